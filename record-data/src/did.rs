// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const DID_PREFIX: &str = "did";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DidError {
    #[error("not a did: {0}")]
    MissingPrefix(String),
    #[error("unknown did storage: {0}")]
    UnknownStorage(String),
    #[error("empty did identifier")]
    EmptyId,
}

/// Where the authoritative copy of a record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStorage {
    /// The append-only permanent ledger. Public, block-ordered records.
    Ledger,
    /// The mutable peer graph. Private, collaborative or draft records.
    Peer,
}

impl RecordStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStorage::Ledger => "ledger",
            RecordStorage::Peer => "peer",
        }
    }
}

impl fmt::Display for RecordStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStorage {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ledger" => Ok(RecordStorage::Ledger),
            "peer" => Ok(RecordStorage::Peer),
            other => Err(DidError::UnknownStorage(other.into())),
        }
    }
}

/// A decentralized identifier of the form `did:<storage>:<id>`.
///
/// The identifier part is opaque: a transaction id for ledger records, a
/// soul for peer records. Souls themselves contain `:` separators, so
/// parsing splits on the first two colons only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Did {
    storage: RecordStorage,
    id: String,
}

impl Did {
    pub fn new(storage: RecordStorage, id: impl Into<String>) -> Self {
        Self {
            storage,
            id: id.into(),
        }
    }

    pub fn ledger(id: impl Into<String>) -> Self {
        Self::new(RecordStorage::Ledger, id)
    }

    pub fn peer(id: impl Into<String>) -> Self {
        Self::new(RecordStorage::Peer, id)
    }

    pub fn storage(&self) -> RecordStorage {
        self.storage
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cheap syntax check used by the codec for `dref` fields, which must
    /// not perform full parsing on every value.
    pub fn is_valid_syntax(s: &str) -> bool {
        Did::from_str(s).is_ok()
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DID_PREFIX}:{}:{}", self.storage, self.id)
    }
}

impl FromStr for Did {
    type Err = DidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(DID_PREFIX)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| DidError::MissingPrefix(s.into()))?;

        let (storage, id) = rest
            .split_once(':')
            .ok_or_else(|| DidError::MissingPrefix(s.into()))?;

        if id.is_empty() {
            return Err(DidError::EmptyId);
        }

        Ok(Did {
            storage: storage.parse()?,
            id: id.into(),
        })
    }
}

impl Serialize for Did {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Did::from_str(&s).map_err(D::Error::custom)
    }
}
