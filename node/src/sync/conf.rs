// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Params {
    /// Period between sync cycles. A cycle that exceeds ten periods is
    /// aborted; the next one starts on schedule.
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Concurrent peer-graph requests per cycle.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// How long a processed deletion suppresses re-fetching of the same
    /// did, however often peers keep advertising it.
    #[serde(with = "humantime_serde", default = "default_reprocess_window")]
    pub reprocess_window: Duration,

    /// Peer graph endpoints to synchronize with.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_max_concurrent_requests() -> usize {
    5
}

fn default_reprocess_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for Params {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            max_concurrent_requests: default_max_concurrent_requests(),
            reprocess_window: default_reprocess_window(),
            peers: Vec::new(),
        }
    }
}
