// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) DUSK NETWORK. All rights reserved.

use serde::{Deserialize, Serialize};

use crate::did::Did;
use crate::record::{FieldValue, Record};

/// Per-record visibility level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Private,
    Organization,
}

/// Optional access-control metadata carried in a record's system section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    pub level: AccessLevel,
    #[serde(
        rename = "ownerPubKey",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub owner_pub_key: Option<String>,
    #[serde(
        rename = "organizationDid",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub organization_did: Option<Did>,
    #[serde(
        rename = "sharedWith",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub shared_with: Option<Vec<String>>,
}

impl AccessControl {
    pub fn public() -> Self {
        Self {
            level: AccessLevel::Public,
            owner_pub_key: None,
            organization_did: None,
            shared_with: None,
        }
    }

    pub fn private(owner_pub_key: impl Into<String>) -> Self {
        Self {
            level: AccessLevel::Private,
            owner_pub_key: Some(owner_pub_key.into()),
            organization_did: None,
            shared_with: None,
        }
    }

    pub fn organization(org_did: Did) -> Self {
        Self {
            level: AccessLevel::Organization,
            owner_pub_key: None,
            organization_did: Some(org_did),
            shared_with: None,
        }
    }
}

/// The caller identity a query is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    /// The caller's signed public key, if authenticated.
    pub pub_key: Option<String>,
    /// The caller's verified email/handle domain, for domain enrollment.
    pub domain: Option<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_pub_key(pub_key: impl Into<String>) -> Self {
        Self {
            pub_key: Some(pub_key.into()),
            domain: None,
        }
    }
}

/// Organization membership policies. Only `autoEnrollByDomain` grants
/// membership here; the others parse but always deny.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "camelCase")]
pub enum MembershipPolicy {
    AutoEnrollByDomain,
    #[default]
    InviteOnly,
    TokenGated,
    OpenJoin,
}

/// The decoded fields of an `organization` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(rename = "orgHandle", default)]
    pub handle: String,
    #[serde(rename = "orgPublicKey", default)]
    pub public_key: String,
    #[serde(rename = "adminPubKeys", default)]
    pub admin_pub_keys: Vec<String>,
    #[serde(rename = "membershipPolicy", default)]
    pub membership_policy: MembershipPolicy,
    #[serde(rename = "webUrl", default)]
    pub web_url: String,
}

impl Organization {
    /// Decode an organization from its record's `organization` section.
    pub fn from_record(record: &Record) -> Option<Self> {
        let section = record.data.section("organization")?;

        let text = |name: &str| -> String {
            section
                .get(name)
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let admin_pub_keys = section
            .get("adminPubKeys")
            .and_then(FieldValue::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(FieldValue::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let membership_policy = section
            .get("membershipPolicy")
            .and_then(FieldValue::as_str)
            .and_then(|s| {
                serde_json::from_value(serde_json::Value::String(s.into()))
                    .ok()
            })
            .unwrap_or_default();

        Some(Self {
            handle: text("orgHandle"),
            public_key: text("orgPublicKey"),
            admin_pub_keys,
            membership_policy,
            web_url: text("webUrl"),
        })
    }

    /// Whether the principal is an admin of this organization.
    pub fn is_admin(&self, principal: &Principal) -> bool {
        principal
            .pub_key
            .as_ref()
            .is_some_and(|pk| self.admin_pub_keys.iter().any(|a| a == pk))
    }

    /// Whether the principal is admitted as a member: an admin always is; a
    /// domain principal is under `autoEnrollByDomain` when its domain
    /// matches the organization's web URL host.
    pub fn admits(&self, principal: &Principal) -> bool {
        if self.is_admin(principal) {
            return true;
        }

        if self.membership_policy != MembershipPolicy::AutoEnrollByDomain {
            return false;
        }

        match (&principal.domain, self.web_host()) {
            (Some(domain), Some(host)) => {
                domain.eq_ignore_ascii_case(host)
            }
            _ => false,
        }
    }

    /// The host part of `web_url`, tolerating bare domains.
    fn web_host(&self) -> Option<&str> {
        let rest = self
            .web_url
            .split_once("://")
            .map_or(self.web_url.as_str(), |(_, rest)| rest);
        let host = rest.split(['/', ':', '?']).next()?;
        let host = host.strip_prefix("www.").unwrap_or(host);
        (!host.is_empty()).then_some(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org(policy: MembershipPolicy) -> Organization {
        Organization {
            handle: "acme".into(),
            public_key: "orgpk".into(),
            admin_pub_keys: vec!["adminpk".into()],
            membership_policy: policy,
            web_url: "https://www.acme.example/about".into(),
        }
    }

    #[test]
    fn admin_is_always_admitted() {
        let org = org(MembershipPolicy::InviteOnly);
        let admin = Principal::with_pub_key("adminpk");
        assert!(org.is_admin(&admin));
        assert!(org.admits(&admin));
    }

    #[test]
    fn domain_enrollment_only_under_auto_enroll() {
        let principal = Principal {
            pub_key: Some("memberpk".into()),
            domain: Some("acme.example".into()),
        };

        assert!(org(MembershipPolicy::AutoEnrollByDomain).admits(&principal));
        assert!(!org(MembershipPolicy::InviteOnly).admits(&principal));
        assert!(!org(MembershipPolicy::TokenGated).admits(&principal));
        assert!(!org(MembershipPolicy::OpenJoin).admits(&principal));
    }

    #[test]
    fn mismatched_domain_denied() {
        let principal = Principal {
            pub_key: None,
            domain: Some("other.example".into()),
        };
        assert!(!org(MembershipPolicy::AutoEnrollByDomain).admits(&principal));
        assert!(!org(MembershipPolicy::AutoEnrollByDomain)
            .admits(&Principal::anonymous()));
    }

    #[test]
    fn access_control_serde_names() {
        let ac = AccessControl::private("pkA");
        let json = serde_json::to_value(&ac).unwrap();
        assert_eq!(json["level"], "private");
        assert_eq!(json["ownerPubKey"], "pkA");
        assert!(json.get("organizationDid").is_none());
    }
}
