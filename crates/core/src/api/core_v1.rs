//! The two core kinds the engine reads to build credentials.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::impl_resource;
use crate::object::ObjectMeta;

/// Secret type holding a service account bearer token.
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Name-only reference within the same namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Identity the engine impersonates while stamping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub secrets: Vec<LocalObjectReference>,
}

impl_resource!(ServiceAccount, "v1", "ServiceAccount", namespaced);

/// Opaque key/value data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(rename = "type", default)]
    pub type_: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl_resource!(Secret, "v1", "Secret", namespaced);

impl Secret {
    /// The bearer token, when this is a non-empty service account token secret.
    #[must_use]
    pub fn service_account_token(&self) -> Option<&str> {
        if self.type_ != SERVICE_ACCOUNT_TOKEN_TYPE {
            return None;
        }
        self.data
            .get("token")
            .map(String::as_str)
            .filter(|token| !token.is_empty())
    }
}
