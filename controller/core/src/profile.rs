//! TLS profile material carried to the load balancer.

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomProfileContext {
    Client,
    Server,
}

/// A reference to a profile attached to a virtual server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRef {
    pub name: String,
    pub partition: String,
    pub context: CustomProfileContext,
}

/// A profile materialized from a Secret or inline certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProfile {
    pub name: String,
    pub partition: String,
    pub context: CustomProfileContext,
    pub cert: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl CustomProfile {
    /// A certificate-only profile (e.g. a server-side CA bundle).
    pub fn from_cert(profile: &ProfileRef, cert: impl Into<String>) -> Self {
        Self {
            name: profile.name.clone(),
            partition: profile.partition.clone(),
            context: profile.context,
            cert: cert.into(),
            key: String::new(),
            server_name: None,
        }
    }
}

/// Scopes a profile to its owning resource so the same secret name in two
/// resources does not collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretKey {
    pub name: String,
    pub namespace: String,
    pub resource_name: String,
}
