use serde::{Deserialize, Serialize};

/// A hypermedia link attached to most OpenStack resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Link {
    pub href: String,
    pub rel: String,
}
