//! Resource-group state as stored in the coordination service.

use serde::{Deserialize, Serialize};

/// Latest known membership of one resource group.
///
/// Stored as JSON at `{basePath}/{name}`:
///
/// ```json
/// { "master": "10.0.0.1:6379", "slaves": ["10.0.0.2:6379"], "unavailable": [] }
/// ```
///
/// A state is always replaced as a whole on update, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroupState {
    /// Current master, if one is elected.
    #[serde(default)]
    pub master: Option<String>,

    /// Available slaves, in selection order.
    #[serde(default)]
    pub slaves: Vec<String>,

    /// Members known to the cluster but currently down.
    #[serde(default)]
    pub unavailable: Vec<String>,
}

impl ResourceGroupState {
    /// Create a state with the given master and slaves and nothing unavailable.
    pub fn new(master: impl Into<String>, slaves: Vec<String>) -> Self {
        Self {
            master: Some(master.into()),
            slaves,
            unavailable: Vec::new(),
        }
    }

    /// Set the unavailable members.
    pub fn with_unavailable(mut self, unavailable: Vec<String>) -> Self {
        self.unavailable = unavailable;
        self
    }

    /// Decode a state from its stored bytes.
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Encode the state for storage.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Whether `member` is known to this group as master, slave or unavailable.
    ///
    /// A member that is known but down is still "known"; only members absent
    /// from all three lists are unknown.
    pub fn knows(&self, member: &str) -> bool {
        self.master.as_deref() == Some(member)
            || self.slaves.iter().any(|s| s == member)
            || self.unavailable.iter().any(|u| u == member)
    }
}

/// Which member of a group a lookup wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// The group's master.
    #[default]
    Master,
    /// One of the group's slaves, chosen round-robin.
    Slave,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Slave => write!(f, "slave"),
        }
    }
}
