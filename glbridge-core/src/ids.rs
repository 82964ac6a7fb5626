use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique identifier of a graphics context.
///
/// Assigned monotonically by the registry and never reused, so a stale id
/// can never alias a newer context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Driver-assigned name of a buffer, texture, shader or program.
pub type ObjectName = u32;
