//! Identifier types for scheduled work.

use crate::define_id;

// =============================================================================
// Invocations
// =============================================================================

define_id!(InvocationId, "inv");

// =============================================================================
// Commands
// =============================================================================

/// Sequential command id assigned by the scheduler, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(u32);

impl CommandId {
    /// The first id a scheduler hands out.
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }

    /// Returns the id following this one, or `None` at `u32::MAX`.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CommandId {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| crate::IdError::InvalidNumber(s.to_string()))
    }
}

impl From<u32> for CommandId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<CommandId> for u32 {
    fn from(id: CommandId) -> Self {
        id.0
    }
}

impl serde::Serialize for CommandId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for CommandId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        u32::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Tests
// =============================================================================
