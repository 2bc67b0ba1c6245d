//! Optimistic concurrency token for delivery tickets.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque value rotated on every successful claim or result write.
///
/// A conditional write succeeds only when the caller presents the token it last
/// observed; any write in between rotates the token and turns the caller's write
/// into a lost race.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyToken(Uuid);

impl ConcurrencyToken {
    /// Issue a fresh, never-before-seen token.
    pub fn issue() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn matches(self, actual: ConcurrencyToken) -> bool {
        self == actual
    }
}

impl core::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
