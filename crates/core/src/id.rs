//! Keys of catalog, queue and log rows.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Declares a UUID-keyed catalog or queue row identifier.
///
/// Keys are UUIDv7, so ids minted by one process sort by creation instant. Parse
/// errors carry the key's name.
macro_rules! uuid_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap a key read back from storage.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(key: $name) -> Self {
                key.0
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self).map_err(|e| {
                    DomainError::invalid_id(format!("{}: {e}", stringify!($name)))
                })
            }
        }
    };
}

uuid_key! {
    /// A logical bus deployment, stable across restarts.
    HostId
}
uuid_key! {
    /// One running process of a host, fresh every start.
    HostRuntimeId
}
uuid_key!(ScenarioId);
uuid_key!(PublisherId);
uuid_key!(PublisherInstanceId);
uuid_key!(SubscriberId);
uuid_key!(SubscriberInstanceId);
uuid_key!(JobInstanceId);
uuid_key! {
    /// An immutable published message.
    MessageId
}
uuid_key! {
    /// A delivery ticket: a `subscriber_message` or `message_temp_queue` row.
    #[derive(PartialOrd, Ord)]
    TicketId
}
uuid_key! {
    /// A lifecycle or audit log row.
    LogId
}

/// Integer surrogate key of a job catalog row (assigned by the database).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

/// Integer surrogate key of a message type catalog row (assigned by the database).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTypeId(i32);

macro_rules! impl_int_newtype {
    ($t:ty) => {
        impl $t {
            pub fn new(value: i32) -> Self {
                Self(value)
            }

            pub fn get(self) -> i32 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i32> for $t {
            fn from(value: i32) -> Self {
                Self(value)
            }
        }
    };
}

impl_int_newtype!(JobId);
impl_int_newtype!(MessageTypeId);

/// Application-chosen key of a job checkpoint.
///
/// Immutable once a snapshot has been written under it; ownership of the snapshot can
/// move between job instances but the identifier never changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotIdentifier(String);

impl SnapshotIdentifier {
    pub const MAX_LENGTH: usize = 256;

    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id("SnapshotIdentifier cannot be empty"));
        }
        if value.len() > Self::MAX_LENGTH {
            return Err(DomainError::invalid_id(format!(
                "SnapshotIdentifier exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SnapshotIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
