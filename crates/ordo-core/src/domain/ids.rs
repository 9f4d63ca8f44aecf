//! Domain identifiers (strongly-typed IDs).
//!
//! Every identifier is a 128-bit ULID wrapped in `Id<T>`, where `T` is a
//! zero-sized marker type. `TaskId` and `MessageId` share one implementation
//! but cannot be mixed up at compile time.
//!
//! On the wire (the queue envelope) a `TaskId` travels as a hyphenated UUID
//! string; ULID and UUID have the same 128-bit layout so the conversion is
//! lossless.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

/// Marker trait for each ID kind.
///
/// Provides the prefix used by `Display` ("task-", "msg-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Build an id from a raw 128-bit value. Handy for fixtures.
    pub fn from_u128(value: u128) -> Self {
        Self::from_ulid(Ulid::from_bytes(value.to_be_bytes()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    pub fn as_uuid(&self) -> Uuid {
        Uuid::from(self.ulid)
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self::from_ulid(Ulid::from(uuid))
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Parses either the prefixed display form (`task-01H...`), a bare ULID, or
/// a hyphenated UUID.
impl<T: IdMarker> FromStr for Id<T> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        if let Ok(ulid) = Ulid::from_string(raw) {
            return Ok(Self::from_ulid(ulid));
        }
        Uuid::parse_str(raw)
            .map(Self::from_uuid)
            .map_err(|_| IdParseError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct IdParseError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker for broker-level message identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Identifier of a Task record.
pub type TaskId = Id<Task>;

/// Identifier of one published message (assigned by the transport).
pub type MessageId = Id<Message>;
