//! Server-assigned identifiers.
//!
//! `sessionId` and `sourceId` are `int32`, server-assigned, and never reused
//! while the owning entity lives (data model invariant). A plain
//! monotonically-increasing counter per owning registry satisfies this for
//! the lifetime of a server process.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

macro_rules! server_id {
    ($name:ident, $repr:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name($repr);

        impl $name {
            /// Wraps a raw value. Used by the assigning registry only.
            pub fn from_raw(value: $repr) -> Self {
                Self(value)
            }

            /// Returns the raw wire-form value.
            pub fn as_raw(&self) -> $repr {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

server_id!(SessionId, i32, "Unique identifier for a media session.");
server_id!(SourceId, i32, "Identifier for a source within a session, unique within that session.");
server_id!(WebAudioHandle, i32, "Identifier for a Web Audio session.");
server_id!(ControlHandle, i32, "Identifier under which a client is registered with Control.");

/// Monotonically-increasing request id, scoped to a single session.
///
/// A `NeedData` is outstanding between send and a matching `haveData` that
/// carries the same `RequestId`; any other value is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u32);

impl RequestId {
    /// Wraps a raw value.
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque id carried by the healthcheck `PingRequest`/`AckEvent` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PingId(u64);

impl PingId {
    /// Wraps a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates ever-increasing `i32` ids for a single registry (e.g. one
/// `PlaybackService`'s session table).
///
/// # Examples
///
/// ```
/// use rialto_shared_types::{IdGenerator, SessionId};
///
/// let gen = IdGenerator::new();
/// let a: SessionId = gen.next();
/// let b: SessionId = gen.next();
/// assert_ne!(a, b);
/// ```
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicI32,
}

impl IdGenerator {
    /// Creates a generator starting at zero.
    pub fn new() -> Self {
        Self {
            next: AtomicI32::new(0),
        }
    }

    /// Allocates the next id.
    pub fn next<T: From<i32>>(&self) -> T {
        T::from(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<i32> for SessionId {
    fn from(value: i32) -> Self {
        Self::from_raw(value)
    }
}

impl From<i32> for SourceId {
    fn from(value: i32) -> Self {
        Self::from_raw(value)
    }
}

impl From<i32> for WebAudioHandle {
    fn from(value: i32) -> Self {
        Self::from_raw(value)
    }
}

impl From<i32> for ControlHandle {
    fn from(value: i32) -> Self {
        Self::from_raw(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_never_repeats() {
        let gen = IdGenerator::new();
        let ids: Vec<SessionId> = (0..100).map(|_| gen.next()).collect();
        let mut seen = std::collections::HashSet::new();
        assert!(ids.into_iter().all(|id| seen.insert(id)));
    }

    #[test]
    fn display_matches_raw_value() {
        let id = SessionId::from_raw(42);
        assert_eq!(format!("{id}"), "42");
        assert_eq!(format!("{id:?}"), "SessionId(42)");
    }
}
