//! Strongly-typed identifier wrappers.
//!
//! Every identifier in the platform is a 128-bit value; the wrappers carry
//! only type discipline. Equality and ordering are on the raw value, and
//! database adapters convert at the boundary via `From`/`Into<Uuid>`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn into_inner(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

define_id!(
    /// Stable producer-assigned identity of an outbox message. Unique per
    /// database; the key for exactly-once handler execution.
    MessageId
);

define_id!(
    /// Identity of a saga-style join aggregate over outbox messages.
    JoinId
);

define_id!(
    /// Identity of a scheduler job definition.
    JobId
);

define_id!(
    /// Identity of one materialized run of a scheduler job.
    RunId
);

define_id!(
    /// Identity of a one-shot timer.
    TimerId
);

define_id!(
    /// Identity a worker attaches to a claim; proves ownership for
    /// ack/abandon/fail.
    OwnerToken
);

/// Correlation ID for tracking related work across components.
///
/// Use `CorrelationId::NONE` for uncorrelated messages, or
/// `CorrelationId::new()` to start tracking a chain of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated messages (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// The value to persist: `None` for the sentinel so the column stays
    /// nullable rather than storing nil UUIDs.
    pub fn as_optional(&self) -> Option<Uuid> {
        if self.is_none() {
            None
        } else {
            Some(self.0)
        }
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<Option<Uuid>> for CorrelationId {
    fn from(opt: Option<Uuid>) -> Self {
        match opt {
            Some(uuid) => Self(uuid),
            None => Self::NONE,
        }
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            self.0.fmt(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_equality_is_on_raw_value() {
        let uuid = Uuid::new_v4();
        assert_eq!(MessageId::from(uuid), MessageId::from(uuid));
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn id_roundtrips_through_uuid() {
        let id = OwnerToken::new();
        let raw: Uuid = id.into();
        assert_eq!(OwnerToken::from(raw), id);
    }

    #[test]
    fn correlation_id_none_sentinel() {
        assert!(CorrelationId::NONE.is_none());
        assert_eq!(CorrelationId::NONE.as_optional(), None);
        assert_eq!(format!("{}", CorrelationId::NONE), "NONE");
    }

    #[test]
    fn correlation_id_from_option() {
        let uuid = Uuid::new_v4();
        assert_eq!(CorrelationId::from(Some(uuid)).into_inner(), uuid);
        assert!(CorrelationId::from(None::<Uuid>).is_none());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        let raw: Uuid = serde_json::from_str(&json).unwrap();
        assert_eq!(raw, id.into_inner());
    }
}
