//! Identifier value objects shared by every layer of the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create the identifier from anything string-like
            #[inline]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Value object: Process definition ID
    ProcessId
);

string_id!(
    /// Value object: Process instance ID, unique per execution
    ProcessInstanceId
);

string_id!(
    /// Value object: Flow object ID, unique within a process definition
    FlowObjectId
);

string_id!(
    /// Value object: Sequence flow ID, unique within a process definition
    SequenceFlowId
);

string_id!(
    /// Value object: Role ID
    RoleId
);

string_id!(
    /// Value object: Participant ID
    ParticipantId
);

impl ProcessInstanceId {
    /// Generate a fresh random instance identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Value object: Token ID, allocated sequentially within one process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{}", self.0)
    }
}
