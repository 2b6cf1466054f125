use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Identity of the task that owns a connection.
///
/// Each session runs in its own task, so the task id is the session's
/// execution-context id. Sessions learn theirs via [`tokio::task::id`], the
/// listener via [`tokio::task::JoinHandle::id`].
pub type SessionId = tokio::task::Id;

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self)
            }
        }
    };
}

numeric_id!(ConnectionId);

/// Monotonic id source. The first id handed out is 1.
#[derive(Debug)]
pub struct IdSequence {
    next: u64,
}

impl IdSequence {
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_connection(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next);
        self.next += 1;
        id
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}
