//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identifier of a task created by a requester.
    TaskId
);

string_id!(
    /// Identifier of a worker (helper) account.
    WorkerId
);

string_id!(
    /// Identifier of one time-boxed offer of a task to a worker.
    ///
    /// Generated locally when an alert arrives; two alerts for the same task
    /// produce two offers.
    OfferId
);

impl TaskId {
    /// Channel topic carrying status and location events for this task.
    pub fn topic(&self) -> String {
        format!("task:{}", self.0)
    }
}

impl WorkerId {
    /// Personal channel topic on which this worker receives alerts.
    pub fn topic(&self) -> String {
        format!("helper:{}", self.0)
    }
}
