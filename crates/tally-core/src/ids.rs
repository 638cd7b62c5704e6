//! Branded ID newtypes.
//!
//! A session id names a logical, resumable session and may be supplied by the
//! client. A connection id names one accepted transport stream and is always
//! generated server-side, so two connections presenting the same session id
//! stay distinguishable.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
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

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a resumable session (the `x-session-id` header value).
    SessionId
}

branded_id! {
    /// Identifier of a single accepted connection.
    ConnectionId
}
