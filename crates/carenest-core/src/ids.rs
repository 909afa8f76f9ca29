//! Branded ID newtypes.
//!
//! Users, families, members and conversations are identified by strings
//! minted elsewhere (the identity provider, the persistence layer), so their
//! newtypes only wrap and never generate. [`ConnectionId`] is the one ID this
//! system creates itself: `conn_` followed by a UUID v7.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
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

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
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
    /// Identifier of one live socket session.
    ConnectionId
}

impl ConnectionId {
    /// Generate a fresh connection ID (`conn_<uuid v7>`).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

branded_id! {
    /// Authenticated account that owns a connection.
    UserId
}

branded_id! {
    /// Household / family context a user can select.
    FamilyId
}

branded_id! {
    /// Family member whose health data a session currently operates on.
    MemberId
}

branded_id! {
    /// Chat conversation thread.
    ConversationId
}
