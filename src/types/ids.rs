//! Newtype wrappers for domain identifiers.
//!
//! Keeps a `ResourceId` from being passed where a `SubscriptionResourceId`
//! is expected. All of them serialize as the bare string.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                $name(s.into())
            }

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
            fn from(s: &str) -> Self {
                $name(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id! {
    /// A remote system connection.
    SubscriptionId
}

string_id! {
    /// One watched (remote system, resource type, filter) tuple.
    ///
    /// Also the grouping key of every broker message belonging to it.
    SubscriptionResourceId
}

string_id! {
    /// Logical id of a remote resource, without version.
    ResourceId
}

string_id! {
    /// Caller-supplied idempotency id of a change notification, or an id
    /// generated for a processing run.
    RequestId
}

string_id! {
    /// Opaque correlation token attached to a locally cached resource by its
    /// owner and handed back in the flush outcome.
    ResourceKey
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn ids_are_bare_json_strings(s in "[a-zA-Z0-9-]{1,40}") {
            let id = SubscriptionResourceId::new(s.clone());
            let json = serde_json::to_value(&id).unwrap();
            prop_assert_eq!(&json, &serde_json::Value::String(s));
            let parsed: SubscriptionResourceId = serde_json::from_value(json).unwrap();
            prop_assert_eq!(parsed, id);
        }
    }

    #[test]
    fn display_is_raw_value() {
        assert_eq!(ResourceId::new("Patient/1").to_string(), "Patient/1");
        assert_eq!(RequestId::from("r-1".to_string()).to_string(), "r-1");
        assert_eq!(SubscriptionId::from("s").to_string(), "s");
    }
}
