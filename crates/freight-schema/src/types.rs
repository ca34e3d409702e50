//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings for backward compatibility.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<String> for $name {
            fn eq(&self, other: &String) -> bool {
                self.0 == *other
            }
        }

        impl PartialEq<$name> for String {
            fn eq(&self, other: &$name) -> bool {
                *self == other.0
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

string_newtype!(
    /// Full 64-character lowercase hex sha-256 commit identifier.
    CommitId
);

string_newtype!(
    /// Reverse-DNS collection identifier grouping refs across mirrors.
    CollectionId
);

impl CommitId {
    /// Whether the string is a well-formed commit checksum.
    pub fn is_valid(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Truncated 8-character prefix used in diagnostics.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_id_display_and_as_ref() {
        let id = CommitId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&id), "abc123");
    }

    #[test]
    fn commit_id_serde_roundtrip() {
        let id = CommitId::new("deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: CommitId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn commit_id_validity() {
        assert!(CommitId::is_valid(&"a".repeat(64)));
        assert!(!CommitId::is_valid(&"a".repeat(63)));
        assert!(!CommitId::is_valid(&"A".repeat(64)));
        assert!(!CommitId::is_valid(&"g".repeat(64)));
    }

    #[test]
    fn commit_id_short_is_8_chars() {
        let id = CommitId::new("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef");
        assert_eq!(id.short(), "01234567");
    }

    #[test]
    fn collection_id_from_string() {
        let s = String::from("org.example.Apps");
        let id: CollectionId = s.into();
        assert_eq!(id.as_str(), "org.example.Apps");
    }
}
