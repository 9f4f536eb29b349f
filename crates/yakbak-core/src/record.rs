//! Records, identifiers, and endpoint keys.
//!
//! Identifiers are raw 32-byte values (not hex) in memory; they render and
//! serialize as lowercase hex so they can be used as JSON map keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Unix timestamp in seconds, as supplied by the author (untrusted).
pub type Timestamp = i64;

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Wrap raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Lowercase hex representation.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from a 64 character hex string.
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s.trim()).map_err(|e| Error::HexDecode(e.to_string()))?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidField {
                    field: $field,
                    reason: "not 64 hex characters".to_string(),
                })?;
                Ok(Self(bytes))
            }

            /// First 8 hex characters, for logs.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_hex(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Content-addressed record id (SHA-256 of the canonical event).
    RecordId,
    "id"
);

hex_id!(
    /// Identity of a content producer (x-only public key).
    ParticipantId,
    "author"
);

/// A network source of records, keyed by its normalized URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    /// Wrap a URL. Normalization is the caller's job (see the sync crate's `relay_url`).
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Endpoint {
    fn from(url: String) -> Self {
        Self(url)
    }
}

/// An immutable content item.
///
/// Deletions are ordinary records referencing their target; they are merged
/// like anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub author: ParticipantId,
    pub created_at: Timestamp,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl Record {
    /// Values of every tag named `name` (the second element of the tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Whether any tag named `name` carries a value.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tag_values(name).next().is_some()
    }

    /// The record this one replies to.
    ///
    /// NIP-10 resolution over lowercase `e` tags: the `reply` marker wins,
    /// then the `root` marker, then the last unmarked tag. Falls back to the
    /// NIP-22 uppercase `E` root tag.
    pub fn parent(&self) -> Option<RecordId> {
        let e_tags: Vec<&Vec<String>> = self
            .tags
            .iter()
            .filter(|tag| tag.len() >= 2 && tag[0] == "e")
            .collect();

        let marked = |marker: &str| {
            e_tags
                .iter()
                .find(|tag| tag.get(3).map(String::as_str) == Some(marker))
                .and_then(|tag| RecordId::from_hex(&tag[1]).ok())
        };

        marked("reply")
            .or_else(|| marked("root"))
            .or_else(|| {
                e_tags
                    .iter()
                    .rev()
                    .find(|tag| tag.get(3).is_none_or(|m| m.is_empty()))
                    .and_then(|tag| RecordId::from_hex(&tag[1]).ok())
            })
            .or_else(|| self.tag_values("E").find_map(|v| RecordId::from_hex(v).ok()))
    }

    /// The thread root this record belongs to, if it is a reply.
    pub fn root(&self) -> Option<RecordId> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 4 && tag[0] == "e" && tag[3] == "root")
            .and_then(|tag| RecordId::from_hex(&tag[1]).ok())
            .or_else(|| self.tag_values("E").find_map(|v| RecordId::from_hex(v).ok()))
    }

    /// Whether this record starts a thread (references no other record).
    pub fn is_root(&self) -> bool {
        !self.has_tag("e") && !self.has_tag("E")
    }
}
