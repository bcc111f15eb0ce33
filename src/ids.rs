//! Opaque byte-string identifiers for namespaces, origins and watchers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.as_bytes().to_vec())
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl From<&[u8]> for $name {
            fn from(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match std::str::from_utf8(&self.0) {
                    Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{s}"),
                    _ => {
                        for b in &self.0 {
                            write!(f, "{b:02x}")?;
                        }
                        Ok(())
                    }
                }
            }
        }
    };
}

byte_id!(
    /// Opaque key of an isolated partition of server state.
    NamespaceId
);

byte_id!(
    /// Identity of whoever caused a mutation or issued a watch.
    OriginId
);

byte_id!(
    /// Key of one outstanding watch within a namespace.
    WatcherId
);

impl OriginId {
    /// A fresh random identity, one per client.
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }
}

impl WatcherId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefers_text_and_falls_back_to_hex() {
        assert_eq!(NamespaceId::from("cookies").to_string(), "cookies");
        assert_eq!(OriginId::from(vec![0x00, 0xff]).to_string(), "00ff");
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(OriginId::random(), OriginId::random());
        assert_eq!(WatcherId::random().as_bytes().len(), 16);
    }
}
