//! Fixed-size opaque identifiers. All of them serialize as raw byte strings
//! on the wire and print as short hex for logs.

use serde::de::{Deserializer, Error as _, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

macro_rules! bytes_id {
    ($(#[$doc:meta])* $name:ident, $len:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const SIZE: usize = $len;

            pub fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// All-zero value, used as the "none" marker in wire records.
            pub fn zero() -> Self {
                Self([0u8; $len])
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..8]))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct BytesVisitor;

                impl<'de> Visitor<'de> for BytesVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                        write!(f, "{} bytes", $len)
                    }

                    fn visit_bytes<E: serde::de::Error>(
                        self,
                        v: &[u8],
                    ) -> Result<Self::Value, E> {
                        $name::from_slice(v)
                            .ok_or_else(|| E::invalid_length(v.len(), &self))
                    }

                    fn visit_seq<A: serde::de::SeqAccess<'de>>(
                        self,
                        mut seq: A,
                    ) -> Result<Self::Value, A::Error> {
                        let mut bytes = [0u8; $len];
                        for (i, slot) in bytes.iter_mut().enumerate() {
                            *slot = seq
                                .next_element()?
                                .ok_or_else(|| A::Error::invalid_length(i, &self))?;
                        }
                        Ok($name(bytes))
                    }
                }

                deserializer.deserialize_bytes(BytesVisitor)
            }
        }
    };
}

bytes_id!(
    /// Public signing key of a router.
    RouterId,
    32
);

bytes_id!(
    /// Opaque per-hop identifier of one onion path.
    PathId,
    16
);

bytes_id!(
    /// Opaque label of one bidirectional flow between two service endpoints.
    ConvoTag,
    16
);

bytes_id!(
    /// Public signing key of a hidden-service endpoint.
    ServiceAddress,
    32
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_short_hex() {
        let id = RouterId::new([0xab; 32]);
        assert_eq!(format!("{id}"), "abababababababab");
    }

    #[test]
    fn msgpack_round_trip() {
        let id = PathId::new([3u8; 16]);
        let bytes = rmp_serde::to_vec(&id).expect("encode");
        let back: PathId = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(id, back);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(ConvoTag::from_slice(&[0u8; 15]).is_none());
        assert!(ConvoTag::from_slice(&[0u8; 16]).is_some());
    }

    #[test]
    fn zero_marker() {
        assert!(RouterId::zero().is_zero());
        assert!(!RouterId::new([1; 32]).is_zero());
    }
}
