//! Key types for logs, discovery topics and peers.

use crate::error::{HubError, HubResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Namespace mixed into discovery key derivation.
const DISCOVERY_NAMESPACE: &[u8] = b"loghub:discovery";

/// Encode bytes as lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        })
}

/// Decode a 64 character hex string into 32 bytes.
pub fn hex_decode_32(s: &str) -> HubResult<[u8; 32]> {
    let s = s.trim();
    if s.len() != 64 || !s.is_ascii() {
        return Err(HubError::invalid(format!(
            "expected 64 hex characters, got {}",
            s.len()
        )));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let pair = std::str::from_utf8(chunk).map_err(|e| HubError::invalid(e.to_string()))?;
        out[i] = u8::from_str_radix(pair, 16)
            .map_err(|_| HubError::invalid(format!("invalid hex byte: {}", pair)))?;
    }
    Ok(out)
}

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_hex(s: &str) -> HubResult<Self> {
                hex_decode_32(s).map(Self)
            }

            pub fn to_hex(&self) -> String {
                hex_encode(&self.0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex_encode(&self.0[..6]))
            }
        }
    };
}

key_type!(
    /// Content address of a log.
    LogKey
);

key_type!(
    /// Topic under which the swarm looks up peers for a log.
    DiscoveryKey
);

key_type!(
    /// Public key identifying a remote peer connection.
    PeerKey
);

impl LogKey {
    /// Derive the key of a locally named log from the store seed.
    pub fn derive_named(seed: &[u8; 32], name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(name.as_bytes());
        LogKey(hasher.finalize().into())
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        let mut hasher = Sha256::new();
        hasher.update(DISCOVERY_NAMESPACE);
        hasher.update(self.0);
        DiscoveryKey(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let key = LogKey([0xab; 32]);
        assert_eq!(LogKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn test_hex_rejects_bad_input() {
        assert!(matches!(
            LogKey::from_hex("abc"),
            Err(HubError::InvalidArgument { .. })
        ));
        let bad = "zz".repeat(32);
        assert!(LogKey::from_hex(&bad).is_err());
    }

    #[test]
    fn test_named_keys_are_stable_per_seed() {
        let seed = [7u8; 32];
        assert_eq!(
            LogKey::derive_named(&seed, "prices"),
            LogKey::derive_named(&seed, "prices")
        );
        assert_ne!(
            LogKey::derive_named(&seed, "prices"),
            LogKey::derive_named(&[8u8; 32], "prices")
        );
    }

    #[test]
    fn test_discovery_key_differs_from_key() {
        let key = LogKey([1; 32]);
        assert_ne!(key.discovery_key().0, key.0);
        assert_eq!(key.discovery_key(), key.discovery_key());
    }
}
