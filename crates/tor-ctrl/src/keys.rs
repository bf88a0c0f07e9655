//! Key material for onion services and client authorization.
//!
//! Nothing here does cryptography: these are the *encodings* tor's control
//! port and on-disk key files traffic in.  A v3 onion address is an ed25519
//! public key wrapped in base32 with a version byte and a truncated
//! SHA3-256 checksum; client-authorization keys are x25519 keys, base32 in
//! `.auth_private` files and base64 on `ONION_CLIENT_AUTH_ADD`.

use std::fmt::{self, Display};
use std::str::FromStr;

use data_encoding::{BASE32_NOPAD, BASE64};
use sha3::{Digest, Sha3_256};

/// An error from parsing or decoding key material.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    /// Input had the wrong length.
    #[error("Wrong length: got {got}, expected {expected}")]
    BadLength {
        /// Observed length.
        got: usize,
        /// Required length.
        expected: usize,
    },
    /// Input was not valid in its expected encoding.
    #[error("Invalid {0} encoding")]
    BadEncoding(&'static str),
    /// An onion address had an unknown version byte.
    #[error("Unsupported onion address version {0}")]
    BadVersion(u8),
    /// An onion address's checksum did not verify.
    #[error("Onion address checksum mismatch")]
    BadChecksum,
    /// A composite string (like an `.auth_private` line) was malformed.
    #[error("Malformed {0}")]
    BadFormat(&'static str),
}

/// The number of base32 characters in a v3 onion address (minus `.onion`).
pub const ONION_ADDR_LEN: usize = 56;

/// A version-3 onion-service address: an ed25519 public key.
///
/// Displays as the 56-character lowercase base32 service id, without the
/// `.onion` suffix (that is what `DEL_ONION` and friends expect); use
/// [`OnionAddrV3::onion_name`] for the hostname form.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct OnionAddrV3 {
    /// The service's ed25519 identity key.
    pk: [u8; 32],
}

impl OnionAddrV3 {
    /// Wrap an ed25519 public key.
    pub fn from_public_key(pk: [u8; 32]) -> OnionAddrV3 {
        OnionAddrV3 { pk }
    }

    /// The underlying public-key bytes.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.pk
    }

    /// The `<id>.onion` hostname form.
    pub fn onion_name(&self) -> String {
        format!("{}.onion", self)
    }

    /// The two-byte checksum tor derives for this address.
    fn checksum(pk: &[u8; 32]) -> [u8; 2] {
        let mut d = Sha3_256::new();
        d.update(b".onion checksum");
        d.update(pk);
        d.update([3]);
        let digest = d.finalize();
        [digest[0], digest[1]]
    }
}

impl Display for OnionAddrV3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = [0_u8; 35];
        raw[..32].copy_from_slice(&self.pk);
        raw[32..34].copy_from_slice(&Self::checksum(&self.pk));
        raw[34] = 3;
        write!(f, "{}", BASE32_NOPAD.encode(&raw).to_lowercase())
    }
}

impl fmt::Debug for OnionAddrV3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddrV3({})", self)
    }
}

impl FromStr for OnionAddrV3 {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_suffix(".onion").unwrap_or(s);
        if s.len() != ONION_ADDR_LEN {
            return Err(KeyError::BadLength {
                got: s.len(),
                expected: ONION_ADDR_LEN,
            });
        }
        // Tor's base32 is case-insensitive.
        let raw = BASE32_NOPAD
            .decode(s.to_uppercase().as_bytes())
            .map_err(|_| KeyError::BadEncoding("base32"))?;
        let pk: [u8; 32] = raw[..32]
            .try_into()
            .map_err(|_| KeyError::BadEncoding("base32"))?;
        let version = raw[34];
        if version != 3 {
            return Err(KeyError::BadVersion(version));
        }
        if raw[32..34] != Self::checksum(&pk) {
            return Err(KeyError::BadChecksum);
        }
        Ok(OnionAddrV3 { pk })
    }
}

/// An x25519 key, public or secret, as raw bytes.
///
/// Kept generic over role because the control port and the key files use
/// the same encodings for both.
macro_rules! define_x25519_key {
    { $(#[$meta:meta])* $name:ident } => {
        $(#[$meta])*
        #[derive(Clone, Copy, Eq, PartialEq, Hash)]
        pub struct $name {
            /// The raw key bytes.
            bytes: [u8; 32],
        }

        impl $name {
            /// Wrap raw key bytes.
            pub fn from_bytes(bytes: [u8; 32]) -> $name {
                $name { bytes }
            }

            /// The raw key bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.bytes
            }

            /// Encode in uppercase unpadded base32 (key-file form).
            pub fn to_base32(&self) -> String {
                BASE32_NOPAD.encode(&self.bytes)
            }

            /// Decode from unpadded base32 of either case.
            pub fn from_base32(s: &str) -> Result<$name, KeyError> {
                let raw = BASE32_NOPAD
                    .decode(s.to_uppercase().as_bytes())
                    .map_err(|_| KeyError::BadEncoding("base32"))?;
                let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| KeyError::BadLength {
                    got: v.len(),
                    expected: 32,
                })?;
                Ok($name { bytes })
            }

            /// Encode in padded base64 (control-port form).
            pub fn to_base64(&self) -> String {
                BASE64.encode(&self.bytes)
            }

            /// Decode from padded base64.
            pub fn from_base64(s: &str) -> Result<$name, KeyError> {
                let raw = BASE64
                    .decode(s.as_bytes())
                    .map_err(|_| KeyError::BadEncoding("base64"))?;
                let bytes: [u8; 32] = raw.try_into().map_err(|v: Vec<u8>| KeyError::BadLength {
                    got: v.len(),
                    expected: 32,
                })?;
                Ok($name { bytes })
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Secret material must not end up in logs.
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

define_x25519_key! {
    /// An x25519 public key, as used in `ADD_ONION ... ClientAuthV3=`.
    X25519PublicKey
}
define_x25519_key! {
    /// An x25519 secret key, as used in `.auth_private` files and
    /// `ONION_CLIENT_AUTH_ADD`.
    X25519SecretKey
}

/// One client-authorization credential: which service, and the secret key
/// for it.
///
/// The string form is C Tor's `.auth_private` file content,
/// `<serviceid>:descriptor:x25519:<base32 key>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientAuthEntry {
    /// The service this credential is for.
    pub addr: OnionAddrV3,
    /// The client's secret key.
    pub key: X25519SecretKey,
}

impl Display for ClientAuthEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:descriptor:x25519:{}", self.addr, self.key.to_base32())
    }
}

impl FromStr for ClientAuthEntry {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim().split(':');
        let (addr, auth_type, key_type, encoded) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(a), Some(b), Some(c), Some(d), None) => (a, b, c, d),
            _ => return Err(KeyError::BadFormat("client auth entry")),
        };
        if auth_type != "descriptor" || key_type != "x25519" {
            return Err(KeyError::BadFormat("client auth entry"));
        }
        Ok(ClientAuthEntry {
            addr: addr.parse()?,
            key: X25519SecretKey::from_base32(encoded)?,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use assert_matches::assert_matches;

    /// A real v3 service id (checksum verifies).
    const ADDR: &str = "mnyizjj7m3hpcr7i5afph3zt7maa65johyu2ruis6z7cmnjmaj3h6tad";

    #[test]
    fn onion_addr_round_trip() {
        let addr: OnionAddrV3 = ADDR.parse().unwrap();
        assert_eq!(addr.to_string(), ADDR);
        assert_eq!(addr.onion_name(), format!("{}.onion", ADDR));

        // With suffix, and in uppercase, it parses to the same key.
        let again: OnionAddrV3 = format!("{}.onion", ADDR.to_uppercase()).parse().unwrap();
        assert_eq!(again, addr);

        // Rebuilding from the raw public key agrees too.
        let rebuilt = OnionAddrV3::from_public_key(*addr.public_key());
        assert_eq!(rebuilt.to_string(), ADDR);
    }

    #[test]
    fn onion_addr_rejects_corruption() {
        assert_matches!(
            "short".parse::<OnionAddrV3>(),
            Err(KeyError::BadLength { .. })
        );
        // Flip a character: the checksum no longer verifies.
        let mut corrupted = ADDR.to_string();
        corrupted.replace_range(0..1, if ADDR.starts_with('a') { "b" } else { "a" });
        assert_matches!(
            corrupted.parse::<OnionAddrV3>(),
            Err(KeyError::BadChecksum) | Err(KeyError::BadEncoding(_))
        );
        assert_matches!(
            "!".repeat(56).parse::<OnionAddrV3>(),
            Err(KeyError::BadEncoding(_))
        );
    }

    #[test]
    fn x25519_round_trips() {
        let bytes: [u8; 32] = core::array::from_fn(|i| i as u8);
        let key = X25519SecretKey::from_bytes(bytes);

        let b32 = key.to_base32();
        assert_eq!(X25519SecretKey::from_base32(&b32).unwrap(), key);
        assert_eq!(
            X25519SecretKey::from_base32(&b32.to_lowercase()).unwrap(),
            key
        );

        let b64 = key.to_base64();
        assert_eq!(X25519SecretKey::from_base64(&b64).unwrap(), key);

        assert_matches!(
            X25519SecretKey::from_base32("MFRGG"),
            Err(KeyError::BadLength { .. }) | Err(KeyError::BadEncoding(_))
        );
    }

    #[test]
    fn client_auth_entry_round_trip() {
        let entry = ClientAuthEntry {
            addr: ADDR.parse().unwrap(),
            key: X25519SecretKey::from_bytes([7; 32]),
        };
        let line = entry.to_string();
        assert!(line.starts_with(ADDR));
        assert!(line.contains(":descriptor:x25519:"));
        assert_eq!(line.parse::<ClientAuthEntry>().unwrap(), entry);

        assert_matches!(
            "nonsense".parse::<ClientAuthEntry>(),
            Err(KeyError::BadFormat(_))
        );
        assert_matches!(
            format!("{}:signature:x25519:AAAA", ADDR).parse::<ClientAuthEntry>(),
            Err(KeyError::BadFormat(_))
        );
    }
}
