//! Keypairs, addresses, hashes and recoverable signatures
//!
//! A signature envelope carries the signer's verifying key next to the
//! Ed25519 signature, so the signer can be recovered from the envelope alone
//! and compared against the address a payload claims.

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Address length in bytes (40 hex characters)
pub const ADDRESS_LEN: usize = 20;

/// Hash length in bytes
pub const HASH_LEN: usize = 32;

/// Signature envelope length: verifying key (32) + signature (64)
pub const SIGNATURE_LEN: usize = 96;

const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Randomness source failed: {0}")]
    Entropy(String),

    #[error("Malformed signature")]
    MalformedSignature,

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Signer mismatch: expected {expected}, recovered {recovered}")]
    SignerMismatch { expected: Address, recovered: Address },

    #[error("Invalid {kind} encoding: {value}")]
    InvalidHex { kind: &'static str, value: String },
}

/// Read `out.len()` bytes from the BLAKE3 extendable output over `bytes`
fn xof_into(bytes: &[u8], out: &mut [u8]) {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytes);
    hasher.finalize_xof().fill(out);
}

/// Canonical encoding used for hashing and signing
pub fn canonical_bytes<T: BorshSerialize>(value: &T) -> Vec<u8> {
    borsh::to_vec(value).expect("in-memory borsh serialization should not fail")
}

macro_rules! hex_bytes_type {
    ($name:ident, $len:expr, $kind:literal) => {
        impl $name {
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = IdentityError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut out = [0u8; $len];
                hex::decode_to_slice(s, &mut out).map_err(|_| IdentityError::InvalidHex {
                    kind: $kind,
                    value: s.to_string(),
                })?;
                Ok(Self(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// 32-byte digest of a value's canonical encoding
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct Hash([u8; HASH_LEN]);

hex_bytes_type!(Hash, HASH_LEN, "hash");

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    /// Hash raw bytes
    pub fn digest(bytes: &[u8]) -> Self {
        let mut out = [0u8; HASH_LEN];
        xof_into(bytes, &mut out);
        Self(out)
    }

    /// Hash the canonical encoding of a value
    pub fn of<T: BorshSerialize>(value: &T) -> Self {
        Self::digest(&canonical_bytes(value))
    }

    /// Case-insensitive hex prefix match
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(&prefix.to_ascii_lowercase())
    }
}

/// Identifier derived from a verifying key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct Address([u8; ADDRESS_LEN]);

hex_bytes_type!(Address, ADDRESS_LEN, "address");

impl Address {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let mut out = [0u8; ADDRESS_LEN];
        xof_into(key.as_bytes(), &mut out);
        Self(out)
    }
}

/// Verifying key + Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Signature([u8; SIGNATURE_LEN]);

hex_bytes_type!(Signature, SIGNATURE_LEN, "signature");

impl Signature {
    fn new(public_key: &VerifyingKey, signature: &DalekSignature) -> Self {
        let mut out = [0u8; SIGNATURE_LEN];
        out[..PUBLIC_KEY_LEN].copy_from_slice(public_key.as_bytes());
        out[PUBLIC_KEY_LEN..].copy_from_slice(&signature.to_bytes());
        Self(out)
    }

    /// Recover the signer address of `message`.
    ///
    /// Uses strict verification, which rejects non-canonical scalars and
    /// small-order keys.
    pub fn recover(&self, message: &Hash) -> Result<Address, IdentityError> {
        let (key_bytes, sig_bytes) = self.0.split_at(PUBLIC_KEY_LEN);
        let key_bytes: &[u8; PUBLIC_KEY_LEN] = key_bytes
            .try_into()
            .map_err(|_| IdentityError::MalformedSignature)?;
        let key =
            VerifyingKey::from_bytes(key_bytes).map_err(|_| IdentityError::MalformedSignature)?;
        let signature =
            DalekSignature::from_slice(sig_bytes).map_err(|_| IdentityError::MalformedSignature)?;

        key.verify_strict(message.as_bytes(), &signature)
            .map_err(|_| IdentityError::VerificationFailed)?;

        Ok(Address::from_public_key(&key))
    }
}

/// A keypair and its derived address
pub struct Identity {
    signing_key: SigningKey,
    address: Address,
}

impl Identity {
    /// Generate a fresh keypair from the OS randomness source
    pub fn generate() -> Result<Self, IdentityError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| IdentityError::Entropy(e.to_string()))?;
        let identity = Self::from_secret_bytes(&seed);
        seed.fill(0);
        Ok(identity)
    }

    /// Rebuild an identity from its 32-byte secret
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let address = Address::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(&self, payload_hash: &Hash) -> Signature {
        let signature = self.signing_key.sign(payload_hash.as_bytes());
        Signature::new(&self.signing_key.verifying_key(), &signature)
    }

    /// Sign a payload's canonical hash and wrap both
    pub fn sign_payload<T: BorshSerialize>(&self, payload: T) -> Signed<T> {
        let signature = self.sign(&Hash::of(&payload));
        Signed { payload, signature }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// A payload plus the signature over its canonical hash
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Signed<T> {
    pub payload: T,
    pub signature: Signature,
}

impl<T: BorshSerialize> Signed<T> {
    /// Hash of the payload (the signature is not part of it)
    pub fn hash(&self) -> Hash {
        Hash::of(&self.payload)
    }

    pub fn signer(&self) -> Result<Address, IdentityError> {
        self.signature.recover(&self.hash())
    }

    pub fn verify_signer(&self, expected: &Address) -> Result<(), IdentityError> {
        let recovered = self.signer()?;
        if &recovered != expected {
            return Err(IdentityError::SignerMismatch {
                expected: *expected,
                recovered,
            });
        }
        Ok(())
    }

    pub fn is_signed_by(&self, expected: &Address) -> bool {
        self.verify_signer(expected).is_ok()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        canonical_bytes(self)
    }
}

impl<T: BorshDeserialize> Signed<T> {
    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}
