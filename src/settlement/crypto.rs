use blake2::digest::consts::{U32, U5};
use blake2::{Blake2b, Blake2b512, Digest};
use ed25519_dalek::hazmat::{raw_sign, raw_verify, ExpandedSecretKey};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::str::FromStr;

const ADDRESS_PREFIX: &str = "nano_";
const LEGACY_ADDRESS_PREFIX: &str = "xrb_";
const ALPHABET: &[u8; 32] = b"13456789abcdefghijkmnopqrstuwxyz";
const ACCOUNT_CHARS: usize = 52;
const CHECKSUM_CHARS: usize = 8;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Blake2b with a 256-bit digest, over the concatenation of `parts`
pub fn blake2b_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b::<U32>::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn decode_hex_32(value: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(value).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::DecodingError(format!("expected 32 bytes: {}", value)))
}

/// The master seed every custodial account is derived from
#[derive(Clone)]
pub struct Seed([u8; 32]);

impl Seed {
    /// Generates a fresh random seed
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Seed(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Seed(<redacted>)")
    }
}

impl FromStr for Seed {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex_32(s.trim())
            .map(Seed)
            .map_err(|e| CryptoError::InvalidSeed(e.to_string()))
    }
}

/// A derived account secret. Never persisted and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SecretKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A raw 32-byte account public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex_32(s).map(PublicKey)
    }
}

fn encode_base32(bytes: &[u8]) -> String {
    let total_bits = bytes.len() * 8;
    let pad = (5 - total_bits % 5) % 5;
    let mut out = String::with_capacity((total_bits + pad) / 5);

    // Leading zero padding bits count as already buffered
    let mut acc: u32 = 0;
    let mut acc_bits = pad as u32;
    for &byte in bytes {
        acc = (acc << 8) | byte as u32;
        acc_bits += 8;
        while acc_bits >= 5 {
            acc_bits -= 5;
            out.push(ALPHABET[((acc >> acc_bits) & 0x1f) as usize] as char);
        }
        acc &= (1 << acc_bits) - 1;
    }
    out
}

fn decode_base32(value: &str, out_len: usize) -> Result<Vec<u8>, CryptoError> {
    let total_bits = value.len() * 5;
    if total_bits < out_len * 8 || total_bits - out_len * 8 >= 5 {
        return Err(CryptoError::DecodingError(format!(
            "{} characters cannot hold {} bytes",
            value.len(),
            out_len
        )));
    }

    let mut skip = (total_bits - out_len * 8) as u32;
    let mut out = Vec::with_capacity(out_len);
    let mut acc: u32 = 0;
    let mut acc_bits: u32 = 0;
    for c in value.bytes() {
        let index = ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| CryptoError::DecodingError(format!("invalid character {:?}", c as char)))?;
        acc = (acc << 5) | index as u32;
        acc_bits += 5;

        if skip > 0 {
            let dropped = skip.min(acc_bits);
            acc_bits -= dropped;
            skip -= dropped;
            if acc >> acc_bits != 0 {
                return Err(CryptoError::DecodingError("non-zero padding bits".to_string()));
            }
            acc &= (1 << acc_bits) - 1;
        }

        while acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
            acc &= (1 << acc_bits) - 1;
        }
    }
    Ok(out)
}

fn address_checksum(public_key: &PublicKey) -> [u8; 5] {
    let mut hasher = Blake2b::<U5>::new();
    hasher.update(public_key.0);
    let mut checksum: [u8; 5] = hasher.finalize().into();
    checksum.reverse();
    checksum
}

/// A Nano account address (`nano_` + base32 public key + checksum)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    /// Creates an address from a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let mut encoded = String::with_capacity(ADDRESS_PREFIX.len() + ACCOUNT_CHARS + CHECKSUM_CHARS);
        encoded.push_str(ADDRESS_PREFIX);
        encoded.push_str(&encode_base32(&public_key.0));
        encoded.push_str(&encode_base32(&address_checksum(public_key)));
        Address(encoded)
    }

    /// Decodes the public key, validating the checksum
    pub fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        let body = self
            .0
            .strip_prefix(ADDRESS_PREFIX)
            .or_else(|| self.0.strip_prefix(LEGACY_ADDRESS_PREFIX))
            .ok_or_else(|| CryptoError::InvalidAddress(format!("unknown prefix: {}", self.0)))?;

        if body.len() != ACCOUNT_CHARS + CHECKSUM_CHARS {
            return Err(CryptoError::InvalidAddress(format!("invalid length: {}", self.0)));
        }

        let (account, checksum) = body.split_at(ACCOUNT_CHARS);
        let key_bytes: [u8; 32] = decode_base32(account, 32)?
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey(self.0.clone()))?;
        let public_key = PublicKey(key_bytes);

        if decode_base32(checksum, 5)? != address_checksum(&public_key) {
            return Err(CryptoError::InvalidAddress(format!("checksum mismatch: {}", self.0)));
        }

        Ok(public_key)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.trim().to_string());
        address.to_public_key()?;
        Ok(address)
    }
}

/// A block signature as upper-case hex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(hex::encode_upper(signature.to_bytes()))
    }

    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = hex::decode(&self.0).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        let signature_bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature("Invalid signature length".to_string()))?;
        Ok(Signature::from_bytes(&signature_bytes))
    }
}

fn expand(secret_key: &SecretKey) -> ExpandedSecretKey {
    let mut hashed = [0u8; 64];
    hashed.copy_from_slice(&Blake2b512::digest(secret_key.0));
    ExpandedSecretKey::from_bytes(&hashed)
}

/// The keys of one custodial account, derived on demand from the master seed
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    verifying_key: VerifyingKey,
    public_key: PublicKey,
    address: Address,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Derives the account at `index` of `seed`
    pub fn from_seed(seed: &Seed, index: u32) -> Self {
        let secret = blake2b_256(&[&seed.0, &index.to_be_bytes()]);
        Self::from_secret_key(&SecretKey(secret))
    }

    /// Rebuilds the key pair of an existing secret key
    pub fn from_secret_key(secret_key: &SecretKey) -> Self {
        let verifying_key = VerifyingKey::from(&expand(secret_key));
        let public_key = PublicKey(verifying_key.to_bytes());
        let address = Address::from_public_key(&public_key);

        KeyPair {
            secret_key: secret_key.clone(),
            verifying_key,
            public_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Signs a message (a block hash) with Ed25519 over Blake2b-512
    pub fn sign(&self, message: &[u8]) -> DigitalSignature {
        let signature = raw_sign::<Blake2b512>(&expand(&self.secret_key), message, &self.verifying_key);
        DigitalSignature::from_signature(&signature)
    }
}

/// Verifies a signature against a message and public key
pub fn verify_signature(
    message: &[u8],
    signature: &DigitalSignature,
    public_key: &PublicKey,
) -> Result<bool, CryptoError> {
    let signature = signature.to_signature()?;
    let verifying_key = VerifyingKey::from_bytes(&public_key.0)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    Ok(raw_verify::<Blake2b512>(&verifying_key, message, &signature).is_ok())
}
