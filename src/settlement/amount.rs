use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount: {0}")]
    Invalid(String),

    #[error("Amount {0} does not fit in a 128-bit balance")]
    Overflow(String),
}

/// An amount in raw, the smallest unit of the asset.
///
/// Arbitrary precision; only block balances are narrowed to 128 bits.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Raw(pub BigUint);

impl Raw {
    pub fn zero() -> Self {
        Raw(BigUint::default())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// `self - other`, or `None` if that would be negative
    pub fn checked_sub(&self, other: &Raw) -> Option<Raw> {
        if self.0 < other.0 {
            None
        } else {
            Some(Raw(&self.0 - &other.0))
        }
    }

    /// The 16-byte big-endian encoding used in block hashes
    pub fn to_be_bytes_16(&self) -> Result<[u8; 16], AmountError> {
        let bytes = self.0.to_bytes_be();
        if bytes.len() > 16 {
            return Err(AmountError::Overflow(self.to_string()));
        }
        let mut out = [0u8; 16];
        out[16 - bytes.len()..].copy_from_slice(&bytes);
        Ok(out)
    }
}

impl From<u128> for Raw {
    fn from(value: u128) -> Self {
        Raw(BigUint::from(value))
    }
}

impl Add for &Raw {
    type Output = Raw;

    fn add(self, other: &Raw) -> Raw {
        Raw(&self.0 + &other.0)
    }
}

impl fmt::Display for Raw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Raw {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        BigUint::from_str(trimmed)
            .map(Raw)
            .map_err(|e| AmountError::Invalid(e.to_string()))
    }
}

impl Serialize for Raw {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Raw {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_beyond_u64() {
        let amount: Raw = "340282366920938463463374607431768211455".parse().unwrap();
        assert_eq!(amount, Raw::from(u128::MAX));
        assert_eq!(amount.to_be_bytes_16().unwrap(), [0xff; 16]);

        let too_big = &amount + &Raw::from(1);
        assert!(matches!(too_big.to_be_bytes_16(), Err(AmountError::Overflow(_))));
    }

    #[test]
    fn test_rejects_non_integers() {
        assert!("1.5".parse::<Raw>().is_err());
        assert!("-1".parse::<Raw>().is_err());
        assert!("".parse::<Raw>().is_err());
        assert!("12abc".parse::<Raw>().is_err());
    }

    #[test]
    fn test_checked_sub() {
        let ten = Raw::from(10);
        let three = Raw::from(3);

        assert_eq!(ten.checked_sub(&three), Some(Raw::from(7)));
        assert_eq!(three.checked_sub(&ten), None);
        assert!(ten.checked_sub(&ten).unwrap().is_zero());
    }

    #[test]
    fn test_serializes_as_decimal_string() {
        let json = serde_json::to_string(&Raw::from(1_000_000)).unwrap();
        assert_eq!(json, "\"1000000\"");

        let back: Raw = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Raw::from(1_000_000));
    }
}
