//! Integer money and multiplier types.
//!
//! Balances and stakes are carried as whole cents, multipliers as whole
//! hundredths (2.00x == 200), so two-fractional-digit decimals are exact.
//! Products go through 128-bit intermediates and round half-away-from-zero.

use std::fmt;

use serde::de::{Deserializer, Error as DeError};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest major-unit value accepted from the wire.
const MAX_MAJOR: f64 = 1e12;
/// Tolerance when checking a wire value carries at most two fractional digits.
const PRECISION_EPSILON: f64 = 1e-6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("value is not a finite number")]
    NotFinite,
    #[error("value is negative")]
    Negative,
    #[error("value exceeds the representable range")]
    TooLarge,
    #[error("value carries more than two fractional digits")]
    TooPrecise,
}

/// A monetary amount in whole cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Parse a major-unit wire value. Rejects negatives, non-finite values
    /// and anything finer than two fractional digits.
    pub fn try_from_major(value: f64) -> Result<Self, MoneyError> {
        let cents = scaled_hundredths(value)?;
        Ok(Amount(cents))
    }

    pub fn to_major(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// stake × multiplier, rounded half-away-from-zero to cents.
    pub fn mul_multiplier(self, multiplier: Multiplier) -> Amount {
        let raw = self.0 as i128 * multiplier.hundredths() as i128;
        let rounded = if raw >= 0 { (raw + 50) / 100 } else { (raw - 50) / 100 };
        Amount(rounded as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_major())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Amount::try_from_major(value).map_err(DeError::custom)
    }
}

/// A game multiplier in whole hundredths (1.00x == 100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Multiplier(u32);

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn from_hundredths(hundredths: u32) -> Self {
        Multiplier(hundredths)
    }

    pub const fn hundredths(self) -> u32 {
        self.0
    }

    pub fn try_from_major(value: f64) -> Result<Self, MoneyError> {
        let hundredths = scaled_hundredths(value)?;
        u32::try_from(hundredths)
            .map(Multiplier)
            .map_err(|_| MoneyError::TooLarge)
    }

    /// Quantise a raw climb-law value for broadcast. Flooring keeps emitted
    /// ticks from overshooting the value the law actually reached.
    pub fn from_major_floor(value: f64) -> Self {
        let floored = (value.max(1.0) * 100.0).floor();
        Multiplier(floored.min(u32::MAX as f64) as u32)
    }

    pub fn to_major(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Multiplier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_major())
    }
}

impl<'de> Deserialize<'de> for Multiplier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Multiplier::try_from_major(value).map_err(DeError::custom)
    }
}

fn scaled_hundredths(value: f64) -> Result<i64, MoneyError> {
    if !value.is_finite() {
        return Err(MoneyError::NotFinite);
    }
    if value < 0.0 {
        return Err(MoneyError::Negative);
    }
    if value > MAX_MAJOR {
        return Err(MoneyError::TooLarge);
    }
    let scaled = value * 100.0;
    let rounded = scaled.round();
    if (scaled - rounded).abs() > PRECISION_EPSILON {
        return Err(MoneyError::TooPrecise);
    }
    Ok(rounded as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_digit_values() {
        assert_eq!(Amount::try_from_major(100.0).unwrap().cents(), 10_000);
        assert_eq!(Amount::try_from_major(99.99).unwrap().cents(), 9_999);
        assert_eq!(Amount::try_from_major(0.01).unwrap().cents(), 1);
        assert_eq!(Amount::try_from_major(0.0).unwrap(), Amount::ZERO);
    }

    #[test]
    fn rejects_invalid_wire_values() {
        assert_eq!(Amount::try_from_major(-1.0), Err(MoneyError::Negative));
        assert_eq!(Amount::try_from_major(f64::NAN), Err(MoneyError::NotFinite));
        assert_eq!(Amount::try_from_major(f64::INFINITY), Err(MoneyError::NotFinite));
        assert_eq!(Amount::try_from_major(10.001), Err(MoneyError::TooPrecise));
        assert_eq!(Amount::try_from_major(1e13), Err(MoneyError::TooLarge));
    }

    #[test]
    fn payout_rounds_half_away_from_zero() {
        // 0.99 × 1.50 = 1.485 → 1.49
        let stake = Amount::from_cents(99);
        assert_eq!(stake.mul_multiplier(Multiplier::from_hundredths(150)).cents(), 149);
        // 1.00 × 1.00 nets the stake exactly
        let stake = Amount::from_cents(100);
        assert_eq!(stake.mul_multiplier(Multiplier::ONE).cents(), 100);
        // 33.33 × 2.50 = 83.325 → 83.33
        let stake = Amount::from_cents(3_333);
        assert_eq!(stake.mul_multiplier(Multiplier::from_hundredths(250)).cents(), 8_333);
    }

    #[test]
    fn multiplier_floor_quantisation_is_monotone() {
        let mut prev = Multiplier::ONE;
        let mut raw = 1.0;
        for _ in 0..1_000 {
            raw += 0.0037;
            let q = Multiplier::from_major_floor(raw);
            assert!(q >= prev);
            prev = q;
        }
    }

    #[test]
    fn display_formats_two_digits() {
        assert_eq!(Amount::from_cents(10_050).to_string(), "100.50");
        assert_eq!(Amount::from_cents(-5).to_string(), "-0.05");
        assert_eq!(Multiplier::from_hundredths(207).to_string(), "2.07x");
    }

    #[test]
    fn wire_round_trip() {
        let json = serde_json::to_string(&Amount::from_cents(9_999)).unwrap();
        assert_eq!(json, "99.99");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cents(), 9_999);
        assert!(serde_json::from_str::<Amount>("\"100\"").is_err());
        assert!(serde_json::from_str::<Amount>("-3.5").is_err());
    }
}
