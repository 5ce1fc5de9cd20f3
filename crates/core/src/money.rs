use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// Signed amount in major currency units, always held at two decimal places.
///
/// Positive values are credits (income), negative values are debits (expenses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Money(Decimal::new(cents, 2))
    }

    /// Saturates outside the `i64` cent range.
    pub fn to_cents(self) -> i64 {
        let cents = (self.0 * Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        cents.to_i64().unwrap_or(if cents.is_sign_negative() {
            i64::MIN
        } else {
            i64::MAX
        })
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        let mut value = decimal.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        value.rescale(2);
        Money(value)
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn zero() -> Self {
        Money::from_decimal(Decimal::ZERO)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    /// Plain `0.00` rendering without a currency symbol, used for hashing.
    pub fn to_fixed(self) -> String {
        let mut value = self.0;
        value.rescale(2);
        value.to_string()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_fixed())
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money::from_decimal(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money::from_decimal(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn cents_round_trip_through_decimal() {
        assert_eq!(Money::from_cents(12345).as_decimal(), dec("123.45"));
        assert_eq!(Money::from_decimal(dec("-0.015")).to_cents(), -2);
    }

    #[test]
    fn fixed_rendering_pads_two_decimals() {
        assert_eq!(Money::from_decimal(dec("10")).to_fixed(), "10.00");
        assert_eq!(Money::from_decimal(dec("-3.5")).to_fixed(), "-3.50");
        assert_eq!(Money::from_decimal(dec("-3.5")).abs().to_fixed(), "3.50");
    }

    #[test]
    fn sign_helpers_treat_zero_as_neither() {
        let zero = Money::zero();
        assert!(!zero.is_negative());
        assert!(!zero.is_positive());
        assert!(Money::from_cents(-1).is_negative());
        assert!((-Money::from_cents(-1)).is_positive());
    }

    #[test]
    fn arithmetic_stays_at_two_places() {
        let total = Money::from_cents(1050) + Money::from_cents(-250);
        assert_eq!(total.to_fixed(), "8.00");
        assert_eq!((total - Money::from_cents(800)).to_cents(), 0);
    }
}
