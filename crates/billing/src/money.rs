//! Conversion between decimal currency units and gateway minor units
//!
//! Amounts are stored as `Decimal` with two places. The gateway speaks integer
//! minor units (cents), so every crossing of that boundary goes through here.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};

/// Round to two places, half away from zero
pub fn normalize(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Decimal currency units to gateway minor units
pub fn to_minor_units(amount: Decimal) -> BillingResult<i64> {
    (normalize(amount) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| BillingError::InvalidInput(format!("amount {} out of range", amount)))
}

/// Gateway minor units to decimal currency units
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Clamp a balance at zero
pub fn non_negative(amount: Decimal) -> Decimal {
    if amount.is_sign_negative() {
        Decimal::ZERO
    } else {
        amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_minor_unit_conversion() {
        assert_eq!(to_minor_units(Decimal::from(300)).unwrap(), 30_000);
        assert_eq!(to_minor_units(Decimal::from_str("19.99").unwrap()).unwrap(), 1_999);
        assert_eq!(from_minor_units(1_999), Decimal::from_str("19.99").unwrap());
    }

    #[test]
    fn test_sub_cent_amounts_round_half_away_from_zero() {
        assert_eq!(to_minor_units(Decimal::from_str("0.005").unwrap()).unwrap(), 1);
        assert_eq!(to_minor_units(Decimal::from_str("0.004").unwrap()).unwrap(), 0);
        assert_eq!(to_minor_units(Decimal::from_str("-0.005").unwrap()).unwrap(), -1);
    }

    #[test]
    fn test_non_negative_clamps() {
        assert_eq!(non_negative(Decimal::from(-5)), Decimal::ZERO);
        assert_eq!(non_negative(Decimal::from(5)), Decimal::from(5));
    }
}
