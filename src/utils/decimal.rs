//! Decimal arithmetic utilities for prices and quantities.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to a tick. Used for passive buy prices so they never cross.
pub fn round_down_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Round up to a tick. Used for passive sell prices.
pub fn round_up_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size == Decimal::ZERO {
        return value;
    }
    (value / tick_size).ceil() * tick_size
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Round to the nearest lot, keeping the sign.
pub fn round_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).round() * lot_size
}

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directional_tick_rounding() {
        assert_eq!(round_down_to_tick(dec!(50005.99), dec!(0.1)), dec!(50005.9));
        assert_eq!(round_up_to_tick(dec!(50011.01), dec!(0.1)), dec!(50011.1));
        assert_eq!(round_up_to_tick(dec!(50011.4), dec!(0.1)), dec!(50011.4));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_round_to_lot_keeps_sign() {
        assert_eq!(round_to_lot(dec!(-0.0056), dec!(0.001)), dec!(-0.006));
        assert_eq!(round_to_lot(dec!(0.0054), dec!(0.001)), dec!(0.005));
    }

    #[test]
    fn test_basis_points() {
        assert_eq!(to_basis_points(dec!(0.0001)), dec!(1));
        assert_eq!(to_basis_points(dec!(-0.00014)), dec!(-1.4));
    }
}
