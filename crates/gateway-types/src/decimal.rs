//! Fixed-precision decimal helpers shared by every crate that touches a
//! priced quantity. All monetary amounts in the gateway are USDC-denominated
//! with 6 fractional digits; bundle allocation weights use 8.

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

/// A USDC-denominated amount, always normalized to 6 fractional digits.
pub type Usdc = Decimal;

/// Round to 6 fractional digits, half-away-from-zero — the canonical
/// rounding rule applied to every USDC amount before it is persisted or
/// rendered.
pub fn round6(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(6, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to 4 fractional digits (fee rates), half-away-from-zero.
pub fn round4(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to 8 fractional digits (bundle allocation weights), half-away-from-zero.
pub fn round8(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(8, RoundingStrategy::MidpointAwayFromZero)
}

/// Clamp a fraction into `[lo, hi]`.
pub fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

/// The `{platform_fee, provider_amount}` split of a price at a given rate.
///
/// `platform_fee = round6(price * rate)`, `provider_amount = round6(price - platform_fee)`,
/// which preserves `price = platform_fee + provider_amount` exactly on the
/// 6-decimal grid for any billable price/rate pair.
pub fn fee_split(price: Decimal, fee_rate: Decimal) -> (Decimal, Decimal) {
    let platform_fee = round6(price * fee_rate);
    let provider_amount = round6(price - platform_fee);
    (platform_fee, provider_amount)
}

/// Render a USDC amount at exactly 6 fractional digits, the textual form
/// every `X-NexusX-*-USDC` response header uses.
pub fn format6(value: Decimal) -> String {
    format!("{:.6}", round6(value))
}

/// Convert a 6-decimal USDC amount into its integer atomic-unit string
/// representation (USDC has 6 on-chain decimals), as required by the x402
/// `maxAmountRequired` wire field.
pub fn to_atomic_units_string(price: Decimal) -> String {
    let scaled = round6(price) * Decimal::from(1_000_000u64);
    scaled.trunc().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round6_half_away_from_zero() {
        assert_eq!(round6(dec!(0.0000005)), dec!(0.000001));
        assert_eq!(round6(dec!(1.2345675)), dec!(1.234568));
    }

    #[test]
    fn fee_split_preserves_identity() {
        let (fee, provider) = fee_split(dec!(0.005000), dec!(0.12));
        assert_eq!(fee, dec!(0.000600));
        assert_eq!(provider, dec!(0.004400));
        assert_eq!(fee + provider, dec!(0.005000));
    }

    #[test]
    fn atomic_units_string_scales_to_six_decimals() {
        assert_eq!(to_atomic_units_string(dec!(0.005)), "5000");
        assert_eq!(to_atomic_units_string(dec!(1)), "1000000");
    }
}
