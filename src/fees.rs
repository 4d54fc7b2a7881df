use rust_decimal::{Decimal, RoundingStrategy};

/// Platform/expert split of a booking price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub platform_fee: Decimal,
    pub expert_earning: Decimal,
}

/// Platform fee is `price * percent / 100` rounded half-up to cents; the
/// expert earning is the remainder so the two always sum to `price`.
pub fn split(price: Decimal, platform_fee_percent: Decimal) -> FeeSplit {
    let platform_fee = (price * platform_fee_percent / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    FeeSplit {
        platform_fee,
        expert_earning: price - platform_fee,
    }
}
