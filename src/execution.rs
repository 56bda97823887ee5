//! Immutable trade record shared by every tier, codec and transform.
//!
//! An [`Execution`] is never mutated after construction. Derived variants
//! (a consolidated record with an accumulated size, a synthetic OHLC point)
//! are built through the `with_*` constructors, which return a new value and
//! leave the original untouched so it can keep serving as the "previous"
//! operand of delta decoding.
use rust_decimal::Decimal;
use std::fmt;

/// Aggressor side of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn is_buy(self) -> bool {
        self == Direction::Buy
    }

    pub fn is_sell(self) -> bool {
        self == Direction::Sell
    }

    pub fn inverse(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
        })
    }
}

/// Relation between this record's counterparties and the previous record's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Consecutive {
    #[default]
    Different = 0,
    SameTaker = 1,
    SameCounterparty = 2,
    SameBoth = 3,
}

impl Consecutive {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Consecutive::Different),
            1 => Some(Consecutive::SameTaker),
            2 => Some(Consecutive::SameCounterparty),
            3 => Some(Consecutive::SameBoth),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Delay value meaning the placement-to-execution delay could not be estimated.
pub const DELAY_INESTIMABLE: i32 = 0;
/// Delay value meaning the delay exceeded 180 seconds.
pub const DELAY_HUGE: i32 = -1;
/// Smallest delay the packed side token can carry.
pub const DELAY_MIN: i32 = -3;
/// Largest delay the packed side token can carry.
pub const DELAY_MAX: i32 = 184;

/// Lazy, owned stream of executions handed out by reads.
pub type Executions = Box<dyn Iterator<Item = Execution> + Send>;

/// One trade print.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Execution {
    /// Exchange sequence number, strictly increasing within a market.
    pub id: u64,
    pub direction: Direction,
    pub price: Decimal,
    /// Traded quantity, always positive.
    pub size: Decimal,
    /// Millisecond epoch.
    pub timestamp: i64,
    pub consecutive: Consecutive,
    /// Estimated seconds between order placement and execution.
    pub delay: i32,
}

impl Execution {
    /// Seed used as "previous" for the first record of every stream. Never persisted.
    pub const BASE: Execution = Execution {
        id: 0,
        direction: Direction::Buy,
        price: Decimal::ZERO,
        size: Decimal::ZERO,
        timestamp: 0,
        consecutive: Consecutive::Different,
        delay: DELAY_INESTIMABLE,
    };

    pub fn new(id: u64, direction: Direction, price: Decimal, size: Decimal, timestamp: i64) -> Self {
        Self {
            id,
            direction,
            price,
            size,
            timestamp,
            consecutive: Consecutive::Different,
            delay: DELAY_INESTIMABLE,
        }
    }

    pub fn with_consecutive(&self, consecutive: Consecutive) -> Self {
        Self { consecutive, ..self.clone() }
    }

    /// Out-of-range delays are clamped into the packable range.
    pub fn with_delay(&self, delay: i32) -> Self {
        Self {
            delay: delay.clamp(DELAY_MIN, DELAY_MAX),
            ..self.clone()
        }
    }

    pub fn with_size(&self, size: Decimal) -> Self {
        Self { size, ..self.clone() }
    }

    pub fn with_id(&self, id: u64) -> Self {
        Self { id, ..self.clone() }
    }

    pub fn with_timestamp(&self, timestamp: i64) -> Self {
        Self { timestamp, ..self.clone() }
    }

    pub fn is_buy(&self) -> bool {
        self.direction.is_buy()
    }

    pub fn is_sell(&self) -> bool {
        self.direction.is_sell()
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} x {} @{}ms",
            self.id, self.direction, self.price, self.size, self.timestamp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn derived_copies_leave_original_untouched() {
        let e = Execution::new(7, Direction::Sell, dec("10.5"), dec("2"), 1_000);
        let bigger = e.with_size(dec("5"));
        assert_eq!(e.size, dec("2"));
        assert_eq!(bigger.size, dec("5"));
        assert_eq!(bigger.id, 7);
    }

    #[test]
    fn delay_is_clamped_into_packable_range() {
        let e = Execution::new(1, Direction::Buy, dec("1"), dec("1"), 0);
        assert_eq!(e.with_delay(10_000).delay, DELAY_MAX);
        assert_eq!(e.with_delay(-50).delay, DELAY_MIN);
        assert_eq!(e.with_delay(DELAY_HUGE).delay, DELAY_HUGE);
    }

    #[test]
    fn consecutive_codes_round_trip() {
        for code in 0..4 {
            assert_eq!(Consecutive::from_code(code).map(Consecutive::code), Some(code));
        }
        assert_eq!(Consecutive::from_code(4), None);
    }
}
