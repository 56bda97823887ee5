//! Merges coincident trades before they are written to the compact tier.
use rust_decimal::Decimal;

use crate::execution::Execution;

pub const DEFAULT_WINDOW_MS: i64 = 1_000;

/// Iterator adapter merging consecutive executions that share direction and
/// price and arrive within `window_ms` of the previous one.
///
/// The emitted record is the last execution of each run with its size
/// replaced by the run's total, so ids stay monotonic and the last id of the
/// output equals the last id of the input.
pub struct Consolidator<I> {
    inner: I,
    window_ms: i64,
    previous: Option<Execution>,
    cumulative: Decimal,
}

impl<I: Iterator<Item = Execution>> Consolidator<I> {
    pub fn new(inner: I) -> Self {
        Self::with_window(inner, DEFAULT_WINDOW_MS)
    }

    pub fn with_window(inner: I, window_ms: i64) -> Self {
        Self {
            inner,
            window_ms,
            previous: None,
            cumulative: Decimal::ZERO,
        }
    }

    fn pending(previous: Execution, cumulative: Decimal) -> Execution {
        if previous.size == cumulative {
            previous
        } else {
            previous.with_size(cumulative)
        }
    }
}

impl<I: Iterator<Item = Execution>> Iterator for Consolidator<I> {
    type Item = Execution;

    fn next(&mut self) -> Option<Execution> {
        loop {
            let Some(e) = self.inner.next() else {
                let previous = self.previous.take()?;
                return Some(Self::pending(previous, self.cumulative));
            };
            match self.previous.take() {
                Some(previous)
                    if e.timestamp - previous.timestamp < self.window_ms
                        && e.direction == previous.direction
                        && e.price == previous.price =>
                {
                    self.cumulative += e.size;
                    self.previous = Some(e);
                }
                Some(previous) => {
                    let out = Self::pending(previous, self.cumulative);
                    self.cumulative = e.size;
                    self.previous = Some(e);
                    return Some(out);
                }
                None => {
                    self.cumulative = e.size;
                    self.previous = Some(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Direction;
    use std::collections::HashMap;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn exec(id: u64, direction: Direction, price: &str, size: &str, t: i64) -> Execution {
        Execution::new(id, direction, dec(price), dec(size), t)
    }

    #[test]
    fn merges_same_price_same_side_within_window() {
        let input = vec![
            exec(1, Direction::Buy, "100", "1", 0),
            exec(2, Direction::Buy, "100", "2", 500),
        ];
        let out: Vec<_> = Consolidator::new(input.into_iter()).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 2);
        assert_eq!(out[0].size, dec("3"));
        assert_eq!(out[0].price, dec("100"));
    }

    #[test]
    fn breaks_on_price_side_or_gap() {
        let input = vec![
            exec(1, Direction::Buy, "100", "1", 0),
            exec(2, Direction::Buy, "101", "1", 10),
            exec(3, Direction::Sell, "101", "1", 20),
            exec(4, Direction::Sell, "101", "1", 1_500),
        ];
        let out: Vec<_> = Consolidator::new(input.clone().into_iter()).collect();
        assert_eq!(out, input);
    }

    #[test]
    fn window_chains_from_the_latest_trade() {
        let input = vec![
            exec(1, Direction::Sell, "50", "1", 0),
            exec(2, Direction::Sell, "50", "1", 900),
            exec(3, Direction::Sell, "50", "1", 1_800),
        ];
        let out: Vec<_> = Consolidator::new(input.into_iter()).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 3);
        assert_eq!(out[0].size, dec("3"));
    }

    #[test]
    fn volume_per_side_and_price_is_conserved() {
        let mut input = Vec::new();
        let prices = ["10", "10", "10.5", "10", "10", "9.5", "9.5", "10"];
        for (i, price) in prices.iter().enumerate() {
            let direction = if i == 3 || i == 6 { Direction::Sell } else { Direction::Buy };
            input.push(exec(i as u64 + 1, direction, price, "0.25", i as i64 * 300));
        }
        let totals = |xs: &[Execution]| {
            let mut map: HashMap<(Direction, Decimal), Decimal> = HashMap::new();
            for e in xs {
                *map.entry((e.direction, e.price)).or_default() += e.size;
            }
            map
        };
        let out: Vec<_> = Consolidator::new(input.clone().into_iter()).collect();
        assert!(out.len() < input.len());
        assert_eq!(totals(&out), totals(&input));
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(Consolidator::new(std::iter::empty()).count(), 0);
    }
}
