//! Lossy downsampling for the fast tier.
//!
//! Every fixed window of executions is replaced by a synthetic path of at most
//! four trades tracing the window's open, extremes and close. Volume per side
//! is preserved; intra-window ordering and counts are not.
use std::collections::VecDeque;

use rust_decimal::Decimal;

use crate::execution::{Direction, Execution};

pub const DEFAULT_WINDOW_MS: i64 = 5_000;
const STEP_MS: i64 = 1_000;

struct Bucket {
    start: i64,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    buy: Decimal,
    sell: Decimal,
    last_id: u64,
}

impl Bucket {
    fn begin(e: &Execution, window_ms: i64) -> Self {
        let mut bucket = Self {
            start: e.timestamp.div_euclid(window_ms) * window_ms,
            open: e.price,
            high: e.price,
            low: e.price,
            close: e.price,
            buy: Decimal::ZERO,
            sell: Decimal::ZERO,
            last_id: e.id,
        };
        bucket.add(e);
        bucket
    }

    fn add(&mut self, e: &Execution) {
        self.high = self.high.max(e.price);
        self.low = self.low.min(e.price);
        self.close = e.price;
        self.last_id = e.id;
        match e.direction {
            Direction::Buy => self.buy += e.size,
            Direction::Sell => self.sell += e.size,
        }
    }

    fn points(&self) -> Vec<(Direction, Decimal, Decimal)> {
        if self.buy.is_zero() || self.sell.is_zero() {
            let (side, volume) = if self.buy.is_zero() {
                (Direction::Sell, self.sell)
            } else {
                (Direction::Buy, self.buy)
            };
            if self.high == self.low {
                let half = volume / Decimal::TWO;
                return vec![(side, self.open, half), (side, self.open, volume - half)];
            }
            return vec![(side, self.open, volume)];
        }

        let buy = self.buy / Decimal::TWO;
        let sell = self.sell / Decimal::TWO;
        if self.open <= self.close {
            vec![
                (Direction::Buy, self.open, buy),
                (Direction::Sell, self.low, sell),
                (Direction::Buy, self.high, self.buy - buy),
                (Direction::Sell, self.close, self.sell - sell),
            ]
        } else {
            vec![
                (Direction::Sell, self.open, sell),
                (Direction::Buy, self.high, buy),
                (Direction::Sell, self.low, self.sell - sell),
                (Direction::Buy, self.close, self.buy - buy),
            ]
        }
    }

    fn emit(&self, out: &mut VecDeque<Execution>) {
        let points = self.points();
        let last = points.len() as u64 - 1;
        for (i, (direction, price, size)) in points.into_iter().enumerate() {
            let id = self.last_id.saturating_sub(last - i as u64);
            out.push_back(Execution::new(id, direction, price, size, self.start + i as i64 * STEP_MS));
        }
    }
}

/// Iterator adapter replacing each `window_ms` bucket with its synthetic OHLC path.
pub struct Approximator<I> {
    inner: I,
    window_ms: i64,
    bucket: Option<Bucket>,
    ready: VecDeque<Execution>,
}

impl<I: Iterator<Item = Execution>> Approximator<I> {
    pub fn new(inner: I) -> Self {
        Self::with_window(inner, DEFAULT_WINDOW_MS)
    }

    pub fn with_window(inner: I, window_ms: i64) -> Self {
        Self {
            inner,
            window_ms: window_ms.max(STEP_MS * 4),
            bucket: None,
            ready: VecDeque::with_capacity(4),
        }
    }
}

impl<I: Iterator<Item = Execution>> Iterator for Approximator<I> {
    type Item = Execution;

    fn next(&mut self) -> Option<Execution> {
        while self.ready.is_empty() {
            match self.inner.next() {
                Some(e) => match &mut self.bucket {
                    Some(bucket) if e.timestamp < bucket.start + self.window_ms => bucket.add(&e),
                    current => {
                        if let Some(done) = current.replace(Bucket::begin(&e, self.window_ms)) {
                            done.emit(&mut self.ready);
                        }
                    }
                },
                None => {
                    self.bucket.take()?.emit(&mut self.ready);
                }
            }
        }
        self.ready.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn exec(id: u64, direction: Direction, price: &str, size: &str, t: i64) -> Execution {
        Execution::new(id, direction, dec(price), dec(size), t)
    }

    fn prices(xs: &[Execution]) -> Vec<Decimal> {
        xs.iter().map(|e| e.price).collect()
    }

    #[test]
    fn bullish_bucket_walks_open_low_high_close() {
        let input = vec![
            exec(10, Direction::Buy, "100", "1", 10_000),
            exec(11, Direction::Sell, "98", "2", 10_500),
            exec(12, Direction::Buy, "105", "3", 11_000),
            exec(13, Direction::Sell, "103", "4", 14_999),
        ];
        let out: Vec<_> = Approximator::new(input.into_iter()).collect();
        assert_eq!(out.len(), 4);
        assert_eq!(prices(&out), vec![dec("100"), dec("98"), dec("105"), dec("103")]);
        assert_eq!(
            out.iter().map(|e| e.direction).collect::<Vec<_>>(),
            vec![Direction::Buy, Direction::Sell, Direction::Buy, Direction::Sell]
        );
        assert_eq!(out.iter().map(|e| e.id).collect::<Vec<_>>(), vec![10, 11, 12, 13]);
        assert_eq!(
            out.iter().map(|e| e.timestamp).collect::<Vec<_>>(),
            vec![10_000, 11_000, 12_000, 13_000]
        );
        let total: Decimal = out.iter().map(|e| e.size).sum();
        assert_eq!(total, dec("10"));
    }

    #[test]
    fn bearish_bucket_walks_open_high_low_close() {
        let input = vec![
            exec(1, Direction::Sell, "50", "1", 0),
            exec(2, Direction::Buy, "52", "1", 100),
            exec(3, Direction::Sell, "47", "1", 200),
            exec(4, Direction::Sell, "48", "1", 300),
        ];
        let out: Vec<_> = Approximator::new(input.into_iter()).collect();
        assert_eq!(prices(&out), vec![dec("50"), dec("52"), dec("47"), dec("48")]);
        assert_eq!(out[0].direction, Direction::Sell);
        let buy: Decimal = out.iter().filter(|e| e.is_buy()).map(|e| e.size).sum();
        let sell: Decimal = out.iter().filter(|e| e.is_sell()).map(|e| e.size).sum();
        assert_eq!(buy, dec("1"));
        assert_eq!(sell, dec("3"));
    }

    #[test]
    fn one_sided_bucket_collapses_to_open() {
        let input = vec![
            exec(1, Direction::Buy, "10", "1", 0),
            exec(2, Direction::Buy, "12", "1", 10),
        ];
        let out: Vec<_> = Approximator::new(input.into_iter()).collect();
        assert_eq!(out, vec![exec(2, Direction::Buy, "10", "2", 0)]);
    }

    #[test]
    fn one_sided_flat_bucket_splits_into_two_points() {
        let input = vec![
            exec(5, Direction::Sell, "10", "1", 0),
            exec(6, Direction::Sell, "10", "2", 10),
        ];
        let out: Vec<_> = Approximator::new(input.into_iter()).collect();
        assert_eq!(
            out,
            vec![
                exec(5, Direction::Sell, "10", "1.5", 0),
                exec(6, Direction::Sell, "10", "1.5", 1_000),
            ]
        );
    }

    #[test]
    fn buckets_are_emitted_in_order() {
        let input = vec![
            exec(1, Direction::Buy, "10", "1", 0),
            exec(2, Direction::Sell, "11", "1", 5_000),
            exec(3, Direction::Sell, "12", "1", 10_001),
        ];
        let out: Vec<_> = Approximator::new(input.into_iter()).collect();
        assert_eq!(out.iter().map(|e| e.timestamp).collect::<Vec<_>>(), vec![0, 5_000, 10_000]);
        assert_eq!(out.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
