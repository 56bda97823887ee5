//! Text record codecs.
//!
//! Both codecs write one record per line without the line terminator; the
//! caller appends CRLF.
//!
//! - [`Absolute`] (normal tier): `id timestamp side price size`, every field
//!   standing on its own. The timestamp is an ISO-8601 UTC string with
//!   millisecond precision and the id is decimal, so `SegmentFile` can read the
//!   leading id without decoding the rest of the line.
//! - [`Delta`] (compact and fast tiers): `id' time' side+size' price'`, each
//!   field a difference against the previous record. A field is empty when it
//!   equals its default (`+1` id, `0` ms, unchanged price or size).
//!
//! The side token packs `consecutive + 4 * is_sell` and `delay + 3` into two
//! digits; the delta codec appends the size difference to the same token.
use rust_decimal::Decimal;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::CodecError;
use crate::execution::{Consecutive, DELAY_MAX, DELAY_MIN, Direction, Execution};
use crate::radix;

const TIMESTAMP_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]");

pub trait Codec: Send + Sync {
    /// Appends the encoded form of `current` to `out`.
    fn encode(&self, previous: &Execution, current: &Execution, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Rebuilds the record in `line` against `previous`.
    fn decode(&self, previous: &Execution, line: &[u8]) -> Result<Execution, CodecError>;
}

/// Self-contained records for the normal tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct Absolute;

/// Difference-encoded records for the compact and fast tiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Delta;

fn split_fields<const N: usize>(line: &[u8]) -> Result<[&[u8]; N], CodecError> {
    let mut fields = [&line[..0]; N];
    let mut found = 0;
    for part in line.split(|b| *b == b' ') {
        if found < N {
            fields[found] = part;
        }
        found += 1;
    }
    if found == N {
        Ok(fields)
    } else {
        Err(CodecError::FieldCount { expected: N, found })
    }
}

fn write_side(e: &Execution, out: &mut Vec<u8>) {
    let sell = if e.is_sell() { 4 } else { 0 };
    out.push(radix::digit((e.consecutive.code() + sell) as u32));
    out.push(radix::digit((e.delay.clamp(DELAY_MIN, DELAY_MAX) - DELAY_MIN) as u32));
}

/// Returns side, consecutive, delay and whatever follows the two side digits.
fn read_side(token: &[u8]) -> Result<(Direction, Consecutive, i32, &[u8]), CodecError> {
    if token.len() < 2 {
        return Err(CodecError::Empty("side"));
    }
    let code = radix::value_of(token[0])?;
    let consecutive = Consecutive::from_code((code % 4) as u8).ok_or(CodecError::SideCode(code))?;
    let direction = match code / 4 {
        0 => Direction::Buy,
        1 => Direction::Sell,
        _ => return Err(CodecError::SideCode(code)),
    };
    let delay = radix::value_of(token[1])? as i32 + DELAY_MIN;
    Ok((direction, consecutive, delay, &token[2..]))
}

fn text<'a>(token: &'a [u8], field: &'static str) -> Result<&'a str, CodecError> {
    if token.is_empty() {
        return Err(CodecError::Empty(field));
    }
    std::str::from_utf8(token).map_err(|_| CodecError::Invalid {
        field,
        value: String::from_utf8_lossy(token).into_owned(),
    })
}

fn parse_decimal(token: &[u8], field: &'static str) -> Result<Decimal, CodecError> {
    let s = text(token, field)?;
    s.parse().map_err(|_| CodecError::Invalid {
        field,
        value: s.to_string(),
    })
}

pub fn format_timestamp(millis: i64, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let invalid = || CodecError::Invalid {
        field: "timestamp",
        value: millis.to_string(),
    };
    let at = OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).map_err(|_| invalid())?;
    at.format_into(out, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
    Ok(())
}

pub fn parse_timestamp(token: &[u8]) -> Result<i64, CodecError> {
    let s = text(token, "timestamp")?;
    let at = PrimitiveDateTime::parse(s, TIMESTAMP_FORMAT).map_err(|_| CodecError::Invalid {
        field: "timestamp",
        value: s.to_string(),
    })?;
    Ok((at.assume_utc().unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Leading id of an absolute record, read without decoding the other fields.
pub fn leading_id(line: &[u8]) -> Option<u64> {
    let end = line.iter().position(|b| *b == b' ').unwrap_or(line.len());
    std::str::from_utf8(&line[..end]).ok()?.parse().ok()
}

impl Codec for Absolute {
    fn encode(&self, _previous: &Execution, e: &Execution, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(e.id.to_string().as_bytes());
        out.push(b' ');
        format_timestamp(e.timestamp, out)?;
        out.push(b' ');
        write_side(e, out);
        out.push(b' ');
        out.extend_from_slice(e.price.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(e.size.to_string().as_bytes());
        Ok(())
    }

    fn decode(&self, _previous: &Execution, line: &[u8]) -> Result<Execution, CodecError> {
        let [id, timestamp, side, price, size] = split_fields::<5>(line)?;
        let id = text(id, "id")?.parse::<u64>().map_err(|_| CodecError::Invalid {
            field: "id",
            value: String::from_utf8_lossy(id).into_owned(),
        })?;
        let (direction, consecutive, delay, rest) = read_side(side)?;
        if !rest.is_empty() {
            return Err(CodecError::Invalid {
                field: "side",
                value: String::from_utf8_lossy(side).into_owned(),
            });
        }
        Ok(Execution {
            id,
            direction,
            price: parse_decimal(price, "price")?,
            size: parse_decimal(size, "size")?,
            timestamp: parse_timestamp(timestamp)?,
            consecutive,
            delay,
        })
    }
}

impl Codec for Delta {
    fn encode(&self, previous: &Execution, e: &Execution, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let id = e.id as i128 - previous.id as i128;
        if id != 1 {
            radix::write_signed(id, out);
        }
        out.push(b' ');
        let elapsed = e.timestamp as i128 - previous.timestamp as i128;
        if elapsed != 0 {
            radix::write_signed(elapsed, out);
        }
        out.push(b' ');
        write_side(e, out);
        radix::write_decimal_diff(e.size - previous.size, out);
        out.push(b' ');
        radix::write_decimal_diff(e.price - previous.price, out);
        Ok(())
    }

    fn decode(&self, previous: &Execution, line: &[u8]) -> Result<Execution, CodecError> {
        let [id, elapsed, side, price] = split_fields::<4>(line)?;
        let id = if id.is_empty() {
            previous.id.checked_add(1).ok_or(CodecError::Overflow("id"))?
        } else {
            (previous.id as i128)
                .checked_add(radix::read_signed(id, "id")?)
                .and_then(|id| u64::try_from(id).ok())
                .ok_or(CodecError::Overflow("id"))?
        };
        let timestamp = if elapsed.is_empty() {
            previous.timestamp
        } else {
            (previous.timestamp as i128)
                .checked_add(radix::read_signed(elapsed, "timestamp")?)
                .and_then(|t| i64::try_from(t).ok())
                .ok_or(CodecError::Overflow("timestamp"))?
        };
        let (direction, consecutive, delay, size) = read_side(side)?;
        let size = previous
            .size
            .checked_add(radix::read_decimal_diff(size, "size")?)
            .ok_or(CodecError::Overflow("size"))?;
        let price = previous
            .price
            .checked_add(radix::read_decimal_diff(price, "price")?)
            .ok_or(CodecError::Overflow("price"))?;
        Ok(Execution {
            id,
            direction,
            price,
            size,
            timestamp,
            consecutive,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn samples() -> Vec<Execution> {
        vec![
            Execution::new(1_000_001, Direction::Buy, dec("4321000"), dec("0.015"), 1_704_067_200_000),
            Execution::new(1_000_002, Direction::Sell, dec("4320999.5"), dec("1.2"), 1_704_067_200_000)
                .with_consecutive(Consecutive::SameTaker)
                .with_delay(12),
            Execution::new(1_000_010, Direction::Sell, dec("4321005"), dec("0.00000001"), 1_704_067_201_337)
                .with_consecutive(Consecutive::SameBoth)
                .with_delay(-1),
            Execution::new(1_000_011, Direction::Buy, dec("4321005"), dec("250"), 1_704_067_201_337)
                .with_consecutive(Consecutive::SameCounterparty)
                .with_delay(180),
        ]
    }

    fn round_trip(codec: &dyn Codec) {
        let mut previous = Execution::BASE;
        for e in samples() {
            let mut line = Vec::new();
            codec.encode(&previous, &e, &mut line).unwrap();
            let decoded = codec.decode(&previous, &line).unwrap();
            assert_eq!(decoded, e);
            previous = decoded;
        }
    }

    #[test]
    fn absolute_round_trip() {
        round_trip(&Absolute);
    }

    #[test]
    fn delta_round_trip() {
        round_trip(&Delta);
    }

    #[test]
    fn absolute_line_is_readable() {
        let e = Execution::new(42, Direction::Sell, dec("101.5"), dec("3"), 1_704_067_200_123);
        let mut line = Vec::new();
        Absolute.encode(&Execution::BASE, &e, &mut line).unwrap();
        assert_eq!(line, b"42 2024-01-01T00:00:00.123 43 101.5 3".to_vec());
        assert_eq!(leading_id(&line), Some(42));
    }

    #[test]
    fn delta_omits_default_fields() {
        let first = Execution::new(10, Direction::Buy, dec("100"), dec("2"), 5_000);
        let second = first.with_id(11);
        let mut line = Vec::new();
        Delta.encode(&first, &second, &mut line).unwrap();
        assert_eq!(line, b"  03 ".to_vec());

        let decoded = Delta.decode(&first, b"  03 ").unwrap();
        assert_eq!(decoded.id, 11);
        assert_eq!(decoded.price, first.price);
        assert_eq!(decoded.size, first.size);
        assert_eq!(decoded.timestamp, first.timestamp);
    }

    #[test]
    fn malformed_records_are_codec_errors() {
        assert_eq!(
            Delta.decode(&Execution::BASE, b"1 2 03"),
            Err(CodecError::FieldCount { expected: 4, found: 3 })
        );
        assert_eq!(Delta.decode(&Execution::BASE, b"  0 "), Err(CodecError::Empty("side")));
        assert_eq!(Delta.decode(&Execution::BASE, b"\x7f  03 "), Err(CodecError::InvalidDigit(0x7f)));
        assert!(Absolute.decode(&Execution::BASE, b"x 2024-01-01T00:00:00.000 03 1 1").is_err());
    }
}
