//! Base-188 digit alphabet used to pack numeric fields into short tokens.
//!
//! The alphabet is every printable single-byte (Latin-1) character except the
//! space, which delimits fields, and the soft hyphen. Digits `0..62` are the
//! ASCII alphanumerics in order so small values stay readable in the normal
//! tier.
use once_cell::sync::Lazy;
use rust_decimal::Decimal;

use crate::error::CodecError;

pub const RADIX: u32 = 188;
/// Offset added to a decimal exponent so it fits one non-negative digit.
pub const HALF: i32 = (RADIX / 2) as i32;

const INVALID: u8 = u8::MAX;

static ALPHABET: Lazy<[u8; RADIX as usize]> = Lazy::new(|| {
    let mut symbols = Vec::with_capacity(RADIX as usize);
    symbols.extend(b'0'..=b'9');
    symbols.extend(b'A'..=b'Z');
    symbols.extend(b'a'..=b'z');
    symbols.extend((0x21u8..=0x7E).filter(|b| !b.is_ascii_alphanumeric()));
    symbols.extend((0xA1u8..=0xFF).filter(|b| *b != 0xAD));
    let mut table = [0u8; RADIX as usize];
    table.copy_from_slice(&symbols);
    table
});

static VALUES: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut table = [INVALID; 256];
    for (value, symbol) in ALPHABET.iter().enumerate() {
        table[*symbol as usize] = value as u8;
    }
    table
});

/// Symbol for a single digit. `value` must be below [`RADIX`].
pub fn digit(value: u32) -> u8 {
    debug_assert!(value < RADIX);
    ALPHABET[value as usize]
}

pub fn value_of(symbol: u8) -> Result<u32, CodecError> {
    match VALUES[symbol as usize] {
        INVALID => Err(CodecError::InvalidDigit(symbol)),
        v => Ok(v as u32),
    }
}

pub fn write_unsigned(mut n: u128, out: &mut Vec<u8>) {
    // 188^17 > 2^128
    let mut buf = [0u8; 17];
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = digit((n % RADIX as u128) as u32);
        n /= RADIX as u128;
        if n == 0 {
            break;
        }
    }
    out.extend_from_slice(&buf[i..]);
}

pub fn read_unsigned(token: &[u8], field: &'static str) -> Result<u128, CodecError> {
    if token.is_empty() {
        return Err(CodecError::Empty(field));
    }
    token.iter().try_fold(0u128, |acc, symbol| {
        let d = value_of(*symbol)?;
        acc.checked_mul(RADIX as u128)
            .and_then(|v| v.checked_add(d as u128))
            .ok_or(CodecError::Overflow(field))
    })
}

fn zigzag(n: i128) -> u128 {
    ((n << 1) ^ (n >> 127)) as u128
}

fn unzigzag(n: u128) -> i128 {
    ((n >> 1) as i128) ^ -((n & 1) as i128)
}

pub fn write_signed(n: i128, out: &mut Vec<u8>) {
    write_unsigned(zigzag(n), out);
}

pub fn read_signed(token: &[u8], field: &'static str) -> Result<i128, CodecError> {
    read_unsigned(token, field).map(unzigzag)
}

/// Splits a decimal into `mantissa * 10^-exponent` with trailing zeros moved
/// into the exponent, which may go negative for round integers.
fn split(value: Decimal) -> (i128, i32) {
    let normalized = value.normalize();
    let mut mantissa = normalized.mantissa();
    let mut exponent = normalized.scale() as i32;
    while exponent <= 0 && exponent > -HALF && mantissa != 0 && mantissa % 10 == 0 {
        mantissa /= 10;
        exponent -= 1;
    }
    (mantissa, exponent)
}

/// Writes a decimal difference. Zero writes nothing, which is the "no change"
/// default of the delta codec.
pub fn write_decimal_diff(diff: Decimal, out: &mut Vec<u8>) {
    if diff.is_zero() {
        return;
    }
    let (mantissa, exponent) = split(diff);
    out.push(digit((exponent + HALF) as u32));
    write_signed(mantissa, out);
}

pub fn read_decimal_diff(token: &[u8], field: &'static str) -> Result<Decimal, CodecError> {
    let Some((head, tail)) = token.split_first() else {
        return Ok(Decimal::ZERO);
    };
    let exponent = value_of(*head)? as i32 - HALF;
    let mantissa = read_signed(tail, field)?;
    if exponent >= 0 {
        return Decimal::try_from_i128_with_scale(mantissa, exponent as u32)
            .map_err(|_| CodecError::Overflow(field));
    }
    let mut value =
        Decimal::try_from_i128_with_scale(mantissa, 0).map_err(|_| CodecError::Overflow(field))?;
    for _ in 0..-exponent {
        value = value.checked_mul(Decimal::TEN).ok_or(CodecError::Overflow(field))?;
    }
    Ok(value)
}
