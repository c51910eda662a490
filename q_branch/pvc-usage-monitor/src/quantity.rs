//! Kubernetes resource quantity parsing.
//!
//! PVC storage requests arrive as quantity strings such as `2Gi`, `500M`,
//! `1.5Ti` or `1e9`. Accepted forms follow the Kubernetes grammar:
//!
//! ```text
//! quantity ::= ["+"] number [suffix]
//! number   ::= digits ["." digits] | "." digits
//! suffix   ::= "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei"
//!            | "m" | "k" | "M" | "G" | "T" | "P" | "E"
//!            | ("e" | "E") ["+" | "-"] digits
//! ```
//!
//! Fractional byte counts round up, as `Quantity::Value()` does upstream.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("negative quantity {0:?}")]
    Negative(String),

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix {suffix:?} in quantity {quantity:?}")]
    UnknownSuffix { quantity: String, suffix: String },

    #[error("quantity {0:?} does not fit in 64 bits")]
    Overflow(String),
}

enum Scale {
    Binary(u32),
    Decimal(i32),
}

/// Parse a quantity string into a whole number of bytes
pub fn parse_bytes(quantity: &str) -> Result<u64, QuantityError> {
    let raw = quantity.trim();
    if raw.is_empty() {
        return Err(QuantityError::Empty);
    }
    if raw.starts_with('-') {
        return Err(QuantityError::Negative(raw.to_string()));
    }
    let unsigned = raw.strip_prefix('+').unwrap_or(raw);

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let invalid = || QuantityError::InvalidNumber(raw.to_string());
    let overflow = || QuantityError::Overflow(raw.to_string());

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if frac_part.contains('.') {
        return Err(invalid());
    }

    let mut numerator: u128 = 0;
    for digit in int_part.bytes().chain(frac_part.bytes()) {
        numerator = numerator
            .checked_mul(10)
            .and_then(|n| n.checked_add(u128::from(digit - b'0')))
            .ok_or_else(overflow)?;
    }
    let frac_digits = i32::try_from(frac_part.len()).map_err(|_| invalid())?;

    let scale = parse_suffix(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
        quantity: raw.to_string(),
        suffix: suffix.to_string(),
    })?;

    if numerator == 0 {
        return Ok(0);
    }

    let mut denominator: u128 = 1;
    let exponent = match scale {
        Scale::Binary(power) => {
            numerator = numerator
                .checked_mul(1u128 << (10 * power))
                .ok_or_else(overflow)?;
            -frac_digits
        }
        Scale::Decimal(exp) => exp.checked_sub(frac_digits).ok_or_else(overflow)?,
    };

    if exponent >= 0 {
        let factor = 10u128
            .checked_pow(exponent.unsigned_abs())
            .ok_or_else(overflow)?;
        numerator = numerator.checked_mul(factor).ok_or_else(overflow)?;
    } else {
        match 10u128.checked_pow(exponent.unsigned_abs()) {
            Some(factor) => denominator = factor,
            // Non-zero and smaller than one byte rounds up to 1
            None => return Ok(1),
        }
    }

    let bytes = numerator.div_ceil(denominator);
    u64::try_from(bytes).map_err(|_| overflow())
}

fn parse_suffix(suffix: &str) -> Option<Scale> {
    let scale = match suffix {
        "" => Scale::Decimal(0),
        "Ki" => Scale::Binary(1),
        "Mi" => Scale::Binary(2),
        "Gi" => Scale::Binary(3),
        "Ti" => Scale::Binary(4),
        "Pi" => Scale::Binary(5),
        "Ei" => Scale::Binary(6),
        "m" => Scale::Decimal(-3),
        "k" => Scale::Decimal(3),
        "M" => Scale::Decimal(6),
        "G" => Scale::Decimal(9),
        "T" => Scale::Decimal(12),
        "P" => Scale::Decimal(15),
        "E" => Scale::Decimal(18),
        _ => {
            let exp = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            let digits = exp.strip_prefix(&['+', '-'][..]).unwrap_or(exp);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Scale::Decimal(exp.parse().ok()?)
        }
    };
    Some(scale)
}
