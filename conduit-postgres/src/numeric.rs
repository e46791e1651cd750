use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use bigdecimal::{
    BigDecimal, ParseBigDecimalError,
    num_bigint::{BigInt, BigUint, Sign},
};
use byteorder::{BigEndian, ReadBytesExt};
use tokio_postgres::types::{FromSql, Type};

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_POSITIVE_INFINITY: u16 = 0xD000;
const SIGN_NEGATIVE_INFINITY: u16 = 0xF000;

/// A `numeric` value decoded from the binary wire format, special values included.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PgNumeric {
    NaN,
    PositiveInfinity,
    NegativeInfinity,
    Value(BigDecimal),
}

impl PgNumeric {
    /// Returns the finite value, if any.
    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            PgNumeric::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl FromStr for PgNumeric {
    type Err = ParseBigDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nan" => Ok(PgNumeric::NaN),
            "infinity" | "+infinity" => Ok(PgNumeric::PositiveInfinity),
            "-infinity" => Ok(PgNumeric::NegativeInfinity),
            _ => BigDecimal::from_str(s.trim()).map(PgNumeric::Value),
        }
    }
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let mut reader = Cursor::new(raw);

        let digit_count = reader.read_u16::<BigEndian>()?;
        let weight = reader.read_i16::<BigEndian>()?;
        let sign = match reader.read_u16::<BigEndian>()? {
            SIGN_POSITIVE => Sign::Plus,
            SIGN_NEGATIVE => Sign::Minus,
            SIGN_NAN => return Ok(PgNumeric::NaN),
            SIGN_POSITIVE_INFINITY => return Ok(PgNumeric::PositiveInfinity),
            SIGN_NEGATIVE_INFINITY => return Ok(PgNumeric::NegativeInfinity),
            other => {
                return Err(format!("invalid numeric sign {other:#06x}").into());
            }
        };
        let scale = reader.read_u16::<BigEndian>()?;

        // Digits are base 10000, most significant first.
        let mut magnitude = BigUint::from(0u32);
        for _ in 0..digit_count {
            let digit = reader.read_u16::<BigEndian>()?;
            magnitude = magnitude * BigUint::from(10_000u32) + BigUint::from(digit);
        }

        // The first digit is worth 10000^weight, the last one 10000^(weight - digit_count + 1).
        let exponent = 4 * (i64::from(weight) - i64::from(digit_count) + 1);
        let value = BigDecimal::new(BigInt::from_biguint(sign, magnitude), -exponent)
            .with_scale(i64::from(scale));

        Ok(PgNumeric::Value(value))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC)
    }
}

impl fmt::Display for PgNumeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgNumeric::NaN => f.write_str("NaN"),
            PgNumeric::PositiveInfinity => f.write_str("Infinity"),
            PgNumeric::NegativeInfinity => f.write_str("-Infinity"),
            PgNumeric::Value(value) => write!(f, "{value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(digits: &[u16], weight: i16, sign: u16, scale: u16) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        raw.extend_from_slice(&weight.to_be_bytes());
        raw.extend_from_slice(&sign.to_be_bytes());
        raw.extend_from_slice(&scale.to_be_bytes());
        for digit in digits {
            raw.extend_from_slice(&digit.to_be_bytes());
        }
        raw
    }

    #[test]
    fn decodes_fractional_value() {
        // 12345.678 = [1, 2345, 6780] with weight 1
        let raw = encode(&[1, 2345, 6780], 1, SIGN_POSITIVE, 3);
        let value = PgNumeric::from_sql(&Type::NUMERIC, &raw).unwrap();
        assert_eq!(value.to_string(), "12345.678");
    }

    #[test]
    fn decodes_negative_and_special_values() {
        let raw = encode(&[42], 0, SIGN_NEGATIVE, 0);
        assert_eq!(
            PgNumeric::from_sql(&Type::NUMERIC, &raw).unwrap().to_string(),
            "-42"
        );

        let raw = encode(&[], 0, SIGN_NAN, 0);
        assert_eq!(PgNumeric::from_sql(&Type::NUMERIC, &raw).unwrap(), PgNumeric::NaN);
    }

    #[test]
    fn parses_text_representation() {
        assert_eq!("-infinity".parse::<PgNumeric>().unwrap(), PgNumeric::NegativeInfinity);
        assert!("1.50".parse::<PgNumeric>().unwrap().as_decimal().is_some());
    }
}
