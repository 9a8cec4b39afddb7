//! `numeric(78, 0)` column conversions. 256-bit quantities round-trip
//! through their plain decimal representation.

use std::str::FromStr;

use alloy::primitives::U256;
use bigdecimal::BigDecimal;

use crate::error::StoreError;

pub(crate) fn u256_to_numeric(value: U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).expect("U256 renders as a plain decimal")
}

pub(crate) fn u128_to_numeric(value: u128) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).expect("u128 renders as a plain decimal")
}

pub(crate) fn numeric_to_u256(value: &BigDecimal) -> Result<U256, StoreError> {
    U256::from_str(&value.to_string()).map_err(|e| StoreError::Decode {
        message: format!("numeric column does not fit a U256 ({value}): {e}"),
    })
}

pub(crate) fn numeric_to_u128(value: &BigDecimal) -> Result<u128, StoreError> {
    value.to_string().parse().map_err(|e| StoreError::Decode {
        message: format!("numeric column does not fit a u128 ({value}): {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_round_trip() {
        for value in [U256::ZERO, U256::from(142u64), U256::MAX] {
            assert_eq!(numeric_to_u256(&u256_to_numeric(value)).unwrap(), value);
        }
    }

    #[test]
    fn u128_round_trip() {
        for value in [0u128, 20_000_000_000, u128::MAX] {
            assert_eq!(numeric_to_u128(&u128_to_numeric(value)).unwrap(), value);
        }
    }

    #[test]
    fn oversized_numeric_fails_to_decode() {
        let too_big = u256_to_numeric(U256::MAX);
        assert!(numeric_to_u128(&too_big).is_err());
    }
}
