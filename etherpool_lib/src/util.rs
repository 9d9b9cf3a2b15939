// Copyright (C) 2024, 2025 Etherpool Developers (see AUTHORS)
//
// This file is part of Etherpool
//
// Etherpool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Etherpool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Etherpool. If not, see <https://www.gnu.org/licenses/>.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 2^256, the numerator of every target computation.
pub fn max_uint256() -> BigUint {
    BigUint::one() << 256u32
}

/// One Shannon is 10^9 wei, the pool's accounting unit.
pub fn shannon() -> BigUint {
    BigUint::from(1_000_000_000u64)
}

/// Login addresses are 20-byte hex with the 0x prefix, case-insensitive.
pub fn is_valid_hex_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Worker ids are 1-8 chars of [0-9a-zA-Z-_].
pub fn is_valid_worker_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 8
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

pub fn hex_to_biguint(s: &str) -> Option<BigUint> {
    let digits = strip_0x(s);
    if digits.is_empty() {
        return Some(BigUint::zero());
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

pub fn hex_to_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(strip_0x(s), 16).ok()
}

/// Fixed-width 32-byte hex with the 0x prefix, the form miners expect for
/// targets and hashes.
pub fn biguint_to_hex32(n: &BigUint) -> String {
    format!("0x{:064x}", n)
}

pub fn bytes_to_hex32(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 32-byte hex string (0x optional) into bytes, zero-padded on the
/// left like go-ethereum's HexToHash.
pub fn hex_to_bytes32(s: &str) -> Option<[u8; 32]> {
    let digits = strip_0x(s);
    if digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let padded = format!("{:0>64}", digits);
    let mut out = [0u8; 32];
    hex::decode_to_slice(&padded, &mut out).ok()?;
    Some(out)
}

/// target = 2^256 / difficulty
pub fn diff_to_target(diff: &BigUint) -> BigUint {
    if diff.is_zero() {
        return max_uint256();
    }
    max_uint256() / diff
}

/// difficulty = 2^256 / target
pub fn target_hex_to_diff(target: &str) -> BigUint {
    match hex_to_biguint(target) {
        Some(t) if !t.is_zero() => max_uint256() / t,
        _ => BigUint::zero(),
    }
}

/// Share target hex handed to miners for a fixed pool difficulty.
pub fn get_target_hex(diff: u64) -> String {
    biguint_to_hex32(&diff_to_target(&BigUint::from(diff)))
}

/// NiceHash-style difficulty float: integer difficulty scaled by 2^32.
pub fn diff_to_float(diff: &BigUint) -> f64 {
    diff.to_f64().unwrap_or(f64::MAX) / 4_294_967_296.0
}

pub fn make_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Parse duration strings of the config file: "300ms", "10s", "2m", "1h".
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: f64 = value
        .parse()
        .map_err(|e| format!("bad duration {s:?}: {e}"))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("bad duration unit {other:?} in {s:?}")),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("bad duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;
    use proptest::prelude::*;

    #[test]
    fn test_valid_hex_address() {
        assert!(is_valid_hex_address(
            "0xea674fdde714fd979de3edf0f56aa9716b898ec8"
        ));
        assert!(is_valid_hex_address(
            "0xEA674FDDE714FD979DE3EDF0F56AA9716B898EC8"
        ));
        assert!(!is_valid_hex_address(
            "ea674fdde714fd979de3edf0f56aa9716b898ec8"
        ));
        assert!(!is_valid_hex_address("0xdeadbeef"));
        assert!(!is_valid_hex_address(
            "0xzz674fdde714fd979de3edf0f56aa9716b898ec8"
        ));
    }

    #[test]
    fn test_valid_worker_id() {
        assert!(is_valid_worker_id("rig-1"));
        assert!(is_valid_worker_id("a"));
        assert!(is_valid_worker_id("w_8chars"));
        assert!(!is_valid_worker_id(""));
        assert!(!is_valid_worker_id("ninechars"));
        assert!(!is_valid_worker_id("has space"));
    }

    #[test]
    fn test_get_target_hex() {
        // 2^256 / 2^32 = 2^224
        assert_eq!(
            get_target_hex(4_294_967_296),
            "0x0000000100000000000000000000000000000000000000000000000000000000"
        );
        let t = get_target_hex(2_000_000_000);
        assert_eq!(t.len(), 66);
        assert!(t.starts_with("0x00000001"));
    }

    #[test]
    fn test_target_diff_roundtrip() {
        let diff = BigUint::from(8_589_934_592u64); // 2^33
        let target = diff_to_target(&diff);
        assert_eq!(target_hex_to_diff(&biguint_to_hex32(&target)), diff);
    }

    #[test]
    fn test_hex_to_bytes32_pads_left() {
        let h = hex_to_bytes32("0xff").unwrap();
        assert_eq!(h[31], 0xff);
        assert_eq!(h[0], 0);
        assert!(hex_to_bytes32("0xgg").is_none());
    }

    #[test]
    fn test_diff_to_float() {
        let diff = BigUint::from(4_294_967_296u64 * 5);
        assert!((diff_to_float(&diff) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("120ms").unwrap(), Duration::from_millis(120));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }

    proptest! {
        // result <= 2^256/diff iff diff*result <= 2^256, the two forms of the
        // share acceptance check must agree
        #[test]
        fn share_target_equivalence(diff in 1u64..=u64::MAX, result in any::<u128>()) {
            let diff = BigUint::from(diff);
            let result = BigUint::from_u128(result).unwrap();
            let lhs = result <= diff_to_target(&diff);
            let rhs = &diff * &result <= max_uint256();
            prop_assert_eq!(lhs, rhs);
        }
    }
}
