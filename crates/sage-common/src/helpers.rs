//! Common helper functions for SAGE.

use subtle::ConstantTimeEq;

/// Performs a constant-time comparison of two byte strings.
///
/// Used for MAC and Ack Tag comparison. Lengths are not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Returns true when every byte is zero, without early exit.
pub fn is_all_zero(bytes: &[u8]) -> bool {
    let mut acc = 0u8;
    for b in bytes {
        acc |= b;
    }
    acc.ct_eq(&0u8).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_identical() {
        assert!(constant_time_eq(b"token123", b"token123"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq(b"token123", b"token124"));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq(b"short", b"much_longer_string"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_is_all_zero() {
        assert!(is_all_zero(&[0u8; 32]));
        let mut almost = [0u8; 32];
        almost[31] = 1;
        assert!(!is_all_zero(&almost));
    }
}
