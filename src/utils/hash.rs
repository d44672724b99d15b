//! Stable string bucketing.

use sha2::{Digest, Sha256};

/// Map `value` to a bucket in `0..buckets`.
///
/// The SHA-256 digest is read as one big-endian integer and reduced modulo
/// `buckets`, so the result depends only on the string and never on the
/// process, platform or run.
pub fn stable_bucket(value: &str, buckets: u64) -> u64 {
    if buckets <= 1 {
        return 0;
    }
    let digest = Sha256::digest(value.as_bytes());
    let modulus = u128::from(buckets);
    digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % modulus) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_deterministic() {
        let a = stable_bucket("咖啡", 7);
        let b = stable_bucket("咖啡", 7);
        assert_eq!(a, b);
        assert!(a < 7);
    }

    #[test]
    fn test_single_bucket() {
        assert_eq!(stable_bucket("anything", 1), 0);
        assert_eq!(stable_bucket("anything", 0), 0);
    }

    #[test]
    fn test_matches_big_integer_reduction() {
        // 256 divides the digest integer exactly when its last byte is zero,
        // so mod 256 must equal the final digest byte.
        let digest = Sha256::digest("keyword".as_bytes());
        assert_eq!(stable_bucket("keyword", 256), u64::from(digest[31]));
    }

    #[test]
    fn test_spreads_across_buckets() {
        let mut seen = [false; 4];
        for i in 0..200 {
            seen[stable_bucket(&format!("kw-{}", i), 4) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
