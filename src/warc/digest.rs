//! Block/payload digest computation and WARC digest-string rendering.
//!
//! Rendered form is `{algo}:{BASE32}`, standard RFC 4648 base32 with no
//! padding stripped, matching what every pack WARC writer emits.

use data_encoding::BASE32;
use sha1::{Digest, Sha1};
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgo {
    Sha1,
    Sha256,
}

impl DigestAlgo {
    fn name(self) -> &'static str {
        match self {
            DigestAlgo::Sha1 => "sha1",
            DigestAlgo::Sha256 => "sha256",
        }
    }
}

/// sha1 of `bytes`, rendered as `sha1:<BASE32>`. This is the only digest
/// form the writer ever produces (sha256 is verification-only, per §4.B).
pub fn sha1_digest_string(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("{}:{}", DigestAlgo::Sha1.name(), BASE32.encode(&digest))
}

pub fn sha256_digest_string(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    format!("{}:{}", DigestAlgo::Sha256.name(), BASE32.encode(&digest))
}

/// Parse a rendered digest string `{algo}:{value}` into its parts, for
/// verification in the Reader / `verify` CLI tool.
pub fn parse_digest(s: &str) -> Option<(&str, &str)> {
    s.split_once(':')
}

/// Recompute and compare a digest string against `bytes`. Accepts base32 or
/// base16 for sha256 verification, per §4.B.
pub fn verify_digest(expected: &str, bytes: &[u8]) -> bool {
    let Some((algo, value)) = parse_digest(expected) else {
        return false;
    };
    match algo {
        "sha1" => {
            let mut hasher = Sha1::new();
            hasher.update(bytes);
            let digest = hasher.finalize();
            value.eq_ignore_ascii_case(&BASE32.encode(&digest))
        }
        "sha256" => {
            use sha2::Digest as _;
            let mut hasher = Sha256::new();
            hasher.update(bytes);
            let digest = hasher.finalize();
            let b32 = BASE32.encode(&digest);
            let b16 = data_encoding::HEXLOWER.encode(&digest);
            value.eq_ignore_ascii_case(&b32) || value.eq_ignore_ascii_case(&b16)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_of_known_string() {
        // sha1("hi") = c22b5f9178342609428d6f51b2c5af4c0bde6a42, base32 below
        let got = sha1_digest_string(b"hi");
        assert!(got.starts_with("sha1:"));
        assert!(verify_digest(&got, b"hi"));
        assert!(!verify_digest(&got, b"bye"));
    }

    #[test]
    fn sha256_roundtrip() {
        let got = sha256_digest_string(b"payload");
        assert!(verify_digest(&got, b"payload"));
    }
}
