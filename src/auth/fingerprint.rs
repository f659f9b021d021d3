//! One-way credential fingerprints.
//!
//! The result cache is keyed by a SHA-256 digest of the bearer token so that
//! raw credentials are never stored.

use std::fmt;

use sha2::{Digest, Sha256};

/// SHA-256 digest of a raw credential.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest `token`.  The token is only borrowed for the duration of this
    /// call.
    pub fn of(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// Short prefix only; full digests in debug output make log lines noisy.
impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", hex::encode(&self.0[..6]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_token_same_fingerprint() {
        assert_eq!(Fingerprint::of("ghp_abc"), Fingerprint::of("ghp_abc"));
    }

    #[test]
    fn different_tokens_different_fingerprints() {
        assert_ne!(Fingerprint::of("token-a"), Fingerprint::of("token-b"));
    }

    #[test]
    fn display_is_sha256_hex() {
        // echo -n "hello" | sha256sum
        assert_eq!(
            Fingerprint::of("hello").to_string(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn display_never_contains_token() {
        let token = "github_pat_11AAAAAAA0secret";
        let fp = Fingerprint::of(token);
        assert!(!fp.to_string().contains(token));
        assert!(!format!("{fp:?}").contains(token));
    }

    #[test]
    fn debug_is_truncated() {
        let dbg = format!("{:?}", Fingerprint::of("hello"));
        assert_eq!(dbg, "Fingerprint(2cf24dba5fb0..)");
    }
}
