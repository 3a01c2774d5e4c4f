//! Salted, iterated SHA-256 password hashes.
//!
//! Stored form: `sha256$<rounds>$<salt>$<digest>`, salt and digest in
//! unpadded standard base64.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

const SCHEME: &str = "sha256";
const ROUNDS: u32 = 10_000;
pub const MIN_PASSWORD_LEN: usize = 6;

pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4();
    let digest = derive(password, salt.as_bytes(), ROUNDS);
    format!(
        "{SCHEME}${ROUNDS}${}${}",
        STANDARD_NO_PAD.encode(salt.as_bytes()),
        STANDARD_NO_PAD.encode(digest)
    )
}

/// `false` for a wrong password and for any hash that does not parse.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(SCHEME), Some(rounds), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    let Ok(rounds) = rounds.parse::<u32>() else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (
        STANDARD_NO_PAD.decode(salt),
        STANDARD_NO_PAD.decode(expected),
    ) else {
        return false;
    };
    constant_time_eq(&derive(password, &salt, rounds.max(1)), &expected)
}

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; 32] {
    let mut digest: [u8; 32] = Sha256::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize()
        .into();
    for _ in 1..rounds {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(password.as_bytes())
            .finalize()
            .into();
    }
    digest
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Accepts `local@domain` with both parts non-empty.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_ascii_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(email)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_only_the_original_password() {
        let stored = hash_password("reciclar");
        assert!(stored.starts_with("sha256$10000$"));
        assert!(verify_password("reciclar", &stored));
        assert!(!verify_password("Reciclar", &stored));
        assert_ne!(stored, hash_password("reciclar"));
    }

    #[test]
    fn malformed_hashes_never_verify() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "md5$1$AA$AA"));
        assert!(!verify_password("x", "sha256$many$AA$AA"));
        assert!(!verify_password("x", "sha256$1$!!$AA"));
    }

    #[test]
    fn email_normalization_requires_both_parts() {
        assert_eq!(
            normalize_email("  Ana@EcoRuta.com "),
            Some("ana@ecoruta.com".to_string())
        );
        assert_eq!(normalize_email("no-at-sign"), None);
        assert_eq!(normalize_email("@domain.com"), None);
        assert_eq!(normalize_email("a@b@c"), None);
    }
}
