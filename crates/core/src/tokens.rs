//! Opaque share tokens and file passwords.
//!
//! Download tokens are stored in clear (they are the share link). Edit tokens
//! grant management rights and are only ever stored as a SHA-256 digest.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

pub const DOWNLOAD_TOKEN_LEN: usize = 21;
pub const EDIT_TOKEN_LEN: usize = 32;

pub fn generate_download_token() -> String {
    nanoid::nanoid!(DOWNLOAD_TOKEN_LEN)
}

pub fn generate_edit_token() -> String {
    nanoid::nanoid!(EDIT_TOKEN_LEN)
}

pub fn hash_edit_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Cheap shape check before touching the cache or database
pub fn looks_like_token(token: &str, expected_len: usize) -> bool {
    token.len() == expected_len
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub fn hash_password(password: &str) -> Result<String, CoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| {
            tracing::error!("Failed to hash file password: {}", e);
            CoreError::Hashing
        })
}

/// Check a supplied password against the stored hash.
/// No hash means the file is not protected.
pub fn check_password(stored_hash: Option<&str>, supplied: Option<&str>) -> Result<(), CoreError> {
    let Some(stored) = stored_hash else {
        return Ok(());
    };
    let supplied = supplied
        .filter(|p| !p.is_empty())
        .ok_or(CoreError::PasswordRequired)?;
    let parsed = PasswordHash::new(stored).map_err(|e| {
        tracing::error!("Stored password hash is malformed: {}", e);
        CoreError::Hashing
    })?;
    Argon2::default()
        .verify_password(supplied.as_bytes(), &parsed)
        .map_err(|_| CoreError::WrongPassword)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_expected_shape() {
        let download = generate_download_token();
        let edit = generate_edit_token();
        assert!(looks_like_token(&download, DOWNLOAD_TOKEN_LEN));
        assert!(looks_like_token(&edit, EDIT_TOKEN_LEN));
        assert_ne!(download, generate_download_token());
        assert!(!looks_like_token("../../etc", DOWNLOAD_TOKEN_LEN));
        assert!(!looks_like_token(&download, EDIT_TOKEN_LEN));
    }

    #[test]
    fn edit_token_hash_is_stable_hex() {
        let h1 = hash_edit_token("abc");
        assert_eq!(h1, hash_edit_token("abc"));
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_edit_token("abd"));
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(check_password(Some(&hash), Some("hunter2")).is_ok());
        assert!(matches!(
            check_password(Some(&hash), Some("wrong")),
            Err(CoreError::WrongPassword)
        ));
        assert!(matches!(
            check_password(Some(&hash), None),
            Err(CoreError::PasswordRequired)
        ));
        assert!(matches!(
            check_password(Some(&hash), Some("")),
            Err(CoreError::PasswordRequired)
        ));
        assert!(check_password(None, None).is_ok());
    }
}
