use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::config::PasswordConfig;

/// Checks a candidate password against the configured policy.
/// Returns the violated requirement (`"min_length:8"` style).
pub fn check_policy(password: &str, policy: &PasswordConfig) -> Result<(), String> {
    if password.chars().count() < policy.min_length {
        return Err(format!("min_length:{}", policy.min_length));
    }
    if policy.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
        return Err("require_uppercase".to_string());
    }
    if policy.require_number && !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("require_number".to_string());
    }
    Ok(())
}

/// Argon2id hash with a fresh salt.
pub fn hash(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// Constant-time verification against a stored hash.
pub fn verify(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
