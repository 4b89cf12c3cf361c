use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::error::ValidationError;

pub const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const GENERATED_LENGTH: usize = 6;
pub const MIN_VALIDITY_MINUTES: i64 = 1;
pub const MAX_VALIDITY_MINUTES: i64 = 10080;

static CODE_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Produces candidate short codes. The store checks candidates for collisions.
pub trait CodeGenerator: Send + Sync + std::fmt::Debug {
    fn generate(&self) -> String;
}

/// Draws `GENERATED_LENGTH` characters uniformly from `ALPHABET`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomCodes;

impl CodeGenerator for RandomCodes {
    fn generate(&self) -> String {
        let mut rng = rand::rng();
        (0..GENERATED_LENGTH)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

pub fn validate_code(code: &str) -> Result<(), ValidationError> {
    let pattern = CODE_PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{3,10}$").unwrap());
    if pattern.is_match(code) {
        Ok(())
    } else {
        Err(ValidationError::Code(code.to_string()))
    }
}

/// Accepts absolute URLs with a scheme and a host.
pub fn validate_target(target: &str) -> Result<(), ValidationError> {
    match url::Url::parse(target) {
        Ok(parsed) if parsed.has_host() => Ok(()),
        Ok(_) => Err(ValidationError::Target(format!("{target:?} has no host"))),
        Err(e) => Err(ValidationError::Target(format!("{target:?}: {e}"))),
    }
}

pub fn validate_validity(minutes: i64) -> Result<(), ValidationError> {
    if (MIN_VALIDITY_MINUTES..=MAX_VALIDITY_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(ValidationError::Validity(minutes))
    }
}
