//! Identifier generation and validation.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of every allocation identifier.
pub const ALLOC_ID_LEN: usize = 8;

const ALLOC_ID_ALPHABET: &[u8] =
    b"_0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Longest user/guest identifier accepted.
pub const IDENTIFIER_LEN_MAX: usize = 256;

/// Generate a fresh, unpredictable allocation identifier.
///
/// Uniqueness is not guaranteed here; callers claim the id by creating its
/// directory exclusively and retry on collision.
#[must_use]
pub fn generate_alloc_id() -> String {
    let mut rng = rand::rng();
    (0..ALLOC_ID_LEN)
        .map(|_| char::from(ALLOC_ID_ALPHABET[rng.random_range(0..ALLOC_ID_ALPHABET.len())]))
        .collect()
}

/// True if `id` has the shape of an allocation identifier.
#[must_use]
pub fn is_valid_alloc_id(id: &str) -> bool {
    id.len() == ALLOC_ID_LEN && id.bytes().all(|b| ALLOC_ID_ALPHABET.contains(&b))
}

/// True if `id` can name a user or guest: non-empty, bounded, no
/// whitespace or control characters.
#[must_use]
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= IDENTIFIER_LEN_MAX
        && !id.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Short stable key under which a guest is recorded in an allocation.
#[must_use]
pub fn guest_key(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    hex::encode(&digest[..4])
}
