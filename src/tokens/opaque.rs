use rand::{RngCore, rngs::OsRng};

/// Random bytes per opaque token (256 bits).
pub const TOKEN_BYTES: usize = 32;

const MIN_TOKEN_LEN: usize = 32;
const MAX_TOKEN_LEN: usize = 128;

/// Generate a single-use token: 32 OS-random bytes as lowercase hex.
#[must_use]
pub fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Shape check for tokens arriving in a path segment.
///
/// Accepts 32 to 128 lowercase hex characters. Anything else cannot have
/// been issued here and is rejected before touching the store.
#[must_use]
pub fn is_well_formed(token: &str) -> bool {
    (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token.len())
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
