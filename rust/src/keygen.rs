//! Key token generation. The key is a display token for a social game, not a
//! secret, so a thread-local RNG is sufficient.

use rand::Rng;

/// Symbols a key is drawn from.
pub const KEY_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Length of every generated key.
pub const KEY_LENGTH: usize = 16;

/// Generates a fresh key with the thread-local RNG.
pub fn generate_key() -> String {
    generate_key_with(&mut rand::thread_rng())
}

/// Generates a key from the supplied RNG, each symbol drawn independently.
pub fn generate_key_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..KEY_LENGTH)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}
