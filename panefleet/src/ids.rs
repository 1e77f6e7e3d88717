//! Identifier minting.

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};

/// Fresh session generation token: UTC timestamp plus a random suffix, so two
/// sessions created within the same second still differ.
pub fn mint_generation() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), short_id(4))
}

/// Four hex digits identifying one loop run.
pub fn new_loop_id() -> String {
    format!("{:04x}", rand::thread_rng().r#gen::<u16>())
}

/// Random lowercase alphanumeric string of length `len`.
pub fn short_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect::<String>()
        .to_lowercase()
}

/// Current time as an RFC 3339 string.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}
