//! Session identifiers.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a session id of the form `{user_id}-{unix_millis}-{random hex}`.
pub fn generate_session_id(user_id: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut rng = rand::thread_rng();
    let bytes: [u8; 4] = rng.gen();
    format!("{user_id}-{millis}-{}", hex::encode(bytes))
}
