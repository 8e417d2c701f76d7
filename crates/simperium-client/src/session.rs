//! Client session id sent as the websocket User-Agent

use std::path::Path;

use tracing::warn;
use uuid::Uuid;

const SESSION_FILE: &str = "session_id";
const SESSION_SUFFIX_LEN: usize = 6;

/// Creates a new `{library}-{6 hex chars}` session id.
pub fn generate(library: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}-{}", library, &hex[..SESSION_SUFFIX_LEN])
}

/// Loads the session id saved in `dir`, creating and saving one when missing.
///
/// Failing to persist only costs a new id on the next run.
pub fn load_or_create(dir: Option<&Path>, library: &str) -> String {
    let Some(dir) = dir else {
        return generate(library);
    };

    let path = dir.join(SESSION_FILE);
    if let Ok(saved) = std::fs::read_to_string(&path) {
        let saved = saved.trim();
        if saved.starts_with(&format!("{library}-")) {
            return saved.to_string();
        }
    }

    let session_id = generate(library);
    if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, &session_id)) {
        warn!("Failed to save session id to {}: {}", path.display(), e);
    }
    session_id
}
