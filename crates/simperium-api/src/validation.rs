//! Bucket and object name validation

use std::sync::LazyLock;

use validator::ValidationError;

/// Maximum length for bucket names
pub const MAX_BUCKET_NAME_LENGTH: usize = 64;

/// Maximum length for object keys
pub const MAX_OBJECT_KEY_LENGTH: usize = 256;

static BUCKET_NAME_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-zA-Z0-9_\.\-%]{1,64}$").expect("Invalid regex pattern")
});

static OBJECT_KEY_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-zA-Z0-9_\.\-%@]{1,256}$").expect("Invalid regex pattern")
});

/// Validate a bucket name
///
/// Bucket names are 1 to 64 characters of letters, digits, `_`, `.`, `-`
/// and `%`.
pub fn validate_bucket_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("bucket_name_empty"));
    }
    if !BUCKET_NAME_REGEX.is_match(name) {
        return Err(ValidationError::new("bucket_name_invalid"));
    }
    Ok(())
}

/// Validate an object key and return it trimmed
///
/// Keys additionally allow `@` and may be up to 256 characters.
pub fn validate_object_key(key: &str) -> Result<&str, ValidationError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ValidationError::new("object_key_empty"));
    }
    if !OBJECT_KEY_REGEX.is_match(key) {
        return Err(ValidationError::new("object_key_invalid"));
    }
    Ok(key)
}
