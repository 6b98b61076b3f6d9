// Dirent name validation.

use xenon_core::XenonError;

use super::constants::DIRENT_NAME_SIZE;

/// Characters a FATX name may never contain.
const FORBIDDEN: &[u8] = b"><=?:;\"*+,/\\|";

/// Validate a dirent name: ASCII, 1 to 42 bytes, no reserved characters.
pub fn validate_name(name: &str) -> Result<(), XenonError> {
    if name.is_empty() {
        return Err(XenonError::InvalidName("name is empty".into()));
    }
    if name.len() > DIRENT_NAME_SIZE {
        return Err(XenonError::InvalidName(format!(
            "'{}' is longer than {} bytes",
            name, DIRENT_NAME_SIZE
        )));
    }
    if !name.is_ascii() {
        return Err(XenonError::InvalidName(format!(
            "'{}' contains non-ASCII characters",
            name
        )));
    }
    if let Some(bad) = name.bytes().find(|b| FORBIDDEN.contains(b)) {
        return Err(XenonError::InvalidName(format!(
            "'{}' contains reserved character '{}'",
            name, bad as char
        )));
    }
    Ok(())
}
