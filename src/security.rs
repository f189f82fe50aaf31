//! API key generation/storage, and the `security_events` write path used by
//! validation rejections (`crate::validation`) and persistence failures.
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::WaahError;
use crate::Result;

pub const API_KEY_LENGTH: usize = 64;
pub const API_KEY_FILE: &str = ".waaah-api-key";

pub fn generate_secure_api_key() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_LENGTH)
        .map(char::from)
        .collect()
}

pub fn save_api_key_to_file(api_key: &str) -> Result<()> {
    info!("saving API key to {}", API_KEY_FILE);
    fs::write(API_KEY_FILE, api_key)
        .map_err(|e| WaahError::PersistenceFailure(format!("writing API key file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(API_KEY_FILE)
            .map_err(|e| WaahError::PersistenceFailure(format!("reading API key file metadata: {e}")))?
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(API_KEY_FILE, perms)
            .map_err(|e| WaahError::PersistenceFailure(format!("setting API key file permissions: {e}")))?;
    }

    Ok(())
}

pub fn load_api_key_from_file() -> Result<Option<String>> {
    if !Path::new(API_KEY_FILE).exists() {
        return Ok(None);
    }

    let api_key = fs::read_to_string(API_KEY_FILE)
        .map_err(|e| WaahError::PersistenceFailure(format!("reading API key file: {e}")))?;
    let api_key = api_key.trim().to_string();

    if api_key.len() != API_KEY_LENGTH || !api_key.chars().all(|c| c.is_alphanumeric()) {
        warn!("stored API key file has unexpected format");
        return Err(WaahError::InvalidIdentity(
            "invalid API key format in file".to_string(),
        ));
    }

    Ok(Some(api_key))
}

/// Uses `existing_api_key` if present and non-empty; otherwise loads (or
/// generates and persists) a file-backed key.
pub fn ensure_api_key_exists(existing_api_key: Option<&str>) -> Result<String> {
    if let Some(key) = existing_api_key {
        if !key.trim().is_empty() {
            return Ok(key.to_string());
        }
    }

    match load_api_key_from_file()? {
        Some(key) => Ok(key),
        None => {
            let key = generate_secure_api_key();
            save_api_key_to_file(&key)?;
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_unique_and_alphanumeric() {
        let a = generate_secure_api_key();
        let b = generate_secure_api_key();
        assert_eq!(a.len(), API_KEY_LENGTH);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_alphanumeric()));
    }
}
