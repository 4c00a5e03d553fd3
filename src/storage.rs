//! Broker credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The settings UI writes broker
//! credentials here during onboarding; the sync core reads them back when
//! assembling connect options. Nothing else in the core persists connection
//! configuration.

use crate::config::{self, ConnectOptions};
use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "tillsync";

// Credential keys
const KEY_BROKER_URL: &str = "broker_url";
const KEY_BROKER_USERNAME: &str = "broker_username";
const KEY_BROKER_PASSWORD: &str = "broker_password";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BROKER_URL, KEY_BROKER_USERNAME, KEY_BROKER_PASSWORD];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(value) => Some(value),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The terminal can sync once a broker URL is present. Credentials are
/// optional; anonymous brokers are common on closed shop LANs.
pub fn is_configured() -> bool {
    has_credential(KEY_BROKER_URL)
}

/// Assemble connect options from stored credentials. `None` until a broker
/// URL has been stored.
pub fn connect_options() -> Option<ConnectOptions> {
    let url = get_credential(KEY_BROKER_URL)?;
    let username = get_credential(KEY_BROKER_USERNAME)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let password = get_credential(KEY_BROKER_PASSWORD).filter(|s| !s.is_empty());
    Some(ConnectOptions {
        url: config::normalize_broker_url(&url),
        username,
        password,
    })
}

/// Stored broker config in the shape the settings UI expects. The password
/// is reported only as present or absent.
pub fn get_full_config() -> Value {
    serde_json::json!({
        "broker_url":      get_credential(KEY_BROKER_URL),
        "broker_username": get_credential(KEY_BROKER_USERNAME),
        "has_password":    has_credential(KEY_BROKER_PASSWORD),
    })
}

/// Store broker credentials received from the settings UI.
///
/// Expected JSON shapes (camelCase, matching the settings payloads):
/// ```json
/// { "brokerUrl": "mqtt://192.168.1.40:1883", "username": "pos", "password": "..." }
/// ```
/// or a single onboarding connection string:
/// ```json
/// { "connectionString": "<url, JSON blob, or base64url blob>" }
/// ```
pub fn update_broker_credentials(payload: &Value) -> Result<Value, String> {
    let options = if let Some(raw) = payload.get("connectionString").and_then(Value::as_str) {
        config::connect_options_from_string(raw).ok_or("Invalid connection string")?
    } else {
        let url = payload
            .get("brokerUrl")
            .or_else(|| payload.get("broker_url"))
            .or_else(|| payload.get("url"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or("Missing required field: brokerUrl")?;
        let username = payload
            .get("username")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let password = payload
            .get("password")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty());
        ConnectOptions {
            url: config::normalize_broker_url(url),
            username,
            password,
        }
    };

    set_credential(KEY_BROKER_URL, &options.url)?;
    match options.username.as_deref() {
        Some(username) => set_credential(KEY_BROKER_USERNAME, username)?,
        None => delete_credential(KEY_BROKER_USERNAME)?,
    }
    match options.password.as_deref() {
        Some(password) => set_credential(KEY_BROKER_PASSWORD, password)?,
        None => delete_credential(KEY_BROKER_PASSWORD)?,
    }
    info!(url = %options.url, "broker credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all broker credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only payload validation is covered here; tests that round-trip through
    // the OS keyring would race other processes using the same service name.

    #[test]
    fn test_update_rejects_missing_broker_url() {
        let err = update_broker_credentials(&serde_json::json!({ "username": "pos" }))
            .expect_err("missing url must be rejected");
        assert!(err.contains("brokerUrl"));
    }

    #[test]
    fn test_update_rejects_blank_broker_url() {
        let err = update_broker_credentials(&serde_json::json!({ "brokerUrl": "   " }))
            .expect_err("blank url must be rejected");
        assert!(err.contains("brokerUrl"));
    }

    #[test]
    fn test_update_rejects_empty_connection_string() {
        let err = update_broker_credentials(&serde_json::json!({ "connectionString": "" }))
            .expect_err("empty connection string must be rejected");
        assert!(err.contains("connection string"));
    }
}
