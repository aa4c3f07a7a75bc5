//! Secure terminal config storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the terminal's provisioning
//! state: the reconciliation server URL, the POS API key, and the terminal
//! and branch identity used in every sync request.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "branch-sync";

// Credential keys
const KEY_SERVER_URL: &str = "server_url";
const KEY_TERMINAL_ID: &str = "terminal_id";
const KEY_API_KEY: &str = "pos_api_key";
const KEY_BRANCH_ID: &str = "branch_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SERVER_URL, KEY_TERMINAL_ID, KEY_API_KEY, KEY_BRANCH_ID];

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
        Ok(pw) => Some(pw),
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

/// The terminal is considered provisioned when server URL, branch ID, and
/// API key are all present in the credential store.
pub fn is_configured() -> bool {
    has_credential(KEY_SERVER_URL) && has_credential(KEY_BRANCH_ID) && has_credential(KEY_API_KEY)
}

/// Store terminal credentials received during onboarding.
///
/// Accepts either discrete fields or a connection string (base64-encoded
/// JSON `{key, url, tid, bid}`) pasted into the `apiKey` field, which is the
/// path the provisioning UI uses.
///
/// Expected JSON shape (camelCase):
/// ```json
/// {
///   "apiKey": "...",
///   "serverUrl": "...",  // optional when encoded in the connection string
///   "terminalId": "...", // optional
///   "branchId": "..."    // optional
/// }
/// ```
pub fn update_terminal_credentials(payload: &Value) -> Result<Value, String> {
    let raw_api_key = payload
        .get("apiKey")
        .or_else(|| payload.get("pos_api_key"))
        .and_then(Value::as_str)
        .ok_or("Missing required field: apiKey")?;
    let mut terminal_id = payload
        .get("terminalId")
        .or_else(|| payload.get("terminal_id"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut server_url = payload
        .get("serverUrl")
        .or_else(|| payload.get("server_url"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let mut branch_id = payload
        .get("branchId")
        .or_else(|| payload.get("branch_id"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut api_key = raw_api_key.trim().to_string();
    if let Some(decoded_key) = crate::api::extract_api_key_from_connection_string(raw_api_key) {
        api_key = decoded_key;
        if let Some(decoded_tid) =
            crate::api::extract_terminal_id_from_connection_string(raw_api_key)
        {
            terminal_id = Some(decoded_tid);
        }
        if let Some(decoded_url) =
            crate::api::extract_server_url_from_connection_string(raw_api_key)
        {
            server_url = Some(decoded_url);
        }
        if let Some(decoded_bid) = crate::api::extract_branch_id_from_connection_string(raw_api_key)
        {
            branch_id = Some(decoded_bid);
        }
    }

    if api_key.trim().is_empty() {
        return Err("Missing required field: apiKey".to_string());
    }
    let branch_id = branch_id.ok_or("Missing required field: branchId")?;

    set_credential(KEY_API_KEY, api_key.trim())?;
    set_credential(KEY_BRANCH_ID, &branch_id)?;

    if let Some(url) = server_url.as_deref() {
        let normalized = crate::api::normalize_server_url(url);
        if !normalized.trim().is_empty() {
            set_credential(KEY_SERVER_URL, normalized.trim())?;
        }
    }
    if let Some(tid) = terminal_id.as_deref() {
        set_credential(KEY_TERMINAL_ID, tid)?;
    }

    info!(branch_id = %branch_id, "terminal credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset - deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
