//! Identities and their on-disk store
//!
//! An `Identity` is an account name plus its current password. The
//! `IdentityStore` keeps identities in a JSON file so a password rotated at
//! runtime survives a restart. All writes use atomic temp-file + rename and
//! a tokio Mutex serializes concurrent updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::params::ConnectOptions;

/// A named account with its current credential.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: String,
    pub password: Secret<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>, password: impl Into<Secret<String>>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Standard-privilege connect options for this identity.
    pub fn connect_options(&self, connect_string: &str) -> ConnectOptions {
        ConnectOptions::new(self.user.clone(), self.password.clone()).connect_string(connect_string)
    }
}

/// One persisted record. `updated_at` is a unix timestamp in milliseconds.
#[derive(Clone, Serialize, Deserialize)]
struct StoredIdentity {
    password: String,
    updated_at: u64,
}

/// Thread-safe identity file manager.
pub struct IdentityStore {
    path: PathBuf,
    state: Mutex<HashMap<String, StoredIdentity>>,
}

impl IdentityStore {
    /// Load identities from `path`, creating an empty file if it is missing.
    pub async fn load(path: PathBuf) -> StoreResult<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(format!("reading identity file: {e}")))?;
            let identities: HashMap<String, StoredIdentity> = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Parse(format!("parsing identity file: {e}")))?;
            info!(path = %path.display(), identities = identities.len(), "loaded identities");
            identities
        } else {
            info!(path = %path.display(), "identity file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn get(&self, user: &str) -> Option<Identity> {
        let state = self.state.lock().await;
        state
            .get(user)
            .map(|stored| Identity::new(user, stored.password.clone()))
    }

    /// Insert or replace an identity and persist.
    pub async fn put(&self, identity: &Identity) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.insert(
            identity.user.clone(),
            StoredIdentity {
                password: identity.password.expose().clone(),
                updated_at: now_millis(),
            },
        );
        debug!(user = %identity.user, "stored identity");
        write_atomic(&self.path, &state).await
    }

    /// Record a rotated password for an identity that is already stored.
    pub async fn update_password(&self, user: &str, password: &Secret<String>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .get_mut(user)
            .ok_or_else(|| StoreError::NotFound(format!("identity {user} not in store")))?;
        stored.password = password.expose().clone();
        stored.updated_at = now_millis();
        debug!(user, "updated stored password");
        write_atomic(&self.path, &state).await
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write identities to `path` atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<String, StoredIdentity>) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| StoreError::Parse(format!("serializing identities: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io("identity path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".identities.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| StoreError::Io(format!("writing temp identity file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| StoreError::Io(format!("setting identity file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::Io(format!("renaming temp identity file: {e}")))?;

    debug!(path = %path.display(), "persisted identities");
    Ok(())
}
