use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use keyring::Entry;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::models::{AuthPayload, ProfileUpdate};

const SERVICE: &str = "donation_client";
const USER: &str = "donation_session";
const SESSION_FILE: &str = "session.json";
const TOKEN_FALLBACK_FILE: &str = "session_token.txt";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("keyring unavailable and file fallback disabled: {0}")]
    Keyring(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub user: SessionUser,
}

impl Session {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    pub fn apply_profile(&mut self, update: &ProfileUpdate) {
        if let Some(first) = &update.first_name {
            self.user.first_name = Some(first.clone());
        }
        if let Some(last) = &update.last_name {
            self.user.last_name = Some(last.clone());
        }
        if let Some(url) = &update.profile_image_url {
            self.user.profile_image_url = Some(url.clone());
        }
    }
}

impl From<AuthPayload> for Session {
    fn from(auth: AuthPayload) -> Self {
        Session {
            token: auth.token,
            expires_at: auth.expires_at,
            user: SessionUser {
                id: auth.id,
                email: auth.email,
                first_name: auth.first_name,
                last_name: auth.last_name,
                address: auth.address,
                profile_image_url: auth.profile_image_url,
                active: auth.active,
            },
        }
    }
}

/// On-disk record. The keyring store leaves `token` out.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    user: SessionUser,
    expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> Result<(), SessionError>;
    fn load(&self) -> Result<Option<Session>, SessionError>;
    fn clear(&self) -> Result<(), SessionError>;

    /// The stored session if it has not expired; an expired one is cleared.
    fn load_active(&self, now_ms: i64) -> Result<Option<Session>, SessionError> {
        match self.load()? {
            Some(session) if !session.is_expired_at(now_ms) => Ok(Some(session)),
            Some(_) => {
                info!("[SESSION_STORE] Stored session expired, clearing it");
                self.clear()?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn update_user(&self, update: &ProfileUpdate) -> Result<Option<Session>, SessionError> {
        let Some(mut session) = self.load()? else {
            return Ok(None);
        };
        session.apply_profile(update);
        self.save(&session)?;
        Ok(Some(session))
    }
}

fn read_stored(path: &Path) -> Result<Option<StoredSession>, SessionError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&raw)?))
}

fn write_stored(path: &Path, stored: &StoredSession) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(stored)?)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Whole session, token included, in one JSON file.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SESSION_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, session: &Session) -> Result<(), SessionError> {
        write_stored(
            &self.path,
            &StoredSession {
                user: session.user.clone(),
                expires_at: session.expires_at,
                token: Some(session.token.clone()),
            },
        )
    }

    fn load(&self) -> Result<Option<Session>, SessionError> {
        Ok(read_stored(&self.path)?.and_then(|stored| {
            let token = stored.token.filter(|t| !t.trim().is_empty())?;
            Some(Session {
                token,
                expires_at: stored.expires_at,
                user: stored.user,
            })
        }))
    }

    fn clear(&self) -> Result<(), SessionError> {
        remove_if_exists(&self.path)
    }
}

/// Token in the OS keyring, identity and expiry in the data directory.
/// With `allow_fallback` the token goes to a plain file when the keyring is
/// unavailable; otherwise that is an error.
#[derive(Debug, Clone)]
pub struct KeyringSessionStore {
    identity_path: PathBuf,
    fallback_path: PathBuf,
    allow_fallback: bool,
}

impl KeyringSessionStore {
    pub fn new(data_dir: impl AsRef<Path>, allow_fallback: bool) -> Self {
        let dir = data_dir.as_ref();
        Self {
            identity_path: dir.join(SESSION_FILE),
            fallback_path: dir.join(TOKEN_FALLBACK_FILE),
            allow_fallback,
        }
    }

    fn save_token(&self, token: &str) -> Result<(), SessionError> {
        let entry = Entry::new(SERVICE, USER);
        match entry.set_password(token) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !self.allow_fallback {
                    return Err(SessionError::Keyring(e.to_string()));
                }
                if let Some(parent) = self.fallback_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.fallback_path, token)?;
                // never log the token itself
                warn!("[SESSION_STORE] Keyring unavailable, persisted token to fallback file");
                Ok(())
            }
        }
    }

    fn load_token(&self) -> Option<String> {
        let entry = Entry::new(SERVICE, USER);
        match entry.get_password() {
            Ok(t) if !t.trim().is_empty() => Some(t),
            Ok(_) => None,
            Err(e) => {
                debug!("[SESSION_STORE] Keyring read failed: {}", e);
                if !self.allow_fallback {
                    return None;
                }
                fs::read_to_string(&self.fallback_path)
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|t| !t.is_empty())
            }
        }
    }
}

impl SessionStore for KeyringSessionStore {
    fn save(&self, session: &Session) -> Result<(), SessionError> {
        self.save_token(&session.token)?;
        write_stored(
            &self.identity_path,
            &StoredSession {
                user: session.user.clone(),
                expires_at: session.expires_at,
                token: None,
            },
        )
    }

    fn load(&self) -> Result<Option<Session>, SessionError> {
        let Some(stored) = read_stored(&self.identity_path)? else {
            return Ok(None);
        };
        Ok(self.load_token().map(|token| Session {
            token,
            expires_at: stored.expires_at,
            user: stored.user,
        }))
    }

    fn clear(&self) -> Result<(), SessionError> {
        let entry = Entry::new(SERVICE, USER);
        let _ = entry.delete_password();
        if self.allow_fallback {
            remove_if_exists(&self.fallback_path)?;
        }
        remove_if_exists(&self.identity_path)
    }
}
