//! The signed-in user and their cached role.

use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
};

use log::{log, Level};

use crate::{
    error::{CampusError, CampusResult},
    identity::Identity,
    schema::{
        db::{Role, UserRecord},
        query::DocumentPath,
    },
    store::{encode, DocumentStore},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub avatar: Option<String>,
}

impl SessionUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Default)]
pub struct Session {
    current: RwLock<Option<SessionUser>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session for `identity`. The role is read from the user's
    /// record once and cached; a first sign-in creates a standard record.
    pub async fn sign_in(
        &self,
        identity: Identity,
        store: &dyn DocumentStore,
    ) -> CampusResult<SessionUser> {
        let path = DocumentPath::user(&identity.id);
        let role = match store.get(&path).await {
            Ok(Some(doc)) => match doc.decode::<UserRecord>() {
                Ok(record) => record.role,
                Err(e) => {
                    log!(Level::Warn, "Unreadable user record {path}: {e}");
                    Role::Standard
                }
            },
            Ok(None) => {
                let record = UserRecord {
                    id: identity.id.clone(),
                    display_name: identity.display_name.clone(),
                    email: identity.email.clone(),
                    role: Role::Standard,
                    avatar: identity.avatar.clone(),
                };
                let data = encode(&record).map_err(CampusError::from_write)?;
                store.set(&path, data).await.map_err(CampusError::from_write)?;
                log!(Level::Info, "Created user record for {}", identity.id);
                Role::Standard
            }
            Err(e) => {
                log!(Level::Warn, "Could not read role for {}: {e}", identity.id);
                Role::Standard
            }
        };

        let user = SessionUser {
            id: identity.id,
            display_name: identity.display_name,
            email: identity.email,
            role,
            avatar: identity.avatar,
        };
        log!(Level::Info, "{} signed in as {}", user.id, user.role);
        *self.write() = Some(user.clone());
        Ok(user)
    }

    pub fn sign_out(&self) {
        if let Some(user) = self.write().take() {
            log!(Level::Info, "{} signed out", user.id);
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<SessionUser>> {
        self.current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> Option<SessionUser> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn require_user(&self) -> CampusResult<SessionUser> {
        self.current().ok_or(CampusError::AuthRequired)
    }

    pub fn require_admin(&self) -> CampusResult<SessionUser> {
        let user = self.require_user()?;
        if user.is_admin() {
            Ok(user)
        } else {
            Err(CampusError::PermissionDenied(format!(
                "{} is not an admin",
                user.id
            )))
        }
    }
}

/// Display names of other users, fetched on demand and kept for the session.
#[derive(Default)]
pub struct UserDirectory {
    names: Mutex<HashMap<String, String>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, uid: &str) -> Option<String> {
        self.names.lock().ok()?.get(uid).cloned()
    }

    /// The user's display name, or `uid` itself when no record is readable.
    pub async fn display_name(&self, store: &dyn DocumentStore, uid: &str) -> String {
        if let Some(name) = self.cached(uid) {
            return name;
        }
        let name = match store.get(&DocumentPath::user(uid)).await {
            Ok(Some(doc)) => doc
                .decode::<UserRecord>()
                .ok()
                .map(|record| record.display_name)
                .filter(|name| !name.trim().is_empty()),
            Ok(None) => None,
            Err(e) => {
                log!(Level::Warn, "Failed to fetch user {uid}: {e}");
                return uid.to_string();
            }
        };
        match name {
            Some(name) => {
                if let Ok(mut names) = self.names.lock() {
                    names.insert(uid.to_string(), name.clone());
                }
                name
            }
            None => uid.to_string(),
        }
    }
}
