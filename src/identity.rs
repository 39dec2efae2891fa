//! Participant identity that survives reconnects.
//!
//! The identity (display name, role and participant id) lives in a small
//! key-value store scoped to the client device. [`MemoryStore`] keeps it for
//! the lifetime of the process, [`FileStore`] keeps it in a JSON file.

use crate::types::{ParticipantId, Role};
use rand::Rng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const NAME_KEY: &str = "voting-app-username";
pub const ROLE_KEY: &str = "voting-app-role";
pub const ID_KEY: &str = "voting-app-userid";

const SUFFIX_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LENGTH: usize = 9;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored identity is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persistent string key-value storage
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> StoreResult<()>;
    fn remove(&mut self, key: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        self.values.remove(key);
        Ok(())
    }
}

/// JSON-object file, rewritten on every mutation
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: HashMap<String, String>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => HashMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> StoreResult<()> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> StoreResult<()> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// What [`IdentityStore::load_identity`] found
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedIdentity {
    pub name: String,
    pub role: Role,
    pub id: Option<ParticipantId>,
    /// Whether a display name was stored (callers prompt for one otherwise)
    pub found: bool,
}

pub struct IdentityStore<S> {
    store: S,
}

impl<S: KeyValueStore> IdentityStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn load_identity(&self) -> LoadedIdentity {
        let name = self.store.get(NAME_KEY).filter(|n| !n.is_empty());
        let role = self
            .store
            .get(ROLE_KEY)
            .map(|r| Role::parse(&r))
            .unwrap_or_default();
        let id = self.store.get(ID_KEY).filter(|id| !id.is_empty());

        LoadedIdentity {
            found: name.is_some(),
            name: name.unwrap_or_default(),
            role,
            id,
        }
    }

    /// Persist name and role, overwriting previous values
    pub fn save_identity(&mut self, name: &str, role: Role) -> StoreResult<()> {
        self.store.set(NAME_KEY, name)?;
        self.store.set(ROLE_KEY, role.as_str())
    }

    /// Return the stored participant id, generating and persisting one if needed
    pub fn ensure_id(&mut self) -> StoreResult<ParticipantId> {
        if let Some(id) = self.store.get(ID_KEY).filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        let id = generate_participant_id();
        self.store.set(ID_KEY, &id)?;
        tracing::debug!("Generated participant id {}", id);
        Ok(id)
    }

    /// Remove every identity field (logout)
    pub fn clear_identity(&mut self) -> StoreResult<()> {
        self.store.remove(NAME_KEY)?;
        self.store.remove(ROLE_KEY)?;
        self.store.remove(ID_KEY)
    }
}

impl IdentityStore<FileStore> {
    /// Open the file-backed identity at `IDENTITY_PATH`, if one is configured
    pub fn open_from_env() -> StoreResult<Option<Self>> {
        crate::config::identity_path_from_env()
            .map(|path| FileStore::open(path).map(Self::new))
            .transpose()
    }
}

/// A friendly default display name, e.g. "clever-otter"
pub fn suggest_display_name() -> String {
    petname::petname(2, "-").unwrap_or_else(|| format!("guest-{}", random_suffix()))
}

/// `user_<unix-millis>_<9 base36 chars>`
pub fn generate_participant_id() -> ParticipantId {
    prefixed_id("user")
}

/// `s_<unix-millis>_<9 base36 chars>`, used in shareable `/s/<id>` links
pub fn generate_session_id() -> String {
    prefixed_id("s")
}

fn prefixed_id(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        chrono::Utc::now().timestamp_millis(),
        random_suffix()
    )
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LENGTH)
        .map(|_| SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())] as char)
        .collect()
}
