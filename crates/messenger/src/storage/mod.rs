//! Encrypted local persistence.
//!
//! This module provides:
//! - [`store`]: SQLite key/value table holding the blobs
//! - [`vault`]: Password-derived AES-GCM encryption of each blob
//! - [`backup`]: Plaintext backup bundles and pending imports
//!
//! Layout of the `secure_storage` table:
//!
//! | key                | value                                  |
//! |--------------------|----------------------------------------|
//! | `identity`         | `{salt, iv, data}`, encrypted identity |
//! | `sessions`         | `{iv, data}`, encrypted chat records   |
//! | `contacts`         | `{iv, data}`, encrypted contact book   |
//! | `saved_numeric_id` | plaintext id hint for the unlock prompt |
//!
//! Every mutation re-encrypts and rewrites the whole blob. A failed
//! decryption never writes anything.

pub mod backup;
pub mod store;
pub mod vault;

use std::collections::BTreeMap;
use std::path::Path;

use protocol::{Identity, NumericId, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::contacts::ContactBook;
use crate::session::ChatRecord;

pub use backup::{BackupBundle, IdentityRecord, PendingImport, BACKUP_VERSION};
pub use store::BlobStore;
pub use vault::{EncryptedBlob, IdentityBlob, StorageKey, PBKDF2_ITERATIONS, SALT_LENGTH};

/// Storage key of the identity blob.
pub const IDENTITY_KEY: &str = "identity";
/// Storage key of the sessions blob.
pub const SESSIONS_KEY: &str = "sessions";
/// Storage key of the contacts blob.
pub const CONTACTS_KEY: &str = "contacts";
/// Storage key of the plaintext numeric id hint.
pub const SAVED_NUMERIC_ID_KEY: &str = "saved_numeric_id";

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The master password did not decrypt the identity blob.
    #[error("wrong password")]
    WrongPassword,

    /// A stored blob failed to decrypt or parse under the unlocked key.
    #[error("stored data is corrupt: {0}")]
    CorruptData(String),

    /// No identity has been stored.
    #[error("no account found")]
    NoAccount,

    /// An operation needed the storage key before `unlock` or `create`.
    #[error("storage is locked")]
    Locked,

    /// A backup bundle could not be parsed or verified.
    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    /// Path error.
    #[error("invalid storage path: {0}")]
    InvalidPath(String),

    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Protocol error, such as a sealing failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Encrypted store for the identity, chat histories and contacts.
pub struct SecureStorage {
    store: BlobStore,
    key: Option<StorageKey>,
}

impl SecureStorage {
    /// Opens the store at `path`, locked.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Ok(Self {
            store: BlobStore::open(path)?,
            key: None,
        })
    }

    /// Opens a throwaway in-memory store, locked.
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self {
            store: BlobStore::open_in_memory()?,
            key: None,
        })
    }

    /// Returns whether an identity blob exists.
    pub fn has_account(&self) -> StorageResult<bool> {
        Ok(self.store.get(IDENTITY_KEY)?.is_some())
    }

    /// Returns the plaintext id hint, if one is stored and well formed.
    pub fn saved_numeric_id(&self) -> StorageResult<Option<NumericId>> {
        Ok(self
            .store
            .get(SAVED_NUMERIC_ID_KEY)?
            .and_then(|id| NumericId::new(&id).ok()))
    }

    /// Returns whether the storage key is available.
    pub fn is_unlocked(&self) -> bool {
        self.key.is_some()
    }

    /// Stores a new account under `password`.
    ///
    /// A fresh salt is generated. Sessions and contacts left by a previous
    /// account are removed since they can no longer be decrypted.
    pub fn create(&mut self, identity: &Identity, password: &str) -> StorageResult<()> {
        self.write_account(identity, password, None, None)
    }

    /// Stores an imported account and whatever history it carried.
    ///
    /// Either every blob of the import is written or none is.
    pub fn create_from_import(
        &mut self,
        pending: PendingImport,
        password: &str,
    ) -> StorageResult<Identity> {
        self.write_account(
            &pending.identity,
            password,
            pending.chats.as_ref(),
            pending.contacts.as_ref(),
        )?;
        Ok(pending.identity)
    }

    /// Encrypts every blob of an account, then commits them together.
    fn write_account(
        &mut self,
        identity: &Identity,
        password: &str,
        chats: Option<&BTreeMap<NumericId, ChatRecord>>,
        contacts: Option<&ContactBook>,
    ) -> StorageResult<()> {
        let salt = vault::generate_salt();
        let key = StorageKey::derive(password, &salt);

        let record = IdentityRecord::from_identity(identity);
        let plaintext = zeroize::Zeroizing::new(
            serde_json::to_vec(&record).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
        );
        let identity_blob = serde_json::to_string(&IdentityBlob {
            salt: salt.to_vec(),
            blob: key.encrypt(&plaintext)?,
        })
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let sessions_blob = chats.map(|c| seal(&key, c)).transpose()?;
        let contacts_blob = contacts.map(|c| seal(&key, c)).transpose()?;

        self.store.replace_all(&[
            (IDENTITY_KEY, Some(identity_blob.as_str())),
            (SAVED_NUMERIC_ID_KEY, Some(identity.numeric_id().as_str())),
            (SESSIONS_KEY, sessions_blob.as_deref()),
            (CONTACTS_KEY, contacts_blob.as_deref()),
        ])?;
        self.key = Some(key);

        info!(id = %identity.numeric_id(), "Account created");
        Ok(())
    }

    /// Unlocks the store and returns the stored identity.
    ///
    /// An authentication failure on the identity blob is reported as
    /// [`StorageError::WrongPassword`]. Nothing is written either way.
    pub fn unlock(&mut self, password: &str) -> StorageResult<Identity> {
        let json = self.store.get(IDENTITY_KEY)?.ok_or(StorageError::NoAccount)?;
        let blob: IdentityBlob = serde_json::from_str(&json)
            .map_err(|e| StorageError::CorruptData(format!("identity blob: {}", e)))?;

        let key = StorageKey::derive(password, &blob.salt);
        let plaintext = key.decrypt(&blob.blob).map_err(|e| match e {
            ProtocolError::Decryption(_) => StorageError::WrongPassword,
            other => StorageError::Protocol(other),
        })?;

        let record: IdentityRecord = serde_json::from_slice(&plaintext)
            .map_err(|e| StorageError::CorruptData(format!("identity record: {}", e)))?;
        let identity = record
            .to_identity()
            .map_err(|e| StorageError::CorruptData(e.to_string()))?;

        self.key = Some(key);
        debug!(id = %identity.numeric_id(), "Storage unlocked");
        Ok(identity)
    }

    /// Drops the storage key.
    pub fn lock(&mut self) {
        self.key = None;
    }

    /// Re-encrypts and overwrites the sessions blob.
    pub fn save_sessions(&self, chats: &BTreeMap<NumericId, ChatRecord>) -> StorageResult<()> {
        self.write_encrypted(SESSIONS_KEY, chats)
    }

    /// Loads chat records. A missing blob is an empty map.
    pub fn load_sessions(&self) -> StorageResult<BTreeMap<NumericId, ChatRecord>> {
        Ok(self.read_encrypted(SESSIONS_KEY)?.unwrap_or_default())
    }

    /// Re-encrypts and overwrites the contacts blob.
    pub fn save_contacts(&self, contacts: &ContactBook) -> StorageResult<()> {
        self.write_encrypted(CONTACTS_KEY, contacts)
    }

    /// Loads the contact book. A missing blob is an empty book.
    pub fn load_contacts(&self) -> StorageResult<ContactBook> {
        Ok(self.read_encrypted(CONTACTS_KEY)?.unwrap_or_default())
    }

    /// Builds a plaintext backup of everything stored for `identity`.
    pub fn export_backup(&self, identity: &Identity) -> StorageResult<BackupBundle> {
        Ok(BackupBundle::new(
            identity,
            self.load_sessions()?,
            self.load_contacts()?,
        ))
    }

    /// Parses and verifies a backup file.
    pub fn parse_backup(text: &str) -> StorageResult<PendingImport> {
        BackupBundle::parse(text)
    }

    /// Deletes every stored key and locks the store.
    pub fn forget(&mut self) -> StorageResult<()> {
        self.store.clear()?;
        self.key = None;
        info!("All stored data removed");
        Ok(())
    }

    /// Returns the raw stored value for `key`.
    pub fn raw(&self, key: &str) -> StorageResult<Option<String>> {
        self.store.get(key)
    }

    fn key(&self) -> StorageResult<&StorageKey> {
        self.key.as_ref().ok_or(StorageError::Locked)
    }

    fn write_encrypted<T: Serialize>(&self, name: &str, value: &T) -> StorageResult<()> {
        let json = seal(self.key()?, value)?;
        self.store.put(name, &json)?;
        debug!(blob = name, bytes = json.len(), "Blob written");
        Ok(())
    }

    fn read_encrypted<T: DeserializeOwned>(&self, name: &str) -> StorageResult<Option<T>> {
        let key = self.key()?;
        let Some(json) = self.store.get(name)? else {
            return Ok(None);
        };
        let blob: EncryptedBlob = serde_json::from_str(&json)
            .map_err(|e| StorageError::CorruptData(format!("{} blob: {}", name, e)))?;
        let plaintext = key
            .decrypt(&blob)
            .map_err(|e| StorageError::CorruptData(format!("{} blob: {}", name, e)))?;
        let value = serde_json::from_slice(&plaintext)
            .map_err(|e| StorageError::CorruptData(format!("{} contents: {}", name, e)))?;
        Ok(Some(value))
    }
}

/// Serializes `value` and encrypts it into the JSON form of an [`EncryptedBlob`].
fn seal<T: Serialize>(key: &StorageKey, value: &T) -> StorageResult<String> {
    let plaintext = zeroize::Zeroizing::new(
        serde_json::to_vec(value).map_err(|e| ProtocolError::Serialization(e.to_string()))?,
    );
    let blob = key.encrypt(&plaintext)?;
    Ok(serde_json::to_string(&blob).map_err(|e| ProtocolError::Serialization(e.to_string()))?)
}

impl std::fmt::Debug for SecureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}
