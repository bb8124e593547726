//! Plaintext backup bundles for moving an account between devices.

use std::collections::BTreeMap;

use protocol::{Identity, Jwk, NumericId};
use serde::{Deserialize, Serialize};

use super::{StorageError, StorageResult};
use crate::contacts::ContactBook;
use crate::session::{now_millis, ChatRecord};

/// Current backup format version.
pub const BACKUP_VERSION: u32 = 1;

/// Identity material as stored in the identity blob and in backups.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub phone_number: String,
    pub private_key_jwk: Jwk,
    pub public_key_jwk: Jwk,
}

impl IdentityRecord {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            phone_number: identity.numeric_id().to_string(),
            private_key_jwk: identity.private_key_jwk(),
            public_key_jwk: identity.public_key_jwk(),
        }
    }

    /// Imports the key pair, checking it against the stored numeric id.
    pub fn to_identity(&self) -> protocol::Result<Identity> {
        Identity::from_jwks(
            &self.phone_number,
            &self.private_key_jwk,
            &self.public_key_jwk,
        )
    }
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("phone_number", &self.phone_number)
            .field("private_key_jwk", &"[REDACTED]")
            .finish()
    }
}

/// The exported backup file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupBundle {
    pub identity: IdentityRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chats: Option<BTreeMap<NumericId, ChatRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<ContactBook>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    BACKUP_VERSION
}

impl BackupBundle {
    /// Builds a bundle stamped with the current time.
    pub fn new(
        identity: &Identity,
        chats: BTreeMap<NumericId, ChatRecord>,
        contacts: ContactBook,
    ) -> Self {
        Self {
            identity: IdentityRecord::from_identity(identity),
            chats: Some(chats),
            contacts: Some(contacts),
            timestamp: now_millis(),
            version: BACKUP_VERSION,
        }
    }

    /// Serializes the bundle as pretty-printed JSON.
    pub fn to_json(&self) -> StorageResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StorageError::InvalidBackup(format!("failed to serialize: {}", e)))
    }

    /// Parses and verifies a backup file.
    ///
    /// The embedded private key must import and agree with the embedded
    /// public key and numeric id before anything is accepted.
    pub fn parse(text: &str) -> StorageResult<PendingImport> {
        let bundle: BackupBundle = serde_json::from_str(text)
            .map_err(|e| StorageError::InvalidBackup(format!("malformed JSON: {}", e)))?;

        if bundle.version > BACKUP_VERSION {
            return Err(StorageError::InvalidBackup(format!(
                "unsupported version {}",
                bundle.version
            )));
        }

        let identity = bundle
            .identity
            .to_identity()
            .map_err(|e| StorageError::InvalidBackup(e.to_string()))?;

        Ok(PendingImport {
            identity,
            chats: bundle.chats,
            contacts: bundle.contacts,
        })
    }
}

/// A verified backup waiting to be written under a new password.
#[derive(Debug, Clone)]
pub struct PendingImport {
    pub identity: Identity,
    pub chats: Option<BTreeMap<NumericId, ChatRecord>>,
    pub contacts: Option<ContactBook>,
}

impl PendingImport {
    /// A pending import carrying only an identity, as from a login credential.
    pub fn from_identity(identity: Identity) -> Self {
        Self {
            identity,
            chats: None,
            contacts: None,
        }
    }
}
