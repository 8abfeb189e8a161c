//! Key material: locally-owned signing keys and the pubkey→keyID table.
//!
//! Every signer public key ever seen is recorded in `keys` so messages can
//! be joined to their signer's keyID. Locally-owned keys additionally keep
//! their base58 secret in `private_keys`; exactly one of them is the
//! default signing key.

use rusqlite::{params, Connection, OptionalExtension};
use vouch_sdk::keys as sdk_keys;

use super::error::{Result, StoreError};
use super::Store;

/// A locally-owned key as exposed by `listmykeys`.
#[derive(Debug, Clone)]
pub struct OwnedKey {
    pub pub_key: String,
    pub key_id: String,
    pub priv_key: String,
    pub is_default: bool,
}

/// Load the default key, generating and persisting one on first open.
pub(super) fn ensure_default_key(conn: &Connection) -> Result<ed25519_dalek::SigningKey> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT private_key FROM private_keys WHERE is_default = 1",
            [],
            |r| r.get(0),
        )
        .optional()?;

    match existing {
        // a default row whose secret no longer decodes means the key we
        // are expected to sign with is not actually available
        Some(encoded) => sdk_keys::decode_secret(&encoded).map_err(|_| StoreError::UnknownKey),
        None => {
            let key = sdk_keys::generate();
            import_key(conn, &key, true)?;
            tracing::info!(key_id = %sdk_keys::key_id(&key), "generated default signing key");
            Ok(key)
        }
    }
}

pub(super) fn load_my_key_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT k.key_id FROM keys AS k
         INNER JOIN private_keys AS p ON p.pub_key = k.pub_key",
    )?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

fn import_key(conn: &Connection, key: &ed25519_dalek::SigningKey, set_default: bool) -> Result<()> {
    let pub_key = sdk_keys::encode_public(key);
    let key_id = sdk_keys::key_id(key);
    conn.execute(
        "INSERT OR IGNORE INTO keys (pub_key, key_id) VALUES (?1, ?2)",
        params![pub_key, key_id],
    )?;
    if set_default {
        conn.execute("UPDATE private_keys SET is_default = 0", [])?;
    }
    conn.execute(
        "INSERT OR REPLACE INTO private_keys (pub_key, private_key, is_default) VALUES (?1, ?2, ?3)",
        params![pub_key, sdk_keys::encode_secret(key), set_default as i64],
    )?;
    Ok(())
}

impl Store {
    /// Record a signer public key in `keys`, evicting on a full store.
    /// Idempotent; rejects undecodable keys.
    pub(super) fn save_pub_key(&self, conn: &Connection, pub_key: &str) -> Result<String> {
        let key_id = sdk_keys::key_id_from_public(pub_key)?;
        self.with_eviction(conn, |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO keys (pub_key, key_id) VALUES (?1, ?2)",
                params![pub_key, key_id],
            )
        })?;
        Ok(key_id)
    }

    /// Import a base58 secret key. Refreshes the owned-keyID cache and
    /// enqueues a trust map for the imported key.
    pub fn import_priv_key(&self, encoded: &str, set_default: bool) -> Result<OwnedKey> {
        self.check_open()?;
        let key = sdk_keys::decode_secret(encoded)?;
        {
            let conn = self.db.lock();
            import_key(&conn, &key, set_default)?;
            self.refresh_my_key_ids(&conn)?;
        }
        if set_default {
            *self.default_key.lock() = key.clone();
        }
        let key_id = sdk_keys::key_id(&key);
        self.queue_trust_map_update(
            vouch_sdk::Identifier::new("keyID", key_id.clone()),
            self.opts.trust_map_depth,
        );
        Ok(OwnedKey {
            pub_key: sdk_keys::encode_public(&key),
            key_id,
            priv_key: encoded.to_string(),
            is_default: set_default,
        })
    }

    /// Generate and persist a fresh (non-default) keypair.
    pub fn new_key(&self) -> Result<OwnedKey> {
        self.check_open()?;
        let key = sdk_keys::generate();
        let encoded = sdk_keys::encode_secret(&key);
        self.import_priv_key(&encoded, false)
    }

    /// Make an imported key the default signing key.
    pub fn set_default_key(&self, encoded: &str) -> Result<()> {
        self.import_priv_key(encoded, true)?;
        Ok(())
    }

    /// The current default signing key.
    pub fn default_key(&self) -> ed25519_dalek::SigningKey {
        self.default_key.lock().clone()
    }

    /// keyID of the current default signing key.
    pub fn default_key_id(&self) -> String {
        sdk_keys::key_id(&self.default_key.lock())
    }

    /// All locally-owned keys.
    pub fn my_keys(&self) -> Result<Vec<OwnedKey>> {
        self.check_open()?;
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT k.pub_key, k.key_id, p.private_key, p.is_default FROM keys AS k
             INNER JOIN private_keys AS p ON p.pub_key = k.pub_key",
        )?;
        let keys = stmt
            .query_map([], |r| {
                Ok(OwnedKey {
                    pub_key: r.get(0)?,
                    key_id: r.get(1)?,
                    priv_key: r.get(2)?,
                    is_default: r.get::<_, i64>(3)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    /// Cached keyIDs of locally-owned keys.
    pub fn my_key_ids(&self) -> Vec<String> {
        self.my_key_ids.read().clone()
    }

    pub(super) fn refresh_my_key_ids(&self, conn: &Connection) -> Result<()> {
        *self.my_key_ids.write() = load_my_key_ids(conn)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    #[test]
    fn default_key_persists_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let first = {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            store.default_key_id()
        };
        let second = {
            let store = Store::open(&path, StoreOptions::default()).unwrap();
            store.default_key_id()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn import_and_set_default() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let original_default = store.default_key_id();

        let key = sdk_keys::generate();
        let encoded = sdk_keys::encode_secret(&key);
        let imported = store.import_priv_key(&encoded, false).unwrap();
        assert_eq!(imported.key_id, sdk_keys::key_id(&key));
        assert_eq!(store.default_key_id(), original_default);
        assert_eq!(store.my_key_ids().len(), 2);

        store.set_default_key(&encoded).unwrap();
        assert_eq!(store.default_key_id(), imported.key_id);

        let keys = store.my_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.iter().filter(|k| k.is_default).count(), 1);
    }

    #[test]
    fn bad_secret_is_rejected() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        assert!(store.import_priv_key("definitely-not-a-key", false).is_err());
    }
}
