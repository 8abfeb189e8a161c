//! SQLite persistence layer and trust-graph engine.
//!
//! A [`Store`] owns the database connection, the default signing key, the
//! in-memory cache of locally-owned keyIDs, and the trust-map regeneration
//! queue. Every public method presents as a single atomic call: the
//! connection is guarded by one mutex and internal helpers operate on the
//! already-locked connection.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use vouch_sdk::{Identifier, Message};

pub mod cluster;
pub mod error;
pub mod ingest;
pub mod keys;
pub mod queries;
pub mod schema;
pub mod trust;

pub use cluster::LinkedIdentifier;
pub use error::{Result, StoreError};
pub use keys::OwnedKey;
pub use queries::{IdOverview, SearchResult};

/// Bytes to free per eviction round when an insert hits the size budget.
const EVICTION_CHUNK_BYTES: i64 = 10_000;

/// Tunables fixed at open time.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// On-disk byte budget in megabytes.
    pub max_size_mb: u64,
    /// Closure depth used for queued trust-map regeneration.
    pub trust_map_depth: u32,
    /// Replacement window for repeat messages, in seconds.
    pub min_msg_interval: i64,
    /// Whether priority-0 messages are stored at all.
    pub save_untrusted: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            trust_map_depth: 4,
            min_msg_interval: 30 * 24 * 60 * 60,
            save_untrusted: true,
        }
    }
}

/// A queued trust-map regeneration request.
#[derive(Debug, Clone)]
pub struct TrustMapJob {
    pub id: Identifier,
    pub depth: u32,
}

#[derive(Default)]
struct TrustMapQueue {
    items: VecDeque<TrustMapJob>,
    /// Queue membership, deduplicated by identifier. An identifier stays a
    /// member until its regeneration finishes, so re-enqueues during a run
    /// are dropped.
    members: HashSet<Identifier>,
}

/// The message/identity store.
pub struct Store {
    db: Mutex<Connection>,
    default_key: Mutex<ed25519_dalek::SigningKey>,
    my_key_ids: RwLock<Vec<String>>,
    queue: Mutex<TrustMapQueue>,
    shutdown: AtomicBool,
    opts: StoreOptions,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P, opts: StoreOptions) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, opts)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(opts: StoreOptions) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, opts)
    }

    fn from_connection(conn: Connection, opts: StoreOptions) -> Result<Self> {
        schema::init(&conn)?;
        schema::set_max_size(&conn, opts.max_size_mb)?;

        let default_key = keys::ensure_default_key(&conn)?;
        let my_key_ids = keys::load_my_key_ids(&conn)?;

        let store = Self {
            db: Mutex::new(conn),
            default_key: Mutex::new(default_key),
            my_key_ids: RwLock::new(my_key_ids),
            queue: Mutex::new(TrustMapQueue::default()),
            shutdown: AtomicBool::new(false),
            opts,
        };
        store.queue_my_trust_maps();
        Ok(store)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    // ── Shutdown ───────────────────────────────────────────────────────

    /// Request shutdown. In-flight calls run to completion; subsequent
    /// calls fail with [`StoreError::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(StoreError::Shutdown)
        } else {
            Ok(())
        }
    }

    // ── Trust-map queue ────────────────────────────────────────────────

    /// Enqueue a trust-map regeneration. Idempotent: an identifier already
    /// queued (or currently being regenerated) is not enqueued again.
    pub fn queue_trust_map_update(&self, id: Identifier, depth: u32) {
        let mut queue = self.queue.lock();
        if queue.members.insert(id.clone()) {
            queue.items.push_back(TrustMapJob { id, depth });
        }
    }

    /// Enqueue regeneration for every locally-owned keyID.
    pub fn queue_my_trust_maps(&self) {
        let depth = self.opts.trust_map_depth;
        for key_id in self.my_key_ids.read().iter() {
            self.queue_trust_map_update(Identifier::new("keyID", key_id.clone()), depth);
        }
    }

    /// Pop the next queued job. The identifier stays a queue member until
    /// [`Store::finish_trust_map_job`] is called for it.
    pub fn take_trust_map_job(&self) -> Option<TrustMapJob> {
        self.queue.lock().items.pop_front()
    }

    pub fn finish_trust_map_job(&self, id: &Identifier) {
        self.queue.lock().members.remove(id);
    }

    pub fn trust_map_queue_len(&self) -> usize {
        self.queue.lock().items.len()
    }

    // ── Counts and lookups ─────────────────────────────────────────────

    pub fn message_count(&self) -> Result<i64> {
        let conn = self.db.lock();
        Ok(conn.query_row("SELECT COUNT(1) FROM messages", [], |r| r.get(0))?)
    }

    pub fn identifier_count(&self) -> Result<i64> {
        let conn = self.db.lock();
        Ok(conn.query_row(
            "SELECT COUNT(DISTINCT identifier) FROM message_identifiers",
            [],
            |r| r.get(0),
        )?)
    }

    /// Fetch a message by hash. [`StoreError::NotFound`] when absent.
    pub fn message_by_hash(&self, hash: &str) -> Result<Message> {
        let conn = self.db.lock();
        get_message_by_hash(&conn, hash)
    }

    pub fn latest_message_timestamp(&self) -> Result<i64> {
        let conn = self.db.lock();
        let ts: Option<i64> = conn
            .query_row(
                "SELECT created FROM messages ORDER BY created DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ts.unwrap_or(0))
    }

    // ── Eviction ───────────────────────────────────────────────────────

    /// Run a write, evicting lowest-priority messages and retrying while
    /// the size budget is exhausted.
    fn with_eviction<T>(
        &self,
        conn: &Connection,
        mut op: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        loop {
            match op(conn) {
                Ok(v) => return Ok(v),
                Err(e) if error::is_full(&e) => {
                    tracing::warn!("database full, evicting lowest-priority messages");
                    self.make_free_space(conn, EVICTION_CHUNK_BYTES)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop lowest `(priority, created)` messages until at least
    /// `free_bytes_needed` bytes are reclaimable. Fails with
    /// [`StoreError::NotEnoughSpace`] when the request exceeds the whole
    /// budget or nothing is left to drop.
    fn make_free_space(&self, conn: &Connection, free_bytes_needed: i64) -> Result<()> {
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let max_page_count: i64 = conn.query_row("PRAGMA max_page_count", [], |r| r.get(0))?;

        if free_bytes_needed > max_page_count * page_size {
            return Err(StoreError::NotEnoughSpace);
        }

        loop {
            let victim: Option<String> = conn
                .query_row(
                    "SELECT hash FROM messages ORDER BY priority ASC, created ASC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(hash) = victim else {
                return Err(StoreError::NotEnoughSpace);
            };
            self.drop_message_inner(conn, &hash)?;

            let free_pages: i64 = conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
            if free_pages * page_size >= free_bytes_needed {
                return Ok(());
            }
        }
    }
}

// ── Row mapping ────────────────────────────────────────────────────────

/// Map a `SELECT p.*` row from `messages` back into a [`Message`].
pub(crate) fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let data: String = row.get(1)?;
    let mut msg = Message::from_canonical_json(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    msg.published = row.get::<_, i64>(7)? != 0;
    msg.priority = row.get(8)?;
    msg.is_latest = row.get::<_, i64>(11)? != 0;
    Ok(msg)
}

pub(crate) fn get_message_by_hash(conn: &Connection, hash: &str) -> Result<Message> {
    conn.query_row(
        "SELECT * FROM messages WHERE hash = ?1",
        params![hash],
        row_to_message,
    )
    .optional()?
    .ok_or(StoreError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_seeds_predicates_and_default_key() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        assert_eq!(store.message_count().unwrap(), 0);
        assert_eq!(store.my_key_ids.read().len(), 1);
        // the freshly generated default key lands in the regeneration queue
        assert_eq!(store.trust_map_queue_len(), 1);
    }

    #[test]
    fn queue_is_deduplicated_by_identifier() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        let id = Identifier::new("email", "alice@example.com");
        store.queue_trust_map_update(id.clone(), 4);
        store.queue_trust_map_update(id.clone(), 4);
        store.queue_trust_map_update(id.clone(), 2);
        let before = store.trust_map_queue_len();

        let job = store.take_trust_map_job().unwrap();
        // first job is the default key's; drain until we see ours
        let mut jobs = vec![job];
        while let Some(j) = store.take_trust_map_job() {
            jobs.push(j);
        }
        assert_eq!(jobs.len(), before);
        assert_eq!(jobs.iter().filter(|j| j.id == id).count(), 1);

        // still a member until finished: re-enqueue is dropped
        store.queue_trust_map_update(id.clone(), 4);
        assert_eq!(store.trust_map_queue_len(), 0);
        store.finish_trust_map_job(&id);
        store.queue_trust_map_update(id.clone(), 4);
        assert_eq!(store.trust_map_queue_len(), 1);
    }

    #[test]
    fn shutdown_rejects_operations() {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        store.shutdown();
        let msg = {
            let key = vouch_sdk::keys::generate();
            let mut m = Message::new_rating(
                Identifier::new("email", "a@x"),
                Identifier::new("email", "b@x"),
                1,
                None,
                1,
            );
            m.sign(&key);
            m
        };
        assert!(matches!(
            store.save_message(&msg),
            Err(StoreError::Shutdown)
        ));
    }
}
