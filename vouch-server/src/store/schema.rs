//! Table and index definitions.
//!
//! One table per logical entity from the data model: messages, the
//! message↔identifier edge set, derived trust paths and identity clusters,
//! key material, and the cached name/email lookups. WAL mode for concurrent
//! reads during writes; the on-disk byte budget is enforced through
//! `max_page_count`.

use rusqlite::Connection;
use vouch_sdk::identifier::TRUST_PATHABLE_PREDICATES;

use super::error::Result;

pub(super) fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS trust_pathable_predicates (
            value       TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS messages (
            hash            TEXT PRIMARY KEY,
            data            TEXT NOT NULL,
            created         INTEGER NOT NULL,
            msg_type        TEXT NOT NULL,
            rating          INTEGER NOT NULL DEFAULT 0,
            min_rating      INTEGER NOT NULL DEFAULT 0,
            max_rating      INTEGER NOT NULL DEFAULT 0,
            published       INTEGER NOT NULL DEFAULT 0,
            priority        INTEGER NOT NULL DEFAULT 0,
            signer_pub_key  TEXT NOT NULL,
            signature       TEXT NOT NULL,
            is_latest       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS message_identifiers (
            message_hash  TEXT NOT NULL,
            predicate     TEXT NOT NULL,
            identifier    TEXT NOT NULL,
            is_recipient  INTEGER NOT NULL,
            PRIMARY KEY (message_hash, predicate, identifier, is_recipient),
            FOREIGN KEY (message_hash) REFERENCES messages(hash)
        );

        CREATE INDEX IF NOT EXISTS idx_mi_hash_recipient
            ON message_identifiers(message_hash, is_recipient);
        CREATE INDEX IF NOT EXISTS idx_mi_identifier
            ON message_identifiers(predicate, identifier);

        CREATE TABLE IF NOT EXISTS trust_paths (
            start_predicate  TEXT NOT NULL,
            start_id         TEXT NOT NULL,
            end_predicate    TEXT NOT NULL,
            end_id           TEXT NOT NULL,
            distance         INTEGER NOT NULL,
            PRIMARY KEY (start_predicate, start_id, end_predicate, end_id)
        );

        CREATE TABLE IF NOT EXISTS identities (
            identity_id         INTEGER NOT NULL,
            predicate           TEXT NOT NULL,
            identifier          TEXT NOT NULL,
            viewpoint_predicate TEXT NOT NULL,
            viewpoint_id        TEXT NOT NULL,
            confirmations       INTEGER NOT NULL,
            refutations         INTEGER NOT NULL,
            PRIMARY KEY (predicate, identifier, viewpoint_predicate, viewpoint_id)
        );

        CREATE INDEX IF NOT EXISTS idx_identities_viewpoint
            ON identities(viewpoint_predicate, viewpoint_id, identity_id);

        CREATE TABLE IF NOT EXISTS keys (
            pub_key  TEXT PRIMARY KEY,
            key_id   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS private_keys (
            pub_key      TEXT PRIMARY KEY,
            private_key  TEXT NOT NULL,
            is_default   INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (pub_key) REFERENCES keys(pub_key)
        );

        CREATE TABLE IF NOT EXISTS cached_names (
            predicate    TEXT NOT NULL,
            identifier   TEXT NOT NULL,
            cached_name  TEXT NOT NULL,
            PRIMARY KEY (predicate, identifier)
        );

        CREATE TABLE IF NOT EXISTS cached_emails (
            predicate     TEXT NOT NULL,
            identifier    TEXT NOT NULL,
            cached_email  TEXT NOT NULL,
            PRIMARY KEY (predicate, identifier)
        );
        ",
    )?;

    seed_trust_pathable(conn)?;
    Ok(())
}

/// Seed the default trust-pathable predicate set on first open.
fn seed_trust_pathable(conn: &Connection) -> Result<()> {
    let count: i64 =
        conn.query_row("SELECT COUNT(1) FROM trust_pathable_predicates", [], |r| {
            r.get(0)
        })?;
    if count == 0 {
        let mut stmt =
            conn.prepare("INSERT INTO trust_pathable_predicates (value) VALUES (?1)")?;
        for predicate in TRUST_PATHABLE_PREDICATES {
            stmt.execute([predicate])?;
        }
    }
    Ok(())
}

/// Cap the database size. The budget is expressed in whole megabytes and
/// translated into a page-count limit at the current page size.
pub(super) fn set_max_size(conn: &Connection, max_size_mb: u64) -> Result<()> {
    let max_size_mb = max_size_mb.max(1);
    let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
    let max_pages = (max_size_mb as i64) * (1 << 20) / page_size;
    let _: i64 = conn.query_row(&format!("PRAGMA max_page_count = {max_pages}"), [], |r| {
        r.get(0)
    })?;
    Ok(())
}
