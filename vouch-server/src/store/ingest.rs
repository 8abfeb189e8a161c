//! Message ingest: validation, persistence, `IsLatest` maintenance,
//! trust-path recording, and priority scoring.
//!
//! `save_message` is the single write entry point. Repeat ingest of the
//! same payload is idempotent and returns the same hash. Writes that hit
//! the size budget go through the eviction loop before surfacing.

use rusqlite::{params, Connection};
use vouch_sdk::message::is_connection_type;
use vouch_sdk::{CodecError, Identifier, Message};

use super::error::Result;
use super::trust::trust_distance_inner;
use super::{get_message_by_hash, row_to_message, Store};

const MAX_PRIORITY: i64 = 100;
/// Sentinel for "no trust path"; large enough that integer division by it
/// zeroes any contribution.
const UNREACHABLE: i64 = 1_000_000;

impl Store {
    /// Validate and persist a message.
    ///
    /// Returns `Ok(None)` when the message scores priority 0 and untrusted
    /// saves are disabled — a refusal, not an error. Otherwise returns the
    /// message hash.
    pub fn save_message(&self, msg: &Message) -> Result<Option<String>> {
        self.check_open()?;
        if !msg.verify() {
            return Err(CodecError::InvalidSignature.into());
        }

        let conn = self.db.lock();
        let priority = self.compute_priority(&conn, msg)?;
        if priority == 0 && !self.opts.save_untrusted {
            return Ok(None);
        }

        let hash = msg.hash().to_string();

        // Connection messages are exempt from IsLatest deduplication; they
        // are stored flagged latest and left alone.
        let is_connection = is_connection_type(msg.msg_type());
        self.with_eviction(&conn, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO messages
                 (hash, data, created, msg_type, rating, min_rating, max_rating,
                  published, priority, signer_pub_key, signature, is_latest)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    hash,
                    msg.to_canonical_json(),
                    msg.timestamp(),
                    msg.msg_type(),
                    msg.rating(),
                    msg.min_rating(),
                    msg.max_rating(),
                    msg.published as i64,
                    priority,
                    msg.signature.pub_key,
                    msg.signature.signature,
                    is_connection as i64,
                ],
            )
        })?;

        for author in msg.authors() {
            self.save_edge(&conn, &hash, author, false)?;
        }
        for recipient in msg.recipients() {
            self.save_edge(&conn, &hash, recipient, true)?;
        }

        self.save_pub_key(&conn, &msg.signature.pub_key)?;

        if !is_connection {
            self.update_is_latest(&conn, msg)?;
        }
        self.save_message_trust_paths(&conn, msg)?;

        Ok(Some(hash))
    }

    /// Delete a message and its edges, re-elect `IsLatest` for the classes
    /// it covered, and queue owned-key trust maps for regeneration.
    pub fn drop_message(&self, hash: &str) -> Result<()> {
        self.check_open()?;
        let conn = self.db.lock();
        self.drop_message_inner(&conn, hash)
    }

    pub(super) fn drop_message_inner(&self, conn: &Connection, hash: &str) -> Result<()> {
        let msg = get_message_by_hash(conn, hash)?;

        conn.execute(
            "DELETE FROM message_identifiers WHERE message_hash = ?1",
            params![hash],
        )?;
        conn.execute("DELETE FROM messages WHERE hash = ?1", params![hash])?;

        if !is_connection_type(msg.msg_type()) {
            self.update_is_latest(conn, &msg)?;
        }
        self.queue_my_trust_maps();
        Ok(())
    }

    /// Mark a message published (relaying is the caller's concern).
    pub fn set_published(&self, hash: &str) -> Result<()> {
        self.check_open()?;
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE messages SET published = 1 WHERE hash = ?1",
            params![hash],
        )?;
        if changed == 0 {
            return Err(super::StoreError::NotFound);
        }
        Ok(())
    }

    fn save_edge(
        &self,
        conn: &Connection,
        hash: &str,
        id: &Identifier,
        is_recipient: bool,
    ) -> Result<()> {
        self.with_eviction(conn, |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO message_identifiers
                 (message_hash, predicate, identifier, is_recipient)
                 VALUES (?1, ?2, ?3, ?4)",
                params![hash, id.predicate, id.value, is_recipient as i64],
            )
        })?;
        Ok(())
    }

    // ── IsLatest maintenance ───────────────────────────────────────────

    /// Maintain the single-latest invariant for every (type, author,
    /// recipient) class the message belongs to, where both identifiers are
    /// trust-pathable.
    ///
    /// A prior latest message inside the minimum interval is dropped
    /// outright (replacement); otherwise current latest rows are cleared
    /// and the class maximum by `(created, hash)` is re-elected.
    fn update_is_latest(&self, conn: &Connection, msg: &Message) -> Result<()> {
        let mut to_drop: Vec<String> = Vec::new();

        let mut select_prior = conn.prepare(
            "SELECT p.hash FROM messages AS p
             INNER JOIN message_identifiers AS author
                 ON author.message_hash = p.hash AND author.is_recipient = 0
             INNER JOIN message_identifiers AS recipient
                 ON recipient.message_hash = p.hash AND recipient.is_recipient = 1
             INNER JOIN trust_pathable_predicates AS ap ON ap.value = author.predicate
             INNER JOIN trust_pathable_predicates AS rp ON rp.value = recipient.predicate
             WHERE p.msg_type = :msg_type
               AND author.predicate = :apred AND author.identifier = :aid
               AND recipient.predicate = :rpred AND recipient.identifier = :rid
               AND p.is_latest = 1 AND p.created < :created
               AND (:created - p.created) < :interval",
        )?;
        for author in msg.authors() {
            for recipient in msg.recipients() {
                let rows = select_prior.query_map(
                    rusqlite::named_params! {
                        ":msg_type": msg.msg_type(),
                        ":apred": author.predicate,
                        ":aid": author.value,
                        ":rpred": recipient.predicate,
                        ":rid": recipient.value,
                        ":created": msg.timestamp(),
                        ":interval": self.opts.min_msg_interval,
                    },
                    |r| r.get::<_, String>(0),
                )?;
                for row in rows {
                    to_drop.push(row?);
                }
            }
        }
        drop(select_prior);
        to_drop.sort();
        to_drop.dedup();

        if !to_drop.is_empty() {
            for hash in &to_drop {
                self.drop_message_inner(conn, hash)?;
            }
        } else {
            let mut clear = conn.prepare(
                "UPDATE messages SET is_latest = 0
                 WHERE hash IN (SELECT p.hash FROM messages AS p
                     INNER JOIN message_identifiers AS author
                         ON author.message_hash = p.hash AND author.is_recipient = 0
                     INNER JOIN message_identifiers AS recipient
                         ON recipient.message_hash = p.hash AND recipient.is_recipient = 1
                     INNER JOIN trust_pathable_predicates AS ap ON ap.value = author.predicate
                     INNER JOIN trust_pathable_predicates AS rp ON rp.value = recipient.predicate
                     WHERE p.msg_type = :msg_type
                       AND author.predicate = :apred AND author.identifier = :aid
                       AND recipient.predicate = :rpred AND recipient.identifier = :rid
                       AND p.is_latest = 1)",
            )?;
            for author in msg.authors() {
                for recipient in msg.recipients() {
                    clear.execute(rusqlite::named_params! {
                        ":msg_type": msg.msg_type(),
                        ":apred": author.predicate,
                        ":aid": author.value,
                        ":rpred": recipient.predicate,
                        ":rid": recipient.value,
                    })?;
                }
            }
        }

        let mut elect = conn.prepare(
            "UPDATE messages SET is_latest = 1
             WHERE hash IN (SELECT p.hash FROM messages AS p
                 INNER JOIN message_identifiers AS author
                     ON author.message_hash = p.hash AND author.is_recipient = 0
                 INNER JOIN message_identifiers AS recipient
                     ON recipient.message_hash = p.hash AND recipient.is_recipient = 1
                 INNER JOIN trust_pathable_predicates AS ap ON ap.value = author.predicate
                 INNER JOIN trust_pathable_predicates AS rp ON rp.value = recipient.predicate
                 WHERE p.msg_type = :msg_type
                   AND author.predicate = :apred AND author.identifier = :aid
                   AND recipient.predicate = :rpred AND recipient.identifier = :rid
                 ORDER BY p.created DESC, p.hash DESC LIMIT 1)",
        )?;
        for author in msg.authors() {
            for recipient in msg.recipients() {
                elect.execute(rusqlite::named_params! {
                    ":msg_type": msg.msg_type(),
                    ":apred": author.predicate,
                    ":aid": author.value,
                    ":rpred": recipient.predicate,
                    ":rid": recipient.value,
                })?;
            }
        }
        Ok(())
    }

    // ── Trust-path recording ───────────────────────────────────────────

    /// Record distance-1 paths author→recipient for a positive message
    /// whose signer is trusted by an owned key.
    fn save_message_trust_paths(&self, conn: &Connection, msg: &Message) -> Result<()> {
        if !msg.is_positive() {
            return Ok(());
        }
        if !self.has_trusted_signer(conn, msg)? {
            return Ok(());
        }
        for author in msg.authors() {
            for recipient in msg.recipients() {
                self.save_trust_path(conn, author, recipient, 1)?;
            }
        }
        Ok(())
    }

    // ── Priority ───────────────────────────────────────────────────────

    /// Storage priority: how close the signer and the nearest author are to
    /// our own keys, damped for prolific unknown authors.
    pub(super) fn compute_priority(&self, conn: &Connection, msg: &Message) -> Result<i64> {
        let my_key_ids = self.my_key_ids.read().clone();

        let mut shortest_to_signer = UNREACHABLE;
        if let Ok(signer_key_id) = vouch_sdk::keys::key_id_from_public(&msg.signature.pub_key) {
            if my_key_ids.contains(&signer_key_id) {
                shortest_to_signer = 1;
            } else {
                let signer = Identifier::new("keyID", signer_key_id);
                for key_id in &my_key_ids {
                    let mine = Identifier::new("keyID", key_id.clone());
                    if let Some(d) = trust_distance_inner(conn, &mine, &signer)? {
                        if d > 0 && d < shortest_to_signer {
                            shortest_to_signer = d;
                        }
                    }
                }
            }
        }

        let mut shortest_to_author = UNREACHABLE;
        let mut most_messages_from_author: i64 = -1;
        let mut is_my_message = false;
        for author in msg.authors() {
            if shortest_to_author > 1 {
                for key_id in &my_key_ids {
                    if author.predicate == "keyID" && &author.value == key_id {
                        shortest_to_author = 1;
                        is_my_message = true;
                        break;
                    }
                    let mine = Identifier::new("keyID", key_id.clone());
                    if let Some(d) = trust_distance_inner(conn, &mine, author)? {
                        if d > 0 && d < shortest_to_author {
                            shortest_to_author = d;
                        }
                    }
                }
            }
            let messages_from_author = message_count_by_author(conn, author)?;
            if messages_from_author > most_messages_from_author {
                most_messages_from_author = messages_from_author;
            }
        }

        let mut priority = (MAX_PRIORITY / shortest_to_signer) * (MAX_PRIORITY / shortest_to_author);

        if !is_my_message && most_messages_from_author > 10 {
            priority = (priority as f64 / (most_messages_from_author as f64).log10()) as i64;
        }

        if priority == 0 && shortest_to_signer < UNREACHABLE {
            Ok(5 / shortest_to_signer)
        } else {
            Ok(priority / MAX_PRIORITY)
        }
    }

    /// Recompute stored priorities for every message authored by (and, for
    /// keyIDs, signed by) the given identifier. Runs when a trust path from
    /// an owned key newly reaches it.
    pub(super) fn update_message_priorities(&self, conn: &Connection, id: &Identifier) -> Result<()> {
        let mut to_update = messages_by_author_inner(conn, id)?;
        if id.predicate == "keyID" {
            to_update.extend(messages_by_signer_inner(conn, &id.value)?);
        }

        for msg in to_update {
            let priority = self.compute_priority(conn, &msg)?;
            conn.execute(
                "UPDATE messages SET priority = ?1 WHERE hash = ?2",
                params![priority, msg.hash()],
            )?;
        }
        Ok(())
    }
}

pub(super) fn message_count_by_author(conn: &Connection, author: &Identifier) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(1) FROM message_identifiers
         WHERE predicate = ?1 AND identifier = ?2 AND is_recipient = 0",
        params![author.predicate, author.value],
        |r| r.get(0),
    )?)
}

fn messages_by_author_inner(conn: &Connection, author: &Identifier) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT p.* FROM messages AS p
         INNER JOIN message_identifiers AS pi
             ON pi.message_hash = p.hash AND pi.is_recipient = 0
         WHERE pi.predicate = ?1 AND pi.identifier = ?2",
    )?;
    let msgs = stmt
        .query_map(params![author.predicate, author.value], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(msgs)
}

fn messages_by_signer_inner(conn: &Connection, key_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT p.* FROM messages AS p
         INNER JOIN keys AS k ON k.pub_key = p.signer_pub_key
         WHERE k.key_id = ?1",
    )?;
    let msgs = stmt
        .query_map(params![key_id], row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(msgs)
}
