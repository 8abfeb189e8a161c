//! Trust-map generation, path enumeration, and distances.
//!
//! An edge u→v exists when a latest positive message has u among its
//! authors and v among its recipients, with both predicates trust-pathable.
//! The bounded closures are delegated to SQLite as recursive CTEs; visited
//! vertices are tracked per path in an escaped `predicate:value:` text
//! column so no vertex repeats within a single expansion.

use rusqlite::{params, Connection, OptionalExtension};
use vouch_sdk::identifier::{path_segment, split_path};
use vouch_sdk::{Identifier, Message};

use super::error::Result;
use super::Store;

/// Shared body of the trust closure: seed edges from the start identifier,
/// then extend along positive latest edges, refusing to revisit a vertex
/// already on the path. Parameters: `:pred`, `:id`, `:depth`.
const TRUST_CLOSURE_CTE: &str = "
WITH RECURSIVE transitive_closure(pr1val, id1val, pr2val, id2val, distance, path_string) AS
(
    SELECT id1.predicate, id1.identifier, id2.predicate, id2.identifier, 1 AS distance,
        printf('%s:%s:%s:%s:', replace(id1.predicate,':','::'), replace(id1.identifier,':','::'),
                               replace(id2.predicate,':','::'), replace(id2.identifier,':','::')) AS path_string
    FROM messages AS m
    INNER JOIN message_identifiers AS id1 ON m.hash = id1.message_hash AND id1.is_recipient = 0
    INNER JOIN trust_pathable_predicates AS tpp1 ON tpp1.value = id1.predicate
    INNER JOIN message_identifiers AS id2 ON m.hash = id2.message_hash AND id2.is_recipient = 1
        AND (id1.predicate != id2.predicate OR id1.identifier != id2.identifier)
    INNER JOIN trust_pathable_predicates AS tpp2 ON tpp2.value = id2.predicate
    WHERE m.is_latest AND m.rating > (m.min_rating + m.max_rating) / 2
        AND id1.predicate = :pred AND id1.identifier = :id

    UNION ALL

    SELECT tc.pr1val, tc.id1val, id2.predicate, id2.identifier, tc.distance + 1,
        printf('%s%s:%s:', tc.path_string, replace(id2.predicate,':','::'),
                           replace(id2.identifier,':','::')) AS path_string
    FROM messages AS m
    INNER JOIN message_identifiers AS id1 ON m.hash = id1.message_hash AND id1.is_recipient = 0
    INNER JOIN trust_pathable_predicates AS tpp1 ON tpp1.value = id1.predicate
    INNER JOIN message_identifiers AS id2 ON m.hash = id2.message_hash AND id2.is_recipient = 1
        AND (id1.predicate != id2.predicate OR id1.identifier != id2.identifier)
    INNER JOIN trust_pathable_predicates AS tpp2 ON tpp2.value = id2.predicate
    JOIN transitive_closure AS tc ON id1.predicate = tc.pr2val AND id1.identifier = tc.id2val
    WHERE m.is_latest AND m.rating > (m.min_rating + m.max_rating) / 2
        AND tc.distance < :depth
        AND tc.path_string NOT LIKE printf('%%%s:%s:%%', replace(id2.predicate,':','::'),
                                                         replace(id2.identifier,':','::'))
)
";

impl Store {
    /// Regenerate the trust map for a viewpoint identifier: clear its rows,
    /// then store the minimum distance to every identifier reachable within
    /// `depth` hops.
    pub fn generate_trust_map(&self, id: &Identifier, depth: u32) -> Result<()> {
        self.check_open()?;
        let conn = self.db.lock();

        conn.execute(
            "DELETE FROM trust_paths WHERE start_predicate = ?1 AND start_id = ?2",
            params![id.predicate, id.value],
        )?;

        let sql = format!(
            "{TRUST_CLOSURE_CTE}
             INSERT OR REPLACE INTO trust_paths (start_predicate, start_id, end_predicate, end_id, distance)
             SELECT :pred, :id, pr2val, id2val, MIN(distance) FROM transitive_closure
             GROUP BY pr2val, id2val"
        );
        self.with_eviction(&conn, |conn| {
            conn.execute(
                &sql,
                rusqlite::named_params! {
                    ":pred": id.predicate,
                    ":id": id.value,
                    ":depth": depth,
                },
            )
        })?;
        Ok(())
    }

    /// Enumerate concrete trust paths from `start` to `end`, shortest first.
    /// Each path lists every identifier on it, the endpoints included.
    pub fn find_paths(
        &self,
        start: &Identifier,
        end: &Identifier,
        depth: u32,
    ) -> Result<Vec<Vec<Identifier>>> {
        self.check_open()?;
        let conn = self.db.lock();

        let sql = format!(
            "{TRUST_CLOSURE_CTE}
             SELECT DISTINCT path_string FROM transitive_closure
             WHERE pr2val = :end_pred AND id2val = :end_id
             ORDER BY distance"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::named_params! {
                ":pred": start.predicate,
                ":id": start.value,
                ":depth": depth,
                ":end_pred": end.predicate,
                ":end_id": end.value,
            },
            |r| r.get::<_, String>(0),
        )?;

        let mut paths = Vec::new();
        for row in rows {
            paths.push(split_path(&row?));
        }
        Ok(paths)
    }

    /// Stored directed distance from `start` to `end`, if any.
    pub fn trust_distance(&self, start: &Identifier, end: &Identifier) -> Result<Option<i64>> {
        self.check_open()?;
        let conn = self.db.lock();
        trust_distance_inner(&conn, start, end)
    }

    /// Number of distinct identifiers reachable from `id`.
    pub fn trust_map_size(&self, id: &Identifier) -> Result<i64> {
        self.check_open()?;
        let conn = self.db.lock();
        Ok(conn.query_row(
            "SELECT COUNT(1) FROM
             (SELECT DISTINCT tp.end_predicate, tp.end_id FROM trust_paths AS tp
              WHERE tp.start_predicate = ?1 AND tp.start_id = ?2)",
            params![id.predicate, id.value],
            |r| r.get(0),
        )?)
    }

    /// Whether the message's signer is an owned key or inside an owned
    /// key's trust map.
    pub(super) fn has_trusted_signer(&self, conn: &Connection, msg: &Message) -> Result<bool> {
        let Ok(signer_key_id) = vouch_sdk::keys::key_id_from_public(&msg.signature.pub_key) else {
            return Ok(false);
        };
        let my_key_ids = self.my_key_ids.read().clone();
        if my_key_ids.contains(&signer_key_id) {
            return Ok(true);
        }
        let signer = Identifier::new("keyID", signer_key_id);
        for key_id in &my_key_ids {
            let mine = Identifier::new("keyID", key_id.clone());
            if matches!(trust_distance_inner(conn, &mine, &signer)?, Some(d) if d > 0) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record a trust path unless an equal-or-shorter one already exists.
    /// A path landing an identifier in an owned key's map triggers priority
    /// recomputation for that identifier's messages.
    pub(super) fn save_trust_path(
        &self,
        conn: &Connection,
        start: &Identifier,
        end: &Identifier,
        distance: i64,
    ) -> Result<()> {
        if start == end {
            return Ok(());
        }

        let exists: i64 = conn.query_row(
            "SELECT COUNT(1) FROM trust_paths WHERE
             start_predicate = ?1 AND start_id = ?2 AND end_predicate = ?3 AND end_id = ?4
             AND distance <= ?5",
            params![start.predicate, start.value, end.predicate, end.value, distance],
            |r| r.get(0),
        )?;
        if exists > 0 {
            return Ok(());
        }

        self.with_eviction(conn, |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trust_paths
                 (start_predicate, start_id, end_predicate, end_id, distance)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![start.predicate, start.value, end.predicate, end.value, distance],
            )
        })?;

        let starts_from_owned_key =
            start.predicate == "keyID" && self.my_key_ids.read().contains(&start.value);
        if starts_from_owned_key {
            self.update_message_priorities(conn, end)?;
        }
        Ok(())
    }
}

pub(super) fn trust_distance_inner(
    conn: &Connection,
    start: &Identifier,
    end: &Identifier,
) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT distance FROM trust_paths
             WHERE start_predicate = ?1 AND start_id = ?2
             AND end_predicate = ?3 AND end_id = ?4",
            params![start.predicate, start.value, end.predicate, end.value],
            |r| r.get(0),
        )
        .optional()?)
}
