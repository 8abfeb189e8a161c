//! Identity clustering over connection messages.
//!
//! Two identifiers are linked when some `confirm_connection` or
//! `refute_connection` message names both as recipients. Starting from one
//! identifier, the cluster is the transitive set reachable across links
//! whose confirmations outnumber their refutations, traversing only
//! trust-pathable identifiers (the start excepted), to depth 10.
//!
//! Each run is materialized into `identities` under a freshly-allocated
//! `identity_id` and read back from there. As a side effect, the
//! best-supported name and email for the start identifier are written to
//! the lookup caches.

use std::collections::{HashMap, HashSet};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use vouch_sdk::{Identifier, Message};

use super::error::Result;
use super::queries::{compose_filter, query_messages, Params};
use super::Store;

/// Clustering never looks past this many hops.
const MAX_CLUSTER_DEPTH: i64 = 10;

/// One linked identifier with its tallies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedIdentifier {
    pub id: Identifier,
    pub confirmations: i64,
    pub refutations: i64,
    pub distance: i64,
}

impl Store {
    /// Resolve the identity cluster around `start` and return the linked
    /// identifiers ordered by net confirmations.
    pub fn linked_identifiers(
        &self,
        start: &Identifier,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
    ) -> Result<Vec<LinkedIdentifier>> {
        self.check_open()?;
        let conn = self.db.lock();
        self.linked_identifiers_inner(&conn, start, limit, offset, viewpoint, max_distance)
    }

    pub(super) fn linked_identifiers_inner(
        &self,
        conn: &Connection,
        start: &Identifier,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
    ) -> Result<Vec<LinkedIdentifier>> {
        // Breadth-first closure. `expanded` holds identifiers whose edges
        // have been followed; discovery order fixes each distance.
        let mut discovered: HashMap<Identifier, i64> = HashMap::new();
        let mut expanded: HashSet<Identifier> = HashSet::new();
        expanded.insert(start.clone());

        let mut frontier = vec![start.clone()];
        for depth in 1..=MAX_CLUSTER_DEPTH {
            let mut next = Vec::new();
            for u in &frontier {
                for (v, confirmations, refutations) in
                    connection_edges(conn, u, viewpoint, max_distance)?
                {
                    if v == *start {
                        continue;
                    }
                    discovered.entry(v.clone()).or_insert(depth);
                    if confirmations > refutations
                        && v.is_trust_pathable()
                        && expanded.insert(v.clone())
                    {
                        next.push(v);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        // Tallies are message-distinct: a connect message counts once per
        // linked target no matter how many cluster members it names.
        let cluster: HashSet<Identifier> = expanded;
        let mut linked: Vec<LinkedIdentifier> = Vec::new();
        for (id, distance) in &discovered {
            let (confirmations, refutations) =
                tally_connections(conn, id, &cluster, viewpoint, max_distance)?;
            linked.push(LinkedIdentifier {
                id: id.clone(),
                confirmations,
                refutations,
                distance: *distance,
            });
        }
        linked.sort_by(|a, b| {
            (b.confirmations - b.refutations)
                .cmp(&(a.confirmations - a.refutations))
                .then_with(|| a.id.cmp(&b.id))
        });

        self.materialize(conn, start, viewpoint, &linked)?;
        self.update_name_caches(conn, start, &linked)?;

        Ok(linked
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(if limit > 0 { limit as usize } else { usize::MAX })
            .collect())
    }

    /// Write the cluster rows under a freshly-allocated identity id.
    fn materialize(
        &self,
        conn: &Connection,
        start: &Identifier,
        viewpoint: Option<&Identifier>,
        linked: &[LinkedIdentifier],
    ) -> Result<()> {
        let identity_id: i64 = conn.query_row(
            "SELECT IFNULL(MAX(identity_id), 0) + 1 FROM identities",
            [],
            |r| r.get(0),
        )?;
        let (vp_pred, vp_id) = viewpoint
            .map(|v| (v.predicate.as_str(), v.value.as_str()))
            .unwrap_or(("", ""));

        let mut insert = conn.prepare(
            "INSERT OR REPLACE INTO identities
             (identity_id, predicate, identifier, viewpoint_predicate, viewpoint_id,
              confirmations, refutations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        self.with_eviction(conn, |_| {
            // the start identifier marks the cluster root
            insert.execute(params![
                identity_id,
                start.predicate,
                start.value,
                vp_pred,
                vp_id,
                1,
                1
            ])?;
            for l in linked {
                insert.execute(params![
                    identity_id,
                    l.id.predicate,
                    l.id.value,
                    vp_pred,
                    vp_id,
                    l.confirmations,
                    l.refutations
                ])?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Cache the best-supported name (preferring `name` over `nickname`)
    /// and email for the start identifier; clear the cache when no
    /// candidate survives.
    fn update_name_caches(
        &self,
        conn: &Connection,
        start: &Identifier,
        linked: &[LinkedIdentifier],
    ) -> Result<()> {
        let mut best_name: Option<(&str, &str)> = None; // (predicate, value)
        let mut best_name_confirmations = 0;
        let mut best_email = "";
        let mut best_email_confirmations = 0;

        for l in linked {
            let pred = l.id.predicate.as_str();
            if start.predicate != "name" && start.predicate != "nickname" {
                let name_seen = best_name.map(|(p, _)| p);
                if pred == "name" || (name_seen.is_none() && pred == "nickname") {
                    let supported = l.refutations == 0 || l.confirmations > l.refutations;
                    let preferred = l.confirmations >= best_name_confirmations
                        || (pred == "name" && name_seen == Some("nickname"));
                    if supported && preferred {
                        best_name = Some((pred, l.id.value.as_str()));
                        best_name_confirmations = l.confirmations;
                    }
                }
            }
            if start.predicate != "email"
                && pred == "email"
                && l.confirmations > l.refutations
                && l.confirmations >= best_email_confirmations
            {
                best_email = l.id.value.as_str();
                best_email_confirmations = l.confirmations;
            }
        }

        self.update_cached_value(conn, "name", start, best_name.map(|(_, v)| v).unwrap_or(""))?;
        self.update_cached_value(conn, "email", start, best_email)?;
        Ok(())
    }

    fn update_cached_value(
        &self,
        conn: &Connection,
        kind: &str,
        id: &Identifier,
        value: &str,
    ) -> Result<()> {
        let (table, column) = match kind {
            "name" => ("cached_names", "cached_name"),
            _ => ("cached_emails", "cached_email"),
        };
        if value.is_empty() {
            conn.execute(
                &format!("DELETE FROM {table} WHERE predicate = ?1 AND identifier = ?2"),
                params![id.predicate, id.value],
            )?;
        } else {
            self.with_eviction(conn, |conn| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {table} (predicate, identifier, {column})
                         VALUES (?1, ?2, ?3)"
                    ),
                    params![id.predicate, id.value, value],
                )
            })?;
        }
        Ok(())
    }

    // ── Cached lookups ─────────────────────────────────────────────────

    pub fn cached_name(&self, id: &Identifier) -> Result<String> {
        let conn = self.db.lock();
        cached_value(&conn, "name", id)
    }

    pub fn cached_email(&self, id: &Identifier) -> Result<String> {
        let conn = self.db.lock();
        cached_value(&conn, "email", id)
    }

    /// A display name for an identifier: itself when it already is a name,
    /// otherwise the cached value, otherwise (unless `cached_only`) the
    /// value derived by running the cluster resolution.
    pub fn name_for(&self, id: &Identifier, cached_only: bool) -> Result<String> {
        if id.predicate == "name" || id.predicate == "nickname" {
            return Ok(id.value.clone());
        }
        let cached = self.cached_name(id)?;
        if !cached.is_empty() || cached_only {
            return Ok(cached);
        }
        self.linked_identifiers(id, 0, 0, None, 0)?;
        self.cached_name(id)
    }

    /// Cached author/recipient names for a message (first hit per role).
    pub fn message_linked_names(&self, msg: &Message) -> Result<(String, String)> {
        let mut author_name = String::new();
        for author in msg.authors() {
            author_name = self.name_for(author, true)?;
            if !author_name.is_empty() {
                break;
            }
        }
        let mut recipient_name = String::new();
        for recipient in msg.recipients() {
            recipient_name = self.name_for(recipient, true)?;
            if !recipient_name.is_empty() {
                break;
            }
        }
        Ok((author_name, recipient_name))
    }

    /// Cached author/recipient emails for a message (first hit per role).
    pub fn message_linked_emails(&self, msg: &Message) -> Result<(String, String)> {
        let mut author_email = String::new();
        for author in msg.authors() {
            author_email = self.cached_email_or_self(author)?;
            if !author_email.is_empty() {
                break;
            }
        }
        let mut recipient_email = String::new();
        for recipient in msg.recipients() {
            recipient_email = self.cached_email_or_self(recipient)?;
            if !recipient_email.is_empty() {
                break;
            }
        }
        Ok((author_email, recipient_email))
    }

    fn cached_email_or_self(&self, id: &Identifier) -> Result<String> {
        if id.predicate == "email" {
            return Ok(id.value.clone());
        }
        self.cached_email(id)
    }

    // ── Connecting messages ────────────────────────────────────────────

    /// Messages naming both identifiers as recipients, one per distinct
    /// link author.
    pub fn connecting_messages(
        &self,
        id1: &Identifier,
        id2: &Identifier,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.check_open()?;
        let conn = self.db.lock();

        let mut params: Params = Vec::new();
        let filter = compose_filter(viewpoint, max_distance, msg_type, &mut params);

        let sql = format!(
            "SELECT DISTINCT p.* FROM messages AS p \
             {joins} \
             INNER JOIN message_identifiers AS link_author \
                 ON (link_author.message_hash = p.hash AND link_author.is_recipient = 0) \
             INNER JOIN message_identifiers AS linked1 \
                 ON (linked1.message_hash = p.hash AND linked1.is_recipient = 1) \
             INNER JOIN message_identifiers AS linked2 \
                 ON (linked2.message_hash = p.hash AND linked2.is_recipient = 1 \
                     AND NOT (linked1.identifier = linked2.identifier \
                              AND linked1.predicate = linked2.predicate)) \
             WHERE linked1.predicate = :id1_pred AND linked1.identifier = :id1_value \
               AND linked2.predicate = :id2_pred AND linked2.identifier = :id2_value \
             {where_and} \
             GROUP BY link_author.predicate, link_author.identifier \
             LIMIT :limit OFFSET :offset",
            joins = filter.joins,
            where_and = filter.where_and,
        );
        params.push((":id1_pred", SqlValue::Text(id1.predicate.clone())));
        params.push((":id1_value", SqlValue::Text(id1.value.clone())));
        params.push((":id2_pred", SqlValue::Text(id2.predicate.clone())));
        params.push((":id2_value", SqlValue::Text(id2.value.clone())));
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        query_messages(&conn, &sql, &params)
    }
}

/// Direct connection edges out of `u`: linked identifiers with per-edge
/// confirm/refute counts.
fn connection_edges(
    conn: &Connection,
    u: &Identifier,
    viewpoint: Option<&Identifier>,
    max_distance: i64,
) -> Result<Vec<(Identifier, i64, i64)>> {
    let mut params: Params = Vec::new();
    let filter = compose_filter(viewpoint, max_distance, None, &mut params);

    let sql = format!(
        "SELECT id2.predicate, id2.identifier, \
             SUM(CASE WHEN p.msg_type = 'confirm_connection' THEN 1 ELSE 0 END), \
             SUM(CASE WHEN p.msg_type = 'refute_connection' THEN 1 ELSE 0 END) \
         FROM messages AS p \
         INNER JOIN message_identifiers AS id1 \
             ON p.hash = id1.message_hash AND id1.is_recipient = 1 \
             AND id1.predicate = :u_pred AND id1.identifier = :u_value \
         INNER JOIN message_identifiers AS id2 \
             ON p.hash = id2.message_hash AND id2.is_recipient = 1 \
             AND (id1.predicate != id2.predicate OR id1.identifier != id2.identifier) \
         {joins} \
         WHERE p.msg_type IN ('confirm_connection', 'refute_connection') \
         {where_and} \
         GROUP BY id2.predicate, id2.identifier",
        joins = filter.joins,
        where_and = filter.where_and,
    );
    params.push((":u_pred", SqlValue::Text(u.predicate.clone())));
    params.push((":u_value", SqlValue::Text(u.value.clone())));

    let refs: Vec<(&str, &dyn ToSql)> = params.iter().map(|(n, v)| (*n, v as &dyn ToSql)).collect();
    let mut stmt = conn.prepare(&sql)?;
    let edges = stmt
        .query_map(refs.as_slice(), |r| {
            Ok((
                Identifier::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(edges)
}

/// Message-distinct confirm/refute tallies for `target`: each connect
/// message naming `target` plus at least one cluster member counts once.
fn tally_connections(
    conn: &Connection,
    target: &Identifier,
    cluster: &HashSet<Identifier>,
    viewpoint: Option<&Identifier>,
    max_distance: i64,
) -> Result<(i64, i64)> {
    let mut params: Params = Vec::new();
    let filter = compose_filter(viewpoint, max_distance, None, &mut params);

    let sql = format!(
        "SELECT DISTINCT p.hash, p.msg_type, o.predicate, o.identifier \
         FROM messages AS p \
         INNER JOIN message_identifiers AS t \
             ON p.hash = t.message_hash AND t.is_recipient = 1 \
             AND t.predicate = :t_pred AND t.identifier = :t_value \
         INNER JOIN message_identifiers AS o \
             ON p.hash = o.message_hash AND o.is_recipient = 1 \
             AND (o.predicate != t.predicate OR o.identifier != t.identifier) \
         {joins} \
         WHERE p.msg_type IN ('confirm_connection', 'refute_connection') \
         {where_and}",
        joins = filter.joins,
        where_and = filter.where_and,
    );
    params.push((":t_pred", SqlValue::Text(target.predicate.clone())));
    params.push((":t_value", SqlValue::Text(target.value.clone())));

    let refs: Vec<(&str, &dyn ToSql)> = params.iter().map(|(n, v)| (*n, v as &dyn ToSql)).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(refs.as_slice(), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                Identifier::new(r.get::<_, String>(2)?, r.get::<_, String>(3)?),
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counted: HashSet<String> = HashSet::new();
    let mut confirmations = 0;
    let mut refutations = 0;
    for (hash, msg_type, other) in rows {
        if cluster.contains(&other) && counted.insert(hash) {
            if msg_type == "confirm_connection" {
                confirmations += 1;
            } else {
                refutations += 1;
            }
        }
    }
    Ok((confirmations, refutations))
}

/// Read one cached value; an identifier of the cached kind is its own value.
fn cached_value(conn: &Connection, kind: &str, id: &Identifier) -> Result<String> {
    if kind == id.predicate {
        return Ok(id.value.clone());
    }
    let (table, column) = match kind {
        "name" => ("cached_names", "cached_name"),
        _ => ("cached_emails", "cached_email"),
    };
    let value: Option<String> = conn
        .query_row(
            &format!("SELECT {column} FROM {table} WHERE predicate = ?1 AND identifier = ?2"),
            params![id.predicate, id.value],
            |r| r.get(0),
        )
        .optional()?;
    Ok(value.unwrap_or_default())
}
