//! Paged message queries, search, and the identifier overview.
//!
//! Every message listing shares one filter composition: an optional
//! viewpoint (restrict to messages whose author is inside the viewpoint's
//! trust map, the viewpoint itself included), an optional message type
//! (with `!type` negation and `rating/positive|neutral|negative`
//! sub-forms), a latest-only toggle, and `(limit, offset)` pagination.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ToSql};
use vouch_sdk::{Identifier, Message};

use super::error::Result;
use super::{row_to_message, Store};

/// A `search` hit: the identifier plus its cached name and email.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: Identifier,
    pub name: String,
    pub email: String,
}

/// Aggregate counts for one identifier, per `overview`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdOverview {
    pub authored_positive: i64,
    pub authored_neutral: i64,
    pub authored_negative: i64,
    pub received_positive: i64,
    pub received_neutral: i64,
    pub received_negative: i64,
    pub first_seen: i64,
}

/// Composed SQL fragments for the shared message filter.
pub(super) struct FilterSql {
    pub joins: String,
    /// Conditions starting with `AND ...`, appended to the caller's WHERE.
    pub where_and: String,
}

pub(super) type Params = Vec<(&'static str, SqlValue)>;

/// Build the filter fragments and push their bound parameters.
pub(super) fn compose_filter(
    viewpoint: Option<&Identifier>,
    max_distance: i64,
    msg_type: Option<&str>,
    params: &mut Params,
) -> FilterSql {
    let mut joins = String::new();
    let mut where_and = String::new();

    if let Some(raw) = msg_type {
        let mut effective = raw;
        let mut negated = false;
        if let Some(stripped) = raw.strip_prefix('!') {
            effective = stripped;
            negated = true;
        }
        // rating sub-forms select by sign relative to the scale midpoint
        if let Some(kind) = effective.strip_prefix("rating/") {
            let op = match kind {
                "neutral" => "=",
                "negative" => "<",
                _ => ">",
            };
            joins.push_str(&format!(
                "INNER JOIN messages AS p2 ON (p.hash = p2.hash AND \
                 p2.rating {op} (p2.max_rating + p2.min_rating) / 2) "
            ));
            effective = "rating";
        }
        if negated {
            where_and.push_str("AND p.msg_type != :msg_type ");
        } else {
            where_and.push_str("AND p.msg_type = :msg_type ");
        }
        params.push((":msg_type", SqlValue::Text(effective.to_string())));
    }

    if let Some(viewpoint) = viewpoint {
        joins.push_str(
            "INNER JOIN message_identifiers AS author \
                 ON (author.message_hash = p.hash AND author.is_recipient = 0) \
             INNER JOIN trust_pathable_predicates AS author_tpp \
                 ON author.predicate = author_tpp.value \
             LEFT JOIN trust_paths AS tp ON \
                 (tp.start_id = :viewpoint_id AND \
                  tp.start_predicate = :viewpoint_pred AND \
                  tp.end_id = author.identifier AND \
                  tp.end_predicate = author.predicate",
        );
        if max_distance > 0 {
            joins.push_str(" AND tp.distance <= :max_distance");
            params.push((":max_distance", SqlValue::Integer(max_distance)));
        }
        joins.push_str(") ");

        where_and.push_str(
            "AND (tp.start_id IS NOT NULL OR \
                 (author.identifier = :viewpoint_id AND author.predicate = :viewpoint_pred)) ",
        );
        params.push((
            ":viewpoint_pred",
            SqlValue::Text(viewpoint.predicate.clone()),
        ));
        params.push((":viewpoint_id", SqlValue::Text(viewpoint.value.clone())));
    }

    FilterSql { joins, where_and }
}

pub(super) fn query_messages(
    conn: &Connection,
    sql: &str,
    params: &Params,
) -> Result<Vec<Message>> {
    let refs: Vec<(&str, &dyn ToSql)> =
        params.iter().map(|(n, v)| (*n, v as &dyn ToSql)).collect();
    let mut stmt = conn.prepare(sql)?;
    let msgs = stmt
        .query_map(refs.as_slice(), row_to_message)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(msgs)
}

impl Store {
    /// Messages with the identifier among their authors (or recipients).
    pub fn messages_by_author(
        &self,
        id: &Identifier,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
        latest_only: bool,
    ) -> Result<Vec<Message>> {
        self.messages_by_role(id, false, limit, offset, viewpoint, max_distance, msg_type, latest_only)
    }

    pub fn messages_by_recipient(
        &self,
        id: &Identifier,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
        latest_only: bool,
    ) -> Result<Vec<Message>> {
        self.messages_by_role(id, true, limit, offset, viewpoint, max_distance, msg_type, latest_only)
    }

    fn messages_by_role(
        &self,
        id: &Identifier,
        by_recipient: bool,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
        latest_only: bool,
    ) -> Result<Vec<Message>> {
        self.check_open()?;
        let conn = self.db.lock();

        let mut params: Params = Vec::new();
        let filter = compose_filter(viewpoint, max_distance, msg_type, &mut params);

        let mut sql = format!(
            "SELECT DISTINCT p.* FROM messages AS p \
             INNER JOIN message_identifiers AS pi ON pi.message_hash = p.hash \
             {joins} \
             WHERE pi.predicate = :pred AND pi.identifier = :id \
               AND pi.is_recipient = {role} ",
            joins = filter.joins,
            role = by_recipient as i64,
        );
        if latest_only {
            sql.push_str("AND p.is_latest = 1 ");
        }
        sql.push_str(&filter.where_and);
        sql.push_str("ORDER BY p.created DESC LIMIT :limit OFFSET :offset");

        params.push((":pred", SqlValue::Text(id.predicate.clone())));
        params.push((":id", SqlValue::Text(id.value.clone())));
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        query_messages(&conn, &sql, &params)
    }

    /// Messages naming the identifier in either role. When the identifier's
    /// predicate is empty, matches on the value across all predicates.
    pub fn messages_by_identifier(
        &self,
        id: &Identifier,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
        latest_only: bool,
    ) -> Result<Vec<Message>> {
        self.check_open()?;
        let conn = self.db.lock();

        let mut params: Params = Vec::new();
        let filter = compose_filter(viewpoint, max_distance, msg_type, &mut params);

        let mut sql = format!(
            "SELECT DISTINCT p.* FROM messages AS p \
             INNER JOIN message_identifiers AS pi ON pi.message_hash = p.hash \
             {joins} \
             WHERE pi.identifier = :id ",
            joins = filter.joins,
        );
        if !id.predicate.is_empty() {
            sql.push_str("AND pi.predicate = :pred ");
            params.push((":pred", SqlValue::Text(id.predicate.clone())));
        }
        if latest_only {
            sql.push_str("AND p.is_latest = 1 ");
        }
        sql.push_str(&filter.where_and);
        sql.push_str("ORDER BY p.created ASC LIMIT :limit OFFSET :offset");

        params.push((":id", SqlValue::Text(id.value.clone())));
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        query_messages(&conn, &sql, &params)
    }

    /// Most recent messages first.
    pub fn latest_messages(
        &self,
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
             WHERE 1 {where_and} \
             ORDER BY p.created DESC LIMIT :limit OFFSET :offset",
            joins = filter.joins,
            where_and = filter.where_and,
        );
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        query_messages(&conn, &sql, &params)
    }

    /// Messages created at or after a timestamp, oldest first.
    pub fn messages_after_timestamp(
        &self,
        timestamp: i64,
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
             WHERE p.created >= :timestamp {where_and} \
             ORDER BY p.created ASC LIMIT :limit OFFSET :offset",
            joins = filter.joins,
            where_and = filter.where_and,
        );
        params.push((":timestamp", SqlValue::Integer(timestamp)));
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        query_messages(&conn, &sql, &params)
    }

    /// Messages strictly after the given message in `(created, hash)`
    /// order, oldest first.
    pub fn messages_after_message(
        &self,
        hash: &str,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.messages_relative_to(hash, true, limit, offset, viewpoint, max_distance, msg_type)
    }

    /// Messages strictly before the given message in `(created, hash)`
    /// order, newest first.
    pub fn messages_before_message(
        &self,
        hash: &str,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.messages_relative_to(hash, false, limit, offset, viewpoint, max_distance, msg_type)
    }

    fn messages_relative_to(
        &self,
        hash: &str,
        after: bool,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
        msg_type: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.check_open()?;
        let conn = self.db.lock();
        let anchor = super::get_message_by_hash(&conn, hash)?;

        let mut params: Params = Vec::new();
        let filter = compose_filter(viewpoint, max_distance, msg_type, &mut params);

        let (cmp, tie, order) = if after {
            (">", ">", "ASC")
        } else {
            ("<", "<", "DESC")
        };
        let sql = format!(
            "SELECT DISTINCT p.* FROM messages AS p \
             {joins} \
             WHERE ((p.created = :timestamp AND p.hash {tie} :hash) OR p.created {cmp} :timestamp) \
             {where_and} \
             ORDER BY p.created {order}, p.hash {order} LIMIT :limit OFFSET :offset",
            joins = filter.joins,
            where_and = filter.where_and,
        );
        params.push((":timestamp", SqlValue::Integer(anchor.timestamp())));
        params.push((":hash", SqlValue::Text(hash.to_string())));
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        query_messages(&conn, &sql, &params)
    }

    // ── Search ─────────────────────────────────────────────────────────

    /// Contains-match over identifier values, optionally restricted to one
    /// predicate; ordered by distance from the viewpoint (unreachable
    /// last), then lexicographically; enriched with cached name/email.
    pub fn search_for_id(
        &self,
        query: &str,
        predicate: Option<&str>,
        limit: i64,
        offset: i64,
        viewpoint: Option<&Identifier>,
    ) -> Result<Vec<SearchResult>> {
        self.check_open()?;
        let conn = self.db.lock();

        let mut params: Params = vec![(":query", SqlValue::Text(query.to_string()))];

        let mut sql = String::from(
            "SELECT DISTINCT pred, id, IFNULL(cn.cached_name, ''), \
                 IFNULL(ce.cached_email, CASE WHEN pred = 'email' THEN id ELSE '' END) \
             FROM (SELECT DISTINCT predicate AS pred, identifier AS id \
                   FROM message_identifiers \
                   WHERE identifier LIKE '%' || :query || '%' ",
        );
        if predicate.is_some() {
            sql.push_str("AND predicate = :pred ");
            params.push((
                ":pred",
                SqlValue::Text(predicate.unwrap_or_default().to_string()),
            ));
        }
        sql.push_str(") ");

        if let Some(viewpoint) = viewpoint {
            sql.push_str(
                "LEFT JOIN trust_paths AS tp ON tp.end_predicate = pred AND tp.end_id = id \
                 AND tp.start_predicate = :viewpoint_pred AND tp.start_id = :viewpoint_id ",
            );
            params.push((
                ":viewpoint_pred",
                SqlValue::Text(viewpoint.predicate.clone()),
            ));
            params.push((":viewpoint_id", SqlValue::Text(viewpoint.value.clone())));
        }
        sql.push_str(
            "LEFT JOIN cached_names AS cn ON cn.predicate = pred AND cn.identifier = id \
             LEFT JOIN cached_emails AS ce ON ce.predicate = pred AND ce.identifier = id ",
        );
        if viewpoint.is_some() {
            sql.push_str(
                "ORDER BY CASE WHEN tp.distance IS NULL THEN 1000 ELSE tp.distance END ASC, id ASC ",
            );
        } else {
            sql.push_str("ORDER BY id ASC ");
        }
        sql.push_str("LIMIT :limit OFFSET :offset");
        params.push((":limit", SqlValue::Integer(limit)));
        params.push((":offset", SqlValue::Integer(offset)));

        let refs: Vec<(&str, &dyn ToSql)> =
            params.iter().map(|(n, v)| (*n, v as &dyn ToSql)).collect();
        let mut stmt = conn.prepare(&sql)?;
        let results = stmt
            .query_map(refs.as_slice(), |r| {
                Ok(SearchResult {
                    id: Identifier::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                    name: r.get(2)?,
                    email: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    // ── Overview ───────────────────────────────────────────────────────

    /// Bucketed counts of latest rating messages naming the identifier,
    /// split by role and by sign relative to the scale midpoint. With a
    /// viewpoint, received counts only consider authors inside the
    /// viewpoint's trust map (the viewpoint and the subject excepted).
    pub fn id_overview(
        &self,
        id: &Identifier,
        viewpoint: Option<&Identifier>,
        max_distance: i64,
    ) -> Result<IdOverview> {
        self.check_open()?;
        let conn = self.db.lock();

        let mut params: Params = Vec::new();
        let filter = compose_filter(viewpoint, max_distance, None, &mut params);

        let received_guard = if viewpoint.is_some() {
            " AND (tp.start_id IS NOT NULL OR \
                  (author.identifier = :viewpoint_id AND author.predicate = :viewpoint_pred))"
        } else {
            ""
        };
        let mut sql = format!(
            "SELECT \
             SUM(CASE WHEN pi.is_recipient = 0 AND p.rating > (p.min_rating + p.max_rating) / 2 THEN 1 ELSE 0 END), \
             SUM(CASE WHEN pi.is_recipient = 0 AND p.rating = (p.min_rating + p.max_rating) / 2 THEN 1 ELSE 0 END), \
             SUM(CASE WHEN pi.is_recipient = 0 AND p.rating < (p.min_rating + p.max_rating) / 2 THEN 1 ELSE 0 END), \
             SUM(CASE WHEN pi.is_recipient = 1 AND p.rating > (p.min_rating + p.max_rating) / 2{received_guard} THEN 1 ELSE 0 END), \
             SUM(CASE WHEN pi.is_recipient = 1 AND p.rating = (p.min_rating + p.max_rating) / 2{received_guard} THEN 1 ELSE 0 END), \
             SUM(CASE WHEN pi.is_recipient = 1 AND p.rating < (p.min_rating + p.max_rating) / 2{received_guard} THEN 1 ELSE 0 END), \
             MIN(p.created) \
             FROM messages AS p \
             INNER JOIN message_identifiers AS pi \
                 ON pi.message_hash = p.hash AND pi.predicate = :pred AND pi.identifier = :id \
             {joins} \
             WHERE p.msg_type = 'rating' AND p.is_latest = 1 ",
            joins = filter.joins,
        );
        if viewpoint.is_some() {
            // own authored ratings count regardless of reachability
            sql.push_str(
                "AND (tp.start_id IS NOT NULL OR \
                     (author.identifier = :viewpoint_id AND author.predicate = :viewpoint_pred) OR \
                     (author.predicate = :pred AND author.identifier = :id)) ",
            );
        }

        params.push((":pred", SqlValue::Text(id.predicate.clone())));
        params.push((":id", SqlValue::Text(id.value.clone())));

        let refs: Vec<(&str, &dyn ToSql)> =
            params.iter().map(|(n, v)| (*n, v as &dyn ToSql)).collect();
        let overview = conn.query_row(&sql, refs.as_slice(), |r| {
            Ok(IdOverview {
                authored_positive: r.get::<_, Option<i64>>(0)?.unwrap_or(0),
                authored_neutral: r.get::<_, Option<i64>>(1)?.unwrap_or(0),
                authored_negative: r.get::<_, Option<i64>>(2)?.unwrap_or(0),
                received_positive: r.get::<_, Option<i64>>(3)?.unwrap_or(0),
                received_neutral: r.get::<_, Option<i64>>(4)?.unwrap_or(0),
                received_negative: r.get::<_, Option<i64>>(5)?.unwrap_or(0),
                first_seen: r.get::<_, Option<i64>>(6)?.unwrap_or(0),
            })
        })?;
        Ok(overview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    fn email(v: &str) -> Identifier {
        Identifier::new("email", v)
    }

    fn rate(store: &Store, from: &str, to: &str, rating: i64, ts: i64) {
        let mut msg = Message::new_rating(email(from), email(to), rating, None, ts);
        let key = store.default_key();
        msg.sign(&key);
        store.save_message(&msg).unwrap().unwrap();
    }

    /// Ratings spaced a year apart so each (author, recipient) class keeps
    /// its own latest without interval replacement.
    const YEAR: i64 = 365 * 24 * 60 * 60;

    fn seeded_store() -> Store {
        let store = Store::open_in_memory(StoreOptions::default()).unwrap();
        rate(&store, "alice@x", "carl@x", 1, YEAR);
        rate(&store, "alice@x", "dean@x", 1, 2 * YEAR);
        rate(&store, "alice@x", "bob@x", -1, 3 * YEAR);
        rate(&store, "alice@x", "bob@x", 0, 4 * YEAR);
        rate(&store, "alice@x", "bob@x", 1, 5 * YEAR);
        rate(&store, "bob@x", "alice@x", 1, 6 * YEAR);
        rate(&store, "bob@x", "alice@x", 0, 7 * YEAR);
        rate(&store, "bob@x", "alice@x", -1, 8 * YEAR);
        rate(&store, "carl@x", "alice@x", 1, 9 * YEAR);
        rate(&store, "dean@x", "alice@x", 0, 10 * YEAR);
        store
    }

    #[test]
    fn overview_counts_latest_only() {
        let store = seeded_store();
        let overview = store.id_overview(&email("alice@x"), None, 0).unwrap();
        // authored: carl +1, dean +1, bob's class latest is +1
        assert_eq!(overview.authored_positive, 3);
        assert_eq!(overview.authored_neutral, 0);
        assert_eq!(overview.authored_negative, 0);
        // received: carl +1, dean 0, bob's class latest is -1
        assert_eq!(overview.received_positive, 1);
        assert_eq!(overview.received_neutral, 1);
        assert_eq!(overview.received_negative, 1);
        assert_eq!(overview.first_seen, YEAR);
    }

    #[test]
    fn by_author_and_recipient_listings() {
        let store = seeded_store();
        let authored = store
            .messages_by_author(&email("alice@x"), 20, 0, None, 0, None, false)
            .unwrap();
        assert_eq!(authored.len(), 5);
        // newest first
        assert!(authored.windows(2).all(|w| w[0].timestamp() >= w[1].timestamp()));

        let latest_only = store
            .messages_by_author(&email("alice@x"), 20, 0, None, 0, None, true)
            .unwrap();
        assert_eq!(latest_only.len(), 3);

        let received = store
            .messages_by_recipient(&email("bob@x"), 20, 0, None, 0, None, false)
            .unwrap();
        assert_eq!(received.len(), 3);

        let paged = store
            .messages_by_author(&email("alice@x"), 2, 2, None, 0, None, false)
            .unwrap();
        assert_eq!(paged.len(), 2);
    }

    #[test]
    fn msg_type_filters() {
        let store = seeded_store();
        let positive = store
            .messages_by_author(&email("alice@x"), 20, 0, None, 0, Some("rating/positive"), false)
            .unwrap();
        assert_eq!(positive.len(), 3);
        let negative = store
            .messages_by_author(&email("alice@x"), 20, 0, None, 0, Some("rating/negative"), false)
            .unwrap();
        assert_eq!(negative.len(), 1);
        let excluded = store
            .messages_by_author(&email("alice@x"), 20, 0, None, 0, Some("!rating"), false)
            .unwrap();
        assert!(excluded.is_empty());
    }

    #[test]
    fn viewpoint_restricts_to_reachable_authors() {
        let store = seeded_store();
        store.generate_trust_map(&email("alice@x"), 4).unwrap();

        // dean authored one rating; alice reaches dean, so it is visible
        let seen = store
            .latest_messages(50, 0, Some(&email("alice@x")), 0, None)
            .unwrap();
        assert_eq!(seen.len(), 10);

        // a viewpoint with no trust map sees only its own messages
        let stranger_view = store
            .latest_messages(50, 0, Some(&email("stranger@x")), 0, None)
            .unwrap();
        assert!(stranger_view.is_empty());
    }

    #[test]
    fn timestamp_and_anchor_pagination() {
        let store = seeded_store();
        let all = store
            .messages_after_timestamp(0, 100, 0, None, 0, None)
            .unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));

        let anchor = &all[4];
        let after = store
            .messages_after_message(anchor.hash(), 100, 0, None, 0, None)
            .unwrap();
        assert_eq!(after.len(), 5);
        let before = store
            .messages_before_message(anchor.hash(), 100, 0, None, 0, None)
            .unwrap();
        assert_eq!(before.len(), 4);
    }

    #[test]
    fn by_identifier_matches_either_role() {
        let store = seeded_store();
        let either = store
            .messages_by_identifier(&email("bob@x"), 100, 0, None, 0, None, false)
            .unwrap();
        // 3 authored + 3 received
        assert_eq!(either.len(), 6);

        // empty predicate matches the value across predicates
        let any_pred = store
            .messages_by_identifier(&Identifier::new("", "bob@x"), 100, 0, None, 0, None, false)
            .unwrap();
        assert_eq!(any_pred.len(), 6);

        assert_eq!(store.latest_message_timestamp().unwrap(), 10 * YEAR);
    }

    #[test]
    fn search_matches_substring_and_predicate() {
        let store = seeded_store();
        let hits = store.search_for_id("alice", None, 10, 0, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, email("alice@x"));
        // email identifiers fall back to themselves for the email column
        assert_eq!(hits[0].email, "alice@x");

        let none = store
            .search_for_id("alice", Some("nickname"), 10, 0, None)
            .unwrap();
        assert!(none.is_empty());

        let all = store.search_for_id("@x", None, 100, 0, None).unwrap();
        assert_eq!(all.len(), 4);
    }
}
