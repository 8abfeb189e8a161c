//! End-to-end store flows through the command dispatcher.
//!
//! These exercise the full pipeline the way a client would: build and sign
//! messages, ingest them, then read the derived state back through the
//! command surface.

use std::sync::Arc;

use serde_json::{json, Value};
use vouch_sdk::{Identifier, Message};
use vouch_server::store::{Store, StoreError, StoreOptions};
use vouch_server::web::{dispatch, AppState, LogRelay};

fn state_with(opts: StoreOptions) -> AppState {
    AppState {
        store: Arc::new(Store::open_in_memory(opts).unwrap()),
        relay: Arc::new(LogRelay),
    }
}

fn state() -> AppState {
    state_with(StoreOptions::default())
}

fn call(state: &AppState, method: &str, params: Value) -> Result<Value, String> {
    let params = params.as_array().cloned().unwrap_or_default();
    dispatch(state, method, &params)
}

fn email(v: &str) -> Identifier {
    Identifier::new("email", v)
}

/// Sign and save a rating through the store, bypassing `rate`'s
/// wall-clock timestamps so tests control message times.
fn save_rating_at(state: &AppState, from: &str, to: &str, rating: i64, ts: i64) -> String {
    let mut msg = Message::new_rating(email(from), email(to), rating, None, ts);
    let key = state.store.default_key();
    msg.sign(&key);
    state.store.save_message(&msg).unwrap().unwrap()
}

// ── S1: minimum-interval deduplication ─────────────────────────────────

#[test]
fn repeat_ratings_within_interval_replace_each_other() {
    let state = state();
    let t = 1_400_000_000;

    let initial = call(&state, "getmsgcount", json!([])).unwrap().as_i64().unwrap();
    save_rating_at(&state, "alice@example.com", "bob@example.com", 1, t);
    save_rating_at(&state, "alice@example.com", "bob@example.com", 1, t + 1);
    let last = save_rating_at(&state, "alice@example.com", "bob@example.com", 1, t + 2);

    let count = call(&state, "getmsgcount", json!([])).unwrap().as_i64().unwrap();
    assert_eq!(count, initial + 1);

    let found = call(&state, "getmsgbyhash", json!([last])).unwrap();
    assert_eq!(found.as_array().unwrap()[0]["isLatest"], json!(true));
}

// ── S2: transitive trust map ───────────────────────────────────────────

#[test]
fn trust_distance_follows_rating_chain() {
    let state = state();
    let t = 1_400_000_000;
    save_rating_at(&state, "alice@example.com", "bob@example.com", 1, t);
    save_rating_at(&state, "bob@example.com", "carl@example.com", 1, t + 100);
    save_rating_at(&state, "carl@example.com", "david@example.com", 1, t + 200);
    save_rating_at(&state, "david@example.com", "bob@example.com", 1, t + 300);

    state
        .store
        .generate_trust_map(&email("alice@example.com"), 4)
        .unwrap();

    let d = call(
        &state,
        "gettrustdistance",
        json!([["email", "alice@example.com"], ["email", "david@example.com"]]),
    )
    .unwrap()
    .as_i64()
    .unwrap();
    assert!(d > 0 && d <= 3, "expected 0 < d <= 3, got {d}");

    let none = call(
        &state,
        "gettrustdistance",
        json!([["p1", "nobody1"], ["p2", "nobody2"]]),
    )
    .unwrap();
    assert_eq!(none, json!(-1));

    // concrete paths exist and start/end correctly
    let paths = call(
        &state,
        "getpaths",
        json!([["email", "alice@example.com"], ["email", "david@example.com"], 3]),
    )
    .unwrap();
    let paths = paths.as_array().unwrap();
    assert!(!paths.is_empty());
    let first = paths[0].as_array().unwrap();
    assert_eq!(first.first().unwrap(), &json!(["email", "alice@example.com"]));
    assert_eq!(first.last().unwrap(), &json!(["email", "david@example.com"]));
}

// ── S3: connection confirm/refute ──────────────────────────────────────

#[test]
fn connection_tallies_confirmations_and_refutations() {
    let state = state();
    let key = state.store.default_key();

    let connect = |author: &str, confirm: bool, ts: i64| {
        let mut msg = Message::connection(
            email(author),
            email("bob@example.com"),
            Identifier::new("nickname", "BobTheBuilder"),
            confirm,
            ts,
        );
        msg.sign(&key);
        state.store.save_message(&msg).unwrap().unwrap();
    };
    connect("alice@example.com", true, 1_234_567);
    connect("john@example.com", true, 1_234_568);
    connect("james@example.com", false, 1_234_569);

    let connections = call(
        &state,
        "getconnections",
        json!([["email", "bob@example.com"]]),
    )
    .unwrap();
    let connections = connections.as_array().unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0]["type"], json!("nickname"));
    assert_eq!(connections[0]["value"], json!("BobTheBuilder"));
    assert_eq!(connections[0]["confirmations"], json!(2));
    assert_eq!(connections[0]["refutations"], json!(1));

    let connecting = call(
        &state,
        "getconnectingmsgs",
        json!([["email", "bob@example.com"], ["nickname", "BobTheBuilder"]]),
    )
    .unwrap();
    assert_eq!(connecting.as_array().unwrap().len(), 3);
}

// ── S4: canonical rejection ────────────────────────────────────────────

#[test]
fn non_canonical_message_data_is_rejected() {
    let state = state();
    let canonical = r#"{"signature":{},"signedData":{"author":[["email","alice@example.com"]],"recipient":[["email","bob@example.com"]],"timestamp":1234567,"type":"rating"}}"#;
    assert!(call(&state, "savemsgfromdata", json!([canonical, false])).is_ok());

    // extra whitespace in the top-level object
    let spaced = canonical.replacen("{\"signature\"", "{ \"signature\"", 1);
    let rejected = call(&state, "savemsgfromdata", json!([spaced, false]));
    assert!(rejected.is_err());
    assert!(rejected.unwrap_err().contains("canonical"));
}

// ── S5: eviction under a small budget ──────────────────────────────────

#[test]
fn bounded_store_keeps_accepting_inserts() {
    let mut opts = StoreOptions::default();
    opts.max_size_mb = 1;
    let state = state_with(opts);
    let key = state.store.default_key();

    // ~2 KB of comment per message fills the budget well before 600 saves
    let comment = "x".repeat(2048);
    let mut save = |i: i64| {
        let mut msg = Message::new_rating(
            email("alice@example.com"),
            email(&format!("peer{i}@example.com")),
            1,
            Some(comment.clone()),
            1_400_000_000,
        );
        msg.sign(&key);
        state.store.save_message(&msg).unwrap().unwrap();
    };

    for i in 0..600 {
        save(i);
    }
    let plateau = state.store.message_count().unwrap();

    for i in 600..700 {
        save(i);
    }
    let after = state.store.message_count().unwrap();

    // eviction kept space for new inserts without ever surfacing Full
    assert!(after >= plateau - 100, "count dropped too far: {plateau} -> {after}");
    assert!(after <= plateau + 100);
}

#[test]
fn oversized_message_fails_with_not_enough_space() {
    let mut opts = StoreOptions::default();
    opts.max_size_mb = 1;
    let store = Store::open_in_memory(opts).unwrap();
    let key = store.default_key();

    let mut msg = Message::new_rating(
        email("a@example.com"),
        email("b@example.com"),
        1,
        Some("y".repeat(4 * 1024 * 1024)),
        1,
    );
    msg.sign(&key);
    assert!(matches!(
        store.save_message(&msg),
        Err(StoreError::NotEnoughSpace)
    ));
}

// ── S6: priority promotion ─────────────────────────────────────────────

#[test]
fn rating_from_owned_key_promotes_author_priority() {
    let state = state();
    let store = &state.store;

    let stranger = vouch_sdk::keys::generate();
    let stranger_id = vouch_sdk::keys::key_id(&stranger);

    let mut m1 = Message::new_rating(
        Identifier::new("keyID", stranger_id.clone()),
        email("target@example.com"),
        1,
        None,
        1_000,
    );
    m1.sign(&stranger);
    let h1 = store.save_message(&m1).unwrap().unwrap();
    assert_eq!(store.message_by_hash(&h1).unwrap().priority, 0);

    // endorse the stranger from our default key
    let mut endorse = Message::new_rating(
        Identifier::new("keyID", store.default_key_id()),
        Identifier::new("keyID", stranger_id.clone()),
        1,
        None,
        2_000,
    );
    let key = store.default_key();
    endorse.sign(&key);
    store.save_message(&endorse).unwrap().unwrap();

    assert!(store.message_by_hash(&h1).unwrap().priority > 0);

    let mut m2 = Message::new_rating(
        Identifier::new("keyID", stranger_id),
        email("elsewhere@example.com"),
        1,
        None,
        3_000,
    );
    m2.sign(&stranger);
    let h2 = store.save_message(&m2).unwrap().unwrap();
    assert!(store.message_by_hash(&h2).unwrap().priority > 0);
}

// ── Search and overview through the command surface ────────────────────

#[test]
fn search_and_overview_reflect_ratings() {
    let state = state();
    const YEAR: i64 = 365 * 24 * 60 * 60;
    save_rating_at(&state, "alice@example.com", "carl@example.com", 1, YEAR);
    save_rating_at(&state, "alice@example.com", "dean@example.com", 1, 2 * YEAR);
    save_rating_at(&state, "alice@example.com", "bob@example.com", 1, 3 * YEAR);
    save_rating_at(&state, "bob@example.com", "alice@example.com", -1, 4 * YEAR);

    let hits = call(&state, "search", json!(["alice"])).unwrap();
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["value"], json!("alice@example.com"));

    let overview = call(&state, "overview", json!([["email", "alice@example.com"]])).unwrap();
    assert_eq!(overview["authoredPositive"], json!(3));
    assert_eq!(overview["authoredNegative"], json!(0));
    assert_eq!(overview["receivedNegative"], json!(1));
    assert_eq!(overview["firstSeen"], json!(YEAR));

    // the trust map materializes through the queue-driven path too
    state
        .store
        .generate_trust_map(&email("alice@example.com"), 4)
        .unwrap();
    let overview = call(&state, "overview", json!([["email", "alice@example.com"]])).unwrap();
    assert_eq!(overview["trustMapSize"], json!(3));
}

// ── Publish and delete lifecycle ───────────────────────────────────────

#[test]
fn publish_and_delete_lifecycle() {
    let state = state();
    let canonical = r#"{"signature":{},"signedData":{"author":[["email","alice@example.com"]],"recipient":[["email","bob@example.com"]],"timestamp":1234567,"type":"review"}}"#;
    let hash = call(&state, "savemsgfromdata", json!([canonical, false]))
        .unwrap()
        .as_str()
        .unwrap()
        .to_string();

    let found = call(&state, "getmsgbyhash", json!([hash])).unwrap();
    assert_eq!(found.as_array().unwrap()[0]["published"], json!(false));

    call(&state, "publish", json!([hash])).unwrap();
    let found = call(&state, "getmsgbyhash", json!([hash])).unwrap();
    assert_eq!(found.as_array().unwrap()[0]["published"], json!(true));

    call(&state, "deletemsg", json!([hash])).unwrap();
    assert_eq!(
        call(&state, "getmsgbyhash", json!([hash])).unwrap(),
        json!([])
    );
}

// ── Trust path removal on delete ───────────────────────────────────────

#[test]
fn deleting_link_messages_breaks_regenerated_paths() {
    let state = state();
    let t = 1_400_000_000;
    save_rating_at(&state, "abc@example.com", "def@example.com", 1, t);
    let bridge = save_rating_at(&state, "def@example.com", "fed@example.com", 1, t + 100);

    state
        .store
        .generate_trust_map(&email("abc@example.com"), 4)
        .unwrap();
    assert_eq!(
        state
            .store
            .trust_distance(&email("abc@example.com"), &email("fed@example.com"))
            .unwrap(),
        Some(2)
    );

    call(&state, "deletemsg", json!([bridge])).unwrap();
    state
        .store
        .generate_trust_map(&email("abc@example.com"), 4)
        .unwrap();
    assert_eq!(
        state
            .store
            .trust_distance(&email("abc@example.com"), &email("fed@example.com"))
            .unwrap(),
        None
    );
}
