//! JSON command surface over HTTP.
//!
//! A single endpoint accepts `{"method": "...", "params": [...]}` and maps
//! it onto store calls, mirroring the store's own vocabulary: counts,
//! paged message queries, graph lookups, message authoring, and key
//! management. Identifier arguments are `[predicate, value]` pairs.
//! Responses are `{"result": ...}` or `{"error": "..."}`.
//!
//! Publishing marks a message `published` and hands it to a [`RelaySink`];
//! actual gossip is a collaborator's concern, the default sink only logs.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use vouch_sdk::{CodecError, Identifier, Message, MessageSignature};

use crate::store::{Store, StoreError};

/// Hook invoked when a message is published. Gossip transports implement
/// this; the default sink just logs.
pub trait RelaySink: Send + Sync {
    fn relay(&self, msg: &Message);
}

/// Default no-op relay.
pub struct LogRelay;

impl RelaySink for LogRelay {
    fn relay(&self, msg: &Message) {
        tracing::info!(hash = %msg.hash(), "relay requested for published message");
    }
}

pub struct AppState {
    pub store: Arc<Store>,
    pub relay: Arc<dyn RelaySink>,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Build the axum router for the command surface.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handle_command))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn handle_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Json<Value> {
    match dispatch(&state, &request.method, &request.params) {
        Ok(result) => Json(json!({ "result": result })),
        Err(e) => Json(json!({ "error": e })),
    }
}

type CommandResult = std::result::Result<Value, String>;

/// Route one command to the store.
pub fn dispatch(state: &AppState, method: &str, params: &[Value]) -> CommandResult {
    let store = &state.store;
    match method {
        "getmsgcount" => Ok(json!(store.message_count().map_err(err)?)),
        "getidentifiercount" => Ok(json!(store.identifier_count().map_err(err)?)),

        "getmsgbyhash" => {
            let hash = arg_str(params, 0)?;
            match store.message_by_hash(&hash) {
                Ok(msg) => Ok(json!([message_json(state, &msg)?])),
                Err(StoreError::NotFound) => Ok(json!([])),
                Err(e) => Err(err(e)),
            }
        }

        "getmsgsbyauthor" | "getmsgsbyrecipient" => {
            let id = arg_id(params, 0)?;
            let limit = arg_i64_or(params, 1, 20)?;
            let offset = arg_i64_or(params, 2, 0)?;
            let viewpoint = opt_id(params, 3)?;
            let max_distance = arg_i64_or(params, 4, 0)?;
            let msg_type = opt_str(params, 5)?;
            let msgs = if method == "getmsgsbyauthor" {
                store.messages_by_author(
                    &id,
                    limit,
                    offset,
                    viewpoint.as_ref(),
                    max_distance,
                    msg_type.as_deref(),
                    false,
                )
            } else {
                store.messages_by_recipient(
                    &id,
                    limit,
                    offset,
                    viewpoint.as_ref(),
                    max_distance,
                    msg_type.as_deref(),
                    false,
                )
            }
            .map_err(err)?;
            messages_json(state, &msgs)
        }

        "getmsgsafter" => {
            let timestamp = arg_i64(params, 0)?;
            let limit = arg_i64_or(params, 1, 20)?;
            let offset = arg_i64_or(params, 2, 0)?;
            let viewpoint = opt_id(params, 3)?;
            let max_distance = arg_i64_or(params, 4, 0)?;
            let msg_type = opt_str(params, 5)?;
            let msgs = store
                .messages_after_timestamp(
                    timestamp,
                    limit,
                    offset,
                    viewpoint.as_ref(),
                    max_distance,
                    msg_type.as_deref(),
                )
                .map_err(err)?;
            messages_json(state, &msgs)
        }

        "getlatestmsgs" => {
            let limit = arg_i64_or(params, 0, 20)?;
            let offset = arg_i64_or(params, 1, 0)?;
            let viewpoint = opt_id(params, 2)?;
            let max_distance = arg_i64_or(params, 3, 0)?;
            let msg_type = opt_str(params, 4)?;
            let msgs = store
                .latest_messages(
                    limit,
                    offset,
                    viewpoint.as_ref(),
                    max_distance,
                    msg_type.as_deref(),
                )
                .map_err(err)?;
            messages_json(state, &msgs)
        }

        "getpaths" => {
            let id1 = arg_id(params, 0)?;
            let id2 = arg_id(params, 1)?;
            let depth = arg_i64_or(params, 2, 3)? as u32;
            let paths = store.find_paths(&id1, &id2, depth).map_err(err)?;
            Ok(json!(paths))
        }

        "gettrustdistance" => {
            let id1 = arg_id(params, 0)?;
            let id2 = arg_id(params, 1)?;
            let distance = store.trust_distance(&id1, &id2).map_err(err)?;
            Ok(json!(distance.unwrap_or(-1)))
        }

        "getconnections" => {
            let id = arg_id(params, 0)?;
            let limit = arg_i64_or(params, 1, 20)?;
            let offset = arg_i64_or(params, 2, 0)?;
            let viewpoint = opt_id(params, 3)?;
            let max_distance = arg_i64_or(params, 4, 0)?;
            let linked = store
                .linked_identifiers(&id, limit, offset, viewpoint.as_ref(), max_distance)
                .map_err(err)?;
            Ok(Value::Array(
                linked
                    .iter()
                    .map(|l| {
                        json!({
                            "type": l.id.predicate,
                            "value": l.id.value,
                            "confirmations": l.confirmations,
                            "refutations": l.refutations,
                        })
                    })
                    .collect(),
            ))
        }

        "getconnectingmsgs" => {
            let id1 = arg_id(params, 0)?;
            let id2 = arg_id(params, 1)?;
            let limit = arg_i64_or(params, 2, 20)?;
            let offset = arg_i64_or(params, 3, 0)?;
            let viewpoint = opt_id(params, 4)?;
            let max_distance = arg_i64_or(params, 5, 0)?;
            let msg_type = opt_str(params, 6)?;
            let msgs = store
                .connecting_messages(
                    &id1,
                    &id2,
                    limit,
                    offset,
                    viewpoint.as_ref(),
                    max_distance,
                    msg_type.as_deref(),
                )
                .map_err(err)?;
            messages_json(state, &msgs)
        }

        "search" => {
            let query = arg_str(params, 0)?;
            let predicate = opt_str(params, 1)?;
            let limit = arg_i64_or(params, 2, 10)?;
            let offset = arg_i64_or(params, 3, 0)?;
            let viewpoint = opt_id(params, 4)?;
            let hits = store
                .search_for_id(
                    &query,
                    predicate.as_deref(),
                    limit,
                    offset,
                    viewpoint.as_ref(),
                )
                .map_err(err)?;
            Ok(Value::Array(
                hits.iter()
                    .map(|h| {
                        json!({
                            "type": h.id.predicate,
                            "value": h.id.value,
                            "name": h.name,
                            "email": h.email,
                        })
                    })
                    .collect(),
            ))
        }

        "overview" => {
            let id = arg_id(params, 0)?;
            let viewpoint = opt_id(params, 1)?;
            let max_distance = arg_i64_or(params, 2, 0)?;
            let overview = store
                .id_overview(&id, viewpoint.as_ref(), max_distance)
                .map_err(err)?;
            let trust_map_size = store.trust_map_size(&id).map_err(err)?;
            let name = store.name_for(&id, false).map_err(err)?;
            let email = store.cached_email(&id).map_err(err)?;
            Ok(json!({
                "authoredPositive": overview.authored_positive,
                "authoredNeutral": overview.authored_neutral,
                "authoredNegative": overview.authored_negative,
                "receivedPositive": overview.received_positive,
                "receivedNeutral": overview.received_neutral,
                "receivedNegative": overview.received_negative,
                "firstSeen": overview.first_seen,
                "trustMapSize": trust_map_size,
                "name": name,
                "email": email,
            }))
        }

        "rate" => {
            let recipient = arg_id(params, 0)?;
            let rating = arg_i64(params, 1)?;
            let comment = opt_str(params, 2)?;
            let publish = arg_bool_or(params, 3, true)?;
            let author = Identifier::new("keyID", store.default_key_id());
            save_rating(state, author, recipient, rating, comment, publish)
        }

        "saverating" => {
            let author = arg_id(params, 0)?;
            let recipient = arg_id(params, 1)?;
            let rating = arg_i64(params, 2)?;
            let comment = opt_str(params, 3)?;
            let publish = arg_bool_or(params, 4, true)?;
            save_rating(state, author, recipient, rating, comment, publish)
        }

        "saveconnection" | "refuteconnection" => {
            let author = arg_id(params, 0)?;
            let id1 = arg_id(params, 1)?;
            let id2 = arg_id(params, 2)?;
            let publish = arg_bool_or(params, 3, true)?;
            let mut msg = Message::connection(author, id1, id2, method == "saveconnection", now());
            let key = store.default_key();
            msg.sign(&key);
            save_and_maybe_publish(state, msg, publish)
        }

        "savemsgfromdata" => {
            let data = arg_str(params, 0)?;
            let publish = arg_bool_or(params, 1, true)?;
            let sign = arg_bool_or(params, 2, true)?;
            let mut msg = Message::from_canonical_json(&data).map_err(err)?;
            if !msg.is_signed() && (sign || publish) {
                let key = store.default_key();
                msg.sign(&key);
            }
            save_and_maybe_publish(state, msg, publish)
        }

        "deletemsg" => {
            let hash = arg_str(params, 0)?;
            store.drop_message(&hash).map_err(err)?;
            Ok(json!(true))
        }

        "publish" => {
            let hash = arg_str(params, 0)?;
            store.set_published(&hash).map_err(err)?;
            let msg = store.message_by_hash(&hash).map_err(err)?;
            state.relay.relay(&msg);
            Ok(json!(true))
        }

        "generatetrustmap" => {
            let id = opt_id(params, 0)?
                .unwrap_or_else(|| Identifier::new("keyID", store.default_key_id()));
            let depth = arg_i64_or(params, 1, store.options().trust_map_depth as i64)? as u32;
            store.queue_trust_map_update(id, depth);
            Ok(json!(true))
        }

        "gettrustmapsize" => {
            let id = arg_id(params, 0)?;
            Ok(json!(store.trust_map_size(&id).map_err(err)?))
        }

        "listmykeys" => {
            let keys = store.my_keys().map_err(err)?;
            let mut out = Vec::new();
            for key in keys {
                let name = store
                    .name_for(&Identifier::new("keyID", key.key_id.clone()), false)
                    .map_err(err)?;
                out.push(json!({
                    "pubkey": key.pub_key,
                    "keyID": key.key_id,
                    "privkey": key.priv_key,
                    "name": name,
                    "default": key.is_default,
                }));
            }
            Ok(Value::Array(out))
        }

        "importprivkey" => {
            let key = arg_str(params, 0)?;
            store.import_priv_key(&key, false).map_err(err)?;
            Ok(json!(true))
        }

        "getnewkey" => {
            let key = store.new_key().map_err(err)?;
            Ok(json!({
                "pubkey": key.pub_key,
                "keyID": key.key_id,
                "privkey": key.priv_key,
            }))
        }

        "setdefaultkey" => {
            let key = arg_str(params, 0)?;
            store.set_default_key(&key).map_err(err)?;
            Ok(json!(true))
        }

        "addsignature" => {
            let hash = arg_str(params, 0)?;
            let pub_key = arg_str(params, 1)?;
            let signature = arg_str(params, 2)?;
            let mut msg = store.message_by_hash(&hash).map_err(err)?;
            msg.signature = MessageSignature { pub_key, signature };
            if !msg.verify() {
                return Err(err(CodecError::InvalidSignature));
            }
            store.save_message(&msg).map_err(err)?;
            Ok(json!(true))
        }

        other => Err(format!("unknown method: {other}")),
    }
}

fn save_rating(
    state: &AppState,
    author: Identifier,
    recipient: Identifier,
    rating: i64,
    comment: Option<String>,
    publish: bool,
) -> CommandResult {
    let mut msg = Message::new_rating(author, recipient, rating, comment, now());
    let key = state.store.default_key();
    msg.sign(&key);
    save_and_maybe_publish(state, msg, publish)
}

fn save_and_maybe_publish(state: &AppState, mut msg: Message, publish: bool) -> CommandResult {
    if publish {
        msg.published = true;
    }
    match state.store.save_message(&msg).map_err(err)? {
        Some(hash) => {
            if publish {
                state.relay.relay(&msg);
            }
            Ok(json!(hash))
        }
        // refused as untrusted: empty hash, mirrored to the caller
        None => Ok(json!("")),
    }
}

// ── Result shaping ─────────────────────────────────────────────────────

fn messages_json(state: &AppState, msgs: &[Message]) -> CommandResult {
    let mut out = Vec::with_capacity(msgs.len());
    for msg in msgs {
        out.push(message_json(state, msg)?);
    }
    Ok(Value::Array(out))
}

/// A message plus cached display enrichment.
fn message_json(state: &AppState, msg: &Message) -> CommandResult {
    let store = &state.store;
    let (author_name, recipient_name) = store.message_linked_names(msg).map_err(err)?;
    let (author_email, _) = store.message_linked_emails(msg).map_err(err)?;
    let signer_name = match vouch_sdk::keys::key_id_from_public(&msg.signature.pub_key) {
        Ok(key_id) => store
            .name_for(&Identifier::new("keyID", key_id), true)
            .map_err(err)?,
        Err(_) => String::new(),
    };

    let data: Value =
        serde_json::from_str(&msg.to_canonical_json()).unwrap_or(Value::Null);
    Ok(json!({
        "hash": msg.hash(),
        "data": data,
        "published": msg.published,
        "priority": msg.priority,
        "isLatest": msg.is_latest,
        "authorName": author_name,
        "recipientName": recipient_name,
        "authorEmail": author_email,
        "signerName": signer_name,
    }))
}

// ── Parameter helpers ──────────────────────────────────────────────────

fn err(e: impl std::fmt::Display) -> String {
    e.to_string()
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn arg_str(params: &[Value], index: usize) -> Result<String, String> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing string parameter {index}"))
}

fn opt_str(params: &[Value], index: usize) -> Result<Option<String>, String> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("parameter {index} must be a string")),
    }
}

fn arg_i64(params: &[Value], index: usize) -> Result<i64, String> {
    params
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| format!("missing integer parameter {index}"))
}

fn arg_i64_or(params: &[Value], index: usize, default: i64) -> Result<i64, String> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_i64()
            .ok_or_else(|| format!("parameter {index} must be an integer")),
    }
}

fn arg_bool_or(params: &[Value], index: usize, default: bool) -> Result<bool, String> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(format!("parameter {index} must be a boolean")),
    }
}

fn parse_id(value: &Value) -> Result<Identifier, String> {
    serde_json::from_value(value.clone()).map_err(|_| "identifier must be a [predicate, value] pair".to_string())
}

fn arg_id(params: &[Value], index: usize) -> Result<Identifier, String> {
    let value = params
        .get(index)
        .ok_or_else(|| format!("missing identifier parameter {index}"))?;
    parse_id(value)
}

fn opt_id(params: &[Value], index: usize) -> Result<Option<Identifier>, String> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_id(v).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    fn state() -> AppState {
        AppState {
            store: Arc::new(Store::open_in_memory(StoreOptions::default()).unwrap()),
            relay: Arc::new(LogRelay),
        }
    }

    fn call(state: &AppState, method: &str, params: Value) -> CommandResult {
        let params = params.as_array().cloned().unwrap_or_default();
        dispatch(state, method, &params)
    }

    #[test]
    fn counts_start_at_zero() {
        let state = state();
        assert_eq!(call(&state, "getmsgcount", json!([])).unwrap(), json!(0));
        assert_eq!(
            call(&state, "getidentifiercount", json!([])).unwrap(),
            json!(0)
        );
    }

    #[test]
    fn rate_saves_and_publishes() {
        let state = state();
        let hash = call(
            &state,
            "rate",
            json!([["email", "elena@example.com"], 1, "positive"]),
        )
        .unwrap();
        assert!(hash.as_str().is_some_and(|h| !h.is_empty()));

        assert_eq!(call(&state, "getmsgcount", json!([])).unwrap(), json!(1));
        // author keyID + recipient email
        assert_eq!(
            call(&state, "getidentifiercount", json!([])).unwrap(),
            json!(2)
        );

        let found = call(&state, "getmsgbyhash", json!([hash])).unwrap();
        let msg = &found.as_array().unwrap()[0];
        assert_eq!(msg["published"], json!(true));
    }

    #[test]
    fn unknown_method_is_an_error() {
        let state = state();
        assert!(call(&state, "definitely-not-a-method", json!([])).is_err());
    }

    #[test]
    fn missing_message_lookup_is_empty_not_error() {
        let state = state();
        assert_eq!(
            call(&state, "getmsgbyhash", json!(["nope"])).unwrap(),
            json!([])
        );
        // but deletemsg surfaces not-found
        assert!(call(&state, "deletemsg", json!(["nope"])).is_err());
    }

    #[test]
    fn savemsgfromdata_rejects_non_canonical_input() {
        let state = state();
        let canonical = r#"{"signature":{},"signedData":{"author":[["email","a@x"]],"recipient":[["email","b@x"]],"timestamp":7,"type":"rating"}}"#;
        let hash = call(&state, "savemsgfromdata", json!([canonical, false])).unwrap();
        assert!(hash.as_str().is_some_and(|h| !h.is_empty()));

        let spaced = canonical.replacen("\"signature\":", "\"signature\": ", 1);
        let rejected = call(&state, "savemsgfromdata", json!([spaced, false]));
        assert!(rejected.is_err());
    }

    #[test]
    fn key_management_roundtrip() {
        let state = state();
        let listed = call(&state, "listmykeys", json!([])).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let new_key = call(&state, "getnewkey", json!([])).unwrap();
        let privkey = new_key["privkey"].as_str().unwrap().to_string();
        let listed = call(&state, "listmykeys", json!([])).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 2);

        assert_eq!(
            call(&state, "setdefaultkey", json!([privkey])).unwrap(),
            json!(true)
        );
        assert!(call(&state, "importprivkey", json!(["garbage"])).is_err());
    }

    #[test]
    fn addsignature_replaces_with_verified_signature() {
        let state = state();
        let hash = call(
            &state,
            "rate",
            json!([["email", "bob@example.com"], 1, null, false]),
        )
        .unwrap();
        let hash = hash.as_str().unwrap().to_string();

        // a second key signs the same payload out of band
        let other = vouch_sdk::keys::generate();
        let mut msg = state.store.message_by_hash(&hash).unwrap();
        msg.sign(&other);
        let ok = call(
            &state,
            "addsignature",
            json!([hash, msg.signature.pub_key, msg.signature.signature]),
        )
        .unwrap();
        assert_eq!(ok, json!(true));

        let garbage = call(
            &state,
            "addsignature",
            json!([hash, vouch_sdk::keys::encode_public(&other), "bm90LWEtc2ln"]),
        );
        assert!(garbage.is_err());
    }

    #[test]
    fn gettrustdistance_defaults_to_minus_one() {
        let state = state();
        let d = call(
            &state,
            "gettrustdistance",
            json!([["p1", "nobody1"], ["p2", "nobody2"]]),
        )
        .unwrap();
        assert_eq!(d, json!(-1));
    }
}
