//! Remote-first repository with a local write-through cache.
//!
//! One generic code path serves every entity; the per-entity differences
//! live in [`EntitySpec`]. Transport and cache-format failures never escape
//! from here: reads fall back to the cache, writes fall back to an
//! optimistic local write flagged `pendingSync`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::canon;
use crate::entities::EntitySpec;
use crate::error::FacadeError;
use crate::remote::{Body, Method, RemoteResource};
use crate::store::{self, KeyValueStore};

pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedRecord {
    pub record: Value,
    #[serde(default)]
    pub pending_sync: bool,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDoc {
    #[serde(default)]
    records: BTreeMap<String, CachedRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub items: Vec<Value>,
    pub source: Source,
    pub pending_keys: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub discarded: bool,
}

impl Listing {
    fn discarded(source: Source) -> Self {
        Listing {
            items: Vec::new(),
            source,
            pending_keys: Vec::new(),
            discarded: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Saved {
    pub record: Value,
    pub source: Source,
    /// True when only the local cache holds this write; the value is
    /// provisional until a push succeeds.
    pub pending_sync: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub discarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteOutcome {
    Confirmed,
    Failed,
    /// The record only ever existed locally.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Removed {
    pub key: String,
    pub existed_locally: bool,
    pub remote: RemoteOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub entity: &'static str,
    pub key: String,
    pub record: Value,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub pushed: Vec<String>,
    pub still_pending: Vec<String>,
    pub rejected: Vec<String>,
}

/// Equality filter over canonical fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<(String, Value)>,
}

impl Filter {
    pub fn parse(spec: &EntitySpec, raw: Option<&Value>) -> Result<Filter, FacadeError> {
        let Some(raw) = raw else {
            return Ok(Filter::default());
        };
        if raw.is_null() {
            return Ok(Filter::default());
        }
        let Some(obj) = raw.as_object() else {
            return Err(FacadeError::validation("filter must be an object"));
        };
        let mut terms = Vec::new();
        for (k, v) in obj {
            if v.is_null() {
                continue;
            }
            let Some(f) = spec.field(k) else {
                return Err(FacadeError::invalid_field(
                    k,
                    format!("{} cannot filter on {}", spec.name, k),
                ));
            };
            let kind = match f.kind {
                canon::FieldKind::TextList => canon::FieldKind::Text,
                other => other,
            };
            let Some(cv) = canon::coerce(kind, Some(v)) else {
                return Err(FacadeError::invalid_field(k, format!("invalid value for {}", k)));
            };
            terms.push((f.name.to_string(), cv));
        }
        Ok(Filter { terms })
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Filter {
        Filter {
            terms: vec![(field.to_string(), value.into())],
        }
    }

    fn query(&self, spec: &EntitySpec) -> Vec<(String, String)> {
        self.terms
            .iter()
            .map(|(name, v)| {
                let wire = spec
                    .field(name)
                    .map(|f| f.remote_name().to_string())
                    .unwrap_or_else(|| name.clone());
                (wire, scalar_text(v))
            })
            .collect()
    }

    /// Terms the server can answer. A scope term is dropped because the
    /// server would leave out records that apply to every scope.
    fn remote_part(&self, spec: &EntitySpec) -> Filter {
        Filter {
            terms: self
                .terms
                .iter()
                .filter(|(name, _)| spec.scope_field != Some(name.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn matches(&self, spec: &EntitySpec, record: &Value) -> bool {
        self.terms.iter().all(|(name, want)| match record.get(name) {
            None => spec.scope_field == Some(name.as_str()),
            Some(Value::Array(items)) => items.contains(want),
            Some(have) => have == want,
        })
    }
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

pub struct Repository<'a> {
    spec: &'static EntitySpec,
    remote: &'a dyn RemoteResource,
    store: &'a dyn KeyValueStore,
    ticket: Option<ViewTicket>,
}

impl<'a> Repository<'a> {
    pub fn new(
        spec: &'static EntitySpec,
        remote: &'a dyn RemoteResource,
        store: &'a dyn KeyValueStore,
    ) -> Self {
        Self {
            spec,
            remote,
            store,
            ticket: None,
        }
    }

    /// Results that arrive after the ticket's view was closed or reopened
    /// are discarded instead of applied.
    pub fn with_ticket(mut self, ticket: Option<ViewTicket>) -> Self {
        self.ticket = ticket;
        self
    }

    fn stale(&self) -> bool {
        self.ticket.as_ref().map(|t| !t.is_current()).unwrap_or(false)
    }

    fn load(&self) -> CacheDoc {
        store::get_json(self.store, &self.spec.cache_key()).unwrap_or_default()
    }

    fn save(&self, doc: &CacheDoc) {
        store::set_json(self.store, &self.spec.cache_key(), doc);
    }

    pub fn list(&self, filter: &Filter) -> Listing {
        let sent = filter.remote_part(self.spec);
        let query = sent.query(self.spec);
        let reply = self.remote.request(Method::Get, self.spec.path, &query, None);
        if self.stale() {
            tracing::debug!(entity = self.spec.name, "view closed during list; discarding");
            let source = if reply.is_ok() { Source::Remote } else { Source::Local };
            return Listing::discarded(source);
        }
        let body = match reply {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(entity = self.spec.name, error = %e, "remote list failed; serving cache");
                return self.cached(filter);
            }
        };

        let mut fetched = Vec::new();
        for raw in collection_items(&body) {
            let c = self.spec.canonicalize(raw);
            if self.spec.key_of(&c).is_none() {
                tracing::debug!(entity = self.spec.name, "remote item without key skipped");
                continue;
            }
            fetched.push(c);
        }
        self.write_through_listing(&sent, &fetched);
        let items = fetched
            .into_iter()
            .filter(|item| filter.matches(self.spec, item))
            .collect();
        Listing {
            items,
            source: Source::Remote,
            pending_keys: Vec::new(),
            discarded: false,
        }
    }

    /// Cache-only read with the same filter semantics as a remote list.
    pub fn cached(&self, filter: &Filter) -> Listing {
        let doc = self.load();
        let mut items = Vec::new();
        let mut pending_keys = Vec::new();
        for (key, entry) in &doc.records {
            if !filter.matches(self.spec, &entry.record) {
                continue;
            }
            if entry.pending_sync {
                pending_keys.push(key.clone());
            }
            items.push(entry.record.clone());
        }
        Listing {
            items,
            source: Source::Local,
            pending_keys,
            discarded: false,
        }
    }

    /// Remote is authoritative for the filtered slice, except for unsynced
    /// local writes which stay until pushed or matched.
    fn write_through_listing(&self, filter: &Filter, items: &[Value]) {
        let mut doc = self.load();
        doc.records
            .retain(|_, e| e.pending_sync || !filter.matches(self.spec, &e.record));
        let now = now_stamp();
        for item in items {
            let Some(key) = self.spec.key_of(item) else {
                continue;
            };
            if let Some(existing) = doc.records.get(&key) {
                if existing.pending_sync && existing.record != *item {
                    continue;
                }
            }
            doc.records.insert(
                key,
                CachedRecord {
                    record: item.clone(),
                    pending_sync: false,
                    updated_at: Some(now.clone()),
                },
            );
        }
        self.save(&doc);
    }

    /// Merges `input` (any alias spelling, possibly partial) over the cached
    /// record with the same key, then writes remote-first.
    pub fn upsert(&self, input: &Value) -> Result<Saved, FacadeError> {
        let mut doc = self.load();
        let patch = canon::canonicalize_present(self.spec.fields, input);
        let patch = Value::Object(patch);
        let base = self
            .spec
            .key_of(&patch)
            .and_then(|k| doc.records.get(&k))
            .map(|e| self.rebase(&e.record, &patch));
        let merged = self.spec.canonicalize(&overlay(base.as_ref(), &patch));
        let Some(obj) = merged.as_object() else {
            return Err(FacadeError::validation("record must be an object"));
        };
        (self.spec.validate)(obj)?;

        let local_id = self.spec.id_of(&merged).filter(|id| is_local_id(id));
        let (method, path) = match self.spec.id_of(&merged) {
            Some(id) if !is_local_id(id) => (Method::Put, format!("{}/{}", self.spec.path, id)),
            _ => (Method::Post, self.spec.path.to_string()),
        };
        let outgoing = match (local_id, self.spec.id_field) {
            (Some(_), Some(id_field)) => without(&merged, id_field),
            _ => merged.clone(),
        };
        let body = self.body_for(&outgoing);

        match self.remote.request(method, &path, &[], Some(&body)) {
            Ok(resp) => {
                if self.stale() {
                    tracing::debug!(entity = self.spec.name, "view closed during save; discarding");
                    return Ok(Saved {
                        record: merged,
                        source: Source::Remote,
                        pending_sync: false,
                        discarded: true,
                    });
                }
                let reply = Value::Object(canon::canonicalize_present(
                    self.spec.fields,
                    record_payload(&resp),
                ));
                let confirmed = if self.carries_entity(&reply) {
                    self.spec.canonicalize(&overlay(Some(&merged), &reply))
                } else {
                    merged.clone()
                };
                let Some(new_key) = self.spec.key_of(&confirmed) else {
                    tracing::warn!(entity = self.spec.name, "remote accepted save without an id; keeping it pending");
                    let record = self.write_pending(&mut doc, confirmed)?;
                    return Ok(Saved {
                        record,
                        source: Source::Remote,
                        pending_sync: true,
                        discarded: false,
                    });
                };
                if let Some(old_key) = self.spec.key_of(&merged) {
                    if old_key != new_key {
                        doc.records.remove(&old_key);
                    }
                }
                let unconfirmed = self
                    .spec
                    .id_of(&confirmed)
                    .map(is_local_id)
                    .unwrap_or(false);
                doc.records.insert(
                    new_key,
                    CachedRecord {
                        record: confirmed.clone(),
                        pending_sync: unconfirmed,
                        updated_at: Some(now_stamp()),
                    },
                );
                self.save(&doc);
                Ok(Saved {
                    record: confirmed,
                    source: Source::Remote,
                    pending_sync: unconfirmed,
                    discarded: false,
                })
            }
            Err(e) => {
                tracing::warn!(entity = self.spec.name, error = %e, "remote save failed; writing locally");
                let record = self.write_pending(&mut doc, merged)?;
                Ok(Saved {
                    record,
                    source: Source::Local,
                    pending_sync: true,
                    discarded: false,
                })
            }
        }
    }

    /// Cached base for a patch, minus derived values the patch invalidates.
    fn rebase(&self, base: &Value, patch: &Value) -> Value {
        let mut base = base.clone();
        if let Some(obj) = base.as_object_mut() {
            for (derived, source) in self.spec.derived {
                if patch.get(*source).is_some() && patch.get(*derived).is_none() {
                    obj.remove(*derived);
                }
            }
        }
        base
    }

    /// Whether a save reply describes the record rather than merely
    /// acknowledging it.
    fn carries_entity(&self, reply: &Value) -> bool {
        match self.spec.id_field {
            Some(id_field) => reply.get(id_field).is_some(),
            None => self.spec.key.iter().all(|k| reply.get(*k).is_some()),
        }
    }

    /// Caches a write the server has not confirmed, giving it a provisional
    /// id when it has none.
    fn write_pending(&self, doc: &mut CacheDoc, mut record: Value) -> Result<Value, FacadeError> {
        if let Some(id_field) = self.spec.id_field {
            if self.spec.id_of(&record).is_none() {
                if let Some(obj) = record.as_object_mut() {
                    obj.insert(id_field.to_string(), Value::String(new_local_id()));
                }
            }
        }
        let Some(key) = self.spec.key_of(&record) else {
            return Err(FacadeError::validation(format!(
                "{} record needs {}",
                self.spec.name,
                self.spec.key.join(", ")
            )));
        };
        doc.records.insert(
            key,
            CachedRecord {
                record: record.clone(),
                pending_sync: true,
                updated_at: Some(now_stamp()),
            },
        );
        self.save(doc);
        Ok(record)
    }

    /// Deletes remotely when possible and always locally.
    pub fn remove(&self, input: &Value) -> Result<Removed, FacadeError> {
        let target = Value::Object(canon::canonicalize_present(self.spec.fields, input));
        let Some(key) = self.spec.key_of(&target) else {
            return Err(FacadeError::validation(format!(
                "{} removal needs {}",
                self.spec.name,
                self.spec.key.join(", ")
            )));
        };

        let remote = match self.spec.id_of(&target) {
            Some(id) if is_local_id(id) => RemoteOutcome::Skipped,
            Some(id) => {
                let path = format!("{}/{}", self.spec.path, id);
                self.remote_delete(&path, &[])
            }
            None => {
                let query = Filter {
                    terms: self
                        .spec
                        .key
                        .iter()
                        .filter_map(|k| target.get(*k).map(|v| (k.to_string(), v.clone())))
                        .collect(),
                }
                .query(self.spec);
                self.remote_delete(self.spec.path, &query)
            }
        };

        let mut doc = self.load();
        let existed_locally = doc.records.remove(&key).is_some();
        if existed_locally {
            self.save(&doc);
        }
        Ok(Removed {
            key,
            existed_locally,
            remote,
        })
    }

    fn remote_delete(&self, path: &str, query: &[(String, String)]) -> RemoteOutcome {
        match self.remote.request(Method::Delete, path, query, None) {
            Ok(_) => RemoteOutcome::Confirmed,
            Err(e) => {
                tracing::warn!(entity = self.spec.name, error = %e, "remote delete failed; removed locally only");
                RemoteOutcome::Failed
            }
        }
    }

    pub fn pending(&self) -> Vec<PendingEntry> {
        self.load()
            .records
            .into_iter()
            .filter(|(_, e)| e.pending_sync)
            .map(|(key, e)| PendingEntry {
                entity: self.spec.name,
                key,
                record: e.record,
                updated_at: e.updated_at,
            })
            .collect()
    }

    /// Explicit retry of unsynced local writes. Never called implicitly.
    pub fn push_pending(&self) -> PushReport {
        let mut report = PushReport::default();
        for entry in self.pending() {
            match self.upsert(&entry.record) {
                Ok(saved) if !saved.pending_sync => report.pushed.push(entry.key),
                Ok(_) => report.still_pending.push(entry.key),
                Err(e) => {
                    tracing::warn!(entity = self.spec.name, key = %entry.key, error = %e, "cached record no longer valid");
                    report.rejected.push(entry.key);
                }
            }
        }
        report
    }

    fn body_for(&self, record: &Value) -> Body {
        if let Some(field) = self.spec.attachment_field {
            if let Some(path) = record.get(field).and_then(|v| v.as_str()) {
                if Path::new(path).is_file() {
                    return Body::Multipart {
                        fields: record.clone(),
                        file_field: field.to_string(),
                        file_path: path.into(),
                    };
                }
            }
        }
        Body::Json(record.clone())
    }
}

/// Accepts a bare array or the common `{results|data|items: [...]}` envelopes.
fn collection_items(body: &Value) -> Vec<&Value> {
    match body {
        Value::Array(items) => items.iter().collect(),
        Value::Object(obj) => {
            for k in ["results", "data", "items"] {
                if let Some(Value::Array(items)) = obj.get(k) {
                    return items.iter().collect();
                }
            }
            vec![body]
        }
        _ => Vec::new(),
    }
}

fn record_payload(body: &Value) -> &Value {
    match body.get("data") {
        Some(inner @ Value::Object(_)) => inner,
        _ => body,
    }
}

fn overlay(base: Option<&Value>, patch: &Value) -> Value {
    let mut out: Map<String, Value> = base
        .and_then(|b| b.as_object())
        .cloned()
        .unwrap_or_default();
    if let Some(p) = patch.as_object() {
        for (k, v) in p {
            out.insert(k.clone(), v.clone());
        }
    }
    Value::Object(out)
}

fn without(record: &Value, field: &str) -> Value {
    let mut out = record.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.remove(field);
    }
    out
}

fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Handle proving a view is still the one that started a request.
#[derive(Debug, Clone)]
pub struct ViewTicket {
    generation: Arc<AtomicU64>,
    issued: u64,
}

impl ViewTicket {
    /// Ticket for a view that is not open; anything carrying it is discarded.
    pub fn closed() -> Self {
        ViewTicket {
            generation: Arc::new(AtomicU64::new(1)),
            issued: 0,
        }
    }

    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.issued
    }
}

#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: HashMap<String, Arc<AtomicU64>>,
}

impl ViewRegistry {
    /// Opening (or reopening) a view invalidates tickets from earlier mounts.
    pub fn open(&mut self, view: &str) -> u64 {
        let gen = self
            .views
            .entry(view.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn close(&mut self, view: &str) -> bool {
        match self.views.remove(view) {
            Some(gen) => {
                gen.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn ticket(&self, view: &str) -> Option<ViewTicket> {
        self.views.get(view).map(|gen| ViewTicket {
            generation: Arc::clone(gen),
            issued: gen.load(Ordering::SeqCst),
        })
    }

    pub fn open_views(&self) -> Vec<String> {
        let mut v: Vec<String> = self.views.keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{self, FeeRecord, ATTENDANCE, FEES, HOMEWORK, NOTICES};
    use crate::remote::testing::{FailingRemote, StubRemote};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn fee_reply() -> StubRemote {
        StubRemote::new(|call| match call.method {
            Method::Get => Ok(json!([
                { "id": "f1", "student_id": "s1", "total_amount": 1000, "paid_amount": 1000 },
                { "id": "f2", "student_id": "s1", "total_amount": 800, "paid_amount": 0 }
            ])),
            _ => Ok(json!({})),
        })
    }

    #[test]
    fn failing_remote_returns_empty_cache_without_error() {
        let store = MemoryStore::new();
        let repo = Repository::new(&FEES, &FailingRemote, &store);
        let listing = repo.list(&Filter::default());
        assert!(listing.items.is_empty());
        assert_eq!(listing.source, Source::Local);
    }

    #[test]
    fn failing_remote_returns_exactly_the_cached_records() {
        let store = MemoryStore::new();
        let online = fee_reply();
        let remote_listing = Repository::new(&FEES, &online, &store).list(&Filter::default());
        assert_eq!(remote_listing.source, Source::Remote);
        assert_eq!(remote_listing.items.len(), 2);

        let offline = Repository::new(&FEES, &FailingRemote, &store).list(&Filter::default());
        assert_eq!(offline.source, Source::Local);
        assert_eq!(offline.items, remote_listing.items);
        assert!(offline.pending_keys.is_empty());
    }

    #[test]
    fn remote_list_sends_remote_field_names() {
        let store = MemoryStore::new();
        let online = fee_reply();
        let repo = Repository::new(&FEES, &online, &store);
        let filter = Filter::parse(&FEES, Some(&json!({ "studentId": "s1" }))).expect("filter");
        repo.list(&filter);
        let calls = online.calls.borrow();
        assert_eq!(calls[0].path, "fees");
        assert_eq!(calls[0].query, vec![("student_id".to_string(), "s1".to_string())]);
    }

    #[test]
    fn unknown_filter_field_is_a_validation_error() {
        let err = Filter::parse(&FEES, Some(&json!({ "color": "red" }))).expect_err("unknown");
        assert!(err.code() == "validation");
    }

    #[test]
    fn upsert_via_remote_is_served_from_cache_later() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|call| {
            assert_eq!(call.method, Method::Post);
            Ok(json!({ "id": "f9", "student_id": "s1", "total_amount": 1200, "paid_amount": 200 }))
        });
        let saved = Repository::new(&FEES, &online, &store)
            .upsert(&json!({ "studentId": "s1", "totalAmount": 1200, "paidAmount": 200 }))
            .expect("upsert");
        assert_eq!(saved.source, Source::Remote);
        assert!(!saved.pending_sync);
        assert_eq!(saved.record["id"], json!("f9"));

        let offline = Repository::new(&FEES, &FailingRemote, &store).list(&Filter::default());
        assert_eq!(offline.items, vec![saved.record]);
    }

    #[test]
    fn remote_ack_without_id_is_still_cached() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|_| Ok(json!({ "message": "created" })));
        let saved = Repository::new(&NOTICES, &online, &store)
            .upsert(&json!({ "audience": "students", "title": "Holiday" }))
            .expect("upsert");
        assert_eq!(saved.source, Source::Remote);
        assert!(saved.pending_sync);
        assert!(saved.record.get("description").is_none());
        let id = saved.record["id"].as_str().expect("id").to_string();
        assert!(is_local_id(&id));

        let offline = Repository::new(&NOTICES, &FailingRemote, &store).list(&Filter::default());
        assert_eq!(offline.items, vec![saved.record]);
        assert_eq!(offline.pending_keys, vec![id]);
    }

    #[test]
    fn empty_ack_on_update_keeps_the_submitted_record() {
        let store = MemoryStore::new();
        Repository::new(&FEES, &fee_reply(), &store).list(&Filter::default());
        let online = StubRemote::new(|call| {
            assert_eq!(call.method, Method::Put);
            Ok(Value::Null)
        });
        let saved = Repository::new(&FEES, &online, &store)
            .upsert(&json!({ "id": "f2", "paidAmount": 300 }))
            .expect("upsert");
        assert!(!saved.pending_sync);
        assert_eq!(saved.record["paidAmount"], json!(300));
        assert_eq!(saved.record["totalAmount"], json!(800));

        let offline = Repository::new(&FEES, &FailingRemote, &store).list(&Filter::eq("id", "f2"));
        assert_eq!(offline.items, vec![saved.record]);
        assert!(offline.pending_keys.is_empty());
    }

    #[test]
    fn terse_remote_reply_keeps_submitted_fields() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|_| Ok(json!({ "id": "f3" })));
        let saved = Repository::new(&FEES, &online, &store)
            .upsert(&json!({ "student_id": "s1", "amount": 500, "paid": 100 }))
            .expect("upsert");
        let fee: FeeRecord = serde_json::from_value(saved.record).expect("typed");
        assert_eq!(fee.id.as_deref(), Some("f3"));
        assert_eq!(fee.total_amount, 500.0);
        assert_eq!(fee.paid_amount, 100.0);
    }

    #[test]
    fn remote_named_fields_win_in_reply() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|_| Ok(json!({ "id": "f4", "total_amount": 900, "totalAmount": 1 })));
        let saved = Repository::new(&FEES, &online, &store)
            .upsert(&json!({ "studentId": "s1", "totalAmount": 1000 }))
            .expect("upsert");
        assert_eq!(saved.record["totalAmount"], json!(900));
    }

    #[test]
    fn failed_upsert_is_optimistic_and_flagged() {
        let store = MemoryStore::new();
        let repo = Repository::new(&NOTICES, &FailingRemote, &store);
        let saved = repo
            .upsert(&json!({ "audience": "students", "title": "Exam week" }))
            .expect("upsert");
        assert_eq!(saved.source, Source::Local);
        assert!(saved.pending_sync);
        let id = saved.record["id"].as_str().expect("id").to_string();
        assert!(is_local_id(&id));

        let listing = repo.list(&Filter::default());
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.pending_keys, vec![id]);
        assert_eq!(repo.pending().len(), 1);
    }

    #[test]
    fn validation_error_blocks_before_network() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|_| Ok(json!({})));
        let err = Repository::new(&ATTENDANCE, &online, &store)
            .upsert(&json!({ "subjectId": "s1", "date": "2024-01-02", "status": "late" }))
            .expect_err("invalid");
        assert!(err.code() == "validation");
        assert_eq!(online.call_count(), 0);
    }

    #[test]
    fn attendance_overwrites_same_subject_and_day() {
        let store = MemoryStore::new();
        let repo = Repository::new(&ATTENDANCE, &FailingRemote, &store);
        repo.upsert(&json!({ "subjectId": "s1", "date": "2024-01-02", "status": "Present" }))
            .expect("first");
        repo.upsert(&json!({ "student_id": "s1", "date": "2024-01-02T09:00:00Z", "status": "A" }))
            .expect("second");
        let listing = repo.list(&Filter::default());
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0]["status"], json!("Absent"));
    }

    #[test]
    fn remove_is_local_even_when_remote_fails() {
        let store = MemoryStore::new();
        let online = fee_reply();
        Repository::new(&FEES, &online, &store).list(&Filter::default());

        let repo = Repository::new(&FEES, &FailingRemote, &store);
        let removed = repo.remove(&json!({ "id": "f1" })).expect("remove");
        assert!(removed.existed_locally);
        assert_eq!(removed.remote, RemoteOutcome::Failed);
        let ids: Vec<_> = repo
            .list(&Filter::default())
            .items
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("f2")]);
    }

    #[test]
    fn remove_of_composite_key_uses_query() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|_| Ok(Value::Null));
        let removed = Repository::new(&ATTENDANCE, &online, &store)
            .remove(&json!({ "subjectId": "s1", "date": "2024-01-02" }))
            .expect("remove");
        assert_eq!(removed.remote, RemoteOutcome::Confirmed);
        assert!(!removed.existed_locally);
        let calls = online.calls.borrow();
        assert_eq!(calls[0].method, Method::Delete);
        assert_eq!(calls[0].path, "attendance");
        assert!(calls[0].query.contains(&("subject_id".to_string(), "s1".to_string())));
    }

    #[test]
    fn push_pending_replaces_local_id() {
        let store = MemoryStore::new();
        let offline = Repository::new(&NOTICES, &FailingRemote, &store);
        let saved = offline
            .upsert(&json!({ "audience": "teachers", "title": "Staff meeting" }))
            .expect("upsert");
        let local_key = saved.record["id"].as_str().expect("id").to_string();

        let online = StubRemote::new(|call| {
            assert_eq!(call.method, Method::Post);
            match &call.body {
                Some(Body::Json(b)) => assert!(b.get("id").is_none()),
                other => panic!("unexpected body {:?}", other),
            }
            Ok(json!({ "id": "n100" }))
        });
        let report = Repository::new(&NOTICES, &online, &store).push_pending();
        assert_eq!(report.pushed, vec![local_key.clone()]);

        let listing = Repository::new(&NOTICES, &FailingRemote, &store).list(&Filter::default());
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0]["id"], json!("n100"));
        assert!(listing.pending_keys.is_empty());
    }

    #[test]
    fn remote_list_keeps_divergent_pending_writes() {
        let store = MemoryStore::new();
        Repository::new(&FEES, &FailingRemote, &store)
            .upsert(&json!({ "id": "f1", "studentId": "s1", "totalAmount": 1000, "paidAmount": 50 }))
            .expect("local");
        let online = fee_reply();
        let listing = Repository::new(&FEES, &online, &store).list(&Filter::default());
        assert_eq!(listing.items[0]["paidAmount"], json!(1000));

        let pending = Repository::new(&FEES, &FailingRemote, &store).pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record["paidAmount"], json!(50));
    }

    #[test]
    fn wildcard_scope_matches_class_filter() {
        let store = MemoryStore::new();
        let repo = Repository::new(&HOMEWORK, &FailingRemote, &store);
        repo.upsert(&json!({ "title": "All classes" })).expect("a");
        repo.upsert(&json!({ "title": "Only 7B", "classId": "7B" })).expect("b");
        let filter = Filter::parse(&HOMEWORK, Some(&json!({ "classScope": "7A" }))).expect("filter");
        let titles: Vec<_> = repo
            .list(&filter)
            .items
            .iter()
            .map(|r| r["title"].clone())
            .collect();
        assert_eq!(titles, vec![json!("All classes")]);
    }

    #[test]
    fn scoped_remote_list_keeps_all_class_records_cached() {
        let store = MemoryStore::new();
        let online = StubRemote::new(|call| {
            assert!(call.query.is_empty());
            Ok(json!([
                { "id": "n1", "notice_for": "students", "heading": "Sports day" },
                { "id": "n2", "notice_for": "students", "heading": "Trip", "class_id": "7A" },
                { "id": "n3", "notice_for": "students", "heading": "Lab", "class_id": "7B" }
            ]))
        });
        Repository::new(&NOTICES, &online, &store).list(&Filter::default());

        let scoped = Filter::parse(&NOTICES, Some(&json!({ "classScope": "7A" }))).expect("filter");
        let remote_ids: Vec<_> = Repository::new(&NOTICES, &online, &store)
            .list(&scoped)
            .items
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(remote_ids, vec![json!("n1"), json!("n2")]);

        let offline = Repository::new(&NOTICES, &FailingRemote, &store);
        let local_ids: Vec<_> = offline
            .list(&scoped)
            .items
            .iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(local_ids, remote_ids);
        assert_eq!(offline.list(&Filter::default()).items.len(), 3);
    }

    #[test]
    fn homework_patch_switches_broadcast_to_targeted() {
        let store = MemoryStore::new();
        let repo = Repository::new(&HOMEWORK, &FailingRemote, &store);
        let first = repo.upsert(&json!({ "title": "Essay" })).expect("first");
        assert_eq!(first.record["allRecipients"], json!(true));
        let id = first.record["id"].clone();

        let targeted = repo
            .upsert(&json!({ "id": id.clone(), "recipients": ["s1"] }))
            .expect("targeted");
        assert_eq!(targeted.record["allRecipients"], json!(false));
        assert_eq!(targeted.record["recipients"], json!(["s1"]));
        assert_eq!(targeted.record["title"], json!("Essay"));

        let again = repo
            .upsert(&json!({ "id": id, "allRecipients": true }))
            .expect("broadcast");
        assert_eq!(again.record["allRecipients"], json!(true));
        assert!(again.record.get("recipients").is_none());
    }

    #[test]
    fn closing_view_mid_flight_discards_result() {
        let store = MemoryStore::new();
        let registry = Rc::new(std::cell::RefCell::new(ViewRegistry::default()));
        registry.borrow_mut().open("fees");
        let ticket = registry.borrow().ticket("fees");
        let calls = Rc::new(Cell::new(0));

        let reg = Rc::clone(&registry);
        let seen = Rc::clone(&calls);
        let remote = StubRemote::new(move |_| {
            seen.set(seen.get() + 1);
            reg.borrow_mut().close("fees");
            Ok(json!([{ "id": "f1", "student_id": "s1", "total_amount": 10 }]))
        });
        let listing = Repository::new(&FEES, &remote, &store)
            .with_ticket(ticket)
            .list(&Filter::default());
        assert!(listing.discarded);
        assert!(listing.items.is_empty());
        assert_eq!(calls.get(), 1);
        assert!(store.get(&FEES.cache_key()).is_none());
    }

    #[test]
    fn reopening_a_view_invalidates_older_tickets() {
        let mut views = ViewRegistry::default();
        views.open("library");
        let first = views.ticket("library").expect("ticket");
        assert!(first.is_current());
        views.open("library");
        assert!(!first.is_current());
        assert!(views.ticket("library").expect("ticket").is_current());
        assert!(views.close("library"));
        assert!(!views.close("library"));
        assert!(!ViewTicket::closed().is_current());
    }

    #[test]
    fn closed_view_discards_cache_fallback_too() {
        let store = MemoryStore::new();
        Repository::new(&FEES, &fee_reply(), &store).list(&Filter::default());
        let listing = Repository::new(&FEES, &FailingRemote, &store)
            .with_ticket(Some(ViewTicket::closed()))
            .list(&Filter::default());
        assert!(listing.discarded);
        assert_eq!(listing.source, Source::Local);
        assert!(listing.items.is_empty());
    }

    #[test]
    fn corrupt_cache_reads_as_empty() {
        let store = MemoryStore::new();
        store.set(&FEES.cache_key(), "][");
        let listing = Repository::new(&FEES, &FailingRemote, &store).list(&Filter::default());
        assert!(listing.items.is_empty());
    }

    #[test]
    fn same_input_same_metrics_from_either_source() {
        let store = MemoryStore::new();
        let online = fee_reply();
        let remote_items = Repository::new(&FEES, &online, &store).list(&Filter::default()).items;
        let local_items = Repository::new(&FEES, &FailingRemote, &store)
            .list(&Filter::default())
            .items;
        let a = crate::metrics::fee_totals(&entities::typed::<FeeRecord>(&remote_items));
        let b = crate::metrics::fee_totals(&entities::typed::<FeeRecord>(&local_items));
        assert_eq!(a, b);
        assert_eq!(a.pending, 800.0);
    }
}
