use crate::entities::{self, AttendanceRecord, ATTENDANCE};
use crate::ipc::handlers::records;
use crate::ipc::helpers::{respond, to_json, today, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use crate::repo::Filter;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Accepts either `params.record` or the record fields inline.
fn record_from(params: &Value) -> &Value {
    match params.get("record") {
        Some(r @ Value::Object(_)) => r,
        _ => params,
    }
}

fn attendance_mark(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let saved = state.repo(&ATTENDANCE, params).upsert(record_from(params))?;
    to_json(&saved)
}

fn bulk_records(params: &Value) -> Result<Vec<Value>, HandlerErr> {
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries"));
    };
    let mut out = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let mut rec: Map<String, Value> = match entry {
            Value::Object(m) => m.clone(),
            Value::String(s) => {
                let mut m = Map::new();
                m.insert("subjectId".into(), Value::String(s.clone()));
                m
            }
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "entries[{}] must be an object or subject id",
                    i
                )))
            }
        };
        // Shared fields fill in whatever the entry leaves out.
        for k in ["subjectId", "date", "status", "subjectKind", "scopeId"] {
            if let Some(v) = params.get(k) {
                rec.entry(k.to_string()).or_insert_with(|| v.clone());
            }
        }
        let canonical = ATTENDANCE.canonicalize(&Value::Object(rec.clone()));
        if let Some(obj) = canonical.as_object() {
            if let Err(e) = (ATTENDANCE.validate)(obj) {
                let mut he = HandlerErr::from(e);
                let mut details = he.details.take().unwrap_or_else(|| json!({}));
                details["index"] = json!(i);
                he.details = Some(details);
                return Err(he);
            }
        }
        out.push(Value::Object(rec));
    }
    Ok(out)
}

/// All entries are validated before any of them is written.
fn attendance_bulk_mark(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let records = bulk_records(params)?;
    let repo = state.repo(&ATTENDANCE, params);
    let mut results = Vec::with_capacity(records.len());
    let mut pending = 0usize;
    for rec in &records {
        let saved = repo.upsert(rec)?;
        if saved.pending_sync {
            pending += 1;
        }
        results.push(json!({
            "key": ATTENDANCE.key_of(&saved.record),
            "source": saved.source,
            "pendingSync": saved.pending_sync,
        }));
    }
    Ok(json!({
        "marked": results.len(),
        "pendingSync": pending,
        "results": results,
    }))
}

fn attendance_summary(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let today = today(params)?;
    let mut terms = Map::new();
    for k in ["subjectId", "subjectKind", "scopeId"] {
        if let Some(v) = params.get(k) {
            terms.insert(k.to_string(), v.clone());
        }
    }
    let filter = Filter::parse(&ATTENDANCE, Some(&Value::Object(terms)))?;
    let listing = state.repo(&ATTENDANCE, params).list(&filter);

    let mut by_subject: BTreeMap<String, Vec<AttendanceRecord>> = BTreeMap::new();
    for r in entities::typed::<AttendanceRecord>(&listing.items) {
        by_subject.entry(r.subject_id.clone()).or_default().push(r);
    }
    let subjects: Vec<Value> = by_subject
        .iter()
        .map(|(subject_id, recs)| {
            json!({
                "subjectId": subject_id,
                "percentage": metrics::attendance_percentage(recs),
                "overall": metrics::attendance_counts(recs),
                "month": metrics::monthly_attendance(recs, subject_id, today),
            })
        })
        .collect();
    Ok(json!({
        "source": listing.source,
        "discarded": listing.discarded,
        "today": today.format("%Y-%m-%d").to_string(),
        "subjects": subjects,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "attendance.list" => records::list(state, &ATTENDANCE, &req.params),
        "attendance.mark" => attendance_mark(state, &req.params),
        "attendance.bulkMark" => attendance_bulk_mark(state, &req.params),
        "attendance.summary" => attendance_summary(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
