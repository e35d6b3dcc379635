//! `<entity>.list|upsert|remove` for every entity without bespoke verbs.

use crate::entities::{
    EntitySpec, BOOKS, CLASSES, EXAM_RESULTS, FEES, HOMEWORK, NOTICES, STUDENTS, TEACHERS,
    TRANSPORT_ROUTES,
};
use crate::ipc::helpers::{filter, get_object, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::Value;

static PLAIN: &[&EntitySpec] = &[
    &FEES,
    &BOOKS,
    &NOTICES,
    &HOMEWORK,
    &STUDENTS,
    &TEACHERS,
    &CLASSES,
    &EXAM_RESULTS,
    &TRANSPORT_ROUTES,
];

pub fn list(
    state: &AppState,
    spec: &'static EntitySpec,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let filter = filter(spec, params)?;
    to_json(&state.repo(spec, params).list(&filter))
}

pub fn upsert(
    state: &AppState,
    spec: &'static EntitySpec,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let record = get_object(params, "record")?;
    let saved = state.repo(spec, params).upsert(record)?;
    to_json(&saved)
}

/// `params.key` holds the key fields (`id`, or the composite fields).
pub fn remove(
    state: &AppState,
    spec: &'static EntitySpec,
    params: &Value,
) -> Result<Value, HandlerErr> {
    let key = get_object(params, "key")?;
    let removed = state.repo(spec, params).remove(key)?;
    to_json(&removed)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let (entity, verb) = req.method.split_once('.')?;
    let spec = PLAIN.iter().copied().find(|s| s.name == entity)?;
    let result = match verb {
        "list" => list(state, spec, &req.params),
        "upsert" => upsert(state, spec, &req.params),
        "remove" => remove(state, spec, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
