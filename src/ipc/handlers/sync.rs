use crate::entities::{self, EntitySpec};
use crate::ipc::helpers::{get_optional_str, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::repo::PushReport;
use serde_json::{json, Map, Value};

fn selected(params: &Value) -> Result<Vec<&'static EntitySpec>, HandlerErr> {
    match get_optional_str(params, "entity") {
        Some(name) => entities::by_name(&name)
            .map(|s| vec![s])
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown entity {}", name))),
        None => Ok(entities::ALL.to_vec()),
    }
}

fn sync_pending(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let mut entries = Vec::new();
    for spec in selected(params)? {
        entries.extend(state.repo(spec, params).pending());
    }
    Ok(json!({
        "count": entries.len(),
        "entries": to_json(&entries)?,
    }))
}

/// Retries unsynced writes. Only ever runs when asked.
fn sync_push(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let mut reports = Map::new();
    let (mut pushed, mut still_pending, mut rejected) = (0usize, 0usize, 0usize);
    for spec in selected(params)? {
        let report = state.repo(spec, params).push_pending();
        if report == PushReport::default() {
            continue;
        }
        pushed += report.pushed.len();
        still_pending += report.still_pending.len();
        rejected += report.rejected.len();
        reports.insert(spec.name.to_string(), to_json(&report)?);
    }
    tracing::info!(pushed, still_pending, rejected, "sync push finished");
    Ok(json!({
        "pushed": pushed,
        "stillPending": still_pending,
        "rejected": rejected,
        "entities": reports,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "sync.pending" => sync_pending(state, &req.params),
        "sync.push" => sync_push(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
