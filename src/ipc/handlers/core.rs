use crate::config::{self, Config};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, respond, to_json, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::store::{KeyValueStore, SqliteStore};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "remote": state.remote.endpoint(),
            "durableCache": state.store().is_durable(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            // Settings saved by remote.configure sit above the environment layer.
            // A broken settings row must not prevent the workspace from opening.
            let mut cfg = Config::from_env();
            match db::settings_get_json(&conn, config::SETTINGS_KEY) {
                Ok(Some(saved)) => cfg = cfg.with_patch(&saved),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "ignoring unreadable remote settings"),
            }
            tracing::info!(workspace = %path.display(), remote = ?cfg.base_url, "workspace selected");

            state.apply_config(cfg);
            state.db = Some(SqliteStore::new(conn));
            state.workspace = Some(path.clone());
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "remote": state.config.redacted(),
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn remote_configure(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !params.is_object() {
        return Err(HandlerErr::bad_params("params must be an object"));
    }
    let cfg = state.config.clone().with_patch(params);
    let mut persisted = false;
    if let Some(store) = state.db.as_ref() {
        let saved = to_json(&cfg)?;
        db::settings_set_json(store.conn(), config::SETTINGS_KEY, &saved).map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
        persisted = true;
    }
    tracing::info!(remote = ?cfg.base_url, timeout_ms = cfg.timeout_ms, "remote configured");
    state.apply_config(cfg);
    Ok(json!({
        "remote": state.config.redacted(),
        "persisted": persisted,
    }))
}

fn remote_status(state: &AppState) -> serde_json::Value {
    let pending: usize = crate::entities::ALL
        .iter()
        .copied()
        .map(|spec| state.repo(spec, &serde_json::Value::Null).pending().len())
        .sum();
    json!({
        "remote": state.config.redacted(),
        "configured": state.remote.endpoint().is_some(),
        "pendingCount": pending,
        "cachedCollections": state.store().keys_with_prefix("cache:"),
    })
}

fn view_open(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let view = get_required_str(params, "view")?;
    let generation = state.views.open(&view);
    tracing::debug!(view = %view, generation, "view opened");
    Ok(json!({ "view": view, "generation": generation }))
}

fn view_close(
    state: &mut AppState,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let view = get_required_str(params, "view")?;
    let closed = state.views.close(&view);
    Ok(json!({ "view": view, "closed": closed, "openViews": state.views.open_views() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "remote.configure" => Some(respond(&req.id, remote_configure(state, &req.params))),
        "remote.status" => Some(ok(&req.id, remote_status(state))),
        "view.open" => Some(respond(&req.id, view_open(state, &req.params))),
        "view.close" => Some(respond(&req.id, view_close(state, &req.params))),
        _ => None,
    }
}
