use crate::entities::{self, FeeRecord, FEES};
use crate::ipc::helpers::{get_optional_str, respond, today, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use crate::repo::Filter;
use serde_json::{json, Value};

fn fees_summary(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let today = today(params)?;
    let filter = match get_optional_str(params, "studentId") {
        Some(student) => Filter::eq("studentId", student),
        None => Filter::default(),
    };
    let listing = state.repo(&FEES, params).list(&filter);
    let fees = entities::typed::<FeeRecord>(&listing.items);
    Ok(json!({
        "source": listing.source,
        "discarded": listing.discarded,
        "totals": metrics::fee_totals(&fees),
        "overdue": metrics::overdue_fees(&fees, today),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "fees.summary" => Some(respond(&req.id, fees_summary(state, &req.params))),
        _ => None,
    }
}
