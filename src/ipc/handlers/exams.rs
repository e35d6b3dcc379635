use crate::entities::{self, ExamResult, EXAM_RESULTS};
use crate::ipc::helpers::{get_optional_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use crate::repo::Filter;
use serde_json::{json, Value};

fn exams_summary(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let filter = match get_optional_str(params, "examId") {
        Some(exam) => Filter::eq("examId", exam),
        None => Filter::default(),
    };
    let listing = state.repo(&EXAM_RESULTS, params).list(&filter);
    let results = entities::typed::<ExamResult>(&listing.items);
    Ok(json!({
        "students": metrics::exam_summary(&results),
        "source": listing.source,
        "discarded": listing.discarded,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "exams.summary" => Some(respond(&req.id, exams_summary(state, &req.params))),
        _ => None,
    }
}
