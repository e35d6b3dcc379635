use crate::entities::{self, Audience, HomeworkItem, Notice, HOMEWORK, NOTICES};
use crate::error::FacadeError;
use crate::ipc::helpers::{get_optional_str, get_required_str, respond, today, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use crate::repo::Filter;
use serde_json::{json, Value};

fn audience_param(params: &Value) -> Result<Option<Audience>, HandlerErr> {
    let Some(raw) = params.get("audience").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let canonical = NOTICES
        .field("audience")
        .and_then(|f| f.coerce(Some(raw)))
        .and_then(|v| serde_json::from_value::<Audience>(v).ok());
    match canonical {
        Some(a) => Ok(Some(a)),
        None => Err(
            FacadeError::invalid_field("audience", "audience must be students or teachers").into(),
        ),
    }
}

/// Scope is checked locally: a class-less notice applies everywhere, which a
/// remote `class_id` query would not return.
fn notices_for_class(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let today = today(params)?;
    let audience = audience_param(params)?;
    let class_id = get_optional_str(params, "classId");
    let listing = state.repo(&NOTICES, params).list(&Filter::default());
    let items: Vec<Notice> = entities::typed::<Notice>(&listing.items)
        .into_iter()
        .filter(|n| metrics::notice_applies(n, audience, class_id.as_deref(), today))
        .collect();
    Ok(json!({
        "items": items,
        "source": listing.source,
        "discarded": listing.discarded,
    }))
}

fn homework_for_student(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let class_id = get_optional_str(params, "classId");
    let listing = state.repo(&HOMEWORK, params).list(&Filter::default());
    let items: Vec<HomeworkItem> = entities::typed::<HomeworkItem>(&listing.items)
        .into_iter()
        .filter(|h| metrics::homework_visible_to(h, &student_id, class_id.as_deref()))
        .collect();
    Ok(json!({
        "items": items,
        "source": listing.source,
        "discarded": listing.discarded,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "notices.forClass" => notices_for_class(state, &req.params),
        "homework.forStudent" => homework_for_student(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
