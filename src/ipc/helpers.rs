use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};

use crate::canon;
use crate::entities::EntitySpec;
use crate::error::FacadeError;
use crate::ipc::error::{err, ok};
use crate::repo::Filter;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<FacadeError> for HandlerErr {
    fn from(e: FacadeError) -> Self {
        let details = match &e {
            FacadeError::Validation {
                field: Some(field), ..
            } => Some(json!({ "field": field })),
            _ => None,
        };
        let message = match &e {
            FacadeError::Validation { message, .. } => message.clone(),
            other => other.to_string(),
        };
        HandlerErr {
            code: e.code(),
            message,
            details,
        }
    }
}

pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Value, HandlerErr> {
    serde_json::to_value(value).map_err(|e| HandlerErr {
        code: "serialization",
        message: e.to_string(),
        details: None,
    })
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    get_optional_str(params, key).ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn get_object<'p>(params: &'p Value, key: &str) -> Result<&'p Value, HandlerErr> {
    match params.get(key) {
        Some(v @ Value::Object(_)) => Ok(v),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an object", key))),
        None => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

/// `params.today` when given (any accepted date spelling), else the local date.
pub fn today(params: &Value) -> Result<NaiveDate, HandlerErr> {
    match params.get("today") {
        None | Some(Value::Null) => Ok(chrono::Local::now().date_naive()),
        Some(v) => parse_day(v, "today"),
    }
}

pub fn parse_day(v: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    canon::parse_date(v)
        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a date", key)))
}

pub fn filter(spec: &EntitySpec, params: &Value) -> Result<Filter, HandlerErr> {
    Ok(Filter::parse(spec, params.get("filter"))?)
}
