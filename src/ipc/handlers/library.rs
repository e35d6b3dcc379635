use crate::entities::{self, Book, IssuedBookRecord, BOOKS, ISSUED_BOOKS};
use crate::error::FacadeError;
use crate::ipc::helpers::{
    filter, get_optional_str, get_required_str, parse_day, respond, to_json, today, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::metrics;
use crate::repo::Filter;
use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};

const DEFAULT_LOAN_DAYS: i64 = 14;

fn optional_day(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_day(v, key).map(Some),
    }
}

fn day_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Checks stock against the freshest data available before writing the loan.
fn library_issue(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let book_id = get_required_str(params, "bookId")?;
    let student_id = get_required_str(params, "studentId")?;
    let issue_date = optional_day(params, "issueDate")?.unwrap_or(today(params)?);
    let loan_days = params
        .get("loanDays")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_LOAN_DAYS);
    if loan_days < 0 {
        return Err(HandlerErr::bad_params("loanDays must not be negative"));
    }
    let due_date = match optional_day(params, "dueDate")? {
        Some(d) => d,
        None => issue_date + Duration::days(loan_days),
    };

    let books = state.repo(&BOOKS, params).list(&Filter::default());
    let issued = state
        .repo(&ISSUED_BOOKS, params)
        .list(&Filter::eq("bookId", book_id.clone()));
    if books.discarded || issued.discarded {
        return Ok(json!({ "discarded": true }));
    }
    let Some(book) = entities::typed::<Book>(&books.items)
        .into_iter()
        .find(|b| b.id == book_id)
    else {
        let message = format!("unknown book {}", book_id);
        return Err(FacadeError::invalid_field("bookId", message).into());
    };
    let issued = entities::typed::<IssuedBookRecord>(&issued.items);
    let available = metrics::available_copies(&book, &issued);
    if available == 0 {
        return Err(FacadeError::invalid_field(
            "bookId",
            format!("no copies of {} are available", book.title),
        )
        .into());
    }

    let record = json!({
        "bookId": book_id,
        "studentId": student_id,
        "issueDate": day_str(issue_date),
        "dueDate": day_str(due_date),
        "isReturned": false,
    });
    let saved = state.repo(&ISSUED_BOOKS, params).upsert(&record)?;
    let mut out = to_json(&saved)?;
    out["availableAfter"] = json!(available - 1);
    Ok(out)
}

fn library_return(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "id")?;
    let return_date = match optional_day(params, "returnDate")? {
        Some(d) => d,
        None => today(params)?,
    };
    let saved = state.repo(&ISSUED_BOOKS, params).upsert(&json!({
        "id": id,
        "returnDate": day_str(return_date),
    }))?;
    to_json(&saved)
}

fn library_issued(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let today = today(params)?;
    let filter = filter(&ISSUED_BOOKS, params)?;
    let listing = state.repo(&ISSUED_BOOKS, params).list(&filter);
    let loans = entities::typed::<IssuedBookRecord>(&listing.items);
    let overdue = metrics::overdue_issues(&loans, today);
    let mut out = to_json(&listing)?;
    out["overdue"] = to_json(&overdue)?;
    Ok(out)
}

fn library_availability(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (book_filter, issued_filter) = match get_optional_str(params, "bookId") {
        Some(id) => (Filter::eq("id", id.clone()), Filter::eq("bookId", id)),
        None => (Filter::default(), Filter::default()),
    };
    let books = state.repo(&BOOKS, params).list(&book_filter);
    let issued = state.repo(&ISSUED_BOOKS, params).list(&issued_filter);
    let rows = metrics::availability(
        &entities::typed::<Book>(&books.items),
        &entities::typed::<IssuedBookRecord>(&issued.items),
    );
    Ok(json!({
        "items": rows,
        "sources": { "books": books.source, "issued": issued.source },
        "discarded": books.discarded || issued.discarded,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "library.issue" => library_issue(state, &req.params),
        "library.return" => library_return(state, &req.params),
        "library.issued" => library_issued(state, &req.params),
        "library.availability" => library_availability(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
