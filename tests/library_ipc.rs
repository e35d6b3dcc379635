use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .env_remove("SCHOOLD_API_BASE_URL")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn issue_respects_available_copies_offline() {
    // No workspace and no endpoint: memory cache, every remote call falls back.
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "books.upsert",
        json!({ "record": { "id": "b1", "book_title": "World Atlas", "total_copies": 1 } }),
    );

    let issued = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "library.issue",
        json!({ "bookId": "b1", "studentId": "s1", "today": "2024-03-01" }),
    );
    assert_eq!(issued["record"]["issueDate"], json!("2024-03-01"));
    assert_eq!(issued["record"]["dueDate"], json!("2024-03-15"));
    assert_eq!(issued["availableAfter"], json!(0));
    let issue_id = issued["record"]["id"].as_str().expect("issue id").to_string();

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "library.issue",
        json!({ "bookId": "b1", "studentId": "s2", "today": "2024-03-02" }),
    );
    assert_eq!(refused["ok"], json!(false));
    assert_eq!(refused["error"]["code"], json!("validation"));
    assert_eq!(refused["error"]["details"]["field"], json!("bookId"));

    let availability = request_ok(&mut stdin, &mut reader, "4", "library.availability", json!({}));
    assert_eq!(availability["items"][0]["available"], json!(0));
    assert_eq!(availability["items"][0]["issued"], json!(1));
    assert_eq!(availability["sources"]["books"], json!("local"));

    let loans = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "library.issued",
        json!({ "today": "2024-04-01" }),
    );
    assert_eq!(loans["overdue"][0]["daysOverdue"], json!(17));

    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "library.return",
        json!({ "id": issue_id, "returnDate": "2024-03-10" }),
    );
    assert_eq!(returned["record"]["id"], json!(issue_id));
    assert_eq!(returned["record"]["isReturned"], json!(true));
    assert_eq!(returned["record"]["returnDate"], json!("2024-03-10"));
    assert_eq!(returned["record"]["bookId"], json!("b1"));
    assert_eq!(returned["record"]["studentId"], json!("s1"));
    assert_eq!(returned["record"]["dueDate"], json!("2024-03-15"));

    let restocked = request_ok(
        &mut stdin,
        &mut reader,
        "6b",
        "library.availability",
        json!({ "bookId": "b1" }),
    );
    assert_eq!(restocked["items"][0]["available"], json!(1));
    assert_eq!(restocked["items"][0]["issued"], json!(0));

    let reissued = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "library.issue",
        json!({ "bookId": "b1", "studentId": "s2", "today": "2024-03-11", "loanDays": 7 }),
    );
    assert_eq!(reissued["record"]["dueDate"], json!("2024-03-18"));
    assert_eq!(reissued["availableAfter"], json!(0));

    let unknown = request(
        &mut stdin,
        &mut reader,
        "8",
        "library.issue",
        json!({ "bookId": "nope", "studentId": "s2" }),
    );
    assert_eq!(unknown["error"]["code"], json!("validation"));

    let missing = request(&mut stdin, &mut reader, "9", "library.issue", json!({ "bookId": "b1" }));
    assert_eq!(missing["error"]["code"], json!("bad_params"));
}
