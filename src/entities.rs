//! Per-entity configuration of the reconciling repository, plus the typed
//! views the metric functions consume.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canon::{self, field, Choice, FieldKind, FieldSpec};
use crate::error::FacadeError;
use crate::metrics;

pub struct EntitySpec {
    /// Cache namespace and IPC name.
    pub name: &'static str,
    /// Remote collection path, relative to the base URL.
    pub path: &'static str,
    pub fields: &'static [FieldSpec],
    /// Canonical fields forming the cache key.
    pub key: &'static [&'static str],
    /// Server-assigned identifier, when the entity has one.
    pub id_field: Option<&'static str>,
    /// Field whose absence means "applies to all".
    pub scope_field: Option<&'static str>,
    /// Field that may hold a local file path to upload.
    pub attachment_field: Option<&'static str>,
    pub finish: fn(&mut Map<String, Value>),
    /// `(derived, source)` pairs: a patch that sets `source` without
    /// `derived` drops the cached `derived` value so `finish` recomputes it.
    pub derived: &'static [(&'static str, &'static str)],
    pub validate: fn(&Map<String, Value>) -> Result<(), FacadeError>,
}

impl EntitySpec {
    pub fn canonicalize(&self, raw: &Value) -> Value {
        let mut m = canon::canonicalize(self.fields, raw);
        (self.finish)(&mut m);
        Value::Object(m)
    }

    pub fn cache_key(&self) -> String {
        format!("cache:{}", self.name)
    }

    /// Composite key of a canonical record; `None` when a key field is missing.
    pub fn key_of(&self, record: &Value) -> Option<String> {
        let mut parts = Vec::with_capacity(self.key.len());
        for k in self.key {
            let part = match record.get(*k)? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            parts.push(part);
        }
        Some(parts.join("|"))
    }

    pub fn id_of<'r>(&self, record: &'r Value) -> Option<&'r str> {
        record.get(self.id_field?)?.as_str()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        canon::find_field(self.fields, name)
    }
}

fn no_finish(_: &mut Map<String, Value>) {}

fn require(m: &Map<String, Value>, name: &str) -> Result<(), FacadeError> {
    if m.contains_key(name) {
        Ok(())
    } else {
        Err(FacadeError::invalid_field(name, format!("{} is required", name)))
    }
}

fn num(m: &Map<String, Value>, name: &str) -> f64 {
    canon::to_number(m.get(name))
}

fn non_negative(m: &Map<String, Value>, name: &str) -> Result<(), FacadeError> {
    if num(m, name) < 0.0 {
        return Err(FacadeError::invalid_field(
            name,
            format!("{} must not be negative", name),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------- attendance

const SUBJECT_KINDS: &[Choice] = &[
    Choice {
        canonical: "student",
        aliases: &["students", "s"],
    },
    Choice {
        canonical: "teacher",
        aliases: &["teachers", "staff", "t"],
    },
];

const ATTENDANCE_STATUSES: &[Choice] = &[
    Choice {
        canonical: "Present",
        aliases: &["p", "1", "true"],
    },
    Choice {
        canonical: "Absent",
        aliases: &["a", "0", "false"],
    },
    Choice {
        canonical: "Leave",
        aliases: &["l", "on leave", "on_leave", "excused"],
    },
];

const ATTENDANCE_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "attendance_id"], FieldKind::Text),
    field(
        "subjectId",
        &[
            "subject_id",
            "subjectId",
            "student_id",
            "studentId",
            "teacher_id",
            "teacherId",
            "student.id",
        ],
        FieldKind::Text,
    ),
    field(
        "subjectKind",
        &["subject_type", "subjectKind", "kind"],
        FieldKind::Choice(SUBJECT_KINDS),
    ),
    field("date", &["date", "attendance_date", "day"], FieldKind::Date),
    field(
        "status",
        &["status", "attendance_status", "value"],
        FieldKind::Choice(ATTENDANCE_STATUSES),
    ),
    field(
        "scopeId",
        &["class_id", "scopeId", "classId", "class", "room"],
        FieldKind::Text,
    ),
];

fn finish_attendance(m: &mut Map<String, Value>) {
    m.entry("subjectKind")
        .or_insert_with(|| Value::String("student".to_string()));
}

fn validate_attendance(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "subjectId")?;
    require(m, "date")?;
    if !m.contains_key("status") {
        return Err(FacadeError::invalid_field(
            "status",
            "status must be Present, Absent or Leave",
        ));
    }
    Ok(())
}

pub static ATTENDANCE: EntitySpec = EntitySpec {
    name: "attendance",
    path: "attendance",
    fields: ATTENDANCE_FIELDS,
    key: &["subjectId", "date"],
    id_field: None,
    scope_field: None,
    attachment_field: None,
    finish: finish_attendance,
    derived: &[],
    validate: validate_attendance,
};

// ---------------------------------------------------------------------- fees

const FEE_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "fee_id"], FieldKind::Text),
    field(
        "studentId",
        &["student_id", "studentId", "student.id"],
        FieldKind::Text,
    ),
    field("term", &["term", "term_name", "termName"], FieldKind::Text),
    field(
        "totalAmount",
        &["total_amount", "totalAmount", "amount", "total", "totalFee"],
        FieldKind::Number,
    ),
    field(
        "paidAmount",
        &["paid_amount", "paidAmount", "paid", "amountPaid"],
        FieldKind::Number,
    ),
    field("dueDate", &["due_date", "dueDate"], FieldKind::Date),
];

/// Status is never taken from the source; it is derived from the amounts.
fn finish_fee(m: &mut Map<String, Value>) {
    let status = metrics::fee_status(num(m, "totalAmount"), num(m, "paidAmount"));
    m.insert("status".to_string(), Value::String(status.as_str().to_string()));
}

fn validate_fee(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "studentId")?;
    non_negative(m, "totalAmount")?;
    non_negative(m, "paidAmount")?;
    Ok(())
}

pub static FEES: EntitySpec = EntitySpec {
    name: "fees",
    path: "fees",
    fields: FEE_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: None,
    finish: finish_fee,
    derived: &[],
    validate: validate_fee,
};

// ------------------------------------------------------------------- library

const BOOK_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "book_id"], FieldKind::Text),
    field("title", &["title", "book_title", "name"], FieldKind::Text),
    field("author", &["author", "author_name"], FieldKind::Text),
    field("isbn", &["isbn", "ISBN"], FieldKind::Text),
    field(
        "quantity",
        &["quantity", "total_copies", "totalCopies", "copies", "qty"],
        FieldKind::Number,
    ),
];

fn validate_book(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "title")?;
    non_negative(m, "quantity")
}

pub static BOOKS: EntitySpec = EntitySpec {
    name: "books",
    path: "books",
    fields: BOOK_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: None,
    finish: no_finish,
    derived: &[],
    validate: validate_book,
};

const ISSUED_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "issue_id"], FieldKind::Text),
    field("bookId", &["book_id", "bookId", "book.id"], FieldKind::Text),
    field(
        "studentId",
        &["student_id", "studentId", "student.id"],
        FieldKind::Text,
    ),
    field(
        "issueDate",
        &["issue_date", "issueDate", "issuedOn"],
        FieldKind::Date,
    ),
    field("dueDate", &["due_date", "dueDate", "returnBy"], FieldKind::Date),
    field(
        "returnDate",
        &["return_date", "returnDate", "returnedOn"],
        FieldKind::Date,
    ),
    field(
        "isReturned",
        &["is_returned", "isReturned", "returned"],
        FieldKind::Bool,
    ),
];

/// A return date implies the copy is back on the shelf.
fn finish_issued(m: &mut Map<String, Value>) {
    if m.contains_key("returnDate") {
        m.insert("isReturned".to_string(), Value::Bool(true));
    }
}

fn validate_issued(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "bookId")?;
    require(m, "studentId")?;
    require(m, "issueDate")?;
    require(m, "dueDate")?;
    let issued = m.get("issueDate").and_then(|v| v.as_str());
    let due = m.get("dueDate").and_then(|v| v.as_str());
    // Canonical dates are ISO, so string order is date order.
    if let (Some(i), Some(d)) = (issued, due) {
        if d < i {
            return Err(FacadeError::invalid_field(
                "dueDate",
                "due date is before issue date",
            ));
        }
    }
    Ok(())
}

pub static ISSUED_BOOKS: EntitySpec = EntitySpec {
    name: "issuedBooks",
    path: "issued-books",
    fields: ISSUED_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: None,
    finish: finish_issued,
    derived: &[],
    validate: validate_issued,
};

// ------------------------------------------------------------------- notices

const AUDIENCES: &[Choice] = &[
    Choice {
        canonical: "students",
        aliases: &["student"],
    },
    Choice {
        canonical: "teachers",
        aliases: &["teacher", "staff"],
    },
];

const NOTICE_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "notice_id"], FieldKind::Text),
    field(
        "audience",
        &["audience", "notice_for", "target", "type"],
        FieldKind::Choice(AUDIENCES),
    ),
    field("title", &["title", "subject", "heading"], FieldKind::Text),
    field(
        "description",
        &["description", "body", "message", "content"],
        FieldKind::Text,
    ),
    field(
        "classScope",
        &["class_id", "classScope", "classId", "class"],
        FieldKind::Text,
    ),
    field(
        "applicableDate",
        &["applicable_date", "applicableDate", "date"],
        FieldKind::Date,
    ),
    field(
        "recipients",
        &["recipients", "recipient_ids", "recipientIds"],
        FieldKind::TextList,
    ),
];

fn validate_notice(m: &Map<String, Value>) -> Result<(), FacadeError> {
    if !m.contains_key("audience") {
        return Err(FacadeError::invalid_field(
            "audience",
            "audience must be students or teachers",
        ));
    }
    require(m, "title")
}

pub static NOTICES: EntitySpec = EntitySpec {
    name: "notices",
    path: "notices",
    fields: NOTICE_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: Some("classScope"),
    attachment_field: None,
    finish: no_finish,
    derived: &[],
    validate: validate_notice,
};

// ------------------------------------------------------------------ homework

const HOMEWORK_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "homework_id"], FieldKind::Text),
    field("title", &["title", "subject"], FieldKind::Text),
    field(
        "text",
        &["text", "description", "body", "message"],
        FieldKind::Text,
    ),
    field(
        "attachment",
        &["attachment", "attachment_url", "file", "fileUrl"],
        FieldKind::Text,
    ),
    field(
        "timestamp",
        &["timestamp", "created_at", "createdAt"],
        FieldKind::Text,
    ),
    field(
        "classScope",
        &["class_id", "classScope", "classId"],
        FieldKind::Text,
    ),
    field(
        "recipients",
        &["recipients", "student_ids", "studentIds"],
        FieldKind::TextList,
    ),
    field(
        "allRecipients",
        &["all_recipients", "allRecipients", "sendToAll", "all"],
        FieldKind::Bool,
    ),
];

/// Broadcast and targeted delivery are one concept: keep exactly one
/// representation. An empty or missing list means broadcast.
fn finish_homework(m: &mut Map<String, Value>) {
    let all = m
        .get("allRecipients")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let has_list = m
        .get("recipients")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if all || !has_list {
        m.remove("recipients");
        m.insert("allRecipients".to_string(), Value::Bool(true));
    } else {
        m.insert("allRecipients".to_string(), Value::Bool(false));
    }
}

fn validate_homework(m: &Map<String, Value>) -> Result<(), FacadeError> {
    if ["title", "text", "attachment"]
        .iter()
        .any(|k| m.contains_key(*k))
    {
        Ok(())
    } else {
        Err(FacadeError::validation(
            "homework needs a title, text or attachment",
        ))
    }
}

pub static HOMEWORK: EntitySpec = EntitySpec {
    name: "homework",
    path: "homework",
    fields: HOMEWORK_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: Some("classScope"),
    attachment_field: Some("attachment"),
    finish: finish_homework,
    derived: &[("allRecipients", "recipients")],
    validate: validate_homework,
};

// -------------------------------------------------------------- people/classes

const STUDENT_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "student_id", "studentId"], FieldKind::Text),
    field(
        "name",
        &["name", "student_name", "full_name", "user.username"],
        FieldKind::Text,
    ),
    field(
        "enrollmentNo",
        &["enrollment_no", "enrollmentNo", "admissionNo", "admission_no"],
        FieldKind::Text,
    ),
    field(
        "classId",
        &["class_id", "classId", "class.id", "class"],
        FieldKind::Text,
    ),
    field(
        "guardianName",
        &["guardian_name", "guardianName", "parent_name"],
        FieldKind::Text,
    ),
    field("phone", &["phone", "mobile", "contact"], FieldKind::Text),
    field("email", &["email", "user.email"], FieldKind::Text),
    field(
        "profilePicture",
        &["profile_picture", "profilePicture", "photo"],
        FieldKind::Text,
    ),
];

fn validate_named(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "name")
}

pub static STUDENTS: EntitySpec = EntitySpec {
    name: "students",
    path: "students",
    fields: STUDENT_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: Some("profilePicture"),
    finish: no_finish,
    derived: &[],
    validate: validate_named,
};

const TEACHER_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "teacher_id", "teacherId"], FieldKind::Text),
    field(
        "name",
        &["name", "teacher_name", "full_name", "user.username"],
        FieldKind::Text,
    ),
    field("subject", &["subject", "specialization"], FieldKind::Text),
    field("phone", &["phone", "mobile", "contact"], FieldKind::Text),
    field("email", &["email", "user.email"], FieldKind::Text),
    field(
        "profilePicture",
        &["profile_picture", "profilePicture", "photo"],
        FieldKind::Text,
    ),
];

pub static TEACHERS: EntitySpec = EntitySpec {
    name: "teachers",
    path: "teachers",
    fields: TEACHER_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: Some("profilePicture"),
    finish: no_finish,
    derived: &[],
    validate: validate_named,
};

const CLASS_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "class_id", "classId"], FieldKind::Text),
    field("name", &["name", "class_name", "className"], FieldKind::Text),
    field("section", &["section", "division"], FieldKind::Text),
    field(
        "classTeacherId",
        &["class_teacher_id", "classTeacherId", "class_teacher", "teacher_id"],
        FieldKind::Text,
    ),
    field(
        "timetable",
        &["timetable", "timetable_file", "timetableFile"],
        FieldKind::Text,
    ),
];

pub static CLASSES: EntitySpec = EntitySpec {
    name: "classes",
    path: "classes",
    fields: CLASS_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: Some("timetable"),
    finish: no_finish,
    derived: &[],
    validate: validate_named,
};

// --------------------------------------------------------------------- exams

const EXAM_RESULT_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "result_id"], FieldKind::Text),
    field("examId", &["exam_id", "examId", "exam.id", "exam"], FieldKind::Text),
    field(
        "studentId",
        &["student_id", "studentId", "student.id"],
        FieldKind::Text,
    ),
    field("subject", &["subject", "subject_name"], FieldKind::Text),
    field(
        "marksObtained",
        &["marks_obtained", "marksObtained", "marks", "score"],
        FieldKind::Number,
    ),
    field(
        "maxMarks",
        &["max_marks", "maxMarks", "total_marks", "outOf"],
        FieldKind::Number,
    ),
];

fn validate_exam_result(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "examId")?;
    require(m, "studentId")?;
    require(m, "subject")?;
    let max = num(m, "maxMarks");
    if max <= 0.0 {
        return Err(FacadeError::invalid_field("maxMarks", "maxMarks must be positive"));
    }
    let got = num(m, "marksObtained");
    if !(0.0..=max).contains(&got) {
        return Err(FacadeError::invalid_field(
            "marksObtained",
            "marksObtained must be between 0 and maxMarks",
        ));
    }
    Ok(())
}

pub static EXAM_RESULTS: EntitySpec = EntitySpec {
    name: "examResults",
    path: "exam-results",
    fields: EXAM_RESULT_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: None,
    finish: no_finish,
    derived: &[],
    validate: validate_exam_result,
};

// ----------------------------------------------------------------- transport

const TRANSPORT_FIELDS: &[FieldSpec] = &[
    field("id", &["id", "_id", "route_id"], FieldKind::Text),
    field(
        "routeName",
        &["route_name", "routeName", "name", "route"],
        FieldKind::Text,
    ),
    field(
        "vehicleNo",
        &["vehicle_no", "vehicleNo", "vehicle_number", "bus_no"],
        FieldKind::Text,
    ),
    field(
        "driverName",
        &["driver_name", "driverName", "driver"],
        FieldKind::Text,
    ),
    field(
        "driverPhone",
        &["driver_phone", "driverPhone"],
        FieldKind::Text,
    ),
    field("stops", &["stops", "stop_names"], FieldKind::TextList),
];

fn validate_route(m: &Map<String, Value>) -> Result<(), FacadeError> {
    require(m, "routeName")
}

pub static TRANSPORT_ROUTES: EntitySpec = EntitySpec {
    name: "transport",
    path: "transport-routes",
    fields: TRANSPORT_FIELDS,
    key: &["id"],
    id_field: Some("id"),
    scope_field: None,
    attachment_field: None,
    finish: no_finish,
    derived: &[],
    validate: validate_route,
};

pub static ALL: &[&EntitySpec] = &[
    &ATTENDANCE,
    &FEES,
    &BOOKS,
    &ISSUED_BOOKS,
    &NOTICES,
    &HOMEWORK,
    &STUDENTS,
    &TEACHERS,
    &CLASSES,
    &EXAM_RESULTS,
    &TRANSPORT_ROUTES,
];

pub fn by_name(name: &str) -> Option<&'static EntitySpec> {
    ALL.iter().copied().find(|s| s.name == name)
}

// --------------------------------------------------------------- typed views

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Student,
    Teacher,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub subject_id: String,
    pub subject_kind: SubjectKind,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub scope_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeStatus {
    Paid,
    PartiallyPaid,
    Pending,
}

impl FeeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeeStatus::Paid => "Paid",
            FeeStatus::PartiallyPaid => "PartiallyPaid",
            FeeStatus::Pending => "Pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub student_id: String,
    #[serde(default)]
    pub term: Option<String>,
    pub total_amount: f64,
    pub paid_amount: f64,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub status: FeeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedBookRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub book_id: String,
    pub student_id: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    pub is_returned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Students,
    Teachers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    #[serde(default)]
    pub id: Option<String>,
    pub audience: Audience,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub class_scope: Option<String>,
    #[serde(default)]
    pub applicable_date: Option<NaiveDate>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeworkItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub class_scope: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub all_recipients: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamResult {
    #[serde(default)]
    pub id: Option<String>,
    pub exam_id: String,
    pub student_id: String,
    pub subject: String,
    pub marks_obtained: f64,
    pub max_marks: f64,
}

/// Typed view over canonical records. Records that do not fit the type
/// (e.g. an attendance row with an unknown status) are skipped.
pub fn typed<T: DeserializeOwned>(items: &[Value]) -> Vec<T> {
    items
        .iter()
        .filter_map(|v| match serde_json::from_value::<T>(v.clone()) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::debug!(error = %e, "skipping record that does not fit its type");
                None
            }
        })
        .collect()
}
