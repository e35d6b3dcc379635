use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::entities::{
    Audience, AttendanceRecord, AttendanceStatus, Book, ExamResult, FeeRecord, FeeStatus,
    HomeworkItem, IssuedBookRecord, Notice,
};

/// Half-up rounding to an integer (`Math.round` semantics for non-negative values).
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// 1-decimal rounding: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub present: usize,
    pub absent: usize,
    pub leave: usize,
    pub percentage: u32,
}

pub fn attendance_counts<'a, I>(records: I) -> AttendanceCounts
where
    I: IntoIterator<Item = &'a AttendanceRecord>,
{
    let mut out = AttendanceCounts::default();
    for r in records {
        match r.status {
            AttendanceStatus::Present => out.present += 1,
            AttendanceStatus::Absent => out.absent += 1,
            AttendanceStatus::Leave => out.leave += 1,
        }
    }
    let countable = out.present + out.absent;
    out.percentage = if countable == 0 {
        0
    } else {
        round_half_up(100.0 * out.present as f64 / countable as f64) as u32
    };
    out
}

/// Leave days are excluded from both numerator and denominator; 0 when
/// nothing is countable.
pub fn attendance_percentage(records: &[AttendanceRecord]) -> u32 {
    attendance_counts(records).percentage
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyAttendance {
    pub subject_id: String,
    pub month: String,
    #[serde(flatten)]
    pub counts: AttendanceCounts,
}

/// The subject's attendance in `today`'s month, up to and including `today`.
pub fn monthly_attendance(
    records: &[AttendanceRecord],
    subject_id: &str,
    today: NaiveDate,
) -> MonthlyAttendance {
    let in_month = records.iter().filter(|r| {
        r.subject_id == subject_id
            && r.date.year() == today.year()
            && r.date.month() == today.month()
            && r.date <= today
    });
    MonthlyAttendance {
        subject_id: subject_id.to_string(),
        month: today.format("%Y-%m").to_string(),
        counts: attendance_counts(in_month),
    }
}

pub fn fee_status(total: f64, paid: f64) -> FeeStatus {
    if paid >= total {
        FeeStatus::Paid
    } else if paid <= 0.0 {
        FeeStatus::Pending
    } else {
        FeeStatus::PartiallyPaid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTotals {
    pub total: f64,
    pub paid: f64,
    pub pending: f64,
    pub status: FeeStatus,
    pub record_count: usize,
}

/// Overpayment on one record never offsets another record's balance.
fn totals_status(pending: f64, paid: f64) -> FeeStatus {
    if pending <= 0.0 {
        FeeStatus::Paid
    } else if paid <= 0.0 {
        FeeStatus::Pending
    } else {
        FeeStatus::PartiallyPaid
    }
}

pub fn fee_totals(records: &[FeeRecord]) -> FeeTotals {
    let mut total = 0.0;
    let mut paid = 0.0;
    let mut pending = 0.0;
    for r in records {
        total += r.total_amount;
        paid += r.paid_amount;
        pending += (r.total_amount - r.paid_amount).max(0.0);
    }
    FeeTotals {
        total,
        paid,
        pending,
        status: totals_status(pending, paid),
        record_count: records.len(),
    }
}

/// Unpaid records whose due date is strictly before `today`.
pub fn overdue_fees(records: &[FeeRecord], today: NaiveDate) -> Vec<&FeeRecord> {
    records
        .iter()
        .filter(|r| r.status != FeeStatus::Paid)
        .filter(|r| r.due_date.map(|d| d < today).unwrap_or(false))
        .collect()
}

pub fn unreturned_count(book_id: &str, issued: &[IssuedBookRecord]) -> usize {
    issued
        .iter()
        .filter(|r| r.book_id == book_id && !r.is_returned)
        .count()
}

/// Never negative, even when more copies are out than the book's quantity.
pub fn available_copies(book: &Book, issued: &[IssuedBookRecord]) -> u64 {
    let quantity = book.quantity.max(0.0).floor() as u64;
    quantity.saturating_sub(unreturned_count(&book.id, issued) as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookAvailability {
    pub book_id: String,
    pub title: String,
    pub quantity: f64,
    pub issued: usize,
    pub available: u64,
}

pub fn availability(books: &[Book], issued: &[IssuedBookRecord]) -> Vec<BookAvailability> {
    books
        .iter()
        .map(|b| BookAvailability {
            book_id: b.id.clone(),
            title: b.title.clone(),
            quantity: b.quantity,
            issued: unreturned_count(&b.id, issued),
            available: available_copies(b, issued),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueIssue {
    pub id: Option<String>,
    pub book_id: String,
    pub student_id: String,
    pub due_date: NaiveDate,
    pub days_overdue: i64,
}

pub fn overdue_issues(issued: &[IssuedBookRecord], today: NaiveDate) -> Vec<OverdueIssue> {
    issued
        .iter()
        .filter(|r| !r.is_returned && r.due_date < today)
        .map(|r| OverdueIssue {
            id: r.id.clone(),
            book_id: r.book_id.clone(),
            student_id: r.student_id.clone(),
            due_date: r.due_date,
            days_overdue: (today - r.due_date).num_days(),
        })
        .collect()
}

/// Absent class scope applies to every class. An applicable date means the
/// notice is shown from that day on.
pub fn notice_applies(
    notice: &Notice,
    audience: Option<Audience>,
    class_id: Option<&str>,
    today: NaiveDate,
) -> bool {
    if let Some(a) = audience {
        if notice.audience != a {
            return false;
        }
    }
    if let (Some(scope), Some(class_id)) = (notice.class_scope.as_deref(), class_id) {
        if scope != class_id {
            return false;
        }
    }
    notice.applicable_date.map(|d| d <= today).unwrap_or(true)
}

pub fn homework_visible_to(item: &HomeworkItem, student_id: &str, class_id: Option<&str>) -> bool {
    if item.all_recipients {
        match (item.class_scope.as_deref(), class_id) {
            (Some(scope), Some(class_id)) => scope == class_id,
            _ => true,
        }
    } else {
        item.recipients.iter().any(|r| r == student_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentExamSummary {
    pub student_id: String,
    pub obtained: f64,
    pub max: f64,
    pub percentage: f64,
    pub subjects: usize,
}

/// Per-student totals across subjects, ordered by student id.
pub fn exam_summary(results: &[ExamResult]) -> Vec<StudentExamSummary> {
    let mut by_student: BTreeMap<&str, (f64, f64, usize)> = BTreeMap::new();
    for r in results {
        let e = by_student.entry(r.student_id.as_str()).or_default();
        e.0 += r.marks_obtained;
        e.1 += r.max_marks;
        e.2 += 1;
    }
    by_student
        .into_iter()
        .map(|(student_id, (obtained, max, subjects))| StudentExamSummary {
            student_id: student_id.to_string(),
            obtained,
            max,
            percentage: if max > 0.0 {
                round_off_1_decimal(100.0 * obtained / max)
            } else {
                0.0
            },
            subjects,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SubjectKind;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn att(subject: &str, date: &str, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            subject_id: subject.to_string(),
            subject_kind: SubjectKind::Student,
            date: day(date),
            status,
            scope_id: None,
        }
    }

    fn issued(book: &str, returned: bool) -> IssuedBookRecord {
        IssuedBookRecord {
            id: None,
            book_id: book.to_string(),
            student_id: "s1".to_string(),
            issue_date: day("2024-01-01"),
            due_date: day("2024-01-15"),
            return_date: None,
            is_returned: returned,
        }
    }

    fn fee(total: f64, paid: f64, due: Option<&str>) -> FeeRecord {
        FeeRecord {
            id: None,
            student_id: "s1".to_string(),
            term: None,
            total_amount: total,
            paid_amount: paid,
            due_date: due.map(day),
            status: fee_status(total, paid),
        }
    }

    #[test]
    fn leave_days_are_not_countable() {
        use AttendanceStatus::*;
        let statuses = [
            Present, Present, Present, Present, Present, Absent, Absent, Leave, Leave, Leave,
        ];
        let records: Vec<_> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| att("s1", &format!("2024-05-{:02}", i + 1), *s))
            .collect();
        assert_eq!(attendance_percentage(&records), 71);
    }

    #[test]
    fn attendance_percentage_is_zero_without_countable_days() {
        assert_eq!(attendance_percentage(&[]), 0);
        let only_leave = vec![att("s1", "2024-05-01", AttendanceStatus::Leave)];
        assert_eq!(attendance_percentage(&only_leave), 0);
    }

    #[test]
    fn monthly_attendance_stops_at_today() {
        use AttendanceStatus::*;
        let records = vec![
            att("s1", "2024-04-30", Absent),
            att("s1", "2024-05-02", Present),
            att("s1", "2024-05-03", Absent),
            att("s1", "2024-05-20", Absent),
            att("s2", "2024-05-02", Absent),
        ];
        let m = monthly_attendance(&records, "s1", day("2024-05-10"));
        assert_eq!(m.month, "2024-05");
        assert_eq!(m.counts.present, 1);
        assert_eq!(m.counts.absent, 1);
        assert_eq!(m.counts.percentage, 50);
    }

    #[test]
    fn fee_status_follows_amounts() {
        assert_eq!(fee_status(1000.0, 1000.0), FeeStatus::Paid);
        assert_eq!(fee_status(1000.0, 0.0), FeeStatus::Pending);
        assert_eq!(fee_status(1000.0, 400.0), FeeStatus::PartiallyPaid);
        assert_eq!(fee_status(0.0, 0.0), FeeStatus::Paid);
    }

    #[test]
    fn overpaid_record_does_not_settle_the_total() {
        let t = fee_totals(&[fee(500.0, 900.0, None), fee(500.0, 0.0, None)]);
        assert_eq!(t.paid, 900.0);
        assert_eq!(t.pending, 500.0);
        assert_eq!(t.status, FeeStatus::PartiallyPaid);
        assert_eq!(fee_totals(&[]).status, FeeStatus::Paid);
    }

    #[test]
    fn fee_totals_sum_across_terms() {
        let records = vec![
            fee(1000.0, 1000.0, Some("2024-01-10")),
            fee(1000.0, 400.0, Some("2024-04-10")),
            fee(500.0, 0.0, Some("2024-09-10")),
        ];
        let t = fee_totals(&records);
        assert_eq!(t.total, 2500.0);
        assert_eq!(t.paid, 1400.0);
        assert_eq!(t.pending, 1100.0);
        assert_eq!(t.status, FeeStatus::PartiallyPaid);

        let overdue = overdue_fees(&records, day("2024-05-01"));
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].paid_amount, 400.0);
    }

    #[test]
    fn available_copies_never_negative() {
        let book = Book {
            id: "b1".to_string(),
            title: "Atlas".to_string(),
            author: None,
            isbn: None,
            quantity: 2.0,
        };
        let out = vec![issued("b1", false), issued("b1", false), issued("b1", false)];
        assert_eq!(available_copies(&book, &out), 0);

        let mixed = vec![issued("b1", false), issued("b1", true), issued("b2", false)];
        assert_eq!(available_copies(&book, &mixed), 1);
    }

    #[test]
    fn overdue_issues_count_days() {
        let out = vec![issued("b1", false), issued("b1", true)];
        let o = overdue_issues(&out, day("2024-01-20"));
        assert_eq!(o.len(), 1);
        assert_eq!(o[0].days_overdue, 5);
        assert!(overdue_issues(&out, day("2024-01-15")).is_empty());
    }

    #[test]
    fn notice_scope_absence_is_wildcard() {
        let n = Notice {
            id: None,
            audience: Audience::Students,
            title: "Sports day".to_string(),
            description: None,
            class_scope: None,
            applicable_date: Some(day("2024-03-01")),
            recipients: Vec::new(),
        };
        assert!(notice_applies(&n, Some(Audience::Students), Some("7A"), day("2024-03-01")));
        assert!(!notice_applies(&n, Some(Audience::Teachers), None, day("2024-03-02")));
        assert!(!notice_applies(&n, None, None, day("2024-02-28")));

        let scoped = Notice {
            class_scope: Some("7B".to_string()),
            ..n
        };
        assert!(!notice_applies(&scoped, None, Some("7A"), day("2024-03-05")));
        assert!(notice_applies(&scoped, None, Some("7B"), day("2024-03-05")));
    }

    #[test]
    fn homework_targets() {
        let mut hw = HomeworkItem {
            id: None,
            title: Some("Essay".to_string()),
            text: None,
            attachment: None,
            timestamp: None,
            class_scope: Some("7A".to_string()),
            recipients: Vec::new(),
            all_recipients: true,
        };
        assert!(homework_visible_to(&hw, "s1", Some("7A")));
        assert!(!homework_visible_to(&hw, "s1", Some("7B")));
        hw.all_recipients = false;
        hw.recipients = vec!["s2".to_string()];
        assert!(!homework_visible_to(&hw, "s1", Some("7A")));
        assert!(homework_visible_to(&hw, "s2", None));
    }

    #[test]
    fn exam_summary_rounds_to_one_decimal() {
        let r = |s: &str, got: f64, max: f64| ExamResult {
            id: None,
            exam_id: "mid".to_string(),
            student_id: s.to_string(),
            subject: "x".to_string(),
            marks_obtained: got,
            max_marks: max,
        };
        let out = exam_summary(&[r("s2", 40.0, 50.0), r("s1", 2.0, 3.0), r("s1", 1.0, 3.0)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].student_id, "s1");
        assert_eq!(out[0].percentage, 50.0);
        assert_eq!(out[0].subjects, 2);
        assert_eq!(out[1].percentage, 80.0);
        assert_eq!(round_off_1_decimal(100.0 * 2.0 / 3.0), 66.7);
    }
}
