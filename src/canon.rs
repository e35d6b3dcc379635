//! Declarative field-alias tables and the single canonicalization routine.
//!
//! Each canonical field lists its source names in priority order; the first
//! one present in a raw record wins. Names earlier in the list are the
//! remote's; later ones are legacy spellings found in older cached data.
//! Dotted names (`user.username`) reach into nested objects.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed string; empty means absent.
    Text,
    /// Missing or unparsable numbers become 0.
    Number,
    /// Missing means false.
    Bool,
    /// Normalized to `YYYY-MM-DD`; unparsable means absent.
    Date,
    /// Array of strings; a comma-separated string is split.
    TextList,
    /// Closed vocabulary matched case-insensitively against aliases.
    Choice(&'static [Choice]),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: FieldKind,
}

pub const fn field(
    name: &'static str,
    aliases: &'static [&'static str],
    kind: FieldKind,
) -> FieldSpec {
    FieldSpec {
        name,
        aliases,
        kind,
    }
}

impl FieldSpec {
    /// Name used on the wire when talking to the remote (query filters).
    pub fn remote_name(&self) -> &'static str {
        self.aliases.first().copied().unwrap_or(self.name)
    }

    fn sources(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.aliases
            .iter()
            .copied()
            .chain(std::iter::once(self.name))
    }

    pub fn coerce(&self, v: Option<&Value>) -> Option<Value> {
        coerce(self.kind, v)
    }
}

pub fn find_field<'a>(fields: &'a [FieldSpec], name: &str) -> Option<&'a FieldSpec> {
    fields.iter().find(|f| f.name == name)
}

/// Maps a raw record from either source onto the canonical shape. Fields
/// that are absent and have no default are omitted; unknown fields are
/// dropped.
pub fn canonicalize(fields: &[FieldSpec], raw: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for f in fields {
        let found = f.sources().find_map(|path| lookup(raw, path));
        if let Some(v) = f.coerce(found) {
            out.insert(f.name.to_string(), v);
        }
    }
    out
}

/// Like [`canonicalize`], but only emits fields some alias actually
/// supplied. Used to overlay a patch or a terse remote reply onto an
/// existing canonical record without resetting defaults.
pub fn canonicalize_present(fields: &[FieldSpec], raw: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for f in fields {
        let Some(found) = f.sources().find_map(|path| lookup(raw, path)) else {
            continue;
        };
        if let Some(v) = f.coerce(Some(found)) {
            out.insert(f.name.to_string(), v);
        }
    }
    out
}

fn lookup<'v>(raw: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cur = raw;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }
    match cur {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        v => Some(v),
    }
}

pub fn coerce(kind: FieldKind, v: Option<&Value>) -> Option<Value> {
    match kind {
        FieldKind::Text => v.and_then(text_of).map(Value::String),
        FieldKind::Number => Some(number_value(to_number(v))),
        FieldKind::Bool => Some(Value::Bool(v.map(truthy).unwrap_or(false))),
        FieldKind::Date => v.and_then(parse_date).map(Value::String),
        FieldKind::TextList => v.map(|v| Value::Array(text_list(v))),
        FieldKind::Choice(choices) => v
            .and_then(text_of)
            .and_then(|s| match_choice(choices, &s))
            .map(|c| Value::String(c.to_string())),
    }
}

fn text_of(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn to_number(v: Option<&Value>) -> f64 {
    let x = match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(true)) => 1.0,
        _ => 0.0,
    };
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

/// Integral values are emitted as JSON integers so that canonical records
/// compare equal after a round trip through either source.
pub fn number_value(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < 9_007_199_254_740_992.0 {
        Value::from(x as i64)
    } else {
        serde_json::Number::from_f64(x)
            .map(Value::Number)
            .unwrap_or_else(|| Value::from(0))
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|x| x != 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

pub fn parse_date(v: &Value) -> Option<String> {
    let date = match v {
        Value::String(s) => parse_date_str(s.trim())?,
        // Epoch milliseconds.
        Value::Number(n) => DateTime::<Utc>::from_timestamp_millis(n.as_i64()?)?.date_naive(),
        _ => return None,
    };
    Some(date.format("%Y-%m-%d").to_string())
}

fn parse_date_str(s: &str) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    for fmt in ["%d-%m-%Y", "%d/%m/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    None
}

fn text_list(v: &Value) -> Vec<Value> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(text_of)
            .map(Value::String)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Value::String(p.to_string()))
            .collect(),
        other => text_of(other).map(Value::String).into_iter().collect(),
    }
}

fn match_choice(choices: &[Choice], s: &str) -> Option<&'static str> {
    let needle = s.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|c| {
            c.canonical.eq_ignore_ascii_case(&needle)
                || c.aliases.iter().any(|a| a.eq_ignore_ascii_case(&needle))
        })
        .map(|c| c.canonical)
}
