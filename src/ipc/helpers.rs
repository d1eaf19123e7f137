use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::calc::{self, CalcContext, CalcError, RecordFilters};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};

#[derive(Debug)]
pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

/// `map_err` adapter for rusqlite failures: `.map_err(db_err("db_insert_failed"))`.
pub fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string())
}

pub type HandlerResult = Result<Value, HandlerErr>;

/// Run a handler body that needs an open workspace and wrap its outcome in the
/// response envelope.
pub fn with_conn(
    state: &AppState,
    req: &Request,
    f: fn(&Connection, &Value) -> HandlerResult,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::debug!(method = %req.method, code = %e.code, error = %e.message, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn req_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let Some(raw) = params.get(key).and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    let s = raw.trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

pub fn opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Ok(Some(n)),
            _ => Err(HandlerErr::bad_params(format!("{} must be a number", key))),
        },
    }
}

pub fn req_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    opt_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn req_bool(params: &Value, key: &str) -> Result<bool, HandlerErr> {
    opt_bool(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn str_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing/invalid {}", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be strings", key)))
        })
        .collect()
}

pub fn non_negative(v: f64, key: &str) -> Result<f64, HandlerErr> {
    if v < 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must not be negative", key)));
    }
    Ok(v)
}

/// Grade bounds: never negative, and capped at 100 while the subject's grade
/// lock is on.
pub fn check_grade(grade: Option<f64>, grade_lock: bool, key: &str) -> Result<(), HandlerErr> {
    let Some(g) = grade else {
        return Ok(());
    };
    non_negative(g, key)?;
    if grade_lock && g > 100.0 {
        return Err(HandlerErr::bad_params(format!(
            "{} must be at most 100 while grade lock is on",
            key
        ))
        .with_details(json!({ "field": key, "value": g })));
    }
    Ok(())
}

pub fn require_subject(conn: &Connection, subject_id: &str) -> Result<(), HandlerErr> {
    if calc::subject_exists(conn, subject_id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found("subject not found"))
    }
}

#[derive(Debug, Clone)]
pub struct CategoryRow {
    pub id: String,
    pub subject_id: String,
    pub name: String,
    pub total_weight: f64,
    pub default_name: Option<String>,
}

/// Load a category and check it belongs to `subject_id`.
pub fn require_category(
    conn: &Connection,
    subject_id: &str,
    category_id: &str,
) -> Result<CategoryRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, subject_id, name, total_weight, default_name
             FROM categories WHERE id = ?",
            [category_id],
            |r| {
                Ok(CategoryRow {
                    id: r.get(0)?,
                    subject_id: r.get(1)?,
                    name: r.get(2)?,
                    total_weight: r.get(3)?,
                    default_name: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    match row {
        Some(c) if c.subject_id == subject_id => Ok(c),
        Some(_) => Err(HandlerErr::bad_params("category does not belong to subject")
            .with_details(json!({ "categoryId": category_id, "subjectId": subject_id }))),
        None => Err(HandlerErr::not_found("category not found")),
    }
}

pub fn include_predictions(conn: &Connection, params: &Value) -> Result<bool, HandlerErr> {
    match opt_bool(params, "includePredictions")? {
        Some(v) => Ok(v),
        None => Ok(setup::display_settings(conn)?.include_predictions_by_default),
    }
}

pub fn round_decimals(conn: &Connection) -> Result<u32, HandlerErr> {
    Ok(setup::prediction_config(conn)?.round_decimals)
}

pub fn summary_json(
    conn: &Connection,
    subject_id: &str,
    filters: &RecordFilters,
    include_predictions: bool,
) -> HandlerResult {
    let ctx = CalcContext { conn, subject_id };
    let summary = calc::compute_subject_summary(&ctx, filters, include_predictions)?;
    let decimals = round_decimals(conn)?;
    let rounded = summary.rounded(decimals);
    Ok(json!({
        "subjectId": subject_id,
        "includePredictions": include_predictions,
        "total_hours": rounded.total_hours,
        "average_grade": rounded.average_grade,
        "total_weight": rounded.total_weight,
        "remaining_weight": calc::round_off((100.0 - summary.total_weight).max(0.0), decimals),
    }))
}

/// Post-mutation summary for a whole subject, honouring the request's
/// `includePredictions` or the workspace default.
pub fn mutation_summary(conn: &Connection, params: &Value, subject_id: &str) -> HandlerResult {
    let include = include_predictions(conn, params)?;
    summary_json(conn, subject_id, &RecordFilters::default(), include)
}
