use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Round half away from zero to `decimals` places. Non-finite input collapses to 0.
pub fn round_off(x: f64, decimals: u32) -> f64 {
    if !x.is_finite() {
        return 0.0;
    }
    let factor = 10_f64.powi(decimals as i32);
    (x * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryRecord {
    pub study_time: f64,
    pub grade: Option<f64>,
    pub weight: f64,
    pub is_prediction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SubjectSummary {
    pub total_hours: f64,
    pub average_grade: f64,
    pub total_weight: f64,
}

impl SubjectSummary {
    /// `Σ grade·weight` over the graded records that produced this summary.
    pub fn weighted_sum(&self) -> f64 {
        self.average_grade * self.total_weight
    }

    pub fn rounded(&self, decimals: u32) -> Self {
        Self {
            total_hours: round_off(self.total_hours, decimals),
            average_grade: round_off(self.average_grade, decimals),
            total_weight: round_off(self.total_weight, decimals),
        }
    }
}

/// Aggregate an already-filtered record list.
///
/// Ungraded records count toward `total_hours` only. Prediction rows are skipped
/// entirely unless `include_predictions` is set.
pub fn compute_summary<'a, I>(records: I, include_predictions: bool) -> SubjectSummary
where
    I: IntoIterator<Item = &'a SummaryRecord>,
{
    let mut total_hours = 0.0_f64;
    let mut weighted_sum = 0.0_f64;
    let mut total_weight = 0.0_f64;

    for r in records {
        if r.is_prediction && !include_predictions {
            continue;
        }
        total_hours += r.study_time;
        if let Some(g) = r.grade {
            weighted_sum += g * r.weight;
            total_weight += r.weight;
        }
    }

    let average_grade = if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.0
    };

    SubjectSummary {
        total_hours,
        average_grade,
        total_weight,
    }
}

/// Even split of a category's weight across its items; 0 for an empty category.
pub fn category_weight(total_weight: f64, item_count: usize) -> f64 {
    if item_count == 0 {
        return 0.0;
    }
    total_weight / item_count as f64
}

/// Display form of a per-item weight: "N/A" for an empty category, so it never
/// reads as a real zero.
pub fn weight_display(total_weight: f64, item_count: usize, decimals: u32) -> String {
    if item_count == 0 {
        return "N/A".to_string();
    }
    format!(
        "{}",
        round_off(category_weight(total_weight, item_count), decimals)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightAdvisory {
    pub total_weight: f64,
    pub remaining_weight: f64,
    pub balanced: bool,
}

pub fn weight_advisory<I>(category_weights: I, tolerance: f64) -> WeightAdvisory
where
    I: IntoIterator<Item = f64>,
{
    let total: f64 = category_weights.into_iter().sum();
    WeightAdvisory {
        total_weight: total,
        remaining_weight: (100.0 - total).max(0.0),
        balanced: (total - 100.0).abs() <= tolerance,
    }
}

pub fn advisory_warning(advisory: &WeightAdvisory) -> Option<String> {
    if advisory.balanced {
        return None;
    }
    if advisory.total_weight > 100.0 {
        Some(format!(
            "category weights total {}%, which exceeds 100%",
            round_off(advisory.total_weight, 2)
        ))
    } else {
        Some(format!(
            "category weights total {}%; {}% is unallocated",
            round_off(advisory.total_weight, 2),
            round_off(advisory.remaining_weight, 2)
        ))
    }
}

/// Substitute a sequence number into a naming template. `#` marks the slot;
/// templates without one get the number appended.
pub fn apply_name_template(template: &str, seq: &str) -> String {
    let t = template.trim();
    if t.contains('#') {
        t.replacen('#', seq, 1)
    } else if t.is_empty() {
        seq.to_string()
    } else {
        format!("{} {}", t, seq)
    }
}

/// Rewrite `name` from `old_template` to `new_template` if it was generated by
/// the old template. Returns None when the name doesn't follow the old pattern.
pub fn rename_by_template(name: &str, old_template: &str, new_template: &str) -> Option<String> {
    let old = old_template.trim();
    let (prefix, suffix) = match old.split_once('#') {
        Some(parts) => parts,
        None if !old.is_empty() => (old, ""),
        None => return None,
    };
    let prefix = if old.contains('#') {
        prefix.to_string()
    } else {
        format!("{} ", prefix)
    };
    let rest = name.strip_prefix(prefix.as_str())?;
    let seq = rest.strip_suffix(suffix)?;
    if seq.is_empty() || !seq.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(apply_name_template(new_template, seq))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionAccuracy {
    pub mean_absolute_error: f64,
    pub sample_count: usize,
}

/// MAE between stored predictions and the grades that were eventually entered.
pub fn prediction_accuracy<I>(pairs: I) -> Option<PredictionAccuracy>
where
    I: IntoIterator<Item = (Option<f64>, Option<f64>)>,
{
    let mut sum = 0.0_f64;
    let mut n = 0_usize;
    for (predicted, actual) in pairs {
        let (Some(p), Some(a)) = (predicted, actual) else {
            continue;
        };
        sum += (a - p).abs();
        n += 1;
    }
    if n == 0 {
        return None;
    }
    Some(PredictionAccuracy {
        mean_absolute_error: sum / n as f64,
        sample_count: n,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFilters {
    pub category_id: Option<String>,
    pub exclude_assessment_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub subject_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRow {
    pub id: String,
    pub subject_id: String,
    pub subject: String,
    pub category_id: String,
    pub category: String,
    pub assignment_name: String,
    pub study_time: f64,
    pub grade: Option<f64>,
    pub weight: f64,
    pub is_prediction: bool,
    pub predicted_grade: Option<f64>,
    pub position: i64,
}

impl AssessmentRow {
    pub fn as_summary_record(&self) -> SummaryRecord {
        SummaryRecord {
            study_time: self.study_time,
            grade: self.grade,
            weight: self.weight,
            is_prediction: self.is_prediction,
        }
    }
}

const ASSESSMENT_COLUMNS: &str = "a.id, a.subject_id, s.name, a.category_id, c.name,
    a.assignment_name, a.study_time, a.grade, a.weight, a.is_prediction,
    a.predicted_grade, a.position";

fn map_assessment_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AssessmentRow> {
    Ok(AssessmentRow {
        id: r.get(0)?,
        subject_id: r.get(1)?,
        subject: r.get(2)?,
        category_id: r.get(3)?,
        category: r.get(4)?,
        assignment_name: r.get(5)?,
        study_time: r.get(6)?,
        grade: r.get(7)?,
        weight: r.get(8)?,
        is_prediction: r.get::<_, i64>(9)? != 0,
        predicted_grade: r.get(10)?,
        position: r.get(11)?,
    })
}

pub fn load_assessment(conn: &Connection, assessment_id: &str) -> Result<Option<AssessmentRow>, CalcError> {
    let sql = format!(
        "SELECT {}
         FROM assessments a
         JOIN subjects s ON s.id = a.subject_id
         JOIN categories c ON c.id = a.category_id
         WHERE a.id = ?",
        ASSESSMENT_COLUMNS
    );
    conn.query_row(&sql, [assessment_id], map_assessment_row)
        .optional()
        .map_err(CalcError::db)
}

/// All rows visible under a subject filter, in manual order. A None subject
/// means every subject.
pub fn load_assessments(
    conn: &Connection,
    subject_id: Option<&str>,
    filters: &RecordFilters,
) -> Result<Vec<AssessmentRow>, CalcError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(sid) = subject_id {
        clauses.push("a.subject_id = ?");
        bind_values.push(Value::Text(sid.to_string()));
    }
    if let Some(cid) = filters.category_id.as_ref() {
        clauses.push("a.category_id = ?");
        bind_values.push(Value::Text(cid.clone()));
    }
    if let Some(aid) = filters.exclude_assessment_id.as_ref() {
        clauses.push("a.id <> ?");
        bind_values.push(Value::Text(aid.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {}
         FROM assessments a
         JOIN subjects s ON s.id = a.subject_id
         JOIN categories c ON c.id = a.category_id
         {}
         ORDER BY s.name, a.position, a.rowid",
        ASSESSMENT_COLUMNS, where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(CalcError::db)?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), map_assessment_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(rows)
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, CalcError> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(CalcError::db)
}

pub fn subject_grade_lock(conn: &Connection, subject_id: &str) -> Result<bool, CalcError> {
    let lock: Option<i64> = conn
        .query_row(
            "SELECT grade_lock FROM subjects WHERE id = ?",
            [subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    match lock {
        Some(v) => Ok(v != 0),
        None => Err(CalcError::new("not_found", "subject not found")),
    }
}

pub fn compute_subject_summary(
    ctx: &CalcContext<'_>,
    filters: &RecordFilters,
    include_predictions: bool,
) -> Result<SubjectSummary, CalcError> {
    if !subject_exists(ctx.conn, ctx.subject_id)? {
        return Err(CalcError::new("not_found", "subject not found"));
    }
    let rows = load_assessments(ctx.conn, Some(ctx.subject_id), filters)?;
    let records: Vec<SummaryRecord> = rows.iter().map(AssessmentRow::as_summary_record).collect();
    Ok(compute_summary(&records, include_predictions))
}

pub fn category_item_count(
    conn: &Connection,
    category_id: &str,
    exclude_assessment_id: Option<&str>,
) -> Result<usize, CalcError> {
    let n: i64 = match exclude_assessment_id {
        Some(aid) => conn.query_row(
            "SELECT COUNT(*) FROM assessments WHERE category_id = ? AND id <> ?",
            (category_id, aid),
            |r| r.get(0),
        ),
        None => conn.query_row(
            "SELECT COUNT(*) FROM assessments WHERE category_id = ?",
            [category_id],
            |r| r.get(0),
        ),
    }
    .map_err(CalcError::db)?;
    Ok(n.max(0) as usize)
}

/// Re-split a category's total weight across every member row, prediction rows
/// included. Callers run this inside the transaction that changed membership.
pub fn recalculate_category_weights(conn: &Connection, category_id: &str) -> Result<f64, CalcError> {
    let total_weight: Option<f64> = conn
        .query_row(
            "SELECT total_weight FROM categories WHERE id = ?",
            [category_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some(total_weight) = total_weight else {
        return Err(CalcError::new("not_found", "category not found"));
    };
    let count = category_item_count(conn, category_id, None)?;
    let per_item = category_weight(total_weight, count);
    conn.execute(
        "UPDATE assessments SET weight = ? WHERE category_id = ?",
        (per_item, category_id),
    )
    .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    Ok(per_item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(study_time: f64, grade: Option<f64>, weight: f64, is_prediction: bool) -> SummaryRecord {
        SummaryRecord {
            study_time,
            grade,
            weight,
            is_prediction,
        }
    }

    #[test]
    fn empty_summary_is_all_zero() {
        let s = compute_summary(&[], false);
        assert_eq!(s.average_grade, 0.0);
        assert_eq!(s.total_weight, 0.0);
        assert_eq!(s.total_hours, 0.0);
    }

    #[test]
    fn ungraded_rows_count_hours_but_not_weight() {
        let records = vec![
            rec(2.0, Some(80.0), 10.0, false),
            rec(3.0, None, 15.0, false),
            rec(1.0, Some(90.0), 30.0, false),
        ];
        let s = compute_summary(&records, false);
        assert!((s.total_hours - 6.0).abs() < 1e-9);
        assert!((s.total_weight - 40.0).abs() < 1e-9);
        let expected = (80.0 * 10.0 + 90.0 * 30.0) / 40.0;
        assert!((s.average_grade - expected).abs() < 1e-9);
    }

    #[test]
    fn prediction_rows_need_the_include_flag() {
        let records = vec![
            rec(2.0, Some(70.0), 20.0, false),
            rec(4.0, Some(100.0), 20.0, true),
        ];
        let without = compute_summary(&records, false);
        assert!((without.total_hours - 2.0).abs() < 1e-9);
        assert!((without.average_grade - 70.0).abs() < 1e-9);

        let with = compute_summary(&records, true);
        assert!((with.total_hours - 6.0).abs() < 1e-9);
        assert!((with.average_grade - 85.0).abs() < 1e-9);
        assert!((with.total_weight - 40.0).abs() < 1e-9);
    }

    #[test]
    fn summary_is_idempotent() {
        let records = vec![rec(1.5, Some(88.0), 12.5, false), rec(0.5, None, 5.0, true)];
        assert_eq!(compute_summary(&records, true), compute_summary(&records, true));
    }

    #[test]
    fn category_weight_splits_evenly_and_guards_zero() {
        assert_eq!(category_weight(60.0, 3), 20.0);
        assert_eq!(category_weight(40.0, 1), 40.0);
        assert_eq!(category_weight(40.0, 0), 0.0);
        assert_eq!(weight_display(40.0, 0, 2), "N/A");
        assert_eq!(weight_display(100.0, 3, 2), "33.33");
    }

    #[test]
    fn advisory_flags_unbalanced_totals_without_blocking() {
        let ok = weight_advisory([60.0, 25.0, 15.0], 0.01);
        assert!(ok.balanced);
        assert!(advisory_warning(&ok).is_none());

        let short = weight_advisory([30.0, 40.0, 20.0], 0.01);
        assert!(!short.balanced);
        assert!((short.remaining_weight - 10.0).abs() < 1e-9);
        assert!(advisory_warning(&short).unwrap().contains("unallocated"));

        let over = weight_advisory([70.0, 40.0], 0.01);
        assert_eq!(over.remaining_weight, 0.0);
        assert!(advisory_warning(&over).unwrap().contains("exceeds"));
    }

    #[test]
    fn name_templates_fill_and_rename() {
        assert_eq!(apply_name_template("Quiz #", "3"), "Quiz 3");
        assert_eq!(apply_name_template("Lab", "2"), "Lab 2");
        assert_eq!(
            rename_by_template("Quiz 12", "Quiz #", "Test #").as_deref(),
            Some("Test 12")
        );
        assert_eq!(rename_by_template("Pop quiz", "Quiz #", "Test #"), None);
        assert_eq!(rename_by_template("Quiz x", "Quiz #", "Test #"), None);
        assert_eq!(
            rename_by_template("Week 4 reading", "Week # reading", "Reading #").as_deref(),
            Some("Reading 4")
        );
    }

    #[test]
    fn accuracy_ignores_incomplete_pairs() {
        let acc = prediction_accuracy([
            (Some(70.0), Some(75.0)),
            (Some(82.0), Some(85.0)),
            (Some(88.0), Some(90.0)),
            (None, Some(60.0)),
            (Some(50.0), None),
        ])
        .expect("accuracy");
        assert_eq!(acc.sample_count, 3);
        assert!((acc.mean_absolute_error - 10.0 / 3.0).abs() < 1e-9);
        assert!(prediction_accuracy([(None, None)]).is_none());
    }

    #[test]
    fn round_off_handles_non_finite() {
        assert_eq!(round_off(33.33333, 2), 33.33);
        assert_eq!(round_off(f64::INFINITY, 2), 0.0);
    }
}
