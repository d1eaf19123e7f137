//! History-driven grade/hours estimation.
//!
//! Grades follow a saturating learning curve `grade(h) = G·(1 − e^(−k·h/w))`
//! where `w` is the item's share of the course (weight / 100) and `G` the grade
//! ceiling. The learning rate `k` is fitted per student from committed history.

use serde::Serialize;
use serde_json::{json, Value};

use crate::calc::{round_off, CalcError, SubjectSummary};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionConfig {
    pub trim_fraction: f64,
    pub grade_cap_ratio: f64,
    pub min_history: usize,
    pub fallback_to_subject_history: bool,
    pub round_decimals: u32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            trim_fraction: 0.2,
            grade_cap_ratio: 0.995,
            min_history: 1,
            fallback_to_subject_history: true,
            round_decimals: 2,
        }
    }
}

impl PredictionConfig {
    /// Read a stored `prediction` settings section. Missing or out-of-type
    /// fields keep their defaults.
    pub fn from_section(section: &Value) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = section.get("trimFraction").and_then(|v| v.as_f64()) {
            cfg.trim_fraction = v.clamp(0.0, 0.5);
        }
        if let Some(v) = section.get("gradeCapRatio").and_then(|v| v.as_f64()) {
            cfg.grade_cap_ratio = v.clamp(0.9, 0.999);
        }
        if let Some(v) = section.get("minHistory").and_then(|v| v.as_u64()) {
            cfg.min_history = v.max(1) as usize;
        }
        if let Some(v) = section
            .get("fallbackToSubjectHistory")
            .and_then(|v| v.as_bool())
        {
            cfg.fallback_to_subject_history = v;
        }
        if let Some(v) = section.get("roundDecimals").and_then(|v| v.as_u64()) {
            cfg.round_decimals = v.min(4) as u32;
        }
        cfg
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub hours: f64,
    pub grade: f64,
    /// Percentage points; None means "same as the item being predicted".
    pub weight: Option<f64>,
}

impl HistoryPoint {
    #[cfg(test)]
    pub fn new(hours: f64, grade: f64) -> Self {
        Self {
            hours,
            grade,
            weight: None,
        }
    }
}

/// Grade ceiling `G`: 100 under grade lock, otherwise whatever the student has
/// actually reached if that is higher.
pub fn grade_ceiling(grade_lock: bool, history: &[HistoryPoint]) -> f64 {
    if grade_lock {
        return 100.0;
    }
    history
        .iter()
        .map(|p| p.grade)
        .filter(|g| g.is_finite())
        .fold(100.0_f64, f64::max)
}

/// Trimmed-mean learning rate over valid history points, or None when there is
/// not enough usable history.
pub fn estimate_k(
    history: &[HistoryPoint],
    item_weight: f64,
    ceiling: f64,
    cfg: &PredictionConfig,
) -> Option<f64> {
    if ceiling <= 0.0 {
        return None;
    }
    let mut rates: Vec<f64> = history
        .iter()
        .filter_map(|p| {
            let w = p.weight.unwrap_or(item_weight) / 100.0;
            if !(p.hours > 0.0 && p.grade > 0.0 && w > 0.0) {
                return None;
            }
            let ratio = (p.grade / ceiling).min(cfg.grade_cap_ratio);
            let k = -(1.0 - ratio).ln() * w / p.hours;
            k.is_finite().then_some(k)
        })
        .collect();

    let n = rates.len();
    if n == 0 || n < cfg.min_history {
        return None;
    }
    rates.sort_by(|a, b| a.total_cmp(b));
    let drop = ((n as f64 * cfg.trim_fraction).floor() as usize).min(n - 1);
    let kept = &rates[drop..];
    let k = kept.iter().sum::<f64>() / kept.len() as f64;
    (k > 0.0).then_some(k)
}

pub fn predict_grade(hours: f64, item_weight: f64, k: f64, ceiling: f64) -> f64 {
    if hours <= 0.0 {
        return 0.0;
    }
    let w = item_weight / 100.0;
    if w <= 0.0 {
        return ceiling;
    }
    let g = ceiling * (1.0 - (-k * hours / w).exp());
    g.clamp(0.0, ceiling)
}

/// Inverse of [`predict_grade`]. None when the target is at or above the
/// ceiling, which the curve only approaches.
pub fn required_hours(target: f64, item_weight: f64, k: f64, ceiling: f64) -> Option<f64> {
    if target <= 0.0 {
        return Some(0.0);
    }
    if target >= ceiling || k <= 0.0 {
        return None;
    }
    let w = item_weight / 100.0;
    if w <= 0.0 {
        return Some(0.0);
    }
    Some(-(1.0 - target / ceiling).ln() * w / k)
}

fn require_non_negative(v: f64, key: &str) -> Result<(), CalcError> {
    if !v.is_finite() {
        return Err(CalcError::new("bad_params", format!("{} must be a number", key))
            .with_details(json!({ "field": key })));
    }
    if v < 0.0 {
        return Err(CalcError::new("bad_params", format!("{} must not be negative", key))
            .with_details(json!({ "field": key, "value": v })));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemMode {
    GradeFromHours,
    HoursFromGrade,
}

#[derive(Debug, Clone, Copy)]
pub struct ItemInput {
    pub weight: f64,
    pub hours: Option<f64>,
    pub target_grade: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemPrediction {
    pub mode: ItemMode,
    pub predicted_grade: Option<f64>,
    pub required_hours: Option<f64>,
    pub message: Option<String>,
    pub k: Option<f64>,
    pub ceiling: f64,
    pub history_count: usize,
}

impl ItemPrediction {
    pub fn to_json(&self, decimals: u32) -> Value {
        let mut out = json!({
            "mode": self.mode,
            "message": self.message,
            "k": self.k,
            "ceiling": self.ceiling,
            "historyCount": self.history_count,
        });
        match self.mode {
            ItemMode::GradeFromHours => {
                out["predicted_grade"] = json!(self.predicted_grade.map(|g| round_off(g, decimals)));
            }
            ItemMode::HoursFromGrade => {
                out["required_hours"] = json!(self.required_hours.map(|h| round_off(h, decimals)));
            }
        }
        out
    }
}

/// Single-item prediction. Exactly one of `hours` / `target_grade` must be set.
pub fn predict_item(
    input: ItemInput,
    history: &[HistoryPoint],
    grade_lock: bool,
    cfg: &PredictionConfig,
) -> Result<ItemPrediction, CalcError> {
    let mode = match (input.hours, input.target_grade) {
        (Some(_), Some(_)) => {
            return Err(CalcError::new(
                "bad_params",
                "provide exactly one of hours or targetGrade, not both",
            ))
        }
        (None, None) => {
            return Err(CalcError::new(
                "bad_params",
                "provide exactly one of hours or targetGrade",
            ))
        }
        (Some(h), None) => {
            require_non_negative(h, "hours")?;
            ItemMode::GradeFromHours
        }
        (None, Some(t)) => {
            require_non_negative(t, "targetGrade")?;
            ItemMode::HoursFromGrade
        }
    };
    require_non_negative(input.weight, "weight")?;

    let ceiling = grade_ceiling(grade_lock, history);
    let k = estimate_k(history, input.weight, ceiling, cfg);
    let mut out = ItemPrediction {
        mode,
        predicted_grade: None,
        required_hours: None,
        message: None,
        k,
        ceiling,
        history_count: history.len(),
    };

    // A zero-weight item has no place on the curve.
    if input.weight <= 0.0 {
        out.message = Some("weight must be positive to predict".to_string());
        return Ok(out);
    }
    let Some(k) = k else {
        out.message = Some("not enough graded history to make a prediction".to_string());
        return Ok(out);
    };

    match mode {
        ItemMode::GradeFromHours => {
            let hours = input.hours.unwrap_or(0.0);
            out.predicted_grade = Some(predict_grade(hours, input.weight, k, ceiling));
        }
        ItemMode::HoursFromGrade => {
            let target = input.target_grade.unwrap_or(0.0);
            match required_hours(target, input.weight, k, ceiling) {
                Some(h) => out.required_hours = Some(h),
                None => {
                    out.message = Some(format!(
                        "a grade of {} is not reachable; the model tops out below {}",
                        round_off(target, 2),
                        round_off(ceiling, 2)
                    ));
                }
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectMode {
    TargetGrade,
    StudyTime,
}

#[derive(Debug, Clone, Copy)]
pub struct SubjectInput {
    pub summary: SubjectSummary,
    pub target_grade: Option<f64>,
    pub study_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectPrediction {
    pub mode: SubjectMode,
    pub remaining_weight: f64,
    pub current_average: f64,
    pub current_weighted_sum: f64,
    pub average_grade_needed: Option<f64>,
    pub predicted_additional_time: Option<f64>,
    pub predicted_overall_grade: Option<f64>,
    pub message: Option<String>,
}

impl SubjectPrediction {
    pub fn rounded(&self, decimals: u32) -> Self {
        let r = |v: f64| round_off(v, decimals);
        Self {
            mode: self.mode,
            remaining_weight: r(self.remaining_weight),
            current_average: r(self.current_average),
            current_weighted_sum: r(self.current_weighted_sum),
            average_grade_needed: self.average_grade_needed.map(r),
            predicted_additional_time: self.predicted_additional_time.map(r),
            predicted_overall_grade: self.predicted_overall_grade.map(r),
            message: self.message.clone(),
        }
    }
}

/// Weight not yet covered by graded items, floored at 0.
pub fn remaining_weight(summary: &SubjectSummary) -> f64 {
    (100.0 - summary.total_weight).max(0.0)
}

/// Subject-level prediction over the remaining ungraded weight. `k` is the
/// subject's fitted learning rate, if any.
pub fn predict_subject(
    input: SubjectInput,
    k: Option<f64>,
    ceiling: f64,
) -> Result<SubjectPrediction, CalcError> {
    let mode = match (input.target_grade, input.study_time) {
        (Some(_), Some(_)) => {
            return Err(CalcError::new(
                "bad_params",
                "provide exactly one of targetGrade or studyTime, not both",
            ))
        }
        (None, None) => {
            return Err(CalcError::new(
                "bad_params",
                "provide exactly one of targetGrade or studyTime",
            ))
        }
        (Some(t), None) => {
            require_non_negative(t, "targetGrade")?;
            SubjectMode::TargetGrade
        }
        (None, Some(s)) => {
            require_non_negative(s, "studyTime")?;
            SubjectMode::StudyTime
        }
    };

    let weighted_sum = input.summary.weighted_sum();
    let remaining = remaining_weight(&input.summary);
    let mut out = SubjectPrediction {
        mode,
        remaining_weight: remaining,
        current_average: input.summary.average_grade,
        current_weighted_sum: weighted_sum,
        average_grade_needed: None,
        predicted_additional_time: None,
        predicted_overall_grade: None,
        message: None,
    };

    match mode {
        SubjectMode::TargetGrade => {
            let target = input.target_grade.unwrap_or(0.0);
            if remaining <= 0.0 {
                out.message = Some("nothing left to grade in this subject".to_string());
                return Ok(out);
            }
            let needed = (target * 100.0 - weighted_sum) / remaining;
            if needed > ceiling {
                out.message = Some(format!(
                    "target of {} is unreachable; it would need an average of {} on the remaining {}%",
                    round_off(target, 2),
                    round_off(needed, 2),
                    round_off(remaining, 2)
                ));
            } else if needed < 0.0 {
                out.message = Some(format!(
                    "target of {} is already secured by graded work",
                    round_off(target, 2)
                ));
            } else {
                out.average_grade_needed = Some(needed);
                match k {
                    Some(k) => match required_hours(needed, remaining, k, ceiling) {
                        Some(h) => out.predicted_additional_time = Some(h),
                        None => {
                            // The curve only approaches the ceiling.
                            out.message = Some(format!(
                                "an average of {} is possible but the model cannot reach it in finite study time",
                                round_off(needed, 2)
                            ));
                        }
                    },
                    None => {
                        out.message =
                            Some("not enough graded history to estimate study time".to_string());
                    }
                }
            }
        }
        SubjectMode::StudyTime => {
            let study_time = input.study_time.unwrap_or(0.0);
            out.predicted_additional_time = Some(study_time);
            if remaining <= 0.0 {
                out.predicted_overall_grade = Some(weighted_sum / 100.0);
                out.message = Some("nothing left to grade in this subject".to_string());
                return Ok(out);
            }
            match k {
                Some(k) => {
                    let g = predict_grade(study_time, remaining, k, ceiling);
                    out.predicted_overall_grade = Some((weighted_sum + g * remaining) / 100.0);
                }
                None => {
                    out.message =
                        Some("not enough graded history to make a prediction".to_string());
                }
            }
        }
    }
    Ok(out)
}
