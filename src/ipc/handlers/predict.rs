use rusqlite::Connection;
use serde_json::{json, Value};

use crate::calc::{self, round_off, AssessmentRow, CalcContext, RecordFilters};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    include_predictions, opt_bool, opt_f64, opt_str, req_str, require_category, require_subject,
    with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::predict::{self, HistoryPoint, ItemInput, SubjectInput};

/// Committed, graded rows only; predictions never feed the estimator.
fn history_points(rows: &[AssessmentRow]) -> Vec<HistoryPoint> {
    rows.iter()
        .filter(|r| !r.is_prediction)
        .filter_map(|r| {
            r.grade.map(|g| HistoryPoint {
                hours: r.study_time,
                grade: g,
                weight: Some(r.weight),
            })
        })
        .collect()
}

fn predict_item(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")
        .map_err(|_| HandlerErr::bad_params("select a subject first"))?;
    let category_id = req_str(params, "categoryId")
        .map_err(|_| HandlerErr::bad_params("select a category first"))?;
    let assessment_id = opt_str(params, "assessmentId")?.filter(|s| !s.is_empty());
    let hours = opt_f64(params, "hours")?;
    let target_grade = opt_f64(params, "targetGrade")?;
    require_subject(conn, &subject_id)?;
    let category = require_category(conn, &subject_id, &category_id)?;
    let grade_lock = match opt_bool(params, "gradeLock")? {
        Some(v) => v,
        None => calc::subject_grade_lock(conn, &subject_id)?,
    };

    // Without an explicit weight, use the share this item would get in its category.
    let weight = match opt_f64(params, "weight")? {
        Some(w) => w,
        None => {
            let others =
                calc::category_item_count(conn, &category_id, assessment_id.as_deref())?;
            calc::category_weight(category.total_weight, others + 1)
        }
    };

    let cfg = setup::prediction_config(conn)?;
    let input = ItemInput {
        weight,
        hours,
        target_grade,
    };
    let category_filters = RecordFilters {
        category_id: Some(category_id.clone()),
        exclude_assessment_id: assessment_id.clone(),
    };
    let category_history = history_points(&calc::load_assessments(
        conn,
        Some(&subject_id),
        &category_filters,
    )?);
    let mut scope = "category";
    let mut prediction = predict::predict_item(input, &category_history, grade_lock, &cfg)?;

    if prediction.k.is_none() && cfg.fallback_to_subject_history {
        let subject_filters = RecordFilters {
            category_id: None,
            exclude_assessment_id: assessment_id.clone(),
        };
        let subject_history = history_points(&calc::load_assessments(
            conn,
            Some(&subject_id),
            &subject_filters,
        )?);
        if subject_history.len() > category_history.len() {
            prediction = predict::predict_item(input, &subject_history, grade_lock, &cfg)?;
            scope = "subject";
        }
    }

    tracing::debug!(
        subject_id = %subject_id,
        category_id = %category_id,
        scope,
        k = ?prediction.k,
        history = prediction.history_count,
        "item prediction"
    );
    let mut out = prediction.to_json(cfg.round_decimals);
    out["scope"] = json!(scope);
    out["weight"] = json!(round_off(weight, cfg.round_decimals));
    out["gradeLock"] = json!(grade_lock);
    Ok(out)
}

fn predict_subject(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")
        .map_err(|_| HandlerErr::bad_params("select a subject first"))?;
    let target_grade = opt_f64(params, "targetGrade")?;
    let study_time = opt_f64(params, "studyTime")?;
    require_subject(conn, &subject_id)?;
    let include = include_predictions(conn, params)?;
    let grade_lock = calc::subject_grade_lock(conn, &subject_id)?;
    let cfg = setup::prediction_config(conn)?;

    let ctx = CalcContext {
        conn,
        subject_id: &subject_id,
    };
    let summary = calc::compute_subject_summary(&ctx, &RecordFilters::default(), include)?;
    let rows = calc::load_assessments(conn, Some(&subject_id), &RecordFilters::default())?;
    let history = history_points(&rows);
    let ceiling = predict::grade_ceiling(grade_lock, &history);
    let remaining = predict::remaining_weight(&summary);
    let k = predict::estimate_k(&history, remaining, ceiling, &cfg);

    let prediction = predict::predict_subject(
        SubjectInput {
            summary,
            target_grade,
            study_time,
        },
        k,
        ceiling,
    )?;

    tracing::debug!(subject_id = %subject_id, k = ?k, mode = ?prediction.mode, "subject prediction");
    let mut out = json!(prediction.rounded(cfg.round_decimals));
    out["subjectId"] = json!(subject_id);
    out["includePredictions"] = json!(include);
    out["k"] = json!(k);
    out["historyCount"] = json!(history.len());
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "predict.item" => predict_item,
        "predict.subject" => predict_subject,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
