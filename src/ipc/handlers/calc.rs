use rusqlite::Connection;
use serde_json::{json, Value};

use crate::calc::{self, round_off, RecordFilters};
use crate::ipc::helpers::{
    include_predictions, non_negative, opt_str, req_f64, req_str, require_category,
    require_subject, round_decimals, summary_json, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};

fn calc_summary(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let category_id = opt_str(params, "categoryId")?.filter(|s| !s.is_empty());
    require_subject(conn, &subject_id)?;
    if let Some(cid) = category_id.as_deref() {
        require_category(conn, &subject_id, cid)?;
    }
    let include = include_predictions(conn, params)?;
    let filters = RecordFilters {
        category_id,
        exclude_assessment_id: None,
    };
    summary_json(conn, &subject_id, &filters, include)
}

fn calc_category_weight(conn: &Connection, params: &Value) -> HandlerResult {
    let total_weight = non_negative(req_f64(params, "totalWeight")?, "totalWeight")?;
    let Some(item_count) = params.get("itemCount").and_then(|v| v.as_u64()) else {
        return Err(HandlerErr::bad_params(
            "itemCount must be a non-negative integer",
        ));
    };
    let n = item_count as usize;
    let decimals = round_decimals(conn)?;
    Ok(json!({
        "weightPerItem": round_off(calc::category_weight(total_weight, n), decimals),
        "weightDisplay": calc::weight_display(total_weight, n, decimals)
    }))
}

fn calc_prediction_accuracy(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = opt_str(params, "subjectId")?.filter(|s| !s.is_empty());
    if let Some(sid) = subject_id.as_deref() {
        require_subject(conn, sid)?;
    }
    let rows = calc::load_assessments(conn, subject_id.as_deref(), &RecordFilters::default())?;
    let pairs = rows
        .iter()
        .filter(|r| !r.is_prediction)
        .map(|r| (r.predicted_grade, r.grade));
    let decimals = round_decimals(conn)?;
    Ok(match calc::prediction_accuracy(pairs) {
        Some(acc) => json!({
            "meanAbsoluteError": round_off(acc.mean_absolute_error, decimals),
            "sampleCount": acc.sample_count
        }),
        None => json!({
            "meanAbsoluteError": null,
            "sampleCount": 0,
            "message": "no converted predictions to compare yet"
        }),
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "calc.summary" => calc_summary,
        "calc.categoryWeight" => calc_category_weight,
        "calc.predictionAccuracy" => calc_prediction_accuracy,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
