use std::collections::{BTreeSet, HashSet};

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::calc::{self, round_off, AssessmentRow, RecordFilters};
use crate::db;
use crate::ipc::handlers::categories::next_default_name;
use crate::ipc::helpers::{
    check_grade, db_err, include_predictions, mutation_summary, non_negative, opt_bool, opt_f64,
    opt_str, req_f64, req_str, require_category, require_subject, round_decimals, str_list,
    summary_json, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};

fn require_assessment(conn: &Connection, assessment_id: &str) -> Result<AssessmentRow, HandlerErr> {
    calc::load_assessment(conn, assessment_id)?
        .ok_or_else(|| HandlerErr::not_found("assessment not found"))
}

fn row_json(row: &AssessmentRow) -> Value {
    serde_json::to_value(row).unwrap_or(Value::Null)
}

fn assessments_list(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = opt_str(params, "subjectId")?.filter(|s| !s.is_empty());
    let category_id = opt_str(params, "categoryId")?.filter(|s| !s.is_empty());
    let include = include_predictions(conn, params)?;
    if let Some(sid) = subject_id.as_deref() {
        require_subject(conn, sid)?;
        if let Some(cid) = category_id.as_deref() {
            require_category(conn, sid, cid)?;
        }
    }

    let filters = RecordFilters {
        category_id,
        exclude_assessment_id: None,
    };
    let rows = calc::load_assessments(conn, subject_id.as_deref(), &filters)?;
    let assessments: Vec<Value> = rows
        .iter()
        .filter(|r| include || !r.is_prediction)
        .map(row_json)
        .collect();
    Ok(json!({
        "includePredictions": include,
        "count": assessments.len(),
        "assessments": assessments
    }))
}

fn assessments_create(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let category_id = req_str(params, "categoryId")?;
    let study_time = non_negative(req_f64(params, "studyTime")?, "studyTime")?;
    let grade = opt_f64(params, "grade")?;
    let is_prediction = opt_bool(params, "isPrediction")?.unwrap_or(false);
    let mut predicted_grade = opt_f64(params, "predictedGrade")?;

    let grade_lock = calc::subject_grade_lock(conn, &subject_id)?;
    let category = require_category(conn, &subject_id, &category_id)?;
    check_grade(grade, grade_lock, "grade")?;
    check_grade(predicted_grade, grade_lock, "predictedGrade")?;
    if is_prediction && predicted_grade.is_none() {
        predicted_grade = grade;
    }

    let name = match opt_str(params, "assignmentName")?.filter(|s| !s.is_empty()) {
        Some(n) => n,
        None => {
            let template = category
                .default_name
                .clone()
                .unwrap_or_else(|| category.name.clone());
            next_default_name(conn, &category_id, &template)?.0
        }
    };

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let position: i64 = tx
        .query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM assessments WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let assessment_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    tx.execute(
        "INSERT INTO assessments(
            id, subject_id, category_id, assignment_name, study_time, grade, weight,
            is_prediction, predicted_grade, position, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &assessment_id,
            &subject_id,
            &category_id,
            &name,
            study_time,
            grade,
            is_prediction as i64,
            predicted_grade,
            position,
            &now,
            &now,
        ],
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "assessments" }))
    })?;
    let per_item = calc::recalculate_category_weights(&tx, &category_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(
        assessment_id = %assessment_id,
        category_id = %category_id,
        is_prediction,
        weight_per_item = per_item,
        "assessment created"
    );
    let row = require_assessment(conn, &assessment_id)?;
    Ok(json!({
        "assessmentId": assessment_id,
        "assessment": row_json(&row),
        "weightPerItem": round_off(per_item, round_decimals(conn)?),
        "summary": mutation_summary(conn, params, &subject_id)?
    }))
}

fn assessments_update(conn: &Connection, params: &Value) -> HandlerResult {
    let assessment_id = req_str(params, "assessmentId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let current = require_assessment(conn, &assessment_id)?;
    let grade_lock = calc::subject_grade_lock(conn, &current.subject_id)?;

    let mut name = current.assignment_name.clone();
    let mut study_time = current.study_time;
    let mut grade = current.grade;
    let mut category_id = current.category_id.clone();
    let mut is_prediction = current.is_prediction;
    let mut predicted_grade = current.predicted_grade;
    for k in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match k.as_str() {
            "assignmentName" => name = req_str(patch, k)?,
            "studyTime" => study_time = non_negative(req_f64(patch, k)?, k)?,
            "grade" => grade = opt_f64(patch, k)?,
            "categoryId" => category_id = req_str(patch, k)?,
            "isPrediction" => {
                is_prediction = opt_bool(patch, k)?
                    .ok_or_else(|| HandlerErr::bad_params("isPrediction must be boolean"))?
            }
            "predictedGrade" => predicted_grade = opt_f64(patch, k)?,
            _ => {
                return Err(HandlerErr::bad_params(format!(
                    "unknown assessment field: {}",
                    k
                )))
            }
        }
    }
    // Stored grades above the lock stay editable; only patched values are checked.
    if patch.get("grade").is_some() {
        check_grade(grade, grade_lock, "grade")?;
    }
    if patch.get("predictedGrade").is_some() {
        check_grade(predicted_grade, grade_lock, "predictedGrade")?;
    }
    let moved = category_id != current.category_id;
    if moved {
        require_category(conn, &current.subject_id, &category_id)?;
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE assessments
         SET assignment_name = ?, study_time = ?, grade = ?, category_id = ?,
             is_prediction = ?, predicted_grade = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            &name,
            study_time,
            grade,
            &category_id,
            is_prediction as i64,
            predicted_grade,
            db::now_rfc3339(),
            &assessment_id,
        ],
    )
    .map_err(db_err("db_update_failed"))?;
    if moved {
        calc::recalculate_category_weights(&tx, &current.category_id)?;
    }
    calc::recalculate_category_weights(&tx, &category_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(
        assessment_id = %assessment_id,
        moved,
        from_category = %current.category_id,
        to_category = %category_id,
        "assessment updated"
    );
    let row = require_assessment(conn, &assessment_id)?;
    Ok(json!({
        "assessment": row_json(&row),
        "movedFromCategoryId": if moved { Some(current.category_id.clone()) } else { None },
        "summary": mutation_summary(conn, params, &current.subject_id)?
    }))
}

/// Commit a prediction row with its real grade. The stored prediction is kept
/// so accuracy can be measured later.
fn assessments_convert_prediction(conn: &Connection, params: &Value) -> HandlerResult {
    let assessment_id = req_str(params, "assessmentId")?;
    let grade = req_f64(params, "grade")?;
    let study_time = match opt_f64(params, "studyTime")? {
        Some(v) => Some(non_negative(v, "studyTime")?),
        None => None,
    };
    let current = require_assessment(conn, &assessment_id)?;
    if !current.is_prediction {
        return Err(HandlerErr::new("conflict", "assessment is not a prediction")
            .with_details(json!({ "assessmentId": assessment_id })));
    }
    let grade_lock = calc::subject_grade_lock(conn, &current.subject_id)?;
    check_grade(Some(grade), grade_lock, "grade")?;

    let predicted = current.predicted_grade.or(current.grade);
    conn.execute(
        "UPDATE assessments
         SET grade = ?, study_time = ?, is_prediction = 0, predicted_grade = ?, updated_at = ?
         WHERE id = ?",
        rusqlite::params![
            grade,
            study_time.unwrap_or(current.study_time),
            predicted,
            db::now_rfc3339(),
            &assessment_id,
        ],
    )
    .map_err(db_err("db_update_failed"))?;

    tracing::info!(assessment_id = %assessment_id, grade, "prediction converted");
    let decimals = round_decimals(conn)?;
    let row = require_assessment(conn, &assessment_id)?;
    Ok(json!({
        "assessment": row_json(&row),
        "predictionError": predicted.map(|p| round_off(grade - p, decimals)),
        "summary": mutation_summary(conn, params, &current.subject_id)?
    }))
}

fn assessments_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let assessment_id = req_str(params, "assessmentId")?;
    let current = require_assessment(conn, &assessment_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute("DELETE FROM assessments WHERE id = ?", [&assessment_id])
        .map_err(db_err("db_delete_failed"))?;
    let per_item = calc::recalculate_category_weights(&tx, &current.category_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(assessment_id = %assessment_id, category_id = %current.category_id, "assessment deleted");
    Ok(json!({
        "assessmentId": assessment_id,
        "weightPerItem": round_off(per_item, round_decimals(conn)?),
        "summary": mutation_summary(conn, params, &current.subject_id)?
    }))
}

fn assessments_bulk_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let ids = str_list(params, "assessmentIds")?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let mut touched_categories: BTreeSet<String> = BTreeSet::new();
    let mut touched_subjects: BTreeSet<String> = BTreeSet::new();
    let mut skipped: Vec<String> = Vec::new();
    let mut deleted = 0_usize;
    for id in &ids {
        let owner: Option<(String, String)> = tx
            .query_row(
                "SELECT subject_id, category_id FROM assessments WHERE id = ?",
                [id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_err("db_query_failed"))?;
        let Some((subject_id, category_id)) = owner else {
            skipped.push(id.clone());
            continue;
        };
        deleted += tx
            .execute("DELETE FROM assessments WHERE id = ?", [id])
            .map_err(db_err("db_delete_failed"))?;
        touched_subjects.insert(subject_id);
        touched_categories.insert(category_id);
    }
    for category_id in &touched_categories {
        calc::recalculate_category_weights(&tx, category_id)?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(
        deleted,
        skipped = skipped.len(),
        categories = touched_categories.len(),
        "assessments bulk deleted"
    );
    let include = include_predictions(conn, params)?;
    let mut summaries = Map::new();
    for subject_id in &touched_subjects {
        summaries.insert(
            subject_id.clone(),
            summary_json(conn, subject_id, &RecordFilters::default(), include)?,
        );
    }
    Ok(json!({
        "deleted": deleted,
        "skipped": skipped,
        "summaries": summaries
    }))
}

fn assessments_reorder(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let ordered = str_list(params, "orderedIds")?;
    require_subject(conn, &subject_id)?;

    let current_ids: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT id FROM assessments WHERE subject_id = ? ORDER BY position, rowid")
            .map_err(db_err("db_query_failed"))?;
        let ids = stmt
            .query_map([&subject_id], |row| row.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err("db_query_failed"))?;
        ids
    };

    if ordered.len() != current_ids.len() {
        return Err(HandlerErr::bad_params(
            "orderedIds must be a permutation of the subject's assessments",
        )
        .with_details(json!({ "expected": current_ids.len(), "got": ordered.len() })));
    }
    let current_set: HashSet<&str> = current_ids.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for id in &ordered {
        if !seen.insert(id.as_str()) {
            return Err(HandlerErr::bad_params("orderedIds contains duplicates")
                .with_details(json!({ "assessmentId": id })));
        }
        if !current_set.contains(id.as_str()) {
            return Err(HandlerErr::bad_params("orderedIds contains unknown assessmentId")
                .with_details(json!({ "assessmentId": id })));
        }
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    for (i, aid) in ordered.iter().enumerate() {
        tx.execute(
            "UPDATE assessments SET position = ? WHERE id = ? AND subject_id = ?",
            (i as i64, aid, &subject_id),
        )
        .map_err(|e| {
            HandlerErr::new("db_update_failed", e.to_string())
                .with_details(json!({ "table": "assessments" }))
        })?;
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;
    tracing::debug!(subject_id = %subject_id, count = ordered.len(), "assessments reordered");
    Ok(json!({ "subjectId": subject_id, "count": ordered.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "assessments.list" => assessments_list,
        "assessments.create" => assessments_create,
        "assessments.update" => assessments_update,
        "assessments.convertPrediction" => assessments_convert_prediction,
        "assessments.delete" => assessments_delete,
        "assessments.bulkDelete" => assessments_bulk_delete,
        "assessments.reorder" => assessments_reorder,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
