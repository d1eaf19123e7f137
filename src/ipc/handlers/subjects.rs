use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db;
use crate::ipc::helpers::{
    db_err, opt_bool, req_bool, req_str, require_subject, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};

const NAME_MAX: usize = 120;

fn check_name(name: &str) -> Result<(), HandlerErr> {
    if name.chars().count() > NAME_MAX {
        return Err(HandlerErr::bad_params(format!(
            "name length must be <= {}",
            NAME_MAX
        )));
    }
    Ok(())
}

/// Subject names are unique case-insensitively.
fn name_taken(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE lower(name) = lower(?) AND id <> COALESCE(?, '')",
            (name, except_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(found.is_some())
}

fn subjects_list(conn: &Connection, params: &Value) -> HandlerResult {
    let include_retired = opt_bool(params, "includeRetired")?.unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.grade_lock, s.is_retired, s.created_at,
                    (SELECT COUNT(*) FROM categories c WHERE c.subject_id = s.id),
                    (SELECT COUNT(*) FROM assessments a WHERE a.subject_id = s.id AND a.is_prediction = 0),
                    (SELECT COUNT(*) FROM assessments a WHERE a.subject_id = s.id AND a.is_prediction = 1)
             FROM subjects s
             WHERE (? = 1 OR s.is_retired = 0)
             ORDER BY s.name COLLATE NOCASE",
        )
        .map_err(db_err("db_query_failed"))?;
    let subjects = stmt
        .query_map([include_retired as i64], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let grade_lock: i64 = row.get(2)?;
            let is_retired: i64 = row.get(3)?;
            let created_at: String = row.get(4)?;
            let category_count: i64 = row.get(5)?;
            let assessment_count: i64 = row.get(6)?;
            let prediction_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "gradeLock": grade_lock != 0,
                "isRetired": is_retired != 0,
                "createdAt": created_at,
                "categoryCount": category_count,
                "assessmentCount": assessment_count,
                "predictionCount": prediction_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = req_str(params, "name")?;
    check_name(&name)?;
    let grade_lock = opt_bool(params, "gradeLock")?.unwrap_or(true);
    if name_taken(conn, &name, None)? {
        return Err(HandlerErr::new("conflict", "a subject with that name already exists")
            .with_details(json!({ "name": name })));
    }

    let subject_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, name, grade_lock, is_retired, created_at) VALUES(?, ?, ?, 0, ?)",
        (&subject_id, &name, grade_lock as i64, db::now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "subjects" }))
    })?;
    tracing::info!(subject_id = %subject_id, name = %name, "subject created");
    Ok(json!({ "subjectId": subject_id, "name": name, "gradeLock": grade_lock }))
}

fn subjects_rename(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let name = req_str(params, "name")?;
    check_name(&name)?;
    require_subject(conn, &subject_id)?;
    if name_taken(conn, &name, Some(&subject_id))? {
        return Err(HandlerErr::new("conflict", "a subject with that name already exists")
            .with_details(json!({ "name": name })));
    }
    // Categories and assessments reference the subject by id, so they follow.
    conn.execute(
        "UPDATE subjects SET name = ? WHERE id = ?",
        (&name, &subject_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tracing::info!(subject_id = %subject_id, name = %name, "subject renamed");
    Ok(json!({ "subjectId": subject_id, "name": name }))
}

fn subjects_set_grade_lock(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let grade_lock = req_bool(params, "gradeLock")?;
    require_subject(conn, &subject_id)?;
    conn.execute(
        "UPDATE subjects SET grade_lock = ? WHERE id = ?",
        (grade_lock as i64, &subject_id),
    )
    .map_err(db_err("db_update_failed"))?;

    // Existing grades above 100 are kept; the count lets the caller flag them.
    let above: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM assessments WHERE subject_id = ? AND grade > 100",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    Ok(json!({
        "subjectId": subject_id,
        "gradeLock": grade_lock,
        "gradesAboveCeiling": if grade_lock { above } else { 0 }
    }))
}

fn set_retired(conn: &Connection, params: &Value, retired: bool) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;
    conn.execute(
        "UPDATE subjects SET is_retired = ? WHERE id = ?",
        (retired as i64, &subject_id),
    )
    .map_err(db_err("db_update_failed"))?;
    tracing::info!(subject_id = %subject_id, retired, "subject retirement changed");
    Ok(json!({ "subjectId": subject_id, "isRetired": retired }))
}

fn subjects_retire(conn: &Connection, params: &Value) -> HandlerResult {
    set_retired(conn, params, true)
}

fn subjects_unretire(conn: &Connection, params: &Value) -> HandlerResult {
    set_retired(conn, params, false)
}

fn subjects_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let deleted_assessments = tx
        .execute("DELETE FROM assessments WHERE subject_id = ?", [&subject_id])
        .map_err(db_err("db_delete_failed"))?;
    let deleted_categories = tx
        .execute("DELETE FROM categories WHERE subject_id = ?", [&subject_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(
        subject_id = %subject_id,
        deleted_assessments,
        deleted_categories,
        "subject deleted"
    );
    Ok(json!({
        "subjectId": subject_id,
        "deletedAssessments": deleted_assessments,
        "deletedCategories": deleted_categories
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "subjects.list" => subjects_list,
        "subjects.create" => subjects_create,
        "subjects.rename" => subjects_rename,
        "subjects.setGradeLock" => subjects_set_grade_lock,
        "subjects.retire" => subjects_retire,
        "subjects.unretire" => subjects_unretire,
        "subjects.delete" => subjects_delete,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
