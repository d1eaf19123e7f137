use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::calc::{self, round_off};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    db_err, mutation_summary, non_negative, opt_bool, opt_str, req_f64, req_str,
    require_category, require_subject, round_decimals, with_conn, HandlerErr, HandlerResult,
};
use crate::ipc::types::{AppState, Request};

fn name_taken(
    conn: &Connection,
    subject_id: &str,
    name: &str,
    except_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM categories
             WHERE subject_id = ? AND lower(name) = lower(?) AND id <> COALESCE(?, '')",
            (subject_id, name, except_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    Ok(found.is_some())
}

fn subject_category_weights(conn: &Connection, subject_id: &str) -> Result<Vec<f64>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT total_weight FROM categories WHERE subject_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let weights = stmt
        .query_map([subject_id], |r| r.get::<_, f64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    Ok(weights)
}

/// Category totals versus 100%. Never blocks a save; only reported.
fn advisory_json(conn: &Connection, subject_id: &str) -> HandlerResult {
    let tolerance = setup::display_settings(conn)?.weight_tolerance;
    let decimals = round_decimals(conn)?;
    let advisory = calc::weight_advisory(subject_category_weights(conn, subject_id)?, tolerance);
    Ok(json!({
        "totalWeight": round_off(advisory.total_weight, decimals),
        "remainingWeight": round_off(advisory.remaining_weight, decimals),
        "balanced": advisory.balanced,
        "warning": calc::advisory_warning(&advisory)
    }))
}

fn categories_list(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    require_subject(conn, &subject_id)?;
    let decimals = round_decimals(conn)?;

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name, c.total_weight, c.default_name, c.sort_order,
                    (SELECT COUNT(*) FROM assessments a WHERE a.category_id = c.id)
             FROM categories c
             WHERE c.subject_id = ?
             ORDER BY c.sort_order",
        )
        .map_err(db_err("db_query_failed"))?;
    let categories = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let total_weight: f64 = row.get(2)?;
            let default_name: Option<String> = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            let item_count: i64 = row.get(5)?;
            let n = item_count.max(0) as usize;
            let per_item = (n > 0).then(|| round_off(calc::category_weight(total_weight, n), decimals));
            Ok(json!({
                "id": id,
                "name": name,
                "totalWeight": total_weight,
                "defaultName": default_name,
                "sortOrder": sort_order,
                "itemCount": item_count,
                "weightPerItem": per_item,
                "weightDisplay": calc::weight_display(total_weight, n, decimals)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    Ok(json!({
        "categories": categories,
        "advisory": advisory_json(conn, &subject_id)?
    }))
}

fn categories_create(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let name = req_str(params, "name")?;
    let total_weight = non_negative(req_f64(params, "totalWeight")?, "totalWeight")?;
    let default_name = opt_str(params, "defaultName")?.filter(|s| !s.is_empty());
    require_subject(conn, &subject_id)?;
    if name_taken(conn, &subject_id, &name, None)? {
        return Err(HandlerErr::new("conflict", "category name already used in this subject")
            .with_details(json!({ "name": name })));
    }

    let sort_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM categories WHERE subject_id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .map_err(db_err("db_query_failed"))?;
    let category_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO categories(id, subject_id, name, total_weight, default_name, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &category_id,
            &subject_id,
            &name,
            total_weight,
            &default_name,
            sort_order,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "categories" }))
    })?;
    tracing::info!(subject_id = %subject_id, category_id = %category_id, total_weight, "category created");

    Ok(json!({
        "categoryId": category_id,
        "sortOrder": sort_order,
        "advisory": advisory_json(conn, &subject_id)?
    }))
}

fn categories_update(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let category_id = req_str(params, "categoryId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    require_subject(conn, &subject_id)?;
    let current = require_category(conn, &subject_id, &category_id)?;

    let mut name = current.name.clone();
    let mut total_weight = current.total_weight;
    let mut default_name = current.default_name.clone();
    for k in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        match k.as_str() {
            "name" => name = req_str(patch, k)?,
            "totalWeight" => total_weight = non_negative(req_f64(patch, k)?, k)?,
            "defaultName" => default_name = opt_str(patch, k)?.filter(|s| !s.is_empty()),
            _ => return Err(HandlerErr::bad_params(format!("unknown category field: {}", k))),
        }
    }
    if name != current.name && name_taken(conn, &subject_id, &name, Some(&category_id))? {
        return Err(HandlerErr::new("conflict", "category name already used in this subject")
            .with_details(json!({ "name": name })));
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "UPDATE categories SET name = ?, total_weight = ?, default_name = ? WHERE id = ?",
        (&name, total_weight, &default_name, &category_id),
    )
    .map_err(db_err("db_update_failed"))?;

    // Auto-generated names follow a changed template; hand-typed names are left alone.
    // Without a default name, the category name is the template.
    let old_t = current.default_name.as_deref().unwrap_or(&current.name);
    let new_t = default_name.as_deref().unwrap_or(&name);
    let mut renamed = 0_usize;
    if old_t != new_t {
        let rows: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare("SELECT id, assignment_name FROM assessments WHERE category_id = ?")
                .map_err(db_err("db_query_failed"))?;
            let rows = stmt
                .query_map([&category_id], |r| Ok((r.get(0)?, r.get(1)?)))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(db_err("db_query_failed"))?;
            rows
        };
        for (aid, old_name) in rows {
            let Some(new_name) = calc::rename_by_template(&old_name, old_t, new_t) else {
                continue;
            };
            tx.execute(
                "UPDATE assessments SET assignment_name = ?, updated_at = ? WHERE id = ?",
                (&new_name, crate::db::now_rfc3339(), &aid),
            )
            .map_err(db_err("db_update_failed"))?;
            renamed += 1;
        }
    }
    let per_item = calc::recalculate_category_weights(&tx, &category_id)?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(
        category_id = %category_id,
        total_weight,
        renamed,
        weight_per_item = per_item,
        "category updated"
    );
    let decimals = round_decimals(conn)?;
    Ok(json!({
        "categoryId": category_id,
        "renamedAssessments": renamed,
        "weightPerItem": round_off(per_item, decimals),
        "advisory": advisory_json(conn, &subject_id)?,
        "summary": mutation_summary(conn, params, &subject_id)?
    }))
}

fn categories_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let category_id = req_str(params, "categoryId")?;
    let force = opt_bool(params, "force")?.unwrap_or(false);
    require_subject(conn, &subject_id)?;
    require_category(conn, &subject_id, &category_id)?;

    let item_count = calc::category_item_count(conn, &category_id, None)?;
    if item_count > 0 && !force {
        return Err(HandlerErr::new(
            "conflict",
            "category still has assessments; pass force to delete them too",
        )
        .with_details(json!({ "itemCount": item_count })));
    }

    let tx = conn.unchecked_transaction().map_err(db_err("db_tx_failed"))?;
    let deleted = tx
        .execute("DELETE FROM assessments WHERE category_id = ?", [&category_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM categories WHERE id = ?", [&category_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    tracing::info!(category_id = %category_id, deleted_assessments = deleted, "category deleted");
    Ok(json!({
        "categoryId": category_id,
        "deletedAssessments": deleted,
        "advisory": advisory_json(conn, &subject_id)?,
        "summary": mutation_summary(conn, params, &subject_id)?
    }))
}

/// Next free name from the category template, skipping names already in use.
pub(crate) fn next_default_name(
    conn: &Connection,
    category_id: &str,
    template: &str,
) -> Result<(String, i64), HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT lower(assignment_name) FROM assessments WHERE category_id = ?")
        .map_err(db_err("db_query_failed"))?;
    let taken: std::collections::HashSet<String> = stmt
        .query_map([category_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<_, _>>())
        .map_err(db_err("db_query_failed"))?;
    let mut seq = taken.len() as i64 + 1;
    loop {
        let candidate = calc::apply_name_template(template, &seq.to_string());
        if !taken.contains(&candidate.to_ascii_lowercase()) {
            return Ok((candidate, seq));
        }
        seq += 1;
    }
}

fn categories_next_default_name(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let category_id = req_str(params, "categoryId")?;
    require_subject(conn, &subject_id)?;
    let category = require_category(conn, &subject_id, &category_id)?;
    let template = category
        .default_name
        .clone()
        .unwrap_or_else(|| category.name.clone());
    let (name, seq) = next_default_name(conn, &category_id, &template)?;
    Ok(json!({ "name": name, "sequence": seq, "template": template }))
}

/// Per-item weight as it would be after adding one item, or after moving
/// `assessmentId` into this category.
fn categories_weight_preview(conn: &Connection, params: &Value) -> HandlerResult {
    let subject_id = req_str(params, "subjectId")?;
    let category_id = req_str(params, "categoryId")?;
    let assessment_id = opt_str(params, "assessmentId")?.filter(|s| !s.is_empty());
    require_subject(conn, &subject_id)?;
    let category = require_category(conn, &subject_id, &category_id)?;

    let count = match assessment_id.as_deref() {
        Some(aid) => {
            if calc::load_assessment(conn, aid)?.is_none() {
                return Err(HandlerErr::not_found("assessment not found"));
            }
            // Siblings other than the moving item, plus the item itself.
            calc::category_item_count(conn, &category_id, Some(aid))? + 1
        }
        None => calc::category_item_count(conn, &category_id, None)? + 1,
    };
    let decimals = round_decimals(conn)?;
    Ok(json!({
        "categoryId": category_id,
        "itemCount": count,
        "weightPerItem": round_off(calc::category_weight(category.total_weight, count), decimals),
        "weightDisplay": calc::weight_display(category.total_weight, count, decimals)
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Connection, &Value) -> HandlerResult = match req.method.as_str() {
        "categories.list" => categories_list,
        "categories.create" => categories_create,
        "categories.update" => categories_update,
        "categories.delete" => categories_delete,
        "categories.nextDefaultName" => categories_next_default_name,
        "categories.weightPreview" => categories_weight_preview,
        _ => return None,
    };
    Some(with_conn(state, req, f))
}
