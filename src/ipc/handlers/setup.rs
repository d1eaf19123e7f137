use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::predict::PredictionConfig;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Prediction,
    Display,
}

impl SetupSection {
    const ALL: [SetupSection; 2] = [Self::Prediction, Self::Display];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "prediction" => Some(Self::Prediction),
            "display" => Some(Self::Display),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Prediction => "prediction",
            Self::Display => "display",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Prediction => "setup.prediction",
            Self::Display => "setup.display",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Prediction => {
            let d = PredictionConfig::default();
            json!({
                "trimFraction": d.trim_fraction,
                "gradeCapRatio": d.grade_cap_ratio,
                "minHistory": d.min_history,
                "fallbackToSubjectHistory": d.fallback_to_subject_history,
                "roundDecimals": d.round_decimals
            })
        }
        SetupSection::Display => json!({
            "includePredictionsByDefault": false,
            "weightTolerance": 0.01
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Prediction => match k.as_str() {
                "trimFraction" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 0.5)?));
                }
                "gradeCapRatio" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.9, 0.999)?));
                }
                "minHistory" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
                }
                "fallbackToSubjectHistory" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "roundDecimals" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 4)?));
                }
                _ => return Err(format!("unknown prediction field: {}", k)),
            },
            SetupSection::Display => match k.as_str() {
                "includePredictionsByDefault" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "weightTolerance" => {
                    obj.insert(k.clone(), Value::from(parse_f64_range(v, k, 0.0, 5.0)?));
                }
                _ => return Err(format!("unknown display field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Stale fields from older builds are ignored rather than failing the load.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                tracing::warn!(section = section.name(), error = %msg, "ignoring invalid saved setting");
            }
        }
    }
    Ok(current)
}

pub fn prediction_config(conn: &rusqlite::Connection) -> Result<PredictionConfig, HandlerErr> {
    let section = load_section(conn, SetupSection::Prediction)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(PredictionConfig::from_section(&section))
}

#[derive(Debug, Clone, Copy)]
pub struct DisplaySettings {
    pub include_predictions_by_default: bool,
    pub weight_tolerance: f64,
}

pub fn display_settings(conn: &rusqlite::Connection) -> Result<DisplaySettings, HandlerErr> {
    let section = load_section(conn, SetupSection::Display)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(DisplaySettings {
        include_predictions_by_default: section
            .get("includePredictionsByDefault")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        weight_tolerance: section
            .get("weightTolerance")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.01),
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut out = Map::new();
    for section in SetupSection::ALL {
        match load_section(conn, section) {
            Ok(v) => {
                out.insert(section.name().to_string(), v);
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    ok(&req.id, Value::Object(out))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown section",
            Some(json!({ "section": section_raw })),
        );
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = section.name(), "settings updated");
    ok(&req.id, json!({ "section": section.name(), "value": current }))
}

/// Drop saved values for one section, or all of them, so reads fall back to defaults.
fn handle_setup_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let sections: Vec<SetupSection> = match req.params.get("section").and_then(|v| v.as_str()) {
        Some(raw) => match SetupSection::parse(raw) {
            Some(s) => vec![s],
            None => return err(&req.id, "bad_params", "unknown section", None),
        },
        None => SetupSection::ALL.to_vec(),
    };
    for section in &sections {
        if let Err(e) = conn
            .execute("DELETE FROM workspace_settings WHERE key = ?", [section.key()])
            .map_err(db_err("db_delete_failed"))
        {
            return e.response(&req.id);
        }
    }
    let names: Vec<&str> = sections.iter().map(|s| s.name()).collect();
    ok(&req.id, json!({ "reset": names }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        "setup.reset" => Some(handle_setup_reset(state, req)),
        _ => None,
    }
}
