use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, require_admin_level, required_str, user_access};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SettingsSection {
    School,
    Grading,
    Term,
}

impl SettingsSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "grading" => Some(Self::Grading),
            "term" => Some(Self::Term),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "settings.school",
            Self::Grading => "settings.grading",
            Self::Term => "settings.term",
        }
    }
}

fn default_section(section: SettingsSection) -> Value {
    match section {
        SettingsSection::School => json!({
            "name": "",
            "motto": "",
            "address": "",
            "phone": "",
            "headTeacherName": ""
        }),
        SettingsSection::Grading => json!({
            "bands": [
                { "min": 80, "grade": "A", "descriptor": "Excellent" },
                { "min": 70, "grade": "B", "descriptor": "Very Good" },
                { "min": 60, "grade": "C", "descriptor": "Good" },
                { "min": 50, "grade": "D", "descriptor": "Credit" },
                { "min": 40, "grade": "E", "descriptor": "Pass" },
                { "min": 0, "grade": "F", "descriptor": "Fail" }
            ]
        }),
        SettingsSection::Term => json!({
            "currentTerm": 1,
            "currentYear": 2024,
            "termLabel": ""
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_bands(v: &Value) -> Result<Value, String> {
    let items = v.as_array().ok_or("bands must be an array")?;
    if items.is_empty() {
        return Err("bands must not be empty".to_string());
    }
    let mut out = Vec::with_capacity(items.len());
    let mut prev_min: Option<f64> = None;
    for item in items {
        let obj = item.as_object().ok_or("bands entries must be objects")?;
        let min = obj
            .get("min")
            .and_then(|m| m.as_f64())
            .ok_or("bands[].min must be numeric")?;
        if !(0.0..=100.0).contains(&min) {
            return Err("bands[].min must be in 0..=100".to_string());
        }
        if let Some(prev) = prev_min {
            if min >= prev {
                return Err("bands[].min must be strictly descending".to_string());
            }
        }
        prev_min = Some(min);
        let grade = obj
            .get("grade")
            .map(|g| parse_string_max(g, "bands[].grade", 4))
            .transpose()?
            .filter(|g| !g.is_empty())
            .ok_or("bands[].grade must be a non-empty string")?;
        let descriptor = match obj.get("descriptor") {
            None => String::new(),
            Some(d) => parse_string_max(d, "bands[].descriptor", 40)?,
        };
        out.push(json!({ "min": min, "grade": grade, "descriptor": descriptor }));
    }
    Ok(Value::Array(out))
}

fn merge_section_patch(
    section: SettingsSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SettingsSection::School => match k.as_str() {
                "name" | "motto" | "headTeacherName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 240)?));
                }
                "phone" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SettingsSection::Grading => match k.as_str() {
                "bands" => {
                    obj.insert(k.clone(), parse_bands(v)?);
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SettingsSection::Term => match k.as_str() {
                "currentTerm" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 3)?));
                }
                "currentYear" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1970, 2100)?));
                }
                "termLabel" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 40)?));
                }
                _ => return Err(format!("unknown term field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SettingsSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values must not block the settings UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Grading bands as (cutoff, grade) pairs, descending. Used wherever a total
/// needs a letter grade attached.
pub fn grading_bands(conn: &rusqlite::Connection) -> anyhow::Result<Vec<(f64, String)>> {
    let section = load_section(conn, SettingsSection::Grading)?;
    let mut bands = Vec::new();
    if let Some(items) = section.get("bands").and_then(|b| b.as_array()) {
        for item in items {
            let min = item.get("min").and_then(|m| m.as_f64()).unwrap_or(0.0);
            let grade = item
                .get("grade")
                .and_then(|g| g.as_str())
                .unwrap_or("")
                .to_string();
            bands.push((min, grade));
        }
    }
    Ok(bands)
}

pub fn grade_for(bands: &[(f64, String)], total: f64) -> String {
    for (min, grade) in bands {
        if total >= *min {
            return grade.clone();
        }
    }
    bands
        .last()
        .map(|(_, g)| g.clone())
        .unwrap_or_default()
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = user_access(req) {
        return e;
    }

    let school = match load_section(conn, SettingsSection::School) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grading = match load_section(conn, SettingsSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let term = match load_section(conn, SettingsSection::Term) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "school": school,
            "grading": grading,
            "term": term
        }),
    )
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin_level(req, &user) {
        return e;
    }

    let section_raw = match required_str(req, "section") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(section) = SettingsSection::parse(&section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
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
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
