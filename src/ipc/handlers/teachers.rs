use crate::access::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_rfc3339, optional_str, require_admin_level, required_str, user_access,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn load_assignment_map(
    conn: &Connection,
    table: &str,
    value_column: &str,
) -> Result<HashMap<String, Vec<String>>, rusqlite::Error> {
    let sql = format!(
        "SELECT teacher_id, {} FROM {} ORDER BY teacher_id, {}",
        value_column, table, value_column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| {
            let teacher_id: String = r.get(0)?;
            let value: String = r.get(1)?;
            Ok((teacher_id, value))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (teacher_id, value) in rows {
        map.entry(teacher_id).or_default().push(value);
    }
    Ok(map)
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = user_access(req) {
        return e;
    }

    let class_map = match load_assignment_map(conn, "teacher_classes", "class_id") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subject_map = match load_assignment_map(conn, "teacher_subjects", "subject_id") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, email, role, active
         FROM teachers
         ORDER BY last_name, first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let last_name: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let email: Option<String> = r.get(3)?;
            let role: String = r.get(4)?;
            let active: i64 = r.get(5)?;
            Ok((id, last_name, first_name, email, role, active != 0))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let teachers: Vec<serde_json::Value> = all
                .into_iter()
                .map(|(id, last_name, first_name, email, role, active)| {
                    let classes = class_map.get(&id).cloned().unwrap_or_default();
                    let subjects = subject_map.get(&id).cloned().unwrap_or_default();
                    json!({
                        "id": id,
                        "lastName": last_name,
                        "firstName": first_name,
                        "email": email,
                        "role": role,
                        "active": active,
                        "assignedClasses": classes,
                        "assignedSubjects": subjects
                    })
                })
                .collect();
            ok(&req.id, json!({ "teachers": teachers }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let last_name = match required_str(req, "lastName") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if last_name.is_empty() || first_name.is_empty() {
        return err(&req.id, "bad_params", "names must not be empty", None);
    }
    let role_raw = match required_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(role) = Role::parse(&role_raw) else {
        return err(
            &req.id,
            "bad_params",
            "unknown role",
            Some(json!({ "role": role_raw })),
        );
    };
    let email = optional_str(req, "email").map(|e| e.trim().to_string());

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, last_name, first_name, email, role, active, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &teacher_id,
            &last_name,
            &first_name,
            &email,
            role.as_str(),
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    for (key, value) in patch {
        let result = match key.as_str() {
            "lastName" | "firstName" => {
                let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("{} must be a non-empty string", key),
                        None,
                    );
                };
                let column = if key == "lastName" {
                    "last_name"
                } else {
                    "first_name"
                };
                conn.execute(
                    &format!("UPDATE teachers SET {} = ?, updated_at = ? WHERE id = ?", column),
                    (s, now_rfc3339(), &teacher_id),
                )
            }
            "email" => conn.execute(
                "UPDATE teachers SET email = ?, updated_at = ? WHERE id = ?",
                (value.as_str(), now_rfc3339(), &teacher_id),
            ),
            "role" => {
                let Some(role) = value.as_str().and_then(Role::parse) else {
                    return err(&req.id, "bad_params", "unknown role", None);
                };
                conn.execute(
                    "UPDATE teachers SET role = ?, updated_at = ? WHERE id = ?",
                    (role.as_str(), now_rfc3339(), &teacher_id),
                )
            }
            "active" => {
                let Some(b) = value.as_bool() else {
                    return err(&req.id, "bad_params", "active must be boolean", None);
                };
                conn.execute(
                    "UPDATE teachers SET active = ?, updated_at = ? WHERE id = ?",
                    (b as i64, now_rfc3339(), &teacher_id),
                )
            }
            _ => return err(&req.id, "bad_params", format!("unknown field: {}", key), None),
        };
        if let Err(e) = result {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM teacher_classes WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_classes" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_subjects" })),
        );
    }
    let deleted = match tx.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "teacher not found", None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn string_list(req: &Request, key: &str) -> Result<Vec<String>, serde_json::Value> {
    let Some(items) = req.params.get(key).and_then(|v| v.as_array()) else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an array", key),
            None,
        ));
    };
    let mut out = Vec::new();
    for item in items {
        let Some(s) = item.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} must contain non-empty strings", key),
                None,
            ));
        };
        let owned = s.to_string();
        if !out.contains(&owned) {
            out.push(owned);
        }
    }
    Ok(out)
}

/// Replaces both assignment sets in one transaction so a teacher's access
/// never reflects a half-applied change.
fn handle_assignments_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_ids = match string_list(req, "classIds") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_ids = match string_list(req, "subjectIds") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    for class_id in &class_ids {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(
                &req.id,
                "not_found",
                "class not found",
                Some(json!({ "classId": class_id })),
            );
        }
    }
    for subject_id in &subject_ids {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(
                &req.id,
                "not_found",
                "subject not found",
                Some(json!({ "subjectId": subject_id })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM teacher_classes WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "DELETE FROM teacher_subjects WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for class_id in &class_ids {
        if let Err(e) = tx.execute(
            "INSERT INTO teacher_classes(teacher_id, class_id) VALUES(?, ?)",
            (&teacher_id, class_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    for subject_id in &subject_ids {
        if let Err(e) = tx.execute(
            "INSERT INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
            (&teacher_id, subject_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "teacherId": teacher_id,
            "assignedClasses": class_ids,
            "assignedSubjects": subject_ids
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        "teachers.assignments.set" => Some(handle_assignments_set(state, req)),
        _ => None,
    }
}
