use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_admin_level, required_str, user_access};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope = match check_access(&user, None, None) {
        Ok(v) => v,
        Err(d) => return denied(&req.id, d),
    };

    // Counts let the UI render a dashboard without extra round trips.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.form_level,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM teacher_classes tc WHERE tc.class_id = c.id) AS teacher_count
         FROM classes c
         ORDER BY c.sort_order, c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let form_level: Option<i64> = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let teacher_count: i64 = row.get(4)?;
            Ok((id, name, form_level, student_count, teacher_count))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let classes: Vec<serde_json::Value> = all
                .into_iter()
                .filter(|(id, _, _, _, _)| scope.allows_class(id))
                .map(|(id, name, form_level, student_count, teacher_count)| {
                    json!({
                        "id": id,
                        "name": name,
                        "formLevel": form_level,
                        "studentCount": student_count,
                        "teacherCount": teacher_count
                    })
                })
                .collect();
            ok(&req.id, json!({ "classes": classes }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let form_level = req.params.get("formLevel").and_then(|v| v.as_i64());
    let sort_order = req
        .params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, form_level, sort_order) VALUES(?, ?, ?, ?)",
        (&class_id, &name, form_level, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    if let Some(name) = optional_str(req, "name") {
        let name = name.trim().to_string();
        if name.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE classes SET name = ? WHERE id = ?",
            (&name, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = req.params.get("formLevel") {
        let form_level = v.as_i64();
        if let Err(e) = conn.execute(
            "UPDATE classes SET form_level = ? WHERE id = ?",
            (form_level, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = req.params.get("sortOrder").and_then(|v| v.as_i64()) {
        if let Err(e) = conn.execute(
            "UPDATE classes SET sort_order = ? WHERE id = ?",
            (v, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit deletes in dependency order; no ON DELETE CASCADE in the schema.
    if let Err(e) = tx.execute(
        "DELETE FROM assessment_scores
         WHERE assessment_id IN (SELECT id FROM assessments WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessment_scores" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM assessments WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM marks WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM remarks WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "remarks" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM teacher_classes WHERE class_id = ?",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_classes" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM students WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
