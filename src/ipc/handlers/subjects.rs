use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_admin_level, required_str, user_access};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT id, name, code, sort_order FROM subjects ORDER BY sort_order, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let code: Option<String> = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            Ok((id, name, code, sort_order))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let subjects: Vec<serde_json::Value> = all
                .into_iter()
                .filter(|(id, _, _, _)| scope.allows_subject(id))
                .map(|(id, name, code, sort_order)| {
                    json!({
                        "id": id,
                        "name": name,
                        "code": code,
                        "sortOrder": sort_order
                    })
                })
                .collect();
            ok(&req.id, json!({ "subjects": subjects }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let code = optional_str(req, "code").map(|c| c.trim().to_ascii_uppercase());
    let sort_order = req
        .params
        .get("sortOrder")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, code, sort_order) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, &code, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    if let Some(name) = optional_str(req, "name") {
        let name = name.trim().to_string();
        if name.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (&name, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(code) = optional_str(req, "code") {
        let code = code.trim().to_ascii_uppercase();
        if let Err(e) = conn.execute(
            "UPDATE subjects SET code = ? WHERE id = ?",
            (&code, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(v) = req.params.get("sortOrder").and_then(|v| v.as_i64()) {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET sort_order = ? WHERE id = ?",
            (v, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM assessment_scores
         WHERE assessment_id IN (SELECT id FROM assessments WHERE subject_id = ?)",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessment_scores" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM assessments WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM marks WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM teacher_subjects WHERE subject_id = ?",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "teacher_subjects" })),
        );
    }

    let deleted = match tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "subject not found", None);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
