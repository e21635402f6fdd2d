use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{
    can_manage_class, db_conn, now_rfc3339, optional_str, required_str, user_access,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct StudentRow {
    id: String,
    class_id: String,
    last_name: String,
    first_name: String,
    gender: Option<String>,
    active: bool,
    sort_order: i64,
}

fn student_json(s: &StudentRow) -> serde_json::Value {
    json!({
        "id": s.id,
        "classId": s.class_id,
        "lastName": s.last_name,
        "firstName": s.first_name,
        "gender": s.gender,
        "active": s.active,
        "sortOrder": s.sort_order
    })
}

fn class_of_student(
    conn: &Connection,
    req: &Request,
    student_id: &str,
) -> Result<String, serde_json::Value> {
    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    class_id.ok_or_else(|| err(&req.id, "not_found", "student not found", None))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = optional_str(req, "classId");
    let scope = match check_access(&user, class_id.as_deref(), None) {
        Ok(v) => v,
        Err(d) => return denied(&req.id, d),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, class_id, last_name, first_name, gender, active, sort_order
         FROM students
         ORDER BY class_id, sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
                gender: r.get(4)?,
                active: r.get::<_, i64>(5)? != 0,
                sort_order: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let students: Vec<serde_json::Value> = all
                .iter()
                .filter(|s| match class_id.as_deref() {
                    Some(cid) => s.class_id == cid,
                    None => scope.allows_class(&s.class_id),
                })
                .map(student_json)
                .collect();
            ok(&req.id, json!({ "students": students }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !can_manage_class(&user, &class_id) {
        return err(
            &req.id,
            "forbidden",
            "only an admin or the class teacher may manage students",
            None,
        );
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
    let gender = optional_str(req, "gender");
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, gender, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            &gender,
            active as i64,
            next_sort,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match class_of_student(conn, req, &student_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !can_manage_class(&user, &class_id) {
        return err(
            &req.id,
            "forbidden",
            "only an admin or the class teacher may manage students",
            None,
        );
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
                    &format!("UPDATE students SET {} = ?, updated_at = ? WHERE id = ?", column),
                    (s, now_rfc3339(), &student_id),
                )
            }
            "gender" => conn.execute(
                "UPDATE students SET gender = ?, updated_at = ? WHERE id = ?",
                (value.as_str(), now_rfc3339(), &student_id),
            ),
            "active" => {
                let Some(b) = value.as_bool() else {
                    return err(&req.id, "bad_params", "active must be boolean", None);
                };
                conn.execute(
                    "UPDATE students SET active = ?, updated_at = ? WHERE id = ?",
                    (b as i64, now_rfc3339(), &student_id),
                )
            }
            "sortOrder" => {
                let Some(n) = value.as_i64() else {
                    return err(&req.id, "bad_params", "sortOrder must be integer", None);
                };
                conn.execute(
                    "UPDATE students SET sort_order = ?, updated_at = ? WHERE id = ?",
                    (n, now_rfc3339(), &student_id),
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

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match class_of_student(conn, req, &student_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !can_manage_class(&user, &class_id) {
        return err(
            &req.id,
            "forbidden",
            "only an admin or the class teacher may manage students",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM assessment_scores WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessment_scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM marks WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM remarks WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "remarks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
