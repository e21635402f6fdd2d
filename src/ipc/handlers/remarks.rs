use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{
    can_manage_class, db_conn, now_rfc3339, required_str, required_term, required_year,
    user_access,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const REMARK_MAX_CHARS: usize = 600;

fn handle_remarks_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let term = match required_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(d) = check_access(&user, Some(&class_id), None) {
        return denied(&req.id, d);
    }

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.sort_order,
                r.conduct, r.interest, r.teacher_remark, r.head_remark
         FROM students s
         LEFT JOIN remarks r
           ON r.student_id = s.id
          AND r.class_id = s.class_id
          AND r.term = ?
          AND r.year = ?
         WHERE s.class_id = ? AND s.active = 1
         ORDER BY s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((term, year, &class_id), |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let sort_order: i64 = r.get(3)?;
            let conduct: Option<String> = r.get(4)?;
            let interest: Option<String> = r.get(5)?;
            let teacher_remark: Option<String> = r.get(6)?;
            let head_remark: Option<String> = r.get(7)?;
            Ok(json!({
                "studentId": id,
                "studentName": format!("{}, {}", last, first),
                "sortOrder": sort_order,
                "conduct": conduct,
                "interest": interest,
                "teacherRemark": teacher_remark,
                "headRemark": head_remark
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(remarks) => ok(
            &req.id,
            json!({
                "classId": class_id,
                "term": term,
                "year": year,
                "remarks": remarks
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn remark_field(
    req: &Request,
    patch: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<Option<String>>, serde_json::Value> {
    let Some(value) = patch.get(key) else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(Some(None));
    }
    let Some(s) = value.as_str() else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be string or null", key),
            None,
        ));
    };
    let s = s.trim();
    if s.len() > REMARK_MAX_CHARS {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} length must be <= {}", key, REMARK_MAX_CHARS),
            None,
        ));
    }
    Ok(Some(Some(s.to_string())))
}

fn handle_remarks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !can_manage_class(&user, &class_id) {
        return err(
            &req.id,
            "forbidden",
            "only an admin or the class teacher may write remarks",
            None,
        );
    }

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    for key in patch.keys() {
        if !matches!(
            key.as_str(),
            "conduct" | "interest" | "teacherRemark" | "headRemark"
        ) {
            return err(&req.id, "bad_params", format!("unknown field: {}", key), None);
        }
    }

    let conduct = match remark_field(req, patch, "conduct") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let interest = match remark_field(req, patch, "interest") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_remark = match remark_field(req, patch, "teacherRemark") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let head_remark = match remark_field(req, patch, "headRemark") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if head_remark.is_some() && !user.role.is_admin_level() {
        return err(
            &req.id,
            "forbidden",
            "headRemark requires an admin-level role",
            None,
        );
    }

    let in_class: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_class.is_none() {
        return err(&req.id, "not_found", "student not in class", None);
    }

    let remark_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO remarks(id, class_id, student_id, term, year, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, term, year) DO NOTHING",
        (&remark_id, &class_id, &student_id, term, year, now_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "remarks" })),
        );
    }

    let updates: [(&str, &Option<Option<String>>); 4] = [
        ("conduct", &conduct),
        ("interest", &interest),
        ("teacher_remark", &teacher_remark),
        ("head_remark", &head_remark),
    ];
    for (column, value) in updates {
        let Some(v) = value else {
            continue;
        };
        let sql = format!(
            "UPDATE remarks SET {} = ?, updated_at = ?
             WHERE class_id = ? AND student_id = ? AND term = ? AND year = ?",
            column
        );
        if let Err(e) = conn.execute(
            &sql,
            (
                v.as_deref(),
                now_rfc3339(),
                &class_id,
                &student_id,
                term,
                year,
            ),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "remarks.get" => Some(handle_remarks_get(state, req)),
        "remarks.upsert" => Some(handle_remarks_upsert(state, req)),
        _ => None,
    }
}
