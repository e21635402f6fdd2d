use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{
    db_conn, now_rfc3339, required_str, required_term, required_year, user_access,
};
use crate::ipc::types::{AppState, Request};
use crate::rank::{assign_positions, coerce_total, ScoreRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const MARKS_UPSERT_MAX_ROWS: usize = 2000;

struct MarkRow {
    student_id: String,
    last_name: String,
    first_name: String,
    sort_order: i64,
    class_score: Option<f64>,
    exam_score: Option<f64>,
    total: Option<f64>,
}

fn load_subject_marks(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
    term: i64,
    year: i64,
) -> Result<Vec<MarkRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.sort_order,
                m.class_score, m.exam_score, m.total
         FROM students s
         LEFT JOIN marks m
           ON m.student_id = s.id
          AND m.class_id = s.class_id
          AND m.subject_id = ?
          AND m.term = ?
          AND m.year = ?
         WHERE s.class_id = ? AND s.active = 1
         ORDER BY s.sort_order",
    )?;
    stmt.query_map((subject_id, term, year, class_id), |r| {
        Ok(MarkRow {
            student_id: r.get(0)?,
            last_name: r.get(1)?,
            first_name: r.get(2)?,
            sort_order: r.get(3)?,
            class_score: r.get(4)?,
            exam_score: r.get(5)?,
            total: r.get(6)?,
        })
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
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
    if let Err(d) = check_access(&user, Some(&class_id), Some(&subject_id)) {
        return denied(&req.id, d);
    }

    let rows = match load_subject_marks(conn, &class_id, &subject_id, term, year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Positions come from the ranked ordering; the response keeps roster order.
    let records: Vec<ScoreRecord> = rows
        .iter()
        .map(|r| ScoreRecord {
            subject_id: subject_id.clone(),
            student_id: r.student_id.clone(),
            class_id: class_id.clone(),
            total: r.total,
            position: None,
        })
        .collect();
    let position_by_student: HashMap<String, i64> = assign_positions(records)
        .into_iter()
        .filter_map(|r| r.position.map(|p| (r.student_id, p)))
        .collect();

    let marks: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            json!({
                "studentId": r.student_id,
                "studentName": format!("{}, {}", r.last_name, r.first_name),
                "sortOrder": r.sort_order,
                "classScore": r.class_score,
                "examScore": r.exam_score,
                "total": r.total,
                "position": position_by_student.get(&r.student_id)
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "term": term,
            "year": year,
            "marks": marks
        }),
    )
}

fn handle_marks_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
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
    if let Err(d) = check_access(&user, Some(&class_id), Some(&subject_id)) {
        return denied(&req.id, d);
    }

    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "rows must be an array", None);
    };
    if rows.len() > MARKS_UPSERT_MAX_ROWS {
        return err(
            &req.id,
            "bad_params",
            format!("rows exceeds limit of {}", MARKS_UPSERT_MAX_ROWS),
            Some(json!({ "rows": rows.len() })),
        );
    }

    let subject_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated = 0_usize;
    for (i, row) in rows.iter().enumerate() {
        let Some(student_id) = row.get("studentId").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(
                &req.id,
                "bad_params",
                "rows entries need a studentId",
                Some(json!({ "row": i })),
            );
        };

        let in_class: Option<i64> = match tx
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
                (student_id, &class_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        if in_class.is_none() {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                "student not in class",
                Some(json!({ "studentId": student_id })),
            );
        }

        // Dirty feeds happen: scores may arrive as numbers or numeric
        // strings. Anything else counts as unscored.
        let class_score = row.get("classScore").map(coerce_total).unwrap_or(None);
        let exam_score = row.get("examScore").map(coerce_total).unwrap_or(None);
        let total = match (class_score, exam_score) {
            (Some(c), Some(e)) => Some(c + e),
            _ => row.get("total").map(coerce_total).unwrap_or(None),
        };

        let mark_id = Uuid::new_v4().to_string();
        let result = tx.execute(
            "INSERT INTO marks(id, class_id, subject_id, student_id, term, year,
                               class_score, exam_score, total, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(class_id, subject_id, student_id, term, year) DO UPDATE SET
               class_score = excluded.class_score,
               exam_score = excluded.exam_score,
               total = excluded.total,
               updated_at = excluded.updated_at",
            (
                &mark_id,
                &class_id,
                &subject_id,
                student_id,
                term,
                year,
                class_score,
                exam_score,
                total,
                now_rfc3339(),
            ),
        );
        if let Err(e) = result {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "marks" })),
            );
        }
        updated += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "updated": updated }))
}

fn handle_marks_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
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
    if let Err(d) = check_access(&user, Some(&class_id), Some(&subject_id)) {
        return denied(&req.id, d);
    }

    let deleted = match conn.execute(
        "DELETE FROM marks
         WHERE class_id = ? AND subject_id = ? AND student_id = ? AND term = ? AND year = ?",
        (&class_id, &subject_id, &student_id, term, year),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "marks" })),
            )
        }
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "mark not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.list" => Some(handle_marks_list(state, req)),
        "marks.upsert" => Some(handle_marks_upsert(state, req)),
        "marks.delete" => Some(handle_marks_delete(state, req)),
        _ => None,
    }
}
