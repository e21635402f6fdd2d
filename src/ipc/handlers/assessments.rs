use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, required_str, required_term, required_year, user_access,
};
use crate::ipc::types::{AppState, Request};
use crate::rank::{assign_positions, coerce_total, ScoreRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const SCORES_SET_MAX_ROWS: usize = 2000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum AssessmentKind {
    Class,
    Exam,
}

impl AssessmentKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(Self::Class),
            "exam" => Some(Self::Exam),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Exam => "exam",
        }
    }
}

struct AssessmentMeta {
    class_id: String,
    subject_id: String,
    term: i64,
    year: i64,
    title: String,
    kind: String,
    out_of: f64,
}

fn load_assessment(
    conn: &Connection,
    req: &Request,
    assessment_id: &str,
) -> Result<AssessmentMeta, serde_json::Value> {
    let meta: Option<AssessmentMeta> = conn
        .query_row(
            "SELECT class_id, subject_id, term, year, title, kind, out_of
             FROM assessments WHERE id = ?",
            [assessment_id],
            |r| {
                Ok(AssessmentMeta {
                    class_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    term: r.get(2)?,
                    year: r.get(3)?,
                    title: r.get(4)?,
                    kind: r.get(5)?,
                    out_of: r.get(6)?,
                })
            },
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    meta.ok_or_else(|| err(&req.id, "not_found", "assessment not found", None))
}

fn handle_assessments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = optional_str(req, "subjectId");
    let scope = match check_access(&user, Some(&class_id), subject_id.as_deref()) {
        Ok(v) => v,
        Err(d) => return denied(&req.id, d),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, subject_id, title, kind, out_of, held_on, sort_order
         FROM assessments
         WHERE class_id = ? AND term = ? AND year = ?
         ORDER BY subject_id, sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&class_id, term, year), |r| {
            let id: String = r.get(0)?;
            let subject: String = r.get(1)?;
            let title: String = r.get(2)?;
            let kind: String = r.get(3)?;
            let out_of: f64 = r.get(4)?;
            let held_on: Option<String> = r.get(5)?;
            let sort_order: i64 = r.get(6)?;
            Ok((id, subject, title, kind, out_of, held_on, sort_order))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(all) => {
            let assessments: Vec<serde_json::Value> = all
                .into_iter()
                .filter(|(_, subject, _, _, _, _, _)| match subject_id.as_deref() {
                    Some(requested) => subject == requested,
                    None => scope.allows_subject(subject),
                })
                .map(|(id, subject, title, kind, out_of, held_on, sort_order)| {
                    json!({
                        "id": id,
                        "subjectId": subject,
                        "title": title,
                        "kind": kind,
                        "outOf": out_of,
                        "heldOn": held_on,
                        "sortOrder": sort_order
                    })
                })
                .collect();
            ok(&req.id, json!({ "assessments": assessments }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assessments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let title = match required_str(req, "title") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if title.is_empty() {
        return err(&req.id, "bad_params", "title must not be empty", None);
    }
    let kind_raw = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(kind) = AssessmentKind::parse(&kind_raw) else {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: class, exam",
            Some(json!({ "kind": kind_raw })),
        );
    };
    let Some(out_of) = req.params.get("outOf").map(coerce_total).unwrap_or(None) else {
        return err(&req.id, "bad_params", "missing outOf", None);
    };
    if !(out_of > 0.0) {
        return err(&req.id, "bad_params", "outOf must be > 0", None);
    }
    let held_on = optional_str(req, "heldOn");

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0)
         FROM assessments
         WHERE class_id = ? AND subject_id = ? AND term = ? AND year = ?",
        (&class_id, &subject_id, term, year),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assessment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessments(id, class_id, subject_id, term, year, title, kind, out_of, held_on, sort_order)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &assessment_id,
            &class_id,
            &subject_id,
            term,
            year,
            &title,
            kind.as_str(),
            out_of,
            &held_on,
            next_sort,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    ok(&req.id, json!({ "assessmentId": assessment_id }))
}

fn handle_assessments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let meta = match load_assessment(conn, req, &assessment_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(d) = check_access(&user, Some(&meta.class_id), Some(&meta.subject_id)) {
        return denied(&req.id, d);
    }

    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    for (key, value) in patch {
        let result = match key.as_str() {
            "title" => {
                let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "title must be a non-empty string", None);
                };
                conn.execute(
                    "UPDATE assessments SET title = ? WHERE id = ?",
                    (s, &assessment_id),
                )
            }
            "kind" => {
                let Some(kind) = value.as_str().and_then(AssessmentKind::parse) else {
                    return err(&req.id, "bad_params", "kind must be one of: class, exam", None);
                };
                conn.execute(
                    "UPDATE assessments SET kind = ? WHERE id = ?",
                    (kind.as_str(), &assessment_id),
                )
            }
            "outOf" => {
                let Some(out_of) = coerce_total(value) else {
                    return err(&req.id, "bad_params", "outOf must be numeric", None);
                };
                if !(out_of > 0.0) {
                    return err(&req.id, "bad_params", "outOf must be > 0", None);
                }
                conn.execute(
                    "UPDATE assessments SET out_of = ? WHERE id = ?",
                    (out_of, &assessment_id),
                )
            }
            "heldOn" => conn.execute(
                "UPDATE assessments SET held_on = ? WHERE id = ?",
                (value.as_str(), &assessment_id),
            ),
            "sortOrder" => {
                let Some(n) = value.as_i64() else {
                    return err(&req.id, "bad_params", "sortOrder must be integer", None);
                };
                conn.execute(
                    "UPDATE assessments SET sort_order = ? WHERE id = ?",
                    (n, &assessment_id),
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

fn handle_assessments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let meta = match load_assessment(conn, req, &assessment_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(d) = check_access(&user, Some(&meta.class_id), Some(&meta.subject_id)) {
        return denied(&req.id, d);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM assessment_scores WHERE assessment_id = ?",
        [&assessment_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessment_scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM assessments WHERE id = ?", [&assessment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_scores_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let meta = match load_assessment(conn, req, &assessment_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(d) = check_access(&user, Some(&meta.class_id), Some(&meta.subject_id)) {
        return denied(&req.id, d);
    }

    let Some(scores) = req.params.get("scores").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "scores must be an array", None);
    };
    if scores.len() > SCORES_SET_MAX_ROWS {
        return err(
            &req.id,
            "bad_params",
            format!("scores exceeds limit of {}", SCORES_SET_MAX_ROWS),
            Some(json!({ "scores": scores.len() })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated = 0_usize;
    for (i, entry) in scores.iter().enumerate() {
        let Some(student_id) = entry.get("studentId").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(
                &req.id,
                "bad_params",
                "scores entries need a studentId",
                Some(json!({ "row": i })),
            );
        };
        let in_class: Option<i64> = match tx
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
                (student_id, &meta.class_id),
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

        let raw_value = entry.get("rawValue").map(coerce_total).unwrap_or(None);
        if let Some(v) = raw_value {
            if v < 0.0 || v > meta.out_of {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "bad_params",
                    format!("rawValue must be in 0..={}", meta.out_of),
                    Some(json!({ "studentId": student_id, "rawValue": v })),
                );
            }
        }

        let score_id = Uuid::new_v4().to_string();
        let result = tx.execute(
            "INSERT INTO assessment_scores(id, assessment_id, student_id, raw_value)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(assessment_id, student_id) DO UPDATE SET
               raw_value = excluded.raw_value",
            (&score_id, &assessment_id, student_id, raw_value),
        );
        if let Err(e) = result {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "assessment_scores" })),
            );
        }
        updated += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "updated": updated }))
}

fn handle_assessments_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let meta = match load_assessment(conn, req, &assessment_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(d) = check_access(&user, Some(&meta.class_id), Some(&meta.subject_id)) {
        return denied(&req.id, d);
    }

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, sc.raw_value
         FROM students s
         LEFT JOIN assessment_scores sc
           ON sc.student_id = s.id AND sc.assessment_id = ?
         WHERE s.class_id = ? AND s.active = 1
         ORDER BY s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map((&assessment_id, &meta.class_id), |r| {
            let id: String = r.get(0)?;
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            let raw: Option<f64> = r.get(3)?;
            Ok((id, format!("{}, {}", last, first), raw))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let records: Vec<ScoreRecord> = rows
        .iter()
        .map(|(id, _, raw)| ScoreRecord {
            subject_id: meta.subject_id.clone(),
            student_id: id.clone(),
            class_id: meta.class_id.clone(),
            total: *raw,
            position: None,
        })
        .collect();
    let position_by_student: HashMap<String, i64> = assign_positions(records)
        .into_iter()
        .filter_map(|r| r.position.map(|p| (r.student_id, p)))
        .collect();

    let scored: Vec<f64> = rows.iter().filter_map(|(_, _, raw)| *raw).collect();
    let mean_raw = if scored.is_empty() {
        0.0
    } else {
        scored.iter().sum::<f64>() / scored.len() as f64
    };
    let mean_percent = if meta.out_of > 0.0 {
        100.0 * mean_raw / meta.out_of
    } else {
        0.0
    };

    let score_rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|(id, name, raw)| {
            json!({
                "studentId": id,
                "studentName": name,
                "rawValue": raw,
                "position": position_by_student.get(id)
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "assessment": {
                "id": assessment_id,
                "classId": meta.class_id,
                "subjectId": meta.subject_id,
                "term": meta.term,
                "year": meta.year,
                "title": meta.title,
                "kind": meta.kind,
                "outOf": meta.out_of
            },
            "meanRaw": mean_raw,
            "meanPercent": mean_percent,
            "scoredCount": scored.len(),
            "scores": score_rows
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.list" => Some(handle_assessments_list(state, req)),
        "assessments.create" => Some(handle_assessments_create(state, req)),
        "assessments.update" => Some(handle_assessments_update(state, req)),
        "assessments.delete" => Some(handle_assessments_delete(state, req)),
        "assessments.scores.set" => Some(handle_scores_set(state, req)),
        "assessments.stats" => Some(handle_assessments_stats(state, req)),
        _ => None,
    }
}
