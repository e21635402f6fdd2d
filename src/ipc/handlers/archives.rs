use crate::access::check_access;
use crate::backup;
use crate::db;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{
    db_conn, now_rfc3339, optional_str, require_admin_level, required_str, required_term,
    required_year, user_access,
};
use crate::ipc::types::{AppState, Request};
use crate::rank::{assign_positions, ScoreRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

fn snapshot_marks(
    conn: &Connection,
    term: i64,
    year: i64,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT m.class_id, m.subject_id, m.student_id,
                s.last_name, s.first_name,
                m.class_score, m.exam_score, m.total
         FROM marks m
         JOIN students s ON s.id = m.student_id
         WHERE m.term = ? AND m.year = ?
         ORDER BY m.class_id, m.subject_id, s.sort_order",
    )?;
    stmt.query_map((term, year), |r| {
        let class_id: String = r.get(0)?;
        let subject_id: String = r.get(1)?;
        let student_id: String = r.get(2)?;
        let last: String = r.get(3)?;
        let first: String = r.get(4)?;
        let class_score: Option<f64> = r.get(5)?;
        let exam_score: Option<f64> = r.get(6)?;
        let total: Option<f64> = r.get(7)?;
        Ok(json!({
            "classId": class_id,
            "subjectId": subject_id,
            "studentId": student_id,
            "studentName": format!("{}, {}", last, first),
            "classScore": class_score,
            "examScore": exam_score,
            "total": total
        }))
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn snapshot_remarks(
    conn: &Connection,
    term: i64,
    year: i64,
) -> Result<Vec<serde_json::Value>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT r.class_id, r.student_id, s.last_name, s.first_name,
                r.conduct, r.interest, r.teacher_remark, r.head_remark
         FROM remarks r
         JOIN students s ON s.id = r.student_id
         WHERE r.term = ? AND r.year = ?
         ORDER BY r.class_id, s.sort_order",
    )?;
    stmt.query_map((term, year), |r| {
        let class_id: String = r.get(0)?;
        let student_id: String = r.get(1)?;
        let last: String = r.get(2)?;
        let first: String = r.get(3)?;
        let conduct: Option<String> = r.get(4)?;
        let interest: Option<String> = r.get(5)?;
        let teacher_remark: Option<String> = r.get(6)?;
        let head_remark: Option<String> = r.get(7)?;
        Ok(json!({
            "classId": class_id,
            "studentId": student_id,
            "studentName": format!("{}, {}", last, first),
            "conduct": conduct,
            "interest": interest,
            "teacherRemark": teacher_remark,
            "headRemark": head_remark
        }))
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn handle_archives_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let term = match required_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_year(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let label = optional_str(req, "label")
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| format!("Term {} {}", term, year));

    let marks = match snapshot_marks(conn, term, year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let remarks = match snapshot_remarks(conn, term, year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if marks.is_empty() && remarks.is_empty() {
        return err(
            &req.id,
            "not_found",
            "nothing to archive for that term",
            Some(json!({ "term": term, "year": year })),
        );
    }

    let marks_json = match serde_json::to_string(&marks) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "archive_failed", e.to_string(), None),
    };
    let remarks_json = match serde_json::to_string(&remarks) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "archive_failed", e.to_string(), None),
    };

    let archive_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO term_archives(id, term, year, label, created_at, marks_json, remarks_json)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &archive_id,
            term,
            year,
            &label,
            now_rfc3339(),
            &marks_json,
            &remarks_json,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "term_archives" })),
        );
    }

    ok(
        &req.id,
        json!({
            "archiveId": archive_id,
            "label": label,
            "markCount": marks.len(),
            "remarkCount": remarks.len()
        }),
    )
}

fn handle_archives_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = user_access(req) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT id, term, year, label, created_at
         FROM term_archives
         ORDER BY year DESC, term DESC, created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let term: i64 = r.get(1)?;
            let year: i64 = r.get(2)?;
            let label: String = r.get(3)?;
            let created_at: String = r.get(4)?;
            Ok(json!({
                "id": id,
                "term": term,
                "year": year,
                "label": label,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(archives) => ok(&req.id, json!({ "archives": archives })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_archives_open(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let archive_id = match required_str(req, "archiveId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(i64, i64, String, String, String, String)> = match conn
        .query_row(
            "SELECT term, year, label, created_at, marks_json, remarks_json
             FROM term_archives WHERE id = ?",
            [&archive_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((term, year, label, created_at, marks_json, remarks_json)) = row else {
        return err(&req.id, "not_found", "archive not found", None);
    };

    let marks: Vec<serde_json::Value> = match serde_json::from_str(&marks_json) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "archive_failed", e.to_string(), None),
    };
    let remarks: Vec<serde_json::Value> = match serde_json::from_str(&remarks_json) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "archive_failed", e.to_string(), None),
    };

    let visible = |entry: &serde_json::Value| {
        entry
            .get("classId")
            .and_then(|v| v.as_str())
            .map(|cid| scope.allows_class(cid))
            .unwrap_or(false)
    };
    let marks: Vec<serde_json::Value> = marks.into_iter().filter(|m| visible(m)).collect();
    let remarks: Vec<serde_json::Value> = remarks.into_iter().filter(|r| visible(r)).collect();

    // Snapshots never carry positions; recompute them per class so the same
    // subject ranks independently in each class.
    let mut class_order: Vec<String> = Vec::new();
    let mut by_class: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, m) in marks.iter().enumerate() {
        let class_id = m
            .get("classId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if !by_class.contains_key(&class_id) {
            class_order.push(class_id.clone());
        }
        by_class.entry(class_id).or_default().push(i);
    }

    let mut positions: HashMap<usize, i64> = HashMap::new();
    for class_id in &class_order {
        let Some(indexes) = by_class.get(class_id) else {
            continue;
        };
        let records: Vec<ScoreRecord> = indexes
            .iter()
            .map(|&i| {
                let m = &marks[i];
                ScoreRecord {
                    subject_id: m
                        .get("subjectId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    student_id: i.to_string(),
                    class_id: class_id.clone(),
                    total: m.get("total").and_then(|v| v.as_f64()),
                    position: None,
                }
            })
            .collect();
        for r in assign_positions(records) {
            if let (Ok(index), Some(p)) = (r.student_id.parse::<usize>(), r.position) {
                positions.insert(index, p);
            }
        }
    }

    let marks: Vec<serde_json::Value> = marks
        .into_iter()
        .enumerate()
        .map(|(i, mut m)| {
            if let Some(obj) = m.as_object_mut() {
                obj.insert("position".to_string(), json!(positions.get(&i)));
            }
            m
        })
        .collect();

    ok(
        &req.id,
        json!({
            "archive": {
                "id": archive_id,
                "term": term,
                "year": year,
                "label": label,
                "createdAt": created_at
            },
            "marks": marks,
            "remarks": remarks
        }),
    )
}

fn handle_archives_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin_level(req, &user) {
        return e;
    }
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "dbSha256": summary.db_sha256,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "archive_failed", format!("{e:?}"), None),
    }
}

fn handle_archives_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let user = match user_access(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_admin_level(req, &user) {
        return e;
    }
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let in_path = match required_str(req, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    // Release the connection before the database file is replaced.
    state.db = None;
    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(v) => v,
        Err(e) => {
            // Reopen whatever is on disk so the workspace stays usable.
            state.db = db::open_db(&workspace).ok();
            return err(&req.id, "archive_failed", format!("{e:?}"), None);
        }
    };

    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            ok(
                &req.id,
                json!({ "bundleFormatDetected": summary.bundle_format_detected }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "archives.create" => Some(handle_archives_create(state, req)),
        "archives.list" => Some(handle_archives_list(state, req)),
        "archives.open" => Some(handle_archives_open(state, req)),
        "archives.exportBundle" => Some(handle_archives_export_bundle(state, req)),
        "archives.importBundle" => Some(handle_archives_import_bundle(state, req)),
        _ => None,
    }
}
