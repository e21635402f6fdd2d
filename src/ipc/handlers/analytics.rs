use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{db_conn, required_str, required_term, required_year, user_access};
use crate::ipc::types::{AppState, Request};
use crate::rank::{assign_positions, ScoreRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

struct SubjectMeta {
    id: String,
    name: String,
}

struct ClassMarkRow {
    subject_id: String,
    student_id: String,
    total: Option<f64>,
}

fn load_subjects(conn: &Connection) -> Result<Vec<SubjectMeta>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT id, name FROM subjects ORDER BY sort_order, name")?;
    stmt.query_map([], |r| {
        Ok(SubjectMeta {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn load_student_names(
    conn: &Connection,
    class_id: &str,
) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name
         FROM students
         WHERE class_id = ? AND active = 1
         ORDER BY sort_order",
    )?;
    stmt.query_map([class_id], |r| {
        let id: String = r.get(0)?;
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok((id, format!("{}, {}", last, first)))
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn load_class_marks(
    conn: &Connection,
    class_id: &str,
    term: i64,
    year: i64,
) -> Result<Vec<ClassMarkRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT subject_id, student_id, total
         FROM marks
         WHERE class_id = ? AND term = ? AND year = ?",
    )?;
    stmt.query_map((class_id, term, year), |r| {
        Ok(ClassMarkRow {
            subject_id: r.get(0)?,
            student_id: r.get(1)?,
            total: r.get(2)?,
        })
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn handle_class_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let scope = match check_access(&user, Some(&class_id), None) {
        Ok(v) => v,
        Err(d) => return denied(&req.id, d),
    };

    let class_name: Option<String> = match conn
        .query_row("SELECT name FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_name) = class_name else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let subjects: Vec<SubjectMeta> = match load_subjects(conn) {
        Ok(all) => all
            .into_iter()
            .filter(|s| scope.allows_subject(&s.id))
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match load_student_names(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let name_by_id: HashMap<&str, &str> = students
        .iter()
        .map(|(id, name)| (id.as_str(), name.as_str()))
        .collect();
    let marks = match load_class_marks(conn, &class_id, term, year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut subject_rows: Vec<serde_json::Value> = Vec::new();
    for subject in &subjects {
        let records: Vec<ScoreRecord> = marks
            .iter()
            .filter(|m| m.subject_id == subject.id && name_by_id.contains_key(m.student_id.as_str()))
            .map(|m| ScoreRecord {
                subject_id: m.subject_id.clone(),
                student_id: m.student_id.clone(),
                class_id: class_id.clone(),
                total: m.total,
                position: None,
            })
            .collect();
        if records.is_empty() {
            continue;
        }

        let totals: Vec<f64> = records.iter().filter_map(|r| r.total).collect();
        let scored_count = totals.len();
        let mean = if scored_count > 0 {
            totals.iter().sum::<f64>() / scored_count as f64
        } else {
            0.0
        };
        let min = totals.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = totals.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let ranked = assign_positions(records);
        let top = ranked.first();

        subject_rows.push(json!({
            "subjectId": subject.id,
            "subjectName": subject.name,
            "scoredCount": scored_count,
            "mean": mean,
            "min": if scored_count > 0 { Some(min) } else { None },
            "max": if scored_count > 0 { Some(max) } else { None },
            "topStudent": top.map(|r| json!({
                "studentId": r.student_id,
                "studentName": name_by_id.get(r.student_id.as_str()),
                "total": r.total
            }))
        }));
    }

    ok(
        &req.id,
        json!({
            "class": { "id": class_id, "name": class_name },
            "term": term,
            "year": year,
            "classSize": students.len(),
            "subjects": subject_rows
        }),
    )
}

fn handle_student_profile(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let scope = match check_access(&user, Some(&class_id), None) {
        Ok(v) => v,
        Err(d) => return denied(&req.id, d),
    };

    let student_name: Option<(String, String)> = match conn
        .query_row(
            "SELECT last_name, first_name FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &class_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((last, first)) = student_name else {
        return err(&req.id, "not_found", "student not in class", None);
    };

    let subjects: Vec<SubjectMeta> = match load_subjects(conn) {
        Ok(all) => all
            .into_iter()
            .filter(|s| scope.allows_subject(&s.id))
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match load_student_names(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let roster: HashMap<&str, ()> = students.iter().map(|(id, _)| (id.as_str(), ())).collect();
    let marks = match load_class_marks(conn, &class_id, term, year) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Rank the whole class per subject, then pull this student's slots out.
    let mut records: Vec<ScoreRecord> = Vec::new();
    let mut subject_sizes: HashMap<String, usize> = HashMap::new();
    for subject in &subjects {
        for m in &marks {
            if m.subject_id != subject.id || !roster.contains_key(m.student_id.as_str()) {
                continue;
            }
            *subject_sizes.entry(subject.id.clone()).or_insert(0) += 1;
            records.push(ScoreRecord {
                subject_id: m.subject_id.clone(),
                student_id: m.student_id.clone(),
                class_id: class_id.clone(),
                total: m.total,
                position: None,
            });
        }
    }
    let ranked = assign_positions(records);

    let mut own: HashMap<String, (Option<f64>, Option<i64>)> = HashMap::new();
    let mut aggregate = 0.0;
    let mut scored_subjects = 0_usize;
    for r in &ranked {
        if r.student_id != student_id {
            continue;
        }
        own.insert(r.subject_id.clone(), (r.total, r.position));
        if let Some(t) = r.total {
            aggregate += t;
            scored_subjects += 1;
        }
    }

    let overall_records: Vec<ScoreRecord> = {
        let mut agg: HashMap<String, (f64, usize)> = HashMap::new();
        for r in &ranked {
            if let Some(t) = r.total {
                let entry = agg.entry(r.student_id.clone()).or_insert((0.0, 0));
                entry.0 += t;
                entry.1 += 1;
            }
        }
        students
            .iter()
            .map(|(id, _)| ScoreRecord {
                subject_id: "overall".to_string(),
                student_id: id.clone(),
                class_id: class_id.clone(),
                total: agg.get(id).map(|(sum, _)| *sum),
                position: None,
            })
            .collect()
    };
    let overall_position = assign_positions(overall_records)
        .into_iter()
        .find(|r| r.student_id == student_id)
        .and_then(|r| r.position);

    let subject_rows: Vec<serde_json::Value> = subjects
        .iter()
        .filter_map(|subject| {
            own.get(&subject.id).map(|(total, position)| {
                json!({
                    "subjectId": subject.id,
                    "subjectName": subject.name,
                    "total": total,
                    "position": position,
                    "rankedCount": subject_sizes.get(&subject.id).copied().unwrap_or(0)
                })
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "student": {
                "id": student_id,
                "name": format!("{}, {}", last, first),
                "classId": class_id
            },
            "term": term,
            "year": year,
            "subjects": subject_rows,
            "aggregate": if scored_subjects > 0 { Some(aggregate) } else { None },
            "scoredSubjects": scored_subjects,
            "classSize": students.len(),
            "overallPosition": overall_position
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.classOverview" => Some(handle_class_overview(state, req)),
        "analytics.studentProfile" => Some(handle_student_profile(state, req)),
        _ => None,
    }
}
