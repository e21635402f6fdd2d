use crate::access::check_access;
use crate::ipc::error::{denied, err, ok};
use crate::ipc::helpers::{db_conn, required_str, required_term, required_year, user_access};
use crate::ipc::types::{AppState, Request};
use crate::rank::{assign_positions, ScoreRecord};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

use super::settings;

fn round_1dp(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

struct SubjectCol {
    id: String,
    name: String,
    code: Option<String>,
}

struct StudentRow {
    id: String,
    display_name: String,
    sort_order: i64,
}

fn load_subjects(conn: &Connection) -> Result<Vec<SubjectCol>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT id, name, code FROM subjects ORDER BY sort_order, name")?;
    stmt.query_map([], |r| {
        Ok(SubjectCol {
            id: r.get(0)?,
            name: r.get(1)?,
            code: r.get(2)?,
        })
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn load_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, sort_order
         FROM students
         WHERE class_id = ? AND active = 1
         ORDER BY sort_order",
    )?;
    stmt.query_map([class_id], |r| {
        let last: String = r.get(1)?;
        let first: String = r.get(2)?;
        Ok(StudentRow {
            id: r.get(0)?,
            display_name: format!("{}, {}", last, first),
            sort_order: r.get(3)?,
        })
    })?
    .collect::<Result<Vec<_>, _>>()
}

fn handle_broadsheets_open(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let subjects: Vec<SubjectCol> = match load_subjects(conn) {
        Ok(all) => all
            .into_iter()
            .filter(|s| scope.allows_subject(&s.id))
            .collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = match load_students(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT subject_id, student_id, class_score, exam_score, total
         FROM marks
         WHERE class_id = ? AND term = ? AND year = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mark_rows = match stmt
        .query_map((&class_id, term, year), |r| {
            let subject_id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let class_score: Option<f64> = r.get(2)?;
            let exam_score: Option<f64> = r.get(3)?;
            let total: Option<f64> = r.get(4)?;
            Ok((subject_id, student_id, class_score, exam_score, total))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_ids: HashMap<&str, ()> = students.iter().map(|s| (s.id.as_str(), ())).collect();
    let mut mark_by_pair: HashMap<(String, String), (Option<f64>, Option<f64>, Option<f64>)> =
        HashMap::new();
    // Feed the engine subject-by-subject in column order so output grouping
    // mirrors the broadsheet's subject columns.
    let mut records: Vec<ScoreRecord> = Vec::new();
    for subject in &subjects {
        for (subject_id, student_id, class_score, exam_score, total) in &mark_rows {
            if subject_id != &subject.id || !student_ids.contains_key(student_id.as_str()) {
                continue;
            }
            mark_by_pair.insert(
                (subject_id.clone(), student_id.clone()),
                (*class_score, *exam_score, *total),
            );
            records.push(ScoreRecord {
                subject_id: subject_id.clone(),
                student_id: student_id.clone(),
                class_id: class_id.clone(),
                total: *total,
                position: None,
            });
        }
    }

    let ranked = assign_positions(records);
    let mut position_by_pair: HashMap<(String, String), i64> = HashMap::new();
    for r in &ranked {
        if let Some(p) = r.position {
            position_by_pair.insert((r.subject_id.clone(), r.student_id.clone()), p);
        }
    }

    let bands = match settings::grading_bands(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Overall standings rank the aggregates with the same tie rules as the
    // per-subject columns.
    let mut aggregate_by_student: HashMap<String, (f64, usize)> = HashMap::new();
    for subject in &subjects {
        for s in &students {
            if let Some((_, _, Some(total))) =
                mark_by_pair.get(&(subject.id.clone(), s.id.clone()))
            {
                let entry = aggregate_by_student.entry(s.id.clone()).or_insert((0.0, 0));
                entry.0 += *total;
                entry.1 += 1;
            }
        }
    }
    let overall_records: Vec<ScoreRecord> = students
        .iter()
        .map(|s| ScoreRecord {
            subject_id: "overall".to_string(),
            student_id: s.id.clone(),
            class_id: class_id.clone(),
            total: aggregate_by_student.get(&s.id).map(|(sum, _)| *sum),
            position: None,
        })
        .collect();
    let overall_position: HashMap<String, i64> = assign_positions(overall_records)
        .into_iter()
        .filter_map(|r| r.position.map(|p| (r.student_id, p)))
        .collect();

    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let cells: Vec<serde_json::Value> = subjects
                .iter()
                .map(|subject| {
                    match mark_by_pair.get(&(subject.id.clone(), s.id.clone())) {
                        Some((class_score, exam_score, total)) => json!({
                            "subjectId": subject.id,
                            "classScore": class_score,
                            "examScore": exam_score,
                            "total": total,
                            "grade": total.map(|t| settings::grade_for(&bands, t)),
                            "position": position_by_pair.get(&(subject.id.clone(), s.id.clone()))
                        }),
                        None => serde_json::Value::Null,
                    }
                })
                .collect();

            let (aggregate, scored_subjects) = aggregate_by_student
                .get(&s.id)
                .copied()
                .unwrap_or((0.0, 0));
            let average = if scored_subjects > 0 {
                Some(round_1dp(aggregate / scored_subjects as f64))
            } else {
                None
            };

            json!({
                "studentId": s.id,
                "studentName": s.display_name,
                "sortOrder": s.sort_order,
                "cells": cells,
                "aggregate": if scored_subjects > 0 { Some(round_1dp(aggregate)) } else { None },
                "average": average,
                "scoredSubjects": scored_subjects,
                "position": overall_position.get(&s.id)
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "class": { "id": class_id, "name": class_name },
            "term": term,
            "year": year,
            "subjects": subjects
                .iter()
                .map(|s| json!({ "id": s.id, "name": s.name, "code": s.code }))
                .collect::<Vec<_>>(),
            "rows": rows
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "broadsheets.open" => Some(handle_broadsheets_open(state, req)),
        _ => None,
    }
}
