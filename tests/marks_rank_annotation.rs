use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schooldeskd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schooldeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

struct Sidecar {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u32,
}

impl Sidecar {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let payload = json!({ "id": self.next_id.to_string(), "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let resp: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response");
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
        resp["result"].clone()
    }
}

fn admin_auth() -> serde_json::Value {
    json!({ "role": "admin", "assignedClasses": [], "assignedSubjects": [] })
}

#[test]
fn marks_list_annotates_competition_positions_in_roster_order() {
    let workspace = temp_dir("schooldesk-marks-rank");
    let (mut child, stdin, reader) = spawn_sidecar();
    let mut sc = Sidecar {
        stdin,
        reader,
        next_id: 0,
    };

    sc.call(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = sc.call(
        "classes.create",
        json!({ "auth": admin_auth(), "name": "BS7" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let subject_id = sc.call(
        "subjects.create",
        json!({ "auth": admin_auth(), "name": "Mathematics" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let mut students = Vec::new();
    for last in ["Adjei", "Boateng", "Clottey", "Dadzie"] {
        let id = sc.call(
            "students.create",
            json!({
                "auth": admin_auth(),
                "classId": class_id,
                "lastName": last,
                "firstName": "Test"
            }),
        )["studentId"]
            .as_str()
            .expect("studentId")
            .to_string();
        students.push(id);
    }

    // Totals 72.5, 72.5, 90, 40 in roster order; the exam score for the
    // last student arrives as a string, as legacy imports sometimes do.
    sc.call(
        "marks.upsert",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "year": 2025,
            "rows": [
                { "studentId": students[0], "classScore": 30, "examScore": 42.5 },
                { "studentId": students[1], "classScore": 30.0, "examScore": "42.5" },
                { "studentId": students[2], "total": 90 },
                { "studentId": students[3], "classScore": "15", "examScore": 25 }
            ]
        }),
    );

    let listed = sc.call(
        "marks.list",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "year": 2025
        }),
    );
    let marks = listed["marks"].as_array().expect("marks");
    assert_eq!(marks.len(), 4);

    // Response order is the roster order, not rank order.
    let order: Vec<&str> = marks
        .iter()
        .map(|m| m["studentId"].as_str().expect("studentId"))
        .collect();
    let expected: Vec<&str> = students.iter().map(|s| s.as_str()).collect();
    assert_eq!(order, expected);

    assert_eq!(marks[0]["total"].as_f64(), Some(72.5));
    assert_eq!(marks[1]["total"].as_f64(), Some(72.5));
    assert_eq!(marks[2]["total"].as_f64(), Some(90.0));
    assert_eq!(marks[3]["total"].as_f64(), Some(40.0));

    assert_eq!(marks[0]["position"].as_i64(), Some(2));
    assert_eq!(marks[1]["position"].as_i64(), Some(2));
    assert_eq!(marks[2]["position"].as_i64(), Some(1));
    assert_eq!(marks[3]["position"].as_i64(), Some(4));

    // Re-listing returns identical positions.
    let again = sc.call(
        "marks.list",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "year": 2025
        }),
    );
    assert_eq!(again["marks"], listed["marks"]);

    // A student with no recorded mark ranks as zero, below every score.
    let extra = sc.call(
        "students.create",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "lastName": "Essien",
            "firstName": "Test"
        }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    sc.call(
        "marks.upsert",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "year": 2025,
            "rows": [{ "studentId": extra, "total": "n/a" }]
        }),
    );
    let with_extra = sc.call(
        "marks.list",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 1,
            "year": 2025
        }),
    );
    let rows = with_extra["marks"].as_array().expect("marks");
    let extra_row = rows
        .iter()
        .find(|m| m["studentId"].as_str() == Some(extra.as_str()))
        .expect("extra row");
    assert!(extra_row["total"].is_null());
    assert_eq!(extra_row["position"].as_i64(), Some(5));

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
