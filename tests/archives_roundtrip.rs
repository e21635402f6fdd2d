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
    fn raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let payload = json!({ "id": self.next_id.to_string(), "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        serde_json::from_str(line.trim()).expect("parse response json")
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = self.raw(method, params);
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
fn term_archive_snapshots_and_bundle_survive_a_roundtrip() {
    let workspace = temp_dir("schooldesk-archive");
    let bundle_path = workspace.join("term1.sdbackup.zip");
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
        json!({ "auth": admin_auth(), "name": "Science" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let mut students = Vec::new();
    for (last, total) in [("Adjei", 88.0), ("Boateng", 88.0), ("Clottey", 71.0)] {
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
        sc.call(
            "marks.upsert",
            json!({
                "auth": admin_auth(),
                "classId": class_id,
                "subjectId": subject_id,
                "term": 3,
                "year": 2025,
                "rows": [{ "studentId": id, "total": total }]
            }),
        );
        students.push(id);
    }
    sc.call(
        "remarks.upsert",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "studentId": students[0],
            "term": 3,
            "year": 2025,
            "patch": { "teacherRemark": "Consistent effort", "headRemark": "Promoted" }
        }),
    );

    let created = sc.call(
        "archives.create",
        json!({ "auth": admin_auth(), "term": 3, "year": 2025, "label": "End of year" }),
    );
    assert_eq!(created["markCount"].as_i64(), Some(3));
    assert_eq!(created["remarkCount"].as_i64(), Some(1));
    let archive_id = created["archiveId"].as_str().expect("archiveId").to_string();

    let listed = sc.call("archives.list", json!({ "auth": admin_auth() }));
    let archives = listed["archives"].as_array().expect("archives");
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0]["label"].as_str(), Some("End of year"));

    // Opening recomputes positions; snapshots never store them.
    let opened = sc.call(
        "archives.open",
        json!({ "auth": admin_auth(), "archiveId": archive_id }),
    );
    let marks = opened["marks"].as_array().expect("marks");
    assert_eq!(marks.len(), 3);
    let position_of = |student: &str| {
        marks
            .iter()
            .find(|m| m["studentId"].as_str() == Some(student))
            .and_then(|m| m["position"].as_i64())
    };
    assert_eq!(position_of(&students[0]), Some(1));
    assert_eq!(position_of(&students[1]), Some(1));
    assert_eq!(position_of(&students[2]), Some(3));
    assert_eq!(opened["remarks"].as_array().map(|r| r.len()), Some(1));

    // A scoped teacher only sees their own classes in an opened archive.
    let outsider = json!({
        "role": "subject_teacher",
        "assignedClasses": [],
        "assignedSubjects": []
    });
    let opened = sc.call(
        "archives.open",
        json!({ "auth": outsider, "archiveId": archive_id }),
    );
    assert_eq!(opened["marks"].as_array().map(|m| m.len()), Some(0));

    // Bundle out, wipe the term, bundle back in.
    let exported = sc.call(
        "archives.exportBundle",
        json!({ "auth": admin_auth(), "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        exported["bundleFormat"].as_str(),
        Some("schooldesk-archive-v1")
    );
    assert!(bundle_path.is_file());

    for id in &students {
        sc.call(
            "marks.delete",
            json!({
                "auth": admin_auth(),
                "classId": class_id,
                "subjectId": subject_id,
                "studentId": id,
                "term": 3,
                "year": 2025
            }),
        );
    }
    let empty = sc.call(
        "marks.list",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 3,
            "year": 2025
        }),
    );
    assert!(empty["marks"]
        .as_array()
        .expect("marks")
        .iter()
        .all(|m| m["total"].is_null()));

    sc.call(
        "archives.importBundle",
        json!({ "auth": admin_auth(), "inPath": bundle_path.to_string_lossy() }),
    );
    let restored = sc.call(
        "marks.list",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": subject_id,
            "term": 3,
            "year": 2025
        }),
    );
    let totals: Vec<f64> = restored["marks"]
        .as_array()
        .expect("marks")
        .iter()
        .filter_map(|m| m["total"].as_f64())
        .collect();
    assert_eq!(totals, vec![88.0, 88.0, 71.0]);

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
