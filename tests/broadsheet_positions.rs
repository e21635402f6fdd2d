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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn expect_ok(resp: &serde_json::Value, what: &str) -> serde_json::Value {
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        what,
        resp
    );
    resp["result"].clone()
}

fn admin_auth() -> serde_json::Value {
    json!({ "role": "admin", "assignedClasses": [], "assignedSubjects": [] })
}

struct Sidecar {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u32,
}

impl Sidecar {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let resp = request(&mut self.stdin, &mut self.reader, &id, method, params);
        expect_ok(&resp, method)
    }
}

fn seed_class(sc: &mut Sidecar, name: &str) -> String {
    sc.call(
        "classes.create",
        json!({ "auth": admin_auth(), "name": name }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string()
}

fn seed_subject(sc: &mut Sidecar, name: &str, sort_order: i64) -> String {
    sc.call(
        "subjects.create",
        json!({ "auth": admin_auth(), "name": name, "sortOrder": sort_order }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string()
}

fn seed_student(sc: &mut Sidecar, class_id: &str, last: &str) -> String {
    sc.call(
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
        .to_string()
}

#[test]
fn broadsheet_ranks_each_subject_and_overall_with_competition_ties() {
    let workspace = temp_dir("schooldesk-broadsheet");
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

    let class_id = seed_class(&mut sc, "BS7");
    let math = seed_subject(&mut sc, "Mathematics", 0);
    let english = seed_subject(&mut sc, "English", 1);

    let s1 = seed_student(&mut sc, &class_id, "Adjei");
    let s2 = seed_student(&mut sc, &class_id, "Boateng");
    let s3 = seed_student(&mut sc, &class_id, "Clottey");

    // Math: 80, 80, 60 -> positions 1, 1, 3. English: 50, 70, no mark.
    sc.call(
        "marks.upsert",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": math,
            "term": 1,
            "year": 2025,
            "rows": [
                { "studentId": s1, "total": 80 },
                { "studentId": s2, "total": 80 },
                { "studentId": s3, "total": 60 }
            ]
        }),
    );
    sc.call(
        "marks.upsert",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "subjectId": english,
            "term": 1,
            "year": 2025,
            "rows": [
                { "studentId": s1, "total": 50 },
                { "studentId": s2, "total": 70 }
            ]
        }),
    );

    let sheet = sc.call(
        "broadsheets.open",
        json!({ "auth": admin_auth(), "classId": class_id, "term": 1, "year": 2025 }),
    );

    let subjects: Vec<&str> = sheet["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .map(|s| s["id"].as_str().expect("subject id"))
        .collect();
    assert_eq!(subjects, vec![math.as_str(), english.as_str()]);

    let rows = sheet["rows"].as_array().expect("rows");
    assert_eq!(rows.len(), 3);

    let row = |student: &str| {
        rows.iter()
            .find(|r| r["studentId"].as_str() == Some(student))
            .unwrap_or_else(|| panic!("missing row for {}", student))
            .clone()
    };

    let r1 = row(&s1);
    let r2 = row(&s2);
    let r3 = row(&s3);

    // Math column (index 0): tied 80s share position 1, the 60 takes 3.
    assert_eq!(r1["cells"][0]["position"].as_i64(), Some(1));
    assert_eq!(r2["cells"][0]["position"].as_i64(), Some(1));
    assert_eq!(r3["cells"][0]["position"].as_i64(), Some(3));

    // English column: 70 beats 50; the student with no mark has a null cell.
    assert_eq!(r2["cells"][1]["position"].as_i64(), Some(1));
    assert_eq!(r1["cells"][1]["position"].as_i64(), Some(2));
    assert!(r3["cells"][1].is_null());

    // Grades come from the default bands.
    assert_eq!(r1["cells"][0]["grade"].as_str(), Some("A"));
    assert_eq!(r3["cells"][0]["grade"].as_str(), Some("C"));

    // Overall: aggregates 130, 150, 60 -> positions 2, 1, 3.
    assert_eq!(r1["aggregate"].as_f64(), Some(130.0));
    assert_eq!(r2["aggregate"].as_f64(), Some(150.0));
    assert_eq!(r3["aggregate"].as_f64(), Some(60.0));
    assert_eq!(r1["position"].as_i64(), Some(2));
    assert_eq!(r2["position"].as_i64(), Some(1));
    assert_eq!(r3["position"].as_i64(), Some(3));
    assert_eq!(r3["average"].as_f64(), Some(60.0));
    assert_eq!(r3["scoredSubjects"].as_i64(), Some(1));

    // The analytics overview agrees on the subject toppers.
    let overview = sc.call(
        "analytics.classOverview",
        json!({ "auth": admin_auth(), "classId": class_id, "term": 1, "year": 2025 }),
    );
    let math_row = overview["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .find(|s| s["subjectId"].as_str() == Some(math.as_str()))
        .expect("math overview")
        .clone();
    assert_eq!(math_row["scoredCount"].as_i64(), Some(3));
    assert_eq!(math_row["max"].as_f64(), Some(80.0));
    assert_eq!(math_row["topStudent"]["total"].as_f64(), Some(80.0));

    let profile = sc.call(
        "analytics.studentProfile",
        json!({
            "auth": admin_auth(),
            "classId": class_id,
            "studentId": s3,
            "term": 1,
            "year": 2025
        }),
    );
    assert_eq!(profile["overallPosition"].as_i64(), Some(3));
    assert_eq!(profile["scoredSubjects"].as_i64(), Some(1));

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
