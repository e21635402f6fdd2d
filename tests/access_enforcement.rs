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

    fn expect_error(&mut self, method: &str, params: serde_json::Value, code: &str) {
        let resp = self.raw(method, params);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            resp
        );
        assert_eq!(
            resp["error"]["code"].as_str(),
            Some(code),
            "{} wrong error: {}",
            method,
            resp
        );
    }
}

fn admin_auth() -> serde_json::Value {
    json!({ "role": "admin", "assignedClasses": [], "assignedSubjects": [] })
}

fn auth(role: &str, classes: &[&str], subjects: &[&str]) -> serde_json::Value {
    json!({
        "role": role,
        "assignedClasses": classes,
        "assignedSubjects": subjects
    })
}

#[test]
fn scoped_roles_are_filtered_and_denied_consistently() {
    let workspace = temp_dir("schooldesk-access");
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

    let bs7 = sc.call(
        "classes.create",
        json!({ "auth": admin_auth(), "name": "BS7" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let bs8 = sc.call(
        "classes.create",
        json!({ "auth": admin_auth(), "name": "BS8" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let math = sc.call(
        "subjects.create",
        json!({ "auth": admin_auth(), "name": "Mathematics" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();
    let english = sc.call(
        "subjects.create",
        json!({ "auth": admin_auth(), "name": "English" }),
    )["subjectId"]
        .as_str()
        .expect("subjectId")
        .to_string();

    let student = sc.call(
        "students.create",
        json!({
            "auth": admin_auth(),
            "classId": bs7,
            "lastName": "Mensah",
            "firstName": "Ama"
        }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    sc.call(
        "marks.upsert",
        json!({
            "auth": admin_auth(),
            "classId": bs7,
            "subjectId": math,
            "term": 1,
            "year": 2025,
            "rows": [{ "studentId": student, "total": 64 }]
        }),
    );

    let subject_teacher = auth("subject_teacher", &[bs7.as_str()], &[math.as_str()]);
    let class_teacher = auth("class_teacher", &[bs7.as_str()], &[math.as_str()]);

    // Admin bypasses every restriction.
    sc.call(
        "marks.list",
        json!({
            "auth": admin_auth(),
            "classId": bs8,
            "subjectId": english,
            "term": 1,
            "year": 2025
        }),
    );

    // A subject teacher stays inside the assigned class and subject.
    sc.call(
        "marks.list",
        json!({
            "auth": subject_teacher,
            "classId": bs7,
            "subjectId": math,
            "term": 1,
            "year": 2025
        }),
    );
    sc.expect_error(
        "marks.list",
        json!({
            "auth": subject_teacher,
            "classId": bs8,
            "subjectId": math,
            "term": 1,
            "year": 2025
        }),
        "class_access_denied",
    );
    sc.expect_error(
        "marks.list",
        json!({
            "auth": subject_teacher,
            "classId": bs7,
            "subjectId": english,
            "term": 1,
            "year": 2025
        }),
        "subject_access_denied",
    );

    // The class teacher of BS7 sees every subject there, but only there.
    sc.call(
        "marks.list",
        json!({
            "auth": class_teacher,
            "classId": bs7,
            "subjectId": english,
            "term": 1,
            "year": 2025
        }),
    );
    sc.expect_error(
        "marks.list",
        json!({
            "auth": class_teacher,
            "classId": bs8,
            "subjectId": english,
            "term": 1,
            "year": 2025
        }),
        "class_access_denied",
    );

    // Denials hold on read models, not just the mark grid.
    sc.expect_error(
        "broadsheets.open",
        json!({ "auth": subject_teacher, "classId": bs8, "term": 1, "year": 2025 }),
        "class_access_denied",
    );
    sc.expect_error(
        "remarks.get",
        json!({ "auth": subject_teacher, "classId": bs8, "term": 1, "year": 2025 }),
        "class_access_denied",
    );

    // Unscoped listings narrow instead of denying.
    let classes = sc.call("classes.list", json!({ "auth": subject_teacher }));
    let visible: Vec<&str> = classes["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .map(|c| c["id"].as_str().expect("id"))
        .collect();
    assert_eq!(visible, vec![bs7.as_str()]);

    let subjects = sc.call("subjects.list", json!({ "auth": subject_teacher }));
    let visible: Vec<&str> = subjects["subjects"]
        .as_array()
        .expect("subjects")
        .iter()
        .map(|s| s["id"].as_str().expect("id"))
        .collect();
    assert_eq!(visible, vec![math.as_str()]);

    // The class-teacher exemption does not widen catalog mutations.
    sc.expect_error(
        "classes.create",
        json!({ "auth": class_teacher, "name": "BS9" }),
        "forbidden",
    );
    sc.expect_error(
        "settings.update",
        json!({
            "auth": subject_teacher,
            "section": "school",
            "patch": { "name": "Nope" }
        }),
        "forbidden",
    );
    sc.expect_error(
        "students.create",
        json!({
            "auth": subject_teacher,
            "classId": bs7,
            "lastName": "X",
            "firstName": "Y"
        }),
        "forbidden",
    );
    sc.expect_error(
        "archives.create",
        json!({ "auth": class_teacher, "term": 1, "year": 2025 }),
        "forbidden",
    );

    // Only admin-level roles may write the head teacher's remark.
    sc.expect_error(
        "remarks.upsert",
        json!({
            "auth": class_teacher,
            "classId": bs7,
            "studentId": student,
            "term": 1,
            "year": 2025,
            "patch": { "headRemark": "Promoted" }
        }),
        "forbidden",
    );
    sc.call(
        "remarks.upsert",
        json!({
            "auth": class_teacher,
            "classId": bs7,
            "studentId": student,
            "term": 1,
            "year": 2025,
            "patch": { "teacherRemark": "Hardworking" }
        }),
    );

    // Requests without a credential fail closed.
    sc.expect_error(
        "marks.list",
        json!({ "classId": bs7, "subjectId": math, "term": 1, "year": 2025 }),
        "auth_required",
    );
    sc.expect_error(
        "marks.list",
        json!({
            "auth": { "role": "chancellor" },
            "classId": bs7,
            "subjectId": math,
            "term": 1,
            "year": 2025
        }),
        "bad_params",
    );

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
