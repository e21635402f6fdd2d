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

    fn expect_bad_params(&mut self, params: serde_json::Value) {
        let resp = self.raw("settings.update", params);
        assert_eq!(resp["ok"].as_bool(), Some(false), "expected rejection: {}", resp);
        assert_eq!(resp["error"]["code"].as_str(), Some("bad_params"));
    }
}

fn admin_auth() -> serde_json::Value {
    json!({ "role": "admin", "assignedClasses": [], "assignedSubjects": [] })
}

#[test]
fn settings_sections_default_patch_and_validate() {
    let workspace = temp_dir("schooldesk-settings");
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

    let settings = sc.call("settings.get", json!({ "auth": admin_auth() }));
    assert_eq!(settings["school"]["name"].as_str(), Some(""));
    assert_eq!(settings["term"]["currentTerm"].as_i64(), Some(1));
    let bands = settings["grading"]["bands"].as_array().expect("bands");
    assert_eq!(bands.len(), 6);
    assert_eq!(bands[0]["grade"].as_str(), Some("A"));
    assert_eq!(bands[5]["min"].as_f64(), Some(0.0));

    sc.call(
        "settings.update",
        json!({
            "auth": admin_auth(),
            "section": "school",
            "patch": { "name": "Unity Basic School", "motto": "Knowledge is light" }
        }),
    );
    sc.call(
        "settings.update",
        json!({
            "auth": admin_auth(),
            "section": "term",
            "patch": { "currentTerm": 2, "currentYear": 2025 }
        }),
    );
    sc.call(
        "settings.update",
        json!({
            "auth": admin_auth(),
            "section": "grading",
            "patch": {
                "bands": [
                    { "min": 75, "grade": "A" },
                    { "min": 50, "grade": "P" },
                    { "min": 0, "grade": "F" }
                ]
            }
        }),
    );

    let settings = sc.call("settings.get", json!({ "auth": admin_auth() }));
    assert_eq!(
        settings["school"]["name"].as_str(),
        Some("Unity Basic School")
    );
    assert_eq!(settings["term"]["currentTerm"].as_i64(), Some(2));
    let bands = settings["grading"]["bands"].as_array().expect("bands");
    assert_eq!(bands.len(), 3);
    assert_eq!(bands[1]["grade"].as_str(), Some("P"));

    // Partial patches keep the other fields of the section.
    sc.call(
        "settings.update",
        json!({
            "auth": admin_auth(),
            "section": "school",
            "patch": { "phone": "0302-000-000" }
        }),
    );
    let settings = sc.call("settings.get", json!({ "auth": admin_auth() }));
    assert_eq!(
        settings["school"]["motto"].as_str(),
        Some("Knowledge is light")
    );
    assert_eq!(settings["school"]["phone"].as_str(), Some("0302-000-000"));

    // Field-level validation rejects the whole patch.
    sc.expect_bad_params(json!({
        "auth": admin_auth(),
        "section": "term",
        "patch": { "currentTerm": 5 }
    }));
    sc.expect_bad_params(json!({
        "auth": admin_auth(),
        "section": "school",
        "patch": { "founded": 1901 }
    }));
    sc.expect_bad_params(json!({
        "auth": admin_auth(),
        "section": "grading",
        "patch": { "bands": [{ "min": 10, "grade": "B" }, { "min": 60, "grade": "A" }] }
    }));
    sc.expect_bad_params(json!({
        "auth": admin_auth(),
        "section": "grading",
        "patch": { "bands": [] }
    }));

    // Rejected patches leave the stored section untouched.
    let settings = sc.call("settings.get", json!({ "auth": admin_auth() }));
    assert_eq!(settings["term"]["currentTerm"].as_i64(), Some(2));
    assert_eq!(
        settings["grading"]["bands"].as_array().map(|b| b.len()),
        Some(3)
    );

    drop(sc);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
