#![allow(dead_code)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::SeqCst),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub struct Sidecar {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn spawn_sidecar() -> Sidecar {
    let exe = env!("CARGO_BIN_EXE_gradetrackd");
    let mut child = Command::new(exe)
        .env_remove("GRADETRACK_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradetrackd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    Sidecar {
        child,
        stdin,
        reader: BufReader::new(stdout),
        next_id: 0,
    }
}

/// Spawn and select a fresh workspace.
pub fn open_workspace(prefix: &str) -> (Sidecar, PathBuf) {
    let workspace = temp_dir(prefix);
    let mut sc = spawn_sidecar();
    let _ = sc.ok(
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    (sc, workspace)
}

impl Sidecar {
    pub fn send_raw(&mut self, line: &str) -> Value {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut out = String::new();
        self.reader.read_line(&mut out).expect("read response line");
        assert!(!out.trim().is_empty(), "empty response");
        serde_json::from_str(out.trim()).expect("parse response json")
    }

    pub fn request(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        let value = self.send_raw(&payload.to_string());
        assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
        value
    }

    pub fn ok(&mut self, method: &str, params: Value) -> Value {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "expected ok for {}: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    /// Returns the error code.
    pub fn err(&mut self, method: &str, params: Value) -> String {
        let value = self.request(method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "expected error for {}: {}",
            method,
            value
        );
        value["error"]["code"]
            .as_str()
            .expect("error code")
            .to_string()
    }

    pub fn create_subject(&mut self, name: &str) -> String {
        let res = self.ok("subjects.create", json!({ "name": name }));
        res["subjectId"].as_str().expect("subjectId").to_string()
    }

    pub fn create_category(&mut self, subject_id: &str, name: &str, total_weight: f64) -> String {
        let res = self.ok(
            "categories.create",
            json!({ "subjectId": subject_id, "name": name, "totalWeight": total_weight }),
        );
        res["categoryId"].as_str().expect("categoryId").to_string()
    }

    pub fn add_assessment(
        &mut self,
        subject_id: &str,
        category_id: &str,
        name: &str,
        study_time: f64,
        grade: Option<f64>,
    ) -> String {
        let res = self.ok(
            "assessments.create",
            json!({
                "subjectId": subject_id,
                "categoryId": category_id,
                "assignmentName": name,
                "studyTime": study_time,
                "grade": grade
            }),
        );
        res["assessmentId"].as_str().expect("assessmentId").to_string()
    }

    pub fn add_prediction(
        &mut self,
        subject_id: &str,
        category_id: &str,
        name: &str,
        study_time: f64,
        grade: f64,
    ) -> String {
        let res = self.ok(
            "assessments.create",
            json!({
                "subjectId": subject_id,
                "categoryId": category_id,
                "assignmentName": name,
                "studyTime": study_time,
                "grade": grade,
                "isPrediction": true
            }),
        );
        res["assessmentId"].as_str().expect("assessmentId").to_string()
    }
}

pub fn f(v: &Value) -> f64 {
    v.as_f64().unwrap_or_else(|| panic!("expected number, got {}", v))
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.011
}
