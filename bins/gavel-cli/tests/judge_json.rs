use std::fs;
use std::path::Path;
use std::process::{Command, Output};

const SH_LANGUAGES: &str = r#"{
  "languages": [
    {
      "name": "sh",
      "source_file": "solution.sh",
      "run": { "program": "sh", "args": ["{source}"] }
    }
  ]
}"#;

fn judge_json(dir: &Path, source: &str, tests: &str) -> Output {
    let source_path = dir.join("solution.sh");
    let tests_path = dir.join("tests.json");
    let languages_path = dir.join("languages.json");
    let workspaces = dir.join("workspaces");
    fs::write(&source_path, source).unwrap();
    fs::write(&tests_path, tests).unwrap();
    fs::write(&languages_path, SH_LANGUAGES).unwrap();

    Command::new(env!("CARGO_BIN_EXE_gavel-cli"))
        .current_dir(dir)
        .env("RUST_LOG", "debug")
        .env("GAVEL_ISOLATE_NETWORK", "false")
        .env("GAVEL_WORKSPACE_ROOT", &workspaces)
        .arg("judge")
        .arg("--lang")
        .arg("sh")
        .arg("--source")
        .arg(&source_path)
        .arg("--tests")
        .arg(&tests_path)
        .arg("--languages")
        .arg(&languages_path)
        .arg("--json")
        .output()
        .unwrap()
}

#[test]
fn json_stdout_is_a_single_document() {
    let dir = tempfile::tempdir().unwrap();
    let output = judge_json(
        dir.path(),
        "read x\necho $((x * 2))\n",
        r#"[{"input": "2\n", "expected_output": "4"}, {"input": "5\n", "expected_output": "10"}]"#,
    );

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}):\n{}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    });
    assert_eq!(snapshot["status"], "accepted");
    assert_eq!(snapshot["results"].as_array().unwrap().len(), 2);
    assert_eq!(snapshot["summary"]["passed"], 2);

    // Logs still go somewhere, just not to stdout
    assert!(!output.stderr.is_empty());
}

#[test]
fn rejected_verdict_exits_nonzero_with_json() {
    let dir = tempfile::tempdir().unwrap();
    let output = judge_json(
        dir.path(),
        "echo wrong\n",
        r#"[{"input": "", "expected_output": "right"}]"#,
    );

    assert_eq!(output.status.code(), Some(1));
    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(snapshot["status"], "wrong_answer");
}
