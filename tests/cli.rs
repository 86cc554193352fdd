use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn gale() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gale"));
    cmd.env_remove("GALE_MAX_STEPS")
        .env_remove("GALE_MAX_ALLOCATIONS")
        .env_remove("GALE_MAX_FRAMES")
        .env_remove("GALE_LOG")
        .env_remove("RUST_LOG");
    cmd
}

fn script(dir: &TempDir, name: &str, source: &str) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, source).unwrap();
    path
}

fn run(path: &Path, extra: &[&str]) -> Output {
    gale().arg("run").arg(path).args(extra).output().expect("failed to run gale")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

// --- run ---

#[test]
fn run_prints_main_result() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { return 6 * 7 }");
    let out = run(&path, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "42");
}

#[test]
fn run_without_main_executes_globals() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "let who = \"world\"\nconsole.log(\"hello\", who)");
    let out = run(&path, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hello world");
}

#[test]
fn arguments_arrive_as_strings() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main(a, b) { return a + b }");
    let out = run(&path, &["1", "2"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "12");
}

#[test]
fn func_flag_calls_after_globals() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "let prefix = \"hi \"\nfunction greet(name) { return prefix + name }");
    let out = run(&path, &["--func", "greet", "gale"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hi gale");
}

#[test]
fn unknown_func() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "let x = 1");
    let out = run(&path, &["--func", "nope"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("function nope not found"), "{}", stderr(&out));
}

#[test]
fn imports_resolve_next_to_the_entry_file() {
    let dir = tempfile::tempdir().unwrap();
    script(&dir, "lib/math.ts", "export function double(x) { return x * 2 }");
    let path = script(&dir, "main.ts", "import * as m from \"./lib/math\"\nfunction main() { return m.double(21) }");
    let out = run(&path, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "42");
}

// --- errors ---

#[test]
fn uncaught_error_reports_stack() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function div(a, b) {\n return a / b\n}\nfunction main() {\n return div(1, 0)\n}");
    let out = run(&path, &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[GALE-R001]: Attempt to divide by zero"), "{err}");
    assert!(err.contains("note: at"), "{err}");
}

#[test]
fn compile_error_points_at_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() {\n  return missing\n}");
    let out = run(&path, &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[GALE-C001]: Undeclared identifier: missing"), "{err}");
    assert!(err.contains("main.ts:2:"), "{err}");
    assert!(err.contains("return missing"), "{err}");
}

#[test]
fn syntax_error_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "let y = 1 +* 2");
    let out = gale().args(["--json", "run"]).arg(&path).output().unwrap();
    assert!(!out.status.success());
    let line = stderr(&out).lines().last().unwrap_or_default().to_string();
    let v: serde_json::Value = serde_json::from_str(&line).expect("json diagnostic");
    assert_eq!(v["severity"], "error");
    assert!(v["code"].as_str().unwrap().starts_with("GALE-P"), "{v}");
    assert!(v["file"].as_str().unwrap().ends_with("main.ts"));
    assert_eq!(v["labels"][0]["line"], 1);
}

#[test]
fn missing_file() {
    let out = gale().args(["run", "/nonexistent/main.ts"]).output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("GALE-F001"), "{}", stderr(&out));
}

#[test]
fn panic_is_reported_not_printed_by_the_hook() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { panic(\"boom\") }");
    let out = run(&path, &[]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("error[GALE-R003]: PANIC: boom"), "{err}");
    assert!(!err.contains("panicked at"), "{err}");
}

// --- limits ---

#[test]
fn step_limit_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { while (true) { } }");
    let out = run(&path, &["--max-steps", "500"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("error[GALE-R002]: Step limit reached: 500"), "{}", stderr(&out));
}

#[test]
fn step_limit_from_env() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { try { while (true) { } } catch { return 1 } }");
    let out = gale().arg("run").arg(&path).env("GALE_MAX_STEPS", "200").output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Step limit reached: 200"), "{}", stderr(&out));
}

#[test]
fn config_file_sets_frame_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = script(&dir, "gale.json", r#"{ "max_frames": 16 }"#);
    let path = script(&dir, "main.ts", "function f(n) { return f(n + 1) }\nfunction main() { return f(0) }");
    let out = run(&path, &["--config", config.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Max stack frames reached: 16"), "{}", stderr(&out));
}

#[test]
fn flags_override_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = script(&dir, "gale.json", r#"{ "max_steps": 5 }"#);
    let path = script(&dir, "main.ts", "function main() { let s = 0\n for (let i = 0; i < 10; i++) { s += i }\n return s }");
    let out = run(&path, &["--config", config.to_str().unwrap(), "--max-steps", "0"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "45");
}

#[test]
fn invalid_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = script(&dir, "gale.json", "{ max_steps }");
    let path = script(&dir, "main.ts", "let x = 1");
    let out = run(&path, &["--config", config.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("GALE-F002"), "{}", stderr(&out));
}

// --- tooling ---

#[test]
fn disasm_lists_functions_and_constants() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { return \"hi\" }");
    let out = gale().arg("disasm").arg(&path).output().unwrap();
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("0F @global"), "{text}");
    assert!(text.contains("F main"), "{text}");
    assert!(text.contains("K string hi"), "{text}");
}

#[test]
fn names_with_registers() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { let counter = 1\n return counter }");
    let plain = gale().arg("names").arg(&path).output().unwrap();
    let full = gale().args(["names", "--registers"]).arg(&path).output().unwrap();
    assert!(stdout(&plain).contains("main"));
    assert!(!stdout(&plain).contains("counter"));
    assert!(stdout(&full).contains("counter"), "{}", stdout(&full));
}

#[test]
fn ast_is_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(&dir, "main.ts", "function main() { return 1 }");
    let out = gale().arg("ast").arg(&path).output().unwrap();
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("ast json");
    assert!(v["main"]["path"].as_str().unwrap().ends_with("main.ts"));
    assert!(v["main"]["stmts"].as_array().is_some_and(|s| s.len() == 1));
}

#[test]
fn explain_codes() {
    let out = gale().args(["explain", "gale-p014"]).output().unwrap();
    assert!(out.status.success());
    assert!(stdout(&out).starts_with("## GALE-P014"));

    let out = gale().arg("explain").output().unwrap();
    assert!(stdout(&out).lines().any(|l| l.starts_with("GALE-R002")));

    let out = gale().args(["explain", "GALE-X1"]).output().unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("unknown error code 'GALE-X1'"));
}
