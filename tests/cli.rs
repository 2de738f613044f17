//! Integration tests driving the gmindex binary.

use gmindex::module_file::{write_module_summary, ModuleSummary};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Run gmindex with given args, returning (stdout, stderr, success)
fn run_gmindex(args: &[&str], dir: &Path) -> (String, String, bool) {
    let config = dir.join("gmindex-test-config.json");
    std::fs::write(&config, r#"{"show_progress": false}"#).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_gmindex"))
        .args(args)
        .arg("--config")
        .arg(&config)
        .env_remove("GMINDEX_LOG")
        .output()
        .expect("Failed to run gmindex");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let module = |name: &str, identifiers: &[&str], deps: &[&str]| {
        let summary = ModuleSummary {
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            selectors: Vec::new(),
            dependencies: deps.iter().map(PathBuf::from).collect(),
        };
        write_module_summary(&dir.path().join(name), &summary).unwrap();
    };
    module("M1.pcm", &["foo", "bar"], &[]);
    module("M2.pcm", &["foo", "baz"], &["M1.pcm"]);
    dir
}

fn path_arg(dir: &Path) -> &str {
    dir.to_str().unwrap()
}

#[test]
fn test_build_then_lookup() {
    let dir = fixture();
    let d = path_arg(dir.path());

    let (stdout, stderr, ok) = run_gmindex(&["build", d], dir.path());
    assert!(ok, "build failed: {stderr}");
    assert!(stdout.contains("Generation 1: 2 scanned"), "{stdout}");

    let (stdout, _, ok) = run_gmindex(&["lookup", "--dir", d, "foo", "baz", "qux"], dir.path());
    assert!(ok);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["foo: M1.pcm M2.pcm", "baz: M2.pcm", "qux: not found"]);
}

#[test]
fn test_rebuild_is_up_to_date() {
    let dir = fixture();
    let d = path_arg(dir.path());
    assert!(run_gmindex(&["build", d], dir.path()).2);

    let (stdout, _, ok) = run_gmindex(&["build", d], dir.path());
    assert!(ok);
    assert!(stdout.contains("up to date"), "{stdout}");

    let (stdout, _, ok) = run_gmindex(&["build", "--force", d], dir.path());
    assert!(ok);
    assert!(stdout.contains("Generation 2"), "{stdout}");
}

#[test]
fn test_modules_and_deps() {
    let dir = fixture();
    let d = path_arg(dir.path());
    assert!(run_gmindex(&["build", d], dir.path()).2);

    let (stdout, _, ok) = run_gmindex(&["modules", d], dir.path());
    assert!(ok);
    assert!(stdout.contains("M1.pcm"));
    assert!(stdout.contains("M2.pcm"));

    let (stdout, _, ok) = run_gmindex(&["deps", "--dir", d, "M2.pcm"], dir.path());
    assert!(ok);
    assert_eq!(stdout.trim(), "M1.pcm");

    let (_, stderr, ok) = run_gmindex(&["deps", "--dir", d, "Nope.pcm"], dir.path());
    assert!(!ok);
    assert!(stderr.contains("not in the index"));
}

#[test]
fn test_stats_and_remove() {
    let dir = fixture();
    let d = path_arg(dir.path());
    assert!(run_gmindex(&["build", d], dir.path()).2);

    let (stdout, _, ok) = run_gmindex(&["stats", d], dir.path());
    assert!(ok);
    assert!(stdout.contains("Generation:       1"));
    assert!(stdout.contains("Entries:        3"));

    let (stdout, _, ok) = run_gmindex(&["remove", d], dir.path());
    assert!(ok);
    assert!(stdout.contains("Removed index"));

    let (_, stderr, ok) = run_gmindex(&["stats", d], dir.path());
    assert!(!ok);
    assert!(stderr.contains("Cannot open global module index"));
}
