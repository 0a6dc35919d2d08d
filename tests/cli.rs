//! Integration tests for the command-line interface
//!
//! Runs the built binary against a throwaway install tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const PARSERS: &str = "import logging\nimport pycolmap\n\nlogger = logging.getLogger(__name__)\n";

/// Helper: an install root with one hloc file and a patch file pointing at it
fn setup_install() -> TempDir {
    let dir = TempDir::new().unwrap();

    let pkg = dir.path().join("site-packages/hloc/utils");
    fs::create_dir_all(&pkg).unwrap();
    fs::write(pkg.join("parsers.py"), PARSERS).unwrap();

    let patches = dir.path().join("patches");
    fs::create_dir(&patches).unwrap();
    fs::write(
        patches.join("10-hloc.toml"),
        format!(
            r##"[meta]
name = "hloc"
roots = ["{missing}", "{site}"]

[[meta.toggles]]
env = "APPLY_PYCOLMAP_PATCHES"
category = "pycolmap"

[[patches]]
id = "hloc-parsers-safe-import"
file = "hloc/utils/parsers.py"
marker = "PYCOLMAP_SAFE_IMPORT"
category = "pycolmap"

[patches.strategy]
type = "conditional-wrap"
anchor = "import pycolmap"
template = '''
# PYCOLMAP_SAFE_IMPORT
try:
    {{anchor}}
except ImportError:
    pycolmap = None
'''

[[patches]]
id = "viser-camera-message"
file = "viser/_messages.py"
marker = "VISER_COMPAT_PATCH"
required = false

[patches.strategy]
type = "block-append"
placement = "end-of-file"
content = "# VISER_COMPAT_PATCH\nCameraMessage = None\n"
"##,
            missing = dir.path().join("dist-packages").display(),
            site = dir.path().join("site-packages").display(),
        ),
    )
    .unwrap();

    dir
}

fn parsers_path(dir: &Path) -> PathBuf {
    dir.join("site-packages/hloc/utils/parsers.py")
}

fn run(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_site-patcher"))
        .args(args)
        .arg("--patches")
        .arg(dir.join("patches"))
        .env("NO_COLOR", "1")
        .env_remove("APPLY_PYCOLMAP_PATCHES")
        .env_remove("SITE_PATCHER_PATCHES")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run site-patcher")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_apply_then_rerun() {
    let dir = setup_install();

    let first = run(dir.path(), &["apply"]);
    assert!(first.status.success(), "{first:?}");
    let out = stdout(&first);
    assert!(out.contains("hloc-parsers-safe-import: applied"), "{out}");
    assert!(out.contains("viser-camera-message: skipped (not found)"), "{out}");
    assert!(out.contains("1/2"), "{out}");

    let patched = fs::read_to_string(parsers_path(dir.path())).unwrap();
    assert!(patched.contains("# PYCOLMAP_SAFE_IMPORT\ntry:\n    import pycolmap\n"));

    let second = run(dir.path(), &["apply"]);
    assert!(second.status.success());
    assert!(stdout(&second).contains("hloc-parsers-safe-import: already applied"));
    assert!(stdout(&second).contains("0/2"));
    assert_eq!(fs::read_to_string(parsers_path(dir.path())).unwrap(), patched);
}

#[test]
fn test_status_does_not_write() {
    let dir = setup_install();

    let output = run(dir.path(), &["status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("hloc-parsers-safe-import: would apply"));
    assert_eq!(
        fs::read_to_string(parsers_path(dir.path())).unwrap(),
        PARSERS
    );
}

#[test]
fn test_failure_exit_codes() {
    let dir = setup_install();
    // Not UTF-8: reading the target fails inside the unit.
    fs::write(parsers_path(dir.path()), [0xff, 0xfe, 0x00, 0x80]).unwrap();

    let best_effort = run(dir.path(), &["apply"]);
    assert!(best_effort.status.success());
    assert!(stdout(&best_effort).contains("hloc-parsers-safe-import: failed"));

    let strict = run(dir.path(), &["apply", "--strict"]);
    assert_eq!(strict.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&strict.stderr);
    assert!(stderr.contains("hloc-parsers-safe-import"), "{stderr}");
}

#[test]
fn test_strict_ignores_skips() {
    let dir = setup_install();
    fs::remove_file(parsers_path(dir.path())).unwrap();

    let output = run(dir.path(), &["apply", "--strict"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("0/2"));
}

#[test]
fn test_environment_toggle() {
    let dir = setup_install();

    let output = Command::new(env!("CARGO_BIN_EXE_site-patcher"))
        .args(["apply", "--patches"])
        .arg(dir.path().join("patches"))
        .env("NO_COLOR", "1")
        .env("APPLY_PYCOLMAP_PATCHES", "false")
        .output()
        .unwrap();

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(!out.contains("hloc-parsers-safe-import"), "{out}");
    assert!(out.contains("0/1"), "{out}");
    assert_eq!(
        fs::read_to_string(parsers_path(dir.path())).unwrap(),
        PARSERS
    );
}

#[test]
fn test_skip_category_flag() {
    let dir = setup_install();

    let output = run(dir.path(), &["list", "--skip-category", "pycolmap"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(!out.contains("hloc-parsers-safe-import"));
    assert!(out.contains("viser-camera-message"));
    assert!(out.contains("1 patch(es)"));
}

#[test]
fn test_json_report() {
    let dir = setup_install();

    let output = run(dir.path(), &["apply", "--json"]);
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["applied_count"], 1);
    assert_eq!(report["total_count"], 2);
    assert_eq!(report["results"][0]["unit_id"], "hloc-parsers-safe-import");
    assert_eq!(report["results"][0]["status"], "Applied");
    assert_eq!(report["results"][1]["status"], "SkippedNotFound");
}

#[test]
fn test_diff_output() {
    let dir = setup_install();

    let output = run(dir.path(), &["apply", "--diff"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("(original)"), "{out}");
    assert!(out.contains("+# PYCOLMAP_SAFE_IMPORT"), "{out}");
    assert!(out.contains("-import pycolmap"), "{out}");
}

#[test]
fn test_missing_patch_directory_does_not_abort() {
    let dir = TempDir::new().unwrap();

    let output = run(dir.path(), &["apply"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("no .toml patch files"), "{out}");
    assert!(out.contains("0/1"), "{out}");

    let strict = run(dir.path(), &["apply", "--strict"]);
    assert_eq!(strict.status.code(), Some(1));
}

#[test]
fn test_broken_patch_file_does_not_stop_other_files() {
    let dir = setup_install();
    fs::write(
        dir.path().join("patches/20-broken.toml"),
        r#"[[patches]]
id = "broken"
file = "pkg/a.py"
marker = "BROKEN_MARK"

[patches.strategy]
type = "regex-replace"
pattern = "("
replacement = "BROKEN_MARK"
"#,
    )
    .unwrap();

    let output = run(dir.path(), &["apply"]);
    assert!(output.status.success(), "{output:?}");
    let out = stdout(&output);
    assert!(out.contains("20-broken.toml: failed"), "{out}");
    assert!(out.contains("hloc-parsers-safe-import: applied"), "{out}");
    assert!(out.contains("1/3"), "{out}");
    assert!(fs::read_to_string(parsers_path(dir.path()))
        .unwrap()
        .contains("PYCOLMAP_SAFE_IMPORT"));

    let strict = run(dir.path(), &["apply", "--strict"]);
    assert_eq!(strict.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&strict.stderr).contains("20-broken.toml"));
}

#[test]
fn test_patch_location_from_environment() {
    let dir = setup_install();
    let elsewhere = TempDir::new().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_site-patcher"))
        .arg("apply")
        .current_dir(elsewhere.path())
        .env("NO_COLOR", "1")
        .env("SITE_PATCHER_PATCHES", dir.path().join("patches"))
        .env_remove("APPLY_PYCOLMAP_PATCHES")
        .output()
        .unwrap();

    assert!(output.status.success());
    assert!(stdout(&output).contains("hloc-parsers-safe-import: applied"));
}
