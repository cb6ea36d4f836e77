//! CLI integration tests for nb
//!
//! Runs the built binary in a scratch directory so no stray config is
//! picked up from the checkout.

use std::fs;
use std::process::{Command, Output};

fn nb(dir: &tempfile::TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_nb"))
        .args(args)
        .current_dir(dir.path())
        .output()
        .expect("failed to run nb")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "nb failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_types_lists_constants() {
    let dir = tempfile::tempdir().unwrap();
    let out = stdout(&nb(&dir, &["types"]));
    for name in ["INT8", "UINT64", "FLOAT64", "POINTER", "VOID", "LONGDOUBLE"] {
        assert!(out.contains(name), "missing {} in:\n{}", name, out);
    }
    assert!(!out.contains("SHORT"));

    let all = stdout(&nb(&dir, &["types", "--all"]));
    assert!(all.contains("SHORT"));
    assert!(all.contains("buffer_inout"));
}

#[test]
fn test_types_include_config_typedefs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("nativebind.toml"),
        "[typedefs]\nsize_t = \"ulong\"\n",
    )
    .unwrap();
    let out = stdout(&nb(&dir, &["types", "--all"]));
    assert!(out.contains("size_t"));
}

#[test]
fn test_layout_natural_and_packed() {
    let dir = tempfile::tempdir().unwrap();
    let out = stdout(&nb(&dir, &["layout", "a:char", "b:int", "c:double"]));
    assert!(out.starts_with("size 16 align 8"), "{}", out);

    let out = stdout(&nb(&dir, &["layout", "a:char", "b:int", "--packed", "1"]));
    assert!(out.starts_with("size 5 align 1"), "{}", out);

    let out = stdout(&nb(&dir, &["layout", "i:int", "d:double", "--union"]));
    assert!(out.starts_with("size 8 align 8"), "{}", out);
}

#[test]
fn test_layout_rejects_bad_fields() {
    let dir = tempfile::tempdir().unwrap();
    let output = nb(&dir, &["layout", "a:nosuchtype"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("can't convert Symbol into Type"));

    let output = nb(&dir, &["layout", "a:int", "b:int@2"]);
    assert!(!output.status.success());
}

#[cfg(target_os = "linux")]
#[test]
fn test_call_pow_from_libm() {
    let dir = tempfile::tempdir().unwrap();
    let out = stdout(&nb(
        &dir,
        &["call", "-l", "libm.so.6", "double pow(double, double)", "2", "10"],
    ));
    assert_eq!(out.trim(), "1024.0");
}

#[cfg(unix)]
#[test]
fn test_call_through_process_table() {
    let dir = tempfile::tempdir().unwrap();
    let out = stdout(&nb(&dir, &["call", "long labs(long)", "-42"]));
    assert_eq!(out.trim(), "42");
}

#[test]
fn test_call_arity_mismatch_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = nb(&dir, &["call", "int abs(int)"]);
    assert!(!output.status.success());
}
