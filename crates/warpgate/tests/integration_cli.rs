//! CLI smoke tests

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("warpgate")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"))
        .stdout(predicate::str::contains("manifest"));
}

#[test]
fn build_requires_a_readable_template() {
    Command::cargo_bin("warpgate")
        .unwrap()
        .args(["build", "/nonexistent/template.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("template"));
}

#[test]
fn build_rejects_malformed_templates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("template.yaml");
    std::fs::write(&path, "name: [not, a, string\n").unwrap();

    Command::cargo_bin("warpgate")
        .unwrap()
        .args(["build", path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn manifest_create_needs_digest_files() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("warpgate")
        .unwrap()
        .args([
            "manifest",
            "create",
            "--registry",
            "localhost:1",
            "--image",
            "missing",
            "--dir",
            dir.path().to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("digest"));
}

#[test]
fn unknown_provisioner_type_fails_template_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("template.yaml");
    std::fs::write(
        &path,
        r#"
name: box
version: "1.0.0"
architectures: [amd64]
base:
  image: alpine
provisioners:
  - type: chef
    recipes: [default]
"#,
    )
    .unwrap();

    Command::cargo_bin("warpgate")
        .unwrap()
        .args(["build", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsing template"));
}
