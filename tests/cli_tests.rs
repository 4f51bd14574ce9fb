use assert_cmd::Command;
use langctx::module_cache::{encode_artifact, Fingerprint};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

mod test_utils;

use test_utils::Workspace;

/// Target description with one image carrying conflicting flags
fn write_target(ws: &Workspace) -> anyhow::Result<PathBuf> {
    let yaml = format!(
        r#"
id: 1
platform: linux
toolchain-root: {toolchain}
sdk-path: {sdk}
images:
  - id: 1
    path: {build}/app
    has-debug-info: true
    options: ["-DCONFLICT=1", "-warnings-as-errors", "-enable-testing"]
  - id: 2
    path: {build}/libDylib.so
    options: ["-D", "CONFLICT=2", "-Xcc", "-Werror"]
"#,
        toolchain = ws.toolchain().display(),
        sdk = ws.path().join("sdk").display(),
        build = ws.build_dir().display(),
    );
    let path = ws.path().join("target.yaml");
    fs::write(&path, yaml)?;
    Ok(path)
}

fn write_settings(ws: &Workspace, extra: &str) -> anyhow::Result<PathBuf> {
    let path = ws.path().join("settings.yaml");
    fs::write(
        &path,
        format!("module-cache-path: {}\n{extra}", ws.cache_dir().display()),
    )?;
    Ok(path)
}

fn langctx() -> Command {
    let mut cmd = Command::cargo_bin("langctx").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn arg(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn test_version_flag() {
    langctx()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("langctx"));
}

#[test]
fn test_help_lists_subcommands() {
    langctx()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("plugin-server"))
        .stdout(predicate::str::contains("sanitize"))
        .stdout(predicate::str::contains("health"));
}

#[test]
fn test_sanitize_prints_merged_options() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;

    langctx()
        .args(["sanitize", "--target", &arg(&target)])
        .assert()
        .success()
        .stdout(predicate::str::contains("-enable-testing"))
        .stdout(predicate::str::contains("suppressed: -warnings-as-errors"))
        .stdout(predicate::str::contains("image#1: -DCONFLICT=1"))
        .stdout(predicate::str::contains("image#2: -DCONFLICT=2"));
    Ok(())
}

#[test]
fn test_sanitize_json() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;

    let output = langctx()
        .args(["sanitize", "--target", &arg(&target), "--json"])
        .output()?;
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let suppressed = json["suppressed"].as_array().expect("suppressed list");
    assert!(suppressed.iter().any(|v| v == "-warnings-as-errors"));
    assert!(suppressed.iter().any(|v| v == "-Werror"));
    assert_eq!(json["conflicts"].as_array().map(Vec::len), Some(1));
    Ok(())
}

#[test]
fn test_resolve_binary_module_from_search_path() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;
    let settings = write_settings(&ws, "")?;
    let fingerprint = Fingerprint::compute(b"prebuilt elsewhere", "");
    let module = ws.build_dir().join("Binary.swiftmodule");
    fs::write(&module, encode_artifact(&fingerprint, b"payload"))?;

    langctx()
        .args(["--settings", &arg(&settings), "resolve", "-t", &arg(&target), "Binary"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("Binary\t{}", module.display())));
    Ok(())
}

#[test]
fn test_resolve_missing_module_exit_code() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;
    let settings = write_settings(&ws, "")?;

    langctx()
        .args(["--settings", &arg(&settings), "resolve", "-t", &arg(&target), "Missing"])
        .assert()
        .code(langctx::exit_codes::MODULE_NOT_FOUND)
        .stderr(predicate::str::contains("MODULE_NOT_FOUND"))
        .stderr(predicate::str::contains("no such module 'Missing'"));
    Ok(())
}

#[test]
fn test_disabled_importer_exit_code() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;
    let settings = write_settings(&ws, "use-secondary-importer: false\n")?;

    langctx()
        .args(["--settings", &arg(&settings), "resolve", "-t", &arg(&target), "A"])
        .assert()
        .code(langctx::exit_codes::DISABLED);
    Ok(())
}

#[test]
fn test_invalid_settings_file() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;
    let settings = write_settings(&ws, "bogus-key: 1\n")?;

    langctx()
        .args(["--settings", &arg(&settings), "resolve", "-t", &arg(&target), "A"])
        .assert()
        .code(langctx::exit_codes::CONFIG_ERROR)
        .stderr(predicate::str::contains("bogus-key"));
    Ok(())
}

#[test]
fn test_plugin_server_not_found_lists_candidates() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let compiler = dir.path().join("llvm-linux/bin/clang");

    langctx()
        .args([
            "plugin-server",
            "--build-dir",
            &arg(dir.path()),
            "--compiler",
            &arg(&compiler),
        ])
        .assert()
        .code(langctx::exit_codes::PLUGIN_ERROR)
        .stderr(predicate::str::contains("Tried:"))
        .stderr(predicate::str::contains("swift-linux/bin/swift-plugin-server"));
    Ok(())
}

#[test]
fn test_plugin_server_override() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let settings = write_settings(
        &ws,
        &format!(
            "plugin-server-override:\n  {}: /opt/worker\n",
            ws.build_dir().display()
        ),
    )?;

    langctx()
        .args([
            "--settings",
            &arg(&settings),
            "plugin-server",
            "--build-dir",
            &arg(&ws.build_dir()),
        ])
        .assert()
        .success()
        .stdout(predicate::str::diff("/opt/worker\n"));
    Ok(())
}

#[test]
fn test_health_dumps_configuration() -> anyhow::Result<()> {
    let ws = Workspace::new()?;
    let target = write_target(&ws)?;
    let settings = write_settings(&ws, "")?;

    langctx()
        .args(["--settings", &arg(&settings), "health", "-t", &arg(&target)])
        .assert()
        .success()
        .stdout(predicate::str::contains("langctx health log"))
        .stdout(predicate::str::contains("LanguageContext::log_configuration"))
        .stdout(predicate::str::contains("Runtime library paths: (2 items)"))
        .stdout(predicate::str::contains("Using prebuilt module cache path:"));
    Ok(())
}
