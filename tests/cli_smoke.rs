use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn handreceipt(data_dir: &std::path::Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("handreceipt")?;
    cmd.env("HANDRECEIPT_DATA_DIR", data_dir)
        .env("HANDRECEIPT_LOG", "off")
        .env_remove("HANDRECEIPT_API_URL")
        .env_remove("HANDRECEIPT_API_TOKEN");
    Ok(cmd)
}

fn stdout_json(output: &std::process::Output) -> Result<Value> {
    Ok(serde_json::from_slice(&output.stdout)?)
}

#[test]
fn migrate_seed_and_read_back() -> Result<()> {
    let dir = tempdir()?;

    let output = handreceipt(dir.path())?.args(["db", "migrate"]).output()?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(stdout_json(&output)?["version"], 4);

    let output = handreceipt(dir.path())?.arg("seed").output()?;
    assert!(output.status.success());
    let report = stdout_json(&output)?;
    assert!(report["tables"].as_array().is_some_and(|t| !t.is_empty()));

    let output = handreceipt(dir.path())?.args(["db", "status"]).output()?;
    assert!(output.status.success());
    let status = stdout_json(&output)?;
    assert_eq!(status["tables"]["properties"], 4);
    assert_eq!(status["tables"]["outbox"], 0);

    let output = handreceipt(dir.path())?.arg("stats").output()?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)?["total"], 4);

    let output = handreceipt(dir.path())?
        .args(["list", "maintenance-items"])
        .output()?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)?.as_array().map(Vec::len), Some(4));
    Ok(())
}

#[test]
fn outbox_commands_report_missing_entries() -> Result<()> {
    let dir = tempdir()?;

    let output = handreceipt(dir.path())?.args(["outbox", "list"]).output()?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)?, Value::Array(Vec::new()));

    let output = handreceipt(dir.path())?
        .args(["outbox", "retry", "missing"])
        .output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("STORE/NOT_FOUND"));
    Ok(())
}

#[test]
fn sync_drain_needs_an_api_url() -> Result<()> {
    let dir = tempdir()?;
    let output = handreceipt(dir.path())?.args(["sync", "drain"]).output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("HANDRECEIPT_API_URL"));
    Ok(())
}

#[test]
fn unknown_table_is_an_error() -> Result<()> {
    let dir = tempdir()?;
    let output = handreceipt(dir.path())?.args(["list", "households"]).output()?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown table"));
    Ok(())
}
