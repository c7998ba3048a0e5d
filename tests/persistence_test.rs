#![cfg(feature = "storage-rocksdb")]

mod common;

use assert_cmd::cargo_bin;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_rocksdb_interrupted_flow_recovery() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test_db");

    // 1. First run: launch a purchase flow and exit before it completes
    let script1 = dir.path().join("launch.csv");
    common::write_script(&script1, &["purchase, sku1"]).unwrap();

    let mut cmd1 = Command::new(cargo_bin!("billing-session"));
    cmd1.arg(&script1).arg("--db-path").arg(&db_path);

    let output1 = cmd1.output().expect("Failed to execute command");
    assert!(output1.status.success());
    let stdout1 = String::from_utf8_lossy(&output1.stdout);
    assert!(!stdout1.contains("sku1"));

    // 2. Second run: the platform delivers the result to a new process
    let script2 = dir.path().join("resume.csv");
    common::write_script(&script2, &["complete, sku1"]).unwrap();

    let mut cmd2 = Command::new(cargo_bin!("billing-session"));
    cmd2.arg(&script2).arg("--db-path").arg(&db_path);

    let output2 = cmd2.output().expect("Failed to execute command");
    assert!(output2.status.success());
    let stdout2 = String::from_utf8_lossy(&output2.stdout);
    let stderr2 = String::from_utf8_lossy(&output2.stderr);
    assert!(stderr2.contains("event: purchased sku1"));
    assert!(stdout2.contains("sku1,managed,false"));

    // 3. Third run: the flow was resolved and is gone
    let mut cmd3 = Command::new(cargo_bin!("billing-session"));
    cmd3.arg(&script2).arg("--db-path").arg(&db_path);

    let output3 = cmd3.output().expect("Failed to execute command");
    let stderr3 = String::from_utf8_lossy(&output3.stderr);
    assert!(stderr3.contains("no pending purchase flow for sku1"));
}
