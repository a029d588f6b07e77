// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    os::unix::fs::PermissionsExt,
    process::{Command, Stdio},
};

use anyhow::Result;
use assert_cmd::cargo::CommandCargoExt;

#[test]
fn stops_world_accessible() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let runtime_dir = dir.path().join("runtime");
    std::fs::create_dir(&runtime_dir)?;
    std::fs::set_permissions(&runtime_dir, std::fs::Permissions::from_mode(0o777))?;
    let config_path = dir.path().join("config.toml");
    let config = format!(
        r#"
runtime_directory = "{}"
idle_timeout_secs = 1
pinentry = "pinentry"
min_pin_length = 4
max_pin_length = 8

[[profiles]]
name = "default"
cert_id = "01"
card_name = "PIV Card"
card_reader = "Reader 0"
sign_command = "true %1 %2"
"#,
        runtime_dir.display()
    );
    std::fs::write(&config_path, config)?;

    let mut command = Command::cargo_bin("cardsign")?;
    let output = command
        .env("CARDSIGN_LOG", "trace")
        .arg("--config")
        .arg(&config_path)
        .arg("sign")
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .output()?;
    let logs = String::from_utf8_lossy(&output.stderr);
    println!("service_stderr: {logs}");
    assert!(!output.status.success());
    assert!(logs.contains("Other users have access to the runtime directory"));
    assert!(!runtime_dir.join("3b8c1a4e-5d2f-4c17-9e6a-0f7d2b91c4a8.sock").exists());

    Ok(())
}
