// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::Result;
use assert_cmd::cargo::CommandCargoExt;

const SOCKET: &str = "3b8c1a4e-5d2f-4c17-9e6a-0f7d2b91c4a8.sock";

// Answers every request with OK and hands out a fixed PIN.
const PINENTRY: &str = r#"#!/bin/sh
echo "OK Pleased to meet you"
while read -r command rest; do
    case "$command" in
        GETPIN) echo "D 246810"; echo "OK" ;;
        BYE) echo "OK closing connection"; exit 0 ;;
        *) echo "OK" ;;
    esac
done
"#;

fn setup(dir: &Path) -> Result<PathBuf> {
    let runtime_dir = dir.join("runtime");
    std::fs::create_dir(&runtime_dir)?;
    std::fs::set_permissions(&runtime_dir, std::fs::Permissions::from_mode(0o700))?;

    let pinentry = dir.join("pinentry");
    std::fs::write(&pinentry, PINENTRY)?;
    std::fs::set_permissions(&pinentry, std::fs::Permissions::from_mode(0o755))?;

    let config_path = dir.join("config.toml");
    let config = format!(
        r#"
runtime_directory = "{}"
idle_timeout_secs = 2
pinentry = "{}"
min_pin_length = 4
max_pin_length = 8

[[profiles]]
name = "default"
cert_id = "01"
card_name = "PIV Card"
card_reader = "Reader 0"
sign_command = "sh -c \"sleep 1; echo signed $0 with $1\" %1 %2"
"#,
        runtime_dir.display(),
        pinentry.display(),
    );
    std::fs::write(&config_path, config)?;
    Ok(config_path)
}

#[test]
fn second_invocation_hands_files_to_the_server() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = setup(dir.path())?;
    let first = dir.path().join("first.exe");
    let second = dir.path().join("second.exe");
    std::fs::write(&first, b"MZ")?;
    std::fs::write(&second, b"MZ")?;

    let server = Command::cargo_bin("cardsign")?
        .env("CARDSIGN_LOG", "info")
        .arg("--config")
        .arg(&config_path)
        .arg("sign")
        .arg(&first)
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let socket = dir.path().join("runtime").join(SOCKET);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(socket.exists(), "the server never bound its socket");

    let client = Command::cargo_bin("cardsign")?
        .arg("--config")
        .arg(&config_path)
        .arg("sign")
        .arg(&second)
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .output()?;
    println!("client_stderr: {}", String::from_utf8_lossy(&client.stderr));
    assert!(client.status.success());
    assert!(client.stdout.is_empty());

    let output = server.wait_with_output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    println!("server_stdout: {stdout}");
    println!("server_stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(output.status.success());

    let first_at = stdout.find("first.exe with 246810").expect("first job output");
    let second_at = stdout.find("second.exe with 246810").expect("second job output");
    assert!(first_at < second_at);
    let summary: Vec<_> = stdout
        .lines()
        .filter(|line| line.starts_with("success "))
        .collect();
    assert_eq!(summary.len(), 2);
    assert!(!String::from_utf8_lossy(&output.stderr).contains("246810"));
    assert!(!socket.exists());

    Ok(())
}

#[test]
fn missing_file_is_reported_without_prompting() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = setup(dir.path())?;
    std::fs::remove_file(dir.path().join("pinentry"))?;

    let output = Command::cargo_bin("cardsign")?
        .arg("--config")
        .arg(&config_path)
        .arg("sign")
        .arg(dir.path().join("missing.exe"))
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .stdout(Stdio::piped())
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    println!("server_stdout: {stdout}");
    assert!(output.status.success());
    assert!(stdout.contains("file not found"));
    assert!(stdout.contains("missing.exe"));

    Ok(())
}
