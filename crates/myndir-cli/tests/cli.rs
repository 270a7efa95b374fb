use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

use myndir_models::DalleBartDecoderConfig;

fn myndir() -> Command {
    Command::cargo_bin("myndir").unwrap()
}

fn stdout_tokens(output: &[u8]) -> Vec<u32> {
    String::from_utf8_lossy(output)
        .split_whitespace()
        .map(|t| t.parse().unwrap())
        .collect()
}

#[test]
fn test_cli_help() {
    myndir()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"));
}

#[test]
fn test_cli_version() {
    myndir().arg("--version").assert().success();
}

#[test]
fn test_invalid_command() {
    myndir().arg("not-a-command").assert().failure();
}

#[test]
fn test_config_prints_preset_json() {
    let output = myndir().args(["config", "tiny"]).output().unwrap();
    assert!(output.status.success());

    let config = DalleBartDecoderConfig::from_json(&String::from_utf8_lossy(&output.stdout)).unwrap();
    assert_eq!(config, DalleBartDecoderConfig::tiny());
}

#[test]
fn test_config_unknown_preset_fails() {
    myndir()
        .args(["config", "giga"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown preset"));
}

#[test]
fn test_sample_prints_requested_token_count() {
    let output = myndir()
        .args(["sample", "-n", "4", "--prompt-len", "16", "-q"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let tokens = stdout_tokens(&output.stdout);
    assert_eq!(tokens.len(), 4);
    assert!(tokens.iter().all(|&t| t <= 16384));
}

#[test]
fn test_sample_is_reproducible_for_a_seed() {
    let run = || {
        myndir()
            .args(["sample", "-n", "3", "--prompt-len", "16", "--seed", "7", "--json", "-q"])
            .output()
            .unwrap()
    };
    let a = run();
    let b = run();
    assert!(a.status.success());
    assert_eq!(a.stdout, b.stdout);

    let tokens: Vec<u32> = serde_json::from_slice(&a.stdout).unwrap();
    assert_eq!(tokens.len(), 3);
}

#[test]
fn test_sample_progress_lines() {
    myndir()
        .args(["sample", "-n", "2", "--prompt-len", "16", "--progress", "-q"])
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .stderr(predicate::str::contains("image token 0 is"))
        .stderr(predicate::str::contains("image token 1 is"));
}

#[test]
fn test_sample_from_config_file() {
    let config = DalleBartDecoderConfig::tiny().with_sample_token_count(3);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config.to_json_pretty().unwrap().as_bytes())
        .unwrap();

    let output = myndir()
        .args(["sample", "--prompt-len", "16", "-q", "--config"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_tokens(&output.stdout).len(), 3);
}

#[test]
fn test_sample_without_progress_is_silent() {
    myndir()
        .args(["sample", "-n", "2", "--prompt-len", "16", "-q"])
        .env_remove("RUST_LOG")
        .assert()
        .success()
        .stderr(predicate::str::contains("image token").not());
}

#[test]
fn test_sample_rejects_too_many_steps() {
    myndir()
        .args(["sample", "-n", "300", "-q"])
        .assert()
        .failure();
}

#[test]
fn test_sample_rejects_prompt_overflow() {
    myndir()
        .args(["sample", "-n", "1", "--prompt-len", "4", "--prompt-tokens", "8", "-q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("don't fit"));
}
