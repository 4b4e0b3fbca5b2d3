//! End-to-end CLI tests for the icsd-downloader binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Binary with no ambient config or credentials leaking in from the host.
fn isolated(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("icsd-downloader").unwrap();
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("ICSD_LOGIN_ID")
        .env_remove("ICSD_PASSWORD")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_without_subcommand_shows_usage() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_binary_help_displays_usage() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Batch retrieval of ICSD"))
        .stdout(predicate::str::contains("structures"));
}

#[test]
fn test_binary_version_displays_version() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("icsd-downloader"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .args(["--invalid-flag", "search", "q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_batch_size_above_cap_rejected() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .args(["-b", "600", "records", "q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("600"));
}

#[test]
fn test_binary_missing_credential_fails() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .args(["search", "composition : Na:1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ICSD_LOGIN_ID"));
}

#[test]
fn test_binary_missing_password_fails() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .args(["--login-id", "tester", "search", "q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ICSD_PASSWORD"));
}

#[test]
fn test_binary_invalid_config_value_fails() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("config.toml");
    std::fs::write(&config, "concurrency = 0\n").unwrap();

    isolated(&home)
        .env("ICSD_LOGIN_ID", "tester")
        .env("ICSD_PASSWORD", "secret")
        .arg("--config")
        .arg(&config)
        .args(["search", "q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

#[test]
fn test_binary_missing_explicit_config_fails() {
    let home = TempDir::new().unwrap();
    isolated(&home)
        .arg("--config")
        .arg(home.path().join("absent.toml"))
        .args(["search", "q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

#[tokio::test]
async fn test_binary_search_prints_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ws/auth/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("ICSD-Auth-Token", "cli-token"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ws/auth/logout"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ws/search/simple"))
        .and(query_param("query", "NaCl"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<searchResult><idnums>9 12</idnums></searchResult>"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let config = home.path().join("config.toml");
    std::fs::write(&config, format!("base_url = \"{}/ws\"\n", server.uri())).unwrap();

    let mut cmd = isolated(&home);
    cmd.env("ICSD_LOGIN_ID", "tester")
        .env("ICSD_PASSWORD", "secret")
        .arg("--config")
        .arg(&config)
        .args(["search", "NaCl", "--simple"]);

    tokio::task::spawn_blocking(move || {
        cmd.assert().success().stdout("9\n12\n");
    })
    .await
    .unwrap();
}
