//! Exit-code contract of the proxy binary
//!
//! Configuration errors must fail fast with exit code 1 and a usage hint
//! on stderr, before any network or coordination work begins.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_http_url_for_remote_host_exits_1() {
    Command::cargo_bin("mcp-remote")
        .expect("binary built")
        .arg("http://mcp.example.com/sse")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--allow-http"));
}

#[test]
fn test_unsupported_scheme_exits_1() {
    Command::cargo_bin("mcp-remote")
        .expect("binary built")
        .arg("ftp://mcp.example.com/sse")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unsupported URL scheme"));
}

#[test]
fn test_malformed_header_exits_1() {
    Command::cargo_bin("mcp-remote")
        .expect("binary built")
        .args(["https://mcp.example.com/sse", "--header", "NoColonHere"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid header"));
}

#[test]
fn test_bad_static_client_json_exits_1() {
    Command::cargo_bin("mcp-remote")
        .expect("binary built")
        .args([
            "https://mcp.example.com/sse",
            "--static-oauth-client-info",
            "{not json",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid JSON"));
}

#[test]
fn test_client_binary_shares_the_validation() {
    Command::cargo_bin("mcp-remote-client")
        .expect("binary built")
        .arg("http://mcp.example.com/sse")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--allow-http"));
}
