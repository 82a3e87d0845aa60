//! CLI integration tests against a sample host.
//!
//! These run the `ctrmeta` binary with `--root` and `--state` pointing at a
//! fixture installation.

use std::path::PathBuf;
use std::process::{Command, Output};

use crate::fixture::TestHost;
use crate::integration_test;

/// Get the path to the ctrmeta binary.
fn ctrmeta_binary() -> PathBuf {
    // Find the binary in target/debug or target/release
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = PathBuf::from(manifest_dir)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf();

    let debug_path = workspace_root.join("target/debug/ctrmeta");
    if debug_path.exists() {
        return debug_path;
    }

    let release_path = workspace_root.join("target/release/ctrmeta");
    if release_path.exists() {
        return release_path;
    }

    panic!("ctrmeta binary not found. Run `cargo build` first.");
}

/// Run ctrmeta against the host with the given arguments.
fn run_ctrmeta(host: &TestHost, args: &[&str]) -> std::io::Result<Output> {
    Command::new(ctrmeta_binary())
        .arg("--root")
        .arg(host.root())
        .arg("--state")
        .arg(host.state())
        .args(args)
        .env_remove("CTRMETA_ROOT")
        .env_remove("CTRMETA_CONFIG")
        .env_remove("RUST_LOG")
        .output()
}

fn stdout_json(output: &Output) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
    if !output.status.success() {
        return Err(format!(
            "ctrmeta failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

integration_test!(test_cli_list_namespaces, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(&host, &["list", "namespaces"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("NAMESPACE"));
    assert!(stdout.contains("k8s.io"));
    assert!(stdout.contains("default"));
    Ok(())
});

integration_test!(test_cli_containers_json, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(&host, &["list", "containers", "--output", "json"])?;
    let json = stdout_json(&output)?;
    let containers = json.as_array().ok_or("expected a JSON array")?;
    assert_eq!(containers.len(), 3);
    assert_eq!(containers[1]["id"], "app-1");
    assert_eq!(containers[1]["hostname"], "web-7d9f");
    assert_eq!(containers[1]["created_at"], "2024-03-14T15:09:26Z");
    Ok(())
});

integration_test!(test_cli_skip_known_containers, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(
        &host,
        &["ls", "c", "--skip-known-containers", "--output", "json"],
    )?;
    let json = stdout_json(&output)?;
    let ids: Vec<_> = json
        .as_array()
        .ok_or("expected a JSON array")?
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["tool", "app-1"]);
    Ok(())
});

integration_test!(test_cli_containers_table, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(&host, &["list", "containers", "--labels", "--show-empty"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("HOSTNAME"));
    assert!(stdout.contains("web-7d9f"));
    assert!(stdout.contains("2024-03-14T15:09:26.000000000Z"));
    assert!(stdout.contains("io.kubernetes.pod.name=web-7d9f"));
    // Placeholder row for the namespace with no containers.
    assert!(stdout.contains("empty"));
    Ok(())
});

integration_test!(test_cli_containers_task_columns, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(&host, &["list", "containers"])?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("PID"));
    assert!(stdout.contains("STATUS"));
    let app = stdout
        .lines()
        .find(|l| l.contains("app-1"))
        .ok_or("app-1 row missing")?;
    assert!(app.contains("31337"));
    assert!(app.contains("RUNNING"));
    let tool = stdout
        .lines()
        .find(|l| l.contains("tool"))
        .ok_or("tool row missing")?;
    assert!(tool.contains("STOPPED"));
    Ok(())
});

integration_test!(test_cli_updated_column, || {
    let host = TestHost::sample()?;
    for kind in ["containers", "images", "content", "snapshots"] {
        let output = run_ctrmeta(&host, &["list", kind])?;
        assert!(output.status.success());
        assert!(!String::from_utf8_lossy(&output.stdout).contains("UPDATED AT"));

        let output = run_ctrmeta(&host, &["list", kind, "--updated"])?;
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("UPDATED AT"), "{kind}");
    }

    let output = run_ctrmeta(&host, &["list", "containers", "--updated"])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let app = stdout
        .lines()
        .find(|l| l.contains("app-1"))
        .ok_or("app-1 row missing")?;
    assert_eq!(app.matches("2024-03-14T15:09:26.000000000Z").count(), 2);
    Ok(())
});

integration_test!(test_cli_skipped_namespace_reported_once, || {
    let host = TestHost::new()?;
    host.write_broken_namespace()?;
    let output = run_ctrmeta(&host, &["list", "containers"])?;
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.matches("skipping namespace").count(), 1);
    assert!(stderr.contains("broken"));
    Ok(())
});

integration_test!(test_cli_snapshots, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(&host, &["list", "snapshots", "--output", "json"])?;
    let json = stdout_json(&output)?;
    let base = json
        .as_array()
        .ok_or("expected a JSON array")?
        .iter()
        .find(|s| s["key"] == "sha256:base")
        .ok_or("base snapshot missing")?;
    assert_eq!(base["kind"], "Committed");
    assert_eq!(base["id"], 1);
    let expected = host.snapshotter_root("overlayfs").join("snapshots/1/fs");
    let expected = expected.to_str().ok_or("non-UTF-8 temp path")?;
    assert_eq!(base["overlay_path"], expected);
    Ok(())
});

integration_test!(test_cli_tasks, || {
    let host = TestHost::sample()?;
    let output = run_ctrmeta(&host, &["list", "tasks", "--output", "json"])?;
    let json = stdout_json(&output)?;
    let app = json
        .as_array()
        .ok_or("expected a JSON array")?
        .iter()
        .find(|t| t["container_id"] == "app-1")
        .ok_or("app-1 task missing")?;
    assert_eq!(app["pid"], 31337);
    assert_eq!(app["status"], "RUNNING");
    Ok(())
});

integration_test!(test_cli_missing_root_fails, || {
    let host = TestHost::new()?;
    let output = run_ctrmeta(&host, &["list", "containers"])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to open metadata store"));
    Ok(())
});

integration_test!(test_cli_config_file, || {
    let host = TestHost::sample()?;
    let config = host.state().join("ctrmeta.toml");
    std::fs::write(
        &config,
        format!("root = {:?}\n", host.root().to_string_lossy()),
    )?;
    let output = Command::new(ctrmeta_binary())
        .arg("--config")
        .arg(&config)
        .args(["list", "images", "--output", "json"])
        .env_remove("CTRMETA_ROOT")
        .output()?;
    let json = stdout_json(&output)?;
    assert_eq!(json.as_array().map(Vec::len), Some(2));
    Ok(())
});
