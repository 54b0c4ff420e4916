// End-to-end tests for the qroute binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn qroute(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_qroute"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("QROUTE_CHECKPOINT_PATH")
        .env_remove("QROUTE_NUM_REPLICAS")
        .env_remove("QROUTE_STRATEGY")
        .output()
        .expect("failed to run qroute")
}

/// Small, fast configuration whose checkpoint lives in `dir`.
fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("qroute.toml");
    let checkpoint = dir.join("policy.json");
    let content = format!(
        "[policy]\nhidden_size = 16\nseed = 3\n\n\
         [training]\nbatch_size = 8\niterations = 5\nevery_completed_jobs = 10\n\n\
         [checkpoint]\npath = {:?}\n",
        checkpoint.display().to_string()
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn stdout_json(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "qroute failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn cli_help_lists_commands() {
    let output = qroute(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["simulate", "select", "stats", "reset-epsilon", "config"] {
        assert!(stdout.contains(cmd), "missing {cmd} in help");
    }
}

#[test]
fn select_help_shows_telemetry_flags() {
    let output = qroute(&["select", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--loads"));
    assert!(stdout.contains("--queue-depth"));
    assert!(stdout.contains("--greedy"));
}

#[test]
fn select_without_checkpoint_is_least_connections() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(tmp.path());
    let config = config.to_str().unwrap();

    let json = stdout_json(&qroute(&[
        "--config", config, "--format", "json", "select", "--loads", "4,2,7",
    ]));
    assert_eq!(json["replica"], 1);
    assert_eq!(json["name"], "replica-2");
    assert_eq!(json["source"], "heuristic");
    assert_eq!(json["checkpoint_restored"], false);
}

#[test]
fn simulate_then_inspect_and_reset() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(tmp.path());
    let config = config.to_str().unwrap();

    let summary = stdout_json(&qroute(&[
        "--config",
        config,
        "--format",
        "json",
        "simulate",
        "--jobs",
        "40",
        "--concurrency",
        "4",
        "--latency-scale",
        "0.05",
        "--seed",
        "9",
    ]));
    assert_eq!(summary["jobs"], 40);
    let resolved = summary["succeeded"].as_u64().unwrap() + summary["failed"].as_u64().unwrap();
    assert_eq!(resolved, 40);
    assert!(tmp.path().join("policy.json").exists());

    let stats = stdout_json(&qroute(&["--config", config, "--format", "json", "stats"]));
    assert_eq!(stats["checkpoint_restored"], true);
    assert_eq!(stats["steps_done"], summary["stats"]["steps_done"]);
    assert!(stats["steps_done"].as_u64().unwrap() > 0);

    let selection = stdout_json(&qroute(&[
        "--config", config, "--format", "json", "select", "--loads", "0,0,0", "--greedy",
    ]));
    assert_eq!(selection["source"], "learned");
    assert_eq!(selection["exploration"], false);

    let reset = stdout_json(&qroute(&[
        "--config",
        config,
        "--format",
        "json",
        "reset-epsilon",
        "--value",
        "0.25",
    ]));
    assert_eq!(reset["epsilon"], 0.25);

    let stats = stdout_json(&qroute(&["--config", config, "--format", "json", "stats"]));
    assert_eq!(stats["epsilon"], 0.25);
}

#[test]
fn reset_epsilon_without_checkpoint_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(tmp.path());
    let output = qroute(&["--config", config.to_str().unwrap(), "reset-epsilon"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No checkpoint"), "stderr: {stderr}");
}

#[test]
fn config_init_then_show() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("conf").join("qroute.toml");
    let path_str = path.to_str().unwrap();

    let output = qroute(&["--config", path_str, "config", "init"]);
    assert!(output.status.success());
    assert!(path.exists());

    let again = qroute(&["--config", path_str, "config", "init"]);
    assert!(!again.status.success());

    let json = stdout_json(&qroute(&["--config", path_str, "--format", "json", "config", "show"]));
    assert_eq!(json["router"]["num_replicas"], 3);
    assert_eq!(json["router"]["strategy"], "learned-policy");
    assert_eq!(json["policy"]["epsilon_decay"], 0.995);

    let text = qroute(&["--config", path_str, "config", "show"]);
    assert!(String::from_utf8_lossy(&text.stdout).contains("[router]"));
}

#[test]
fn invalid_config_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("qroute.toml");
    std::fs::write(&path, "[replay]\ncapacity = 0\n").unwrap();
    let output = qroute(&["--config", path.to_str().unwrap(), "stats"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid configuration"), "stderr: {stderr}");
}

#[test]
fn log_dir_receives_a_log_file() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(tmp.path());
    let log_dir = tmp.path().join("logs");

    let output = qroute(&[
        "--config",
        config.to_str().unwrap(),
        "--log-dir",
        log_dir.to_str().unwrap(),
        "simulate",
        "--jobs",
        "8",
        "--latency-scale",
        "0.05",
        "--no-save",
    ]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let files: Vec<_> = std::fs::read_dir(&log_dir).unwrap().collect();
    assert_eq!(files.len(), 1);
}
