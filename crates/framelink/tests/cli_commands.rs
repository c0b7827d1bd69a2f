#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique(tag: &str) -> String {
    format!(
        "flcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    )
}

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from("/tmp").join(unique(tag));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn framelink() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_framelink"));
    cmd.arg("--log-level").arg("error");
    cmd
}

/// Wait for `child` to exit, killing it if it outlives `timeout`.
fn wait_with_deadline(mut child: Child, timeout: Duration) -> Output {
    let start = Instant::now();
    loop {
        match child.try_wait().expect("child status should be readable") {
            Some(_) => break,
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let output = child.wait_with_output().expect("killed child should be reaped");
                panic!(
                    "command did not finish within {timeout:?}; stderr: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            None => thread::sleep(Duration::from_millis(20)),
        }
    }
    child.wait_with_output().expect("child output should be readable")
}

fn interrupt(child: &Child) {
    let status = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .expect("kill should run");
    assert!(status.success());
}

fn json_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("each stdout line should be JSON"))
        .collect()
}

#[test]
fn version_prints_crate_version() {
    let output = framelink().arg("version").output().expect("version should run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("framelink {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn probe_reports_shared_memory_and_plan() {
    let output = framelink()
        .arg("--format")
        .arg("json")
        .arg("probe")
        .arg("--transport")
        .arg("shm")
        .output()
        .expect("probe should run");

    assert!(output.status.success());
    let report = &json_lines(&output)[0];
    assert!(report["schema_id"]
        .as_str()
        .unwrap()
        .ends_with("probe-report.schema.json"));
    assert_eq!(report["capabilities"]["shared_memory"], true);
    assert_eq!(report["plan"], serde_json::json!(["shm"]));
    assert_eq!(report["overall"], "pass");
}

#[test]
fn shared_memory_produce_then_consume() {
    let name = unique("shm");

    let producer = framelink()
        .args(["--format", "json", "produce", "--transport", "shm"])
        .args(["--name", &name, "--width", "64", "--height", "48", "--channels", "3"])
        .args(["--fps", "50"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("producer should start");

    let consumer = framelink()
        .args(["--format", "json", "consume", "--transport", "shm"])
        .args(["--name", &name, "--count", "3", "--fps", "20"])
        .args(["--timeout", "2s", "--attach-timeout", "5s"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("consumer should start");
    let consumed = wait_with_deadline(consumer, Duration::from_secs(15));

    interrupt(&producer);
    let produced = wait_with_deadline(producer, Duration::from_secs(5));

    assert!(
        consumed.status.success(),
        "consumer failed: {}",
        String::from_utf8_lossy(&consumed.stderr)
    );
    let frames = json_lines(&consumed);
    assert_eq!(frames.len(), 3);
    let mut last = 0;
    for frame in &frames {
        assert_eq!(frame["backend"], "shm");
        assert_eq!(frame["location"], "host");
        assert_eq!(frame["width"], 64);
        assert_eq!(frame["payload_size"], 64 * 48 * 3);
        let sequence = frame["sequence"].as_u64().unwrap();
        assert!(sequence > last, "sequence must increase");
        last = sequence;
    }

    assert!(produced.status.success());
    let report = &json_lines(&produced)[0];
    assert!(report["published"].as_u64().unwrap() >= last);
    assert_eq!(report["backend"], "shm");
}

#[test]
fn consume_without_producer_exits_3() {
    let output = framelink()
        .args(["consume", "--transport", "shm", "--name", &unique("absent")])
        .args(["--attach-timeout", "200ms"])
        .output()
        .expect("consume should run");
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn inspect_missing_channel_exits_3() {
    let output = framelink()
        .args(["inspect", "--name", &unique("absent")])
        .output()
        .expect("inspect should run");
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not found"));
}

#[test]
fn inspect_shows_live_channel() {
    let name = unique("inspect");
    let producer = framelink()
        .args(["produce", "--transport", "shm", "--name", &name])
        .args(["--width", "8", "--height", "8", "--channels", "1", "--fps", "50"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("producer should start");

    let start = Instant::now();
    let report = loop {
        let output = framelink()
            .args(["--format", "json", "inspect", "--name", &name])
            .output()
            .expect("inspect should run");
        if output.status.success() {
            let report = json_lines(&output).remove(0);
            if report["last_sequence"].as_u64().unwrap_or(0) > 0 {
                break report;
            }
        }
        assert!(start.elapsed() < Duration::from_secs(5), "producer never published");
        thread::sleep(Duration::from_millis(50));
    };

    interrupt(&producer);
    let _ = wait_with_deadline(producer, Duration::from_secs(5));

    assert_eq!(report["backing"], "host");
    assert_eq!(report["owner_alive"], true);
    assert_eq!(report["closed"], false);
    assert_eq!(report["slots"].as_array().unwrap().len(), 2);
}

#[test]
fn socket_produce_then_consume() {
    let dir = unique_temp_dir("sock");
    let sock_path = dir.join("frames.sock");

    let consumer = framelink()
        .args(["--format", "json", "consume", "--transport", "socket"])
        .arg("--socket-path")
        .arg(&sock_path)
        .args(["--count", "2", "--fps", "50", "--timeout", "5s"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("consumer should start");

    let start = Instant::now();
    while !sock_path.exists() {
        assert!(start.elapsed() < Duration::from_secs(5), "consumer never bound");
        thread::sleep(Duration::from_millis(20));
    }

    let producer = framelink()
        .args(["produce", "--transport", "socket"])
        .arg("--socket-path")
        .arg(&sock_path)
        .args(["--width", "8", "--height", "8", "--channels", "3"])
        .args(["--fps", "20", "--count", "40"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("producer should start");

    let consumed = wait_with_deadline(consumer, Duration::from_secs(15));
    // The producer ends on its own once the consumer hangs up.
    let _ = wait_with_deadline(producer, Duration::from_secs(10));

    assert!(
        consumed.status.success(),
        "consumer failed: {}",
        String::from_utf8_lossy(&consumed.stderr)
    );
    let frames = json_lines(&consumed);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["backend"], "socket");
    assert_eq!(frames[0]["sequence"], 1);
    assert_eq!(frames[1]["sequence"], 2);
    assert_eq!(frames[1]["payload_size"], 8 * 8 * 3);

    let _ = std::fs::remove_dir_all(&dir);
}
