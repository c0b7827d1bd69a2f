use std::path::PathBuf;

use framelink_channel::{plan, Capabilities};
use framelink_transport::UnixDomainSocket;
use serde::Serialize;

use crate::cmd::ProbeArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: &'static str,
    status: CheckStatus,
    detail: String,
}

#[derive(Debug, Serialize)]
struct ProbeOutput {
    schema_id: &'static str,
    preference: String,
    plan: Vec<&'static str>,
    capabilities: Capabilities,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let caps = Capabilities::probe();
    let checks = vec![
        shared_memory_check(&caps),
        device_check(&caps),
        socket_check(),
    ];
    let order = plan(args.transport, &caps);

    // Socket is always planned last, so only a broken socket path leaves
    // nothing usable.
    let usable = caps.shared_memory
        || caps.device()
        || checks
            .iter()
            .any(|c| c.name == "socket" && c.status == CheckStatus::Pass);
    let overall = if usable { "pass" } else { "fail" };

    let output = ProbeOutput {
        schema_id: "https://schemas.3leaps.dev/framelink/cli/v1/probe-report.schema.json",
        preference: args.transport.to_string(),
        plan: order.iter().map(|backend| backend.as_str()).collect(),
        capabilities: caps,
        checks,
        overall,
    };
    print_probe(&output, format);

    if usable {
        Ok(SUCCESS)
    } else {
        Ok(HEALTH_CHECK_FAILED)
    }
}

fn shared_memory_check(caps: &Capabilities) -> CheckResult {
    match &caps.shared_memory_error {
        None => CheckResult {
            name: "shared_memory",
            status: CheckStatus::Pass,
            detail: "POSIX shared memory region created and removed".to_string(),
        },
        Some(err) => CheckResult {
            name: "shared_memory",
            status: CheckStatus::Fail,
            detail: err.clone(),
        },
    }
}

fn device_check(caps: &Capabilities) -> CheckResult {
    if caps.device() {
        return CheckResult {
            name: "device",
            status: CheckStatus::Pass,
            detail: format!("{} CUDA device(s)", caps.device_count),
        };
    }
    // No GPU is a normal host, not a failure.
    CheckResult {
        name: "device",
        status: CheckStatus::Info,
        detail: caps
            .device_error
            .clone()
            .unwrap_or_else(|| "no CUDA devices".to_string()),
    }
}

fn socket_check() -> CheckResult {
    let dir = PathBuf::from(format!(
        "/tmp/framelink-probe-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    ));
    let _ = std::fs::create_dir_all(&dir);
    let result = UnixDomainSocket::bind(dir.join("probe.sock"));
    let _ = std::fs::remove_dir_all(&dir);

    match result {
        Ok(_) => CheckResult {
            name: "socket",
            status: CheckStatus::Pass,
            detail: "/tmp socket bind succeeded".to_string(),
        },
        Err(err) => CheckResult {
            name: "socket",
            status: CheckStatus::Warn,
            detail: format!("/tmp socket bind failed: {err}"),
        },
    }
}

fn print_probe(output: &ProbeOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("framelink probe\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<14} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            println!(
                "\n  Order for '{}': {}",
                output.preference,
                output.plan.join(" -> ")
            );
        }
        OutputFormat::Raw => {
            println!("{}", output.plan.first().copied().unwrap_or("none"));
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
    }
}
