use clap::{Parser, Subcommand};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;
use std::net::TcpListener;
use std::path::Path;
use std::process::{exit, Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_PACKAGE: &str = "huddle-server";

#[derive(Parser)]
#[command(author, version, about = "Developer tasks for the Huddle workspace")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    #[command(about = "Run `cargo fmt --all`")]
    Fmt,
    #[command(about = "Run format + clippy lint checks, with and without metrics")]
    Lint,
    #[command(about = "Execute `cargo test --workspace` plus the metrics feature tests")]
    Test,
    #[command(about = "Run fmt + clippy + test sequence")]
    Ci,
    #[command(about = "Boot the server with metrics and probe /ready, /version and /metrics")]
    SmokeServer,
}

fn main() {
    let cli = Cli::parse();

    let Some(workspace_root) = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
    else {
        eprintln!("xtask must live inside the workspace");
        exit(1);
    };

    let ok = match cli.command {
        Task::Fmt => run_commands(&workspace_root, &[&["fmt", "--all"]]),
        Task::Lint => lint(&workspace_root),
        Task::Test => test(&workspace_root),
        Task::Ci => lint(&workspace_root) && test(&workspace_root),
        Task::SmokeServer => smoke_server(&workspace_root),
    };

    if !ok {
        exit(1);
    }
}

fn lint(root: &Path) -> bool {
    run_commands(
        root,
        &[
            &["fmt", "--all", "--", "--check"],
            &["clippy", "--workspace", "--", "-D", "warnings"],
            &[
                "clippy",
                "-p",
                SERVER_PACKAGE,
                "--features",
                "metrics",
                "--",
                "-D",
                "warnings",
            ],
        ],
    )
}

fn test(root: &Path) -> bool {
    run_commands(
        root,
        &[
            &["test", "--workspace"],
            &["test", "-p", SERVER_PACKAGE, "--features", "metrics"],
        ],
    )
}

fn smoke_server(root: &Path) -> bool {
    if !run_commands(
        root,
        &[&["build", "--features", "metrics", "-p", SERVER_PACKAGE]],
    ) {
        return false;
    }

    let Some(port) = reserve_port() else {
        eprintln!("failed to reserve a free TCP port");
        return false;
    };
    let bind_addr = format!("127.0.0.1:{port}");

    let mut child = match spawn_server(root, &bind_addr) {
        Ok(child) => child,
        Err(err) => {
            eprintln!("failed to launch {SERVER_PACKAGE}: {err}");
            return false;
        }
    };

    let result = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => probe(&client, &format!("http://{bind_addr}")),
        Err(err) => {
            eprintln!("failed to build HTTP client: {err}");
            false
        }
    };

    if let Err(err) = child.kill() {
        if err.kind() != std::io::ErrorKind::InvalidInput {
            eprintln!("failed to terminate server process: {err}");
        }
    }
    let _ = child.wait();

    result
}

fn spawn_server(root: &Path, bind_addr: &str) -> std::io::Result<Child> {
    Command::new("cargo")
        .args([
            "run",
            "--quiet",
            "--features",
            "metrics",
            "-p",
            SERVER_PACKAGE,
            "--",
            "--bind-addr",
            bind_addr,
            "--metrics-enabled",
            "true",
        ])
        .env("RUST_LOG", "warn")
        .current_dir(root)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
}

fn probe(client: &Client, base_url: &str) -> bool {
    let Some(ready) = wait_for_ready(client, &format!("{base_url}/ready"), Duration::from_secs(30))
    else {
        eprintln!("server failed to answer /ready within timeout");
        return false;
    };
    println!(
        "ready: status={} connections={}",
        ready["status"], ready["gateway_connections"]
    );

    match client
        .get(format!("{base_url}/version"))
        .send()
        .and_then(|r| r.json::<Value>())
    {
        Ok(body) if body["version"].is_string() => println!("version: {}", body["version"]),
        Ok(body) => {
            eprintln!("unexpected /version body: {body}");
            return false;
        }
        Err(err) => {
            eprintln!("failed to call /version: {err}");
            return false;
        }
    }

    verify_metrics(client, &format!("{base_url}/metrics"))
}

fn reserve_port() -> Option<u16> {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .ok()
}

fn wait_for_ready(client: &Client, url: &str, timeout: Duration) -> Option<Value> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match client.get(url).send() {
            Ok(response) if response.status().is_success() => return response.json().ok(),
            Ok(_) | Err(_) => sleep(Duration::from_millis(500)),
        }
    }
    None
}

fn verify_metrics(client: &Client, url: &str) -> bool {
    const EXPECTED: [&str; 2] = ["huddle_http_requests_total", "huddle_gateway_connections"];

    match client.get(url).send() {
        Ok(response) if response.status() == StatusCode::OK => match response.text() {
            Ok(body) => {
                let missing: Vec<_> = EXPECTED
                    .iter()
                    .filter(|family| !body.contains(*family))
                    .collect();
                if missing.is_empty() {
                    true
                } else {
                    eprintln!("metrics endpoint is missing {missing:?}");
                    false
                }
            }
            Err(err) => {
                eprintln!("failed to read metrics body: {err}");
                false
            }
        },
        Ok(response) => {
            eprintln!("unexpected metrics response status: {}", response.status());
            false
        }
        Err(err) => {
            eprintln!("failed to call metrics endpoint: {err}");
            false
        }
    }
}

fn run_commands(root: &Path, commands: &[&[&str]]) -> bool {
    for args in commands {
        let status = Command::new("cargo").args(*args).current_dir(root).status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                eprintln!("command 'cargo {}' failed with {status}", args.join(" "));
                return false;
            }
            Err(err) => {
                eprintln!("failed to spawn cargo: {err}");
                return false;
            }
        }
    }
    true
}
