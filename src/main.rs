use anyhow::{Context, Result};
use cheetah::api::ApiServer;
use cheetah::client::Client;
use cheetah::config::{env_or_int, state_dir};
use cheetah::postgres;
use cheetah::registry::{Registry, RegistryConfig};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() {
    eprintln!(
        "cheetah {VERSION} — development dashboard

Usage:
  cheetah [flags] [command]

Commands:
  status    Show cheetah and postgres status
  stop      Stop the running cheetah daemon
  update    Update cheetah to the latest version
  version   Print version

Flags:
  -h, --help      Show this help
  -v, --version   Print version"
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    let blue_port_start = env_or_int("APP_PORT", 4000);
    let dashboard_port = env_or_int("PORT", 50000);
    let postgres_port = env_or_int("PG_PORT", 54320);

    if let Some(arg) = std::env::args().nth(1) {
        return match arg.as_str() {
            "-h" | "--help" | "help" => {
                usage();
                ExitCode::SUCCESS
            }
            "-v" | "--version" | "version" => {
                println!("{VERSION}");
                ExitCode::SUCCESS
            }
            "status" => {
                status(dashboard_port, postgres_port).await;
                ExitCode::SUCCESS
            }
            "stop" => stop(dashboard_port),
            "update" => update(),
            unknown => {
                eprintln!("unknown command: {unknown}\n");
                usage();
                ExitCode::FAILURE
            }
        };
    }

    match run_daemon(blue_port_start, dashboard_port, postgres_port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(blue_port_start: u16, dashboard_port: u16, postgres_port: u16) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cheetah=info".parse().expect("valid log directive")),
        )
        .init();

    let registry = Arc::new(Registry::new(RegistryConfig {
        blue_port_start,
        dashboard_port,
        postgres_port,
    }));

    let pg_url = postgres::ensure_running(postgres_port)
        .await
        .context("ensure postgres")?;
    registry.set_postgres(true, &pg_url);

    let dir = state_dir();
    let pid_file = dir.join("cheetah.pid");
    std::fs::write(&pid_file, std::process::id().to_string()).context("write pid file")?;
    let state_file = dir.join("state.json");
    registry.load_state(&state_file);
    tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.probe_health().await }
    });
    tokio::spawn(
        Arc::clone(&registry).periodic_save(state_file.clone(), Duration::from_secs(5)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bind_addr: SocketAddr = ([127, 0, 0, 1], dashboard_port).into();
    let server = ApiServer::new(Arc::clone(&registry), bind_addr, shutdown_rx);

    info!(url = format!("http://cheetah.localhost:{dashboard_port}"), "cheetah");
    let mut server_task = tokio::spawn(server.run());

    let failed = tokio::select! {
        _ = wait_for_signal() => {
            let _ = shutdown_tx.send(true);
            let _ = server_task.await;
            false
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    error!(error = format!("{e:#}"), "server error");
                    true
                }
                Err(e) => {
                    error!(error = %e, "server task failed");
                    true
                }
            }
        }
    };

    info!("shutting down");
    registry.save_state(&state_file);
    let _ = std::fs::remove_file(&pid_file);
    postgres::stop(postgres_port).await;
    info!("shutdown complete");

    if failed {
        anyhow::bail!("server exited abnormally");
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = ctrl_c.await;
        }
    }
}

async fn status(dashboard_port: u16, postgres_port: u16) {
    let client = match Client::new(&format!("http://cheetah.localhost:{dashboard_port}")) {
        Ok(client) => client,
        Err(_) => return,
    };

    match client.status().await {
        Ok(s) => {
            println!("cheetah:  running (http://localhost:{dashboard_port})");
            if s.postgres_running {
                println!("postgres: running (localhost:{})", s.postgres_port);
            } else {
                println!("postgres: stopped");
            }
            println!("apps:     {}", s.app_count);
            println!("uptime:   {}", s.uptime);
            println!("version:  {}", s.version);
        }
        Err(_) => {
            println!("cheetah:  stopped");
            if postgres::dial(postgres_port).await {
                println!("postgres: running (localhost:{postgres_port})");
            } else {
                println!("postgres: stopped");
            }
            println!("version:  {VERSION}");
        }
    }
}

fn stop(dashboard_port: u16) -> ExitCode {
    let pid = find_pid(dashboard_port);
    if pid == 0 {
        eprintln!("cheetah is not running");
        return ExitCode::FAILURE;
    }

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        eprintln!("cheetah is not running");
        return ExitCode::FAILURE;
    }

    println!("cheetah stopped");
    ExitCode::SUCCESS
}

fn find_pid(dashboard_port: u16) -> i32 {
    let pid_file = state_dir().join("cheetah.pid");
    if let Ok(data) = std::fs::read_to_string(&pid_file) {
        if let Ok(pid) = data.trim().parse::<i32>() {
            // Signal 0 checks the process is alive without touching it
            if pid > 0 && unsafe { libc::kill(pid, 0) } == 0 {
                return pid;
            }
        }
    }

    let output = std::process::Command::new("lsof")
        .args(["-ti", &format!(":{dashboard_port}")])
        .output();
    match output {
        Ok(out) => String::from_utf8_lossy(&out.stdout)
            .trim()
            .lines()
            .next()
            .and_then(|line| line.parse().ok())
            .unwrap_or(0),
        Err(_) => 0,
    }
}

fn update() -> ExitCode {
    println!("updating cheetah...");
    let status = std::process::Command::new("cargo")
        .args(["install", "--locked", "cheetah"])
        .status();
    match status {
        Ok(status) if status.success() => {
            println!("cheetah updated to latest version");
            ExitCode::SUCCESS
        }
        Ok(status) => {
            eprintln!("update failed: {status}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("update failed: {e}");
            ExitCode::FAILURE
        }
    }
}
