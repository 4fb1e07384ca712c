//! Per-app supervisor
//!
//! Runs next to a guest app: registers it with the daemon, provisions its
//! database, starts it on the blue port, then watches the source tree and
//! performs health-gated blue/green swaps on change. How the guest is built
//! and launched is the caller's business; the supervisor only needs a start
//! capability and owns process shutdown.

use crate::client::Client;
use crate::config;
use crate::db;
use crate::ports;
use crate::registry::{AppIn, LogEntry, Watch};
use crate::space;
use crate::watcher::Watcher;
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const DEFAULT_CHEETAH_URL: &str = "http://cheetah.localhost:50000";
/// Rebuild callbacks arriving within this window collapse into one rebuild
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
/// Grace period between SIGTERM and SIGKILL when stopping a guest
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Everything a guest needs to come up on a port.
pub struct StartIn {
    pub port: u16,
    pub dir: String,
    pub space: String,
    pub database_url: String,
    pub database_template_url: Option<String>,
    pub cheetah_url: String,
    pub env: HashMap<String, String>,
}

/// Launch capability: produce a running guest process for a port. The
/// supervisor stops what it started; everything else about the subprocess
/// is the caller's concern.
pub type StartGuest = Arc<dyn Fn(StartIn) -> BoxFuture<'static, Result<Child>> + Send + Sync>;

pub struct Options {
    /// Compiled-in defaults for the guest's environment
    pub defaults: HashMap<String, String>,
    /// Watch patterns relative to the app dir
    pub watch_patterns: Vec<String>,
    /// Ignore patterns for the watcher
    pub ignore_patterns: Vec<String>,
    pub start: StartGuest,
}

impl Options {
    pub fn new(start: StartGuest) -> Self {
        Self {
            defaults: HashMap::new(),
            watch_patterns: vec![".envrc".to_string(), "*.sql".to_string()],
            ignore_patterns: Vec::new(),
            start,
        }
    }
}

/// A start capability that runs a shell command with the guest contract
/// environment (PORT, SPACE, DATABASE_URL, DATABASE_TEMPLATE_URL,
/// CHEETAH_URL) plus the merged app env.
pub fn command_guest(command: impl Into<String>) -> StartGuest {
    let command = command.into();
    Arc::new(move |input: StartIn| {
        let command = command.clone();
        Box::pin(async move {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&command)
                .current_dir(&input.dir)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .envs(&input.env)
                .env("PORT", input.port.to_string())
                .env("SPACE", &input.space)
                .env("DATABASE_URL", &input.database_url)
                .env("CHEETAH_URL", &input.cheetah_url);
            if let Some(template) = &input.database_template_url {
                cmd.env("DATABASE_TEMPLATE_URL", template);
            }

            let child = cmd.spawn().context("run")?;
            info!(port = input.port, pid = child.id(), "server");
            Ok(child)
        })
    })
}

struct Supervisor {
    client: Client,
    space: String,
    app_name: String,
    dir: PathBuf,
    cheetah_url: String,
    database_url: String,
    defaults: HashMap<String, String>,
    watch: Watch,
    start: StartGuest,
    proxy_env: Mutex<HashMap<String, String>>,
    app_env: Mutex<HashMap<String, String>>,
    template_url: Mutex<Option<String>>,
    children: tokio::sync::Mutex<HashMap<u16, Child>>,
    ports: ports::Manager,
}

/// Register with the daemon and supervise the guest until interrupted.
pub async fn run(options: Options) -> Result<()> {
    let cheetah_url = config::env_or_string("CHEETAH_URL", DEFAULT_CHEETAH_URL);
    let sp = space::system().context("determine space")?;
    let client = Client::new(&cheetah_url).context("daemon client")?;

    let env = config::default_env();
    let mut cfg = config::load(
        &env,
        Path::new(&sp.dir),
        config::LoadIn {
            defaults: options.defaults.clone(),
            proxy_env: HashMap::new(),
        },
    );

    let watch = Watch {
        match_patterns: options.watch_patterns.clone(),
        ignore: options.ignore_patterns.clone(),
    };
    let resp = client
        .app_post(&AppIn {
            config: cfg.providers.clone(),
            dir: sp.dir.clone(),
            space: sp.name.clone(),
            watch: watch.clone(),
        })
        .await
        .context("register")?;
    info!(space = %sp.name, blue = resp.ports.blue, green = resp.ports.green, "register");

    // The dashboard may hold env for this app; fold it in and republish the
    // provider list so the dashboard shows where values came from.
    if !resp.env.is_empty() {
        cfg = config::load(
            &env,
            Path::new(&sp.dir),
            config::LoadIn {
                defaults: options.defaults.clone(),
                proxy_env: resp.env.clone(),
            },
        );
        let _ = client
            .app_post(&AppIn {
                config: cfg.providers.clone(),
                dir: sp.dir.clone(),
                space: sp.name.clone(),
                watch: watch.clone(),
            })
            .await;
    }

    let supervisor = Arc::new(Supervisor {
        ports: ports::Manager::new(
            resp.ports.blue,
            resp.ports.green,
            ports::default_config(client.clone(), sp.name.clone()),
        ),
        client,
        app_name: space::app_name(&sp.dir, &sp.name),
        space: sp.name,
        dir: PathBuf::from(&sp.dir),
        cheetah_url,
        database_url: resp.database_url,
        defaults: options.defaults,
        watch,
        start: options.start,
        proxy_env: Mutex::new(resp.env),
        app_env: Mutex::new(cfg.env),
        template_url: Mutex::new(None),
        children: tokio::sync::Mutex::new(HashMap::new()),
    });

    let ensure_fut: BoxFuture<'_, Result<Option<String>>> =
        Box::pin(db::ensure(&supervisor.dir, &supervisor.database_url));
    match ensure_fut.await {
        Ok(template) => *supervisor.template_url.lock() = template,
        Err(e) => {
            error!(error = %e, "database setup failed");
            supervisor
                .send_log("error", &format!("database setup failed: {e:#}"))
                .await;
        }
    }

    if let Err(e) = config::sync(&config::default_config(), &supervisor.dir) {
        warn!(error = %e, "config sync failed");
    }

    let blue = supervisor.ports.active();
    match supervisor.start_port(blue).await {
        Ok(()) => {
            supervisor.ports.report_health("unknown").await;
            supervisor.ports.wait_for_healthy(blue).await;
            supervisor.ports.report_health("healthy").await;
        }
        Err(e) => {
            error!(error = %e, "initial build failed");
            supervisor
                .send_log("error", &format!("initial build failed: {e:#}"))
                .await;
        }
    }

    // Watch callbacks hop to the async world through a bounded channel so
    // rebuild work never runs on the tick thread.
    let (change_tx, change_rx) = mpsc::channel::<PathBuf>(16);
    let patterns: Vec<&str> = supervisor
        .watch
        .match_patterns
        .iter()
        .map(String::as_str)
        .collect();
    let ignore: Vec<&str> = supervisor.watch.ignore.iter().map(String::as_str).collect();
    let mut watcher = Watcher::new(supervisor.dir.clone(), &patterns, &ignore, move |path| {
        let _ = change_tx.try_send(path.to_path_buf());
    });
    watcher.start();

    let rebuild_supervisor = Arc::clone(&supervisor);
    let rebuild_task =
        tokio::spawn(async move { rebuild_loop(rebuild_supervisor, change_rx).await });
    let env_task = tokio::spawn(env_event_loop(Arc::clone(&supervisor)));

    wait_for_signal().await;
    info!("shutting down");

    watcher.stop();
    rebuild_task.abort();
    env_task.abort();
    supervisor.stop_all().await;
    supervisor.client.app_delete(&supervisor.space).await;
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

/// Collapse bursts of change callbacks into one rebuild per quiet window.
async fn rebuild_loop(supervisor: Arc<Supervisor>, mut rx: mpsc::Receiver<PathBuf>) {
    while let Some(mut path) = rx.recv().await {
        loop {
            match tokio::time::timeout(DEBOUNCE_WINDOW, rx.recv()).await {
                Ok(Some(next)) => path = next,
                _ => break,
            }
        }
        let fut: BoxFuture<'_, ()> = Box::pin(supervisor.rebuild(&path));
        fut.await;
    }
}

/// Follow the daemon's event stream and react to env updates addressed to
/// this app. Reconnects with a short backoff when the stream drops.
async fn env_event_loop(supervisor: Arc<Supervisor>) {
    loop {
        if let Ok(response) = supervisor.client.events().await {
            consume_events(&supervisor, response).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn consume_events(
    supervisor: &Arc<Supervisor>,
    response: hyper::Response<hyper::body::Incoming>,
) {
    #[derive(serde::Deserialize)]
    struct EnvEvent {
        app: String,
        #[serde(default)]
        vars: HashMap<String, String>,
    }

    let mut body = response.into_body();
    let mut buffer = String::new();
    let mut event_type = String::new();

    while let Some(Ok(frame)) = body.frame().await {
        let Some(data) = frame.data_ref() else {
            continue;
        };
        buffer.push_str(&String::from_utf8_lossy(data));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            if let Some(event) = line.strip_prefix("event: ") {
                event_type = event.to_string();
            } else if let Some(data) = line.strip_prefix("data: ") {
                if event_type == "env" {
                    if let Ok(payload) = serde_json::from_str::<EnvEvent>(data) {
                        if payload.app == supervisor.app_name {
                            supervisor.env_reload(payload.vars).await;
                        }
                    }
                }
                event_type.clear();
            } else if line.is_empty() {
                event_type.clear();
            }
        }
    }
}

impl Supervisor {
    async fn start_port(self: &Arc<Self>, port: u16) -> Result<()> {
        let input = StartIn {
            port,
            dir: self.dir.to_string_lossy().to_string(),
            space: self.space.clone(),
            database_url: self.database_url.clone(),
            database_template_url: self.template_url.lock().clone(),
            cheetah_url: self.cheetah_url.clone(),
            env: self.app_env.lock().clone(),
        };
        let child = (self.start)(input).await?;
        self.children.lock().await.insert(port, child);
        Ok(())
    }

    async fn stop_port(&self, port: u16) {
        let child = self.children.lock().await.remove(&port);
        if let Some(child) = child {
            stop_process(child).await;
        }
    }

    async fn stop_all(&self) {
        let children: Vec<Child> = {
            let mut guard = self.children.lock().await;
            guard.drain().map(|(_, child)| child).collect()
        };
        for child in children {
            stop_process(child).await;
        }
    }

    /// React to a changed file: run the hook its type calls for, then do a
    /// blue/green swap. Hook failures abort the rebuild and leave the old
    /// port serving.
    async fn rebuild(self: &Arc<Self>, changed: &Path) {
        let rel = changed.strip_prefix(&self.dir).unwrap_or(changed);
        info!(path = %rel.display(), "builder");

        let base = rel
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if base == ".envrc" {
            if let Err(e) = config::sync(&config::default_config(), &self.dir) {
                error!(error = %e, "config sync failed");
                self.send_log("error", &format!("config sync failed: {e:#}"))
                    .await;
                return;
            }
            self.reload_env();
        }

        if rel.extension().is_some_and(|ext| ext == "sql") {
            info!(path = %rel.display(), "migrator");
            let ensure_fut: BoxFuture<'_, Result<Option<String>>> =
                Box::pin(db::ensure(&self.dir, &self.database_url));
            match ensure_fut.await {
                Ok(template) => *self.template_url.lock() = template,
                Err(e) => {
                    error!(error = %e, "database rebuild failed");
                    self.send_log("error", &format!("database rebuild failed: {e:#}"))
                        .await;
                    return;
                }
            }
        }

        self.swap().await;
    }

    async fn swap(self: &Arc<Self>) {
        let for_start = Arc::clone(self);
        let for_stop = Arc::clone(self);
        let swapped = self
            .ports
            .swap(
                move |port| -> BoxFuture<'static, Result<()>> {
                    let supervisor = Arc::clone(&for_start);
                    Box::pin(async move { supervisor.start_port(port).await })
                },
                move |port| -> BoxFuture<'static, ()> {
                    let supervisor = Arc::clone(&for_stop);
                    Box::pin(async move { supervisor.stop_port(port).await })
                },
            )
            .await;
        if !swapped {
            error!("swap failed");
            self.send_log("error", "swap failed").await;
        }
    }

    fn reload_env(&self) {
        let cfg = config::load(
            &config::default_env(),
            &self.dir,
            config::LoadIn {
                defaults: self.defaults.clone(),
                proxy_env: self.proxy_env.lock().clone(),
            },
        );
        *self.app_env.lock() = cfg.env;
    }

    /// The dashboard pushed new env for this app: fold it in, republish the
    /// provider list, and swap so the guest picks it up.
    async fn env_reload(self: &Arc<Self>, vars: HashMap<String, String>) {
        info!("env update from dashboard");
        *self.proxy_env.lock() = vars;
        self.reload_env();

        let cfg = config::load(
            &config::default_env(),
            &self.dir,
            config::LoadIn {
                defaults: self.defaults.clone(),
                proxy_env: self.proxy_env.lock().clone(),
            },
        );
        let _ = self
            .client
            .app_post(&AppIn {
                config: cfg.providers,
                dir: self.dir.to_string_lossy().to_string(),
                space: self.space.clone(),
                watch: self.watch.clone(),
            })
            .await;

        self.swap().await;
    }

    async fn send_log(&self, level: &str, message: &str) {
        self.client
            .log_post(
                &self.space,
                &[LogEntry {
                    level: level.to_string(),
                    message: message.to_string(),
                    timestamp: Utc::now(),
                }],
            )
            .await;
    }
}

/// Stop a guest: SIGTERM, wait out the grace period, then SIGKILL.
async fn stop_process(mut child: Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            info!(?status, "guest exited");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for guest to exit");
        }
        Err(_) => {
            warn!("grace period exceeded, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_guest_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let start = command_guest("sleep 30");
        let child = start(StartIn {
            port: 4000,
            dir: dir.path().to_string_lossy().to_string(),
            space: "auth".to_string(),
            database_url: "postgres://localhost/auth".to_string(),
            database_template_url: None,
            cheetah_url: "http://cheetah.localhost:50000".to_string(),
            env: HashMap::new(),
        })
        .await
        .unwrap();

        // SIGTERM lands well inside the grace period
        let begun = std::time::Instant::now();
        stop_process(child).await;
        assert!(begun.elapsed() < STOP_GRACE);
    }

    #[tokio::test]
    async fn test_command_guest_env_contract() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let start = command_guest(format!(
            "echo \"$PORT $SPACE $DATABASE_URL $DATABASE_TEMPLATE_URL $EXTRA\" > {}",
            out.display()
        ));

        let mut env = HashMap::new();
        env.insert("EXTRA".to_string(), "custom".to_string());
        let mut child = start(StartIn {
            port: 4001,
            dir: dir.path().to_string_lossy().to_string(),
            space: "greet".to_string(),
            database_url: "postgres://localhost/greet".to_string(),
            database_template_url: Some("postgres://localhost/t_abc".to_string()),
            cheetah_url: "http://cheetah.localhost:50000".to_string(),
            env,
        })
        .await
        .unwrap();
        child.wait().await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            written.trim(),
            "4001 greet postgres://localhost/greet postgres://localhost/t_abc custom"
        );
    }
}
