//! Workspace identity
//!
//! A "space" is the developer-facing name of one running copy of an app.
//! It comes from the environment when an agent harness sets it, otherwise
//! from the current git branch.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

/// Environment/command access, swappable for tests
pub struct Config {
    pub cmd_output: Box<dyn Fn(&str, &[&str]) -> Result<String> + Send + Sync>,
    pub getenv: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
    pub getwd: Box<dyn Fn() -> Result<String> + Send + Sync>,
}

#[derive(Clone, Default)]
pub struct CmdResult {
    pub err: String,
    pub out: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Out {
    pub dir: String,
    pub name: String,
}

pub fn default_config() -> Config {
    Config {
        cmd_output: Box::new(|name, args| {
            let output = Command::new(name)
                .args(args)
                .output()
                .with_context(|| format!("run {name}"))?;
            if !output.status.success() {
                anyhow::bail!("{name} exited with {}", output.status);
            }
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        }),
        getenv: Box::new(|key| std::env::var(key).ok()),
        getwd: Box::new(|| {
            Ok(std::env::current_dir()
                .context("getwd")?
                .to_string_lossy()
                .to_string())
        }),
    }
}

pub fn test_config(cmds: HashMap<String, CmdResult>, dir: &str, env: Vec<(String, String)>) -> Config {
    let dir = dir.to_string();
    Config {
        cmd_output: Box::new(move |name, args| {
            let key = std::iter::once(name)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            match cmds.get(&key) {
                Some(r) if !r.err.is_empty() => anyhow::bail!("{}", r.err),
                Some(r) => Ok(r.out.clone()),
                None => Ok(String::new()),
            }
        }),
        getenv: Box::new(move |key| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }),
        getwd: Box::new(move || Ok(dir.clone())),
    }
}

pub fn system() -> Result<Out> {
    space(&default_config())
}

/// Resolve the space name and working directory.
///
/// Name precedence: `SPACE`, `CONDUCTOR_SPACE`, `CONDUCTOR_WORKSPACE_NAME`,
/// then the current git branch with `/` replaced by `-`.
pub fn space(cfg: &Config) -> Result<Out> {
    let name = ["SPACE", "CONDUCTOR_SPACE", "CONDUCTOR_WORKSPACE_NAME"]
        .iter()
        .find_map(|key| (cfg.getenv)(key).filter(|v| !v.is_empty()));

    let name = match name {
        Some(n) => n,
        None => {
            let out = (cfg.cmd_output)("git", &["rev-parse", "--abbrev-ref", "HEAD"])
                .context("set SPACE or CONDUCTOR_SPACE env var, or run in a git repo")?;
            out.trim().replace('/', "-")
        }
    };

    let dir = (cfg.getwd)().context("getwd")?;
    Ok(Out { dir, name })
}

/// Derive the application name an env set is keyed by.
///
/// Env sets must survive worktree renames, so the key is the last component
/// of the working directory rather than the space; the space is the fallback
/// when the directory yields nothing usable.
pub fn app_name(dir: &str, space: &str) -> String {
    Path::new(dir)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| space.to_string())
}
