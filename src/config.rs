//! Guest environment configuration
//!
//! Builds the environment an app runs with by merging, in priority order:
//! `.envrc.example` (restricted to declared keys), compiled-in defaults,
//! env pushed from the dashboard, `.envrc`, and finally the process
//! environment. Later sources override earlier ones.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Provider name reported when the dashboard contributed variables
const PROXY_PROVIDER: &str = "cheetah";

/// Filesystem/environment access, swappable for tests
pub struct Env {
    pub getenv: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
    pub read_file: Box<dyn Fn(&Path) -> std::io::Result<String> + Send + Sync>,
}

pub fn default_env() -> Env {
    Env {
        getenv: Box::new(|key| std::env::var(key).ok()),
        read_file: Box::new(|path| std::fs::read_to_string(path)),
    }
}

pub fn test_env(vars: HashMap<String, String>, files: HashMap<String, String>) -> Env {
    let read_files = files;
    Env {
        getenv: Box::new(move |key| vars.get(key).cloned()),
        read_file: Box::new(move |path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            read_files
                .get(&name)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }),
    }
}

/// Command execution seam for [`sync`]
pub struct Config {
    pub run: Box<dyn Fn(&str, &[&str]) -> Result<()> + Send + Sync>,
}

#[derive(Clone, Default)]
pub struct CmdResult {
    pub err: String,
}

pub fn default_config() -> Config {
    Config {
        run: Box::new(|name, args| {
            let status = Command::new(name)
                .args(args)
                .status()
                .with_context(|| format!("run {name}"))?;
            if !status.success() {
                anyhow::bail!("{name} exited with {status}");
            }
            Ok(())
        }),
    }
}

pub fn test_config(cmds: HashMap<String, CmdResult>) -> Config {
    Config {
        run: Box::new(move |name, args| {
            let key = std::iter::once(name)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            if let Some(r) = cmds.get(&key) {
                if !r.err.is_empty() {
                    anyhow::bail!("{}", r.err);
                }
            }
            Ok(())
        }),
    }
}

#[derive(Default)]
pub struct LoadIn {
    pub defaults: HashMap<String, String>,
    pub proxy_env: HashMap<String, String>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Out {
    pub env: HashMap<String, String>,
    pub providers: Vec<String>,
}

/// Merge all environment sources for an app rooted at `dir`.
///
/// `providers` lists, in load order, the sources that contributed at least
/// one non-empty value: `.envrc.example`, the dashboard (`"cheetah"`), and
/// `.envrc`. Defaults and the process environment are ambient and never
/// listed.
pub fn load(env: &Env, dir: &Path, input: LoadIn) -> Out {
    let mut vars: HashMap<String, String> = HashMap::new();
    let mut providers = Vec::new();

    // .envrc.example entries, restricted to keys the app declares
    if let Ok(data) = (env.read_file)(&dir.join(".envrc.example")) {
        let mut contributed = false;
        for (k, v) in parse_env_file(&data) {
            if input.defaults.contains_key(&k) {
                contributed = contributed || !v.is_empty();
                vars.insert(k, v);
            }
        }
        if contributed {
            providers.push(".envrc.example".to_string());
        }
    }

    // Defaults: empty string declares the key without overriding
    for (k, v) in &input.defaults {
        if !v.is_empty() {
            vars.insert(k.clone(), v.clone());
        } else {
            vars.entry(k.clone()).or_insert_with(String::new);
        }
    }

    // Env pushed from the dashboard
    let mut contributed = false;
    for (k, v) in &input.proxy_env {
        contributed = contributed || !v.is_empty();
        vars.insert(k.clone(), v.clone());
    }
    if contributed {
        providers.push(PROXY_PROVIDER.to_string());
    }

    // .envrc, all keys
    if let Ok(data) = (env.read_file)(&dir.join(".envrc")) {
        let mut contributed = false;
        for (k, v) in parse_env_file(&data) {
            contributed = contributed || !v.is_empty();
            vars.insert(k, v);
        }
        if contributed {
            providers.push(".envrc".to_string());
        }
    }

    // Process environment wins, but only for declared keys
    let keys: Vec<String> = vars.keys().cloned().collect();
    for k in keys {
        if let Some(e) = (env.getenv)(&k) {
            if !e.is_empty() {
                vars.insert(k, e);
            }
        }
    }

    Out {
        env: vars,
        providers,
    }
}

/// Parse `.envrc`-style content: comments and blanks skipped, a leading
/// `export ` stripped, the line split on the first `=`, matched surrounding
/// quotes unwrapped.
pub fn parse_env_file(data: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let mut v = v.trim();
        let bytes = v.as_bytes();
        if bytes.len() >= 2
            && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
        {
            v = &v[1..v.len() - 1];
        }
        out.push((k.to_string(), v.to_string()));
    }
    out
}

/// Read an environment variable, falling back to a default when unset or
/// empty.
pub fn env_or_string(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

/// Like [`env_or_string`] but parsed as a port number; parse failures fall
/// back to the default.
pub fn env_or_int(key: &str, fallback: u16) -> u16 {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().unwrap_or(fallback),
        _ => fallback,
    }
}

/// Re-allow the app's direnv config after `.envrc` changes. A no-op when the
/// app has no `.envrc`.
pub fn sync(cfg: &Config, dir: &Path) -> Result<()> {
    if !dir.join(".envrc").exists() {
        return Ok(());
    }
    (cfg.run)("direnv", &["allow"]).context("direnv allow")
}

/// Where cheetah keeps its state: `~/.cheetah/`, created on first use.
pub fn state_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let dir = home.join(".cheetah");
    let _ = std::fs::create_dir_all(&dir);
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct LoadCase {
        name: &'static str,
        defaults: HashMap<String, String>,
        proxy_env: HashMap<String, String>,
        env: HashMap<String, String>,
        files: HashMap<String, String>,
        want_env: HashMap<String, String>,
        want_providers: Vec<&'static str>,
    }

    impl Default for LoadCase {
        fn default() -> Self {
            Self {
                name: "",
                defaults: HashMap::new(),
                proxy_env: HashMap::new(),
                env: HashMap::new(),
                files: HashMap::new(),
                want_env: HashMap::new(),
                want_providers: Vec::new(),
            }
        }
    }

    #[test]
    fn test_load() {
        let cases = vec![
            LoadCase {
                name: "defaults only",
                defaults: map(&[("PORT", "8080")]),
                want_env: map(&[("PORT", "8080")]),
                ..Default::default()
            },
            LoadCase {
                name: "process env overrides default",
                defaults: map(&[("PORT", "8080")]),
                env: map(&[("PORT", "9090")]),
                want_env: map(&[("PORT", "9090")]),
                ..Default::default()
            },
            LoadCase {
                name: "example fills empty default",
                defaults: map(&[("DATABASE_URL", ""), ("PORT", "8080")]),
                files: map(&[(
                    ".envrc.example",
                    "export DATABASE_URL=postgres://localhost/dev\nexport PORT=3000",
                )]),
                want_env: map(&[
                    ("DATABASE_URL", "postgres://localhost/dev"),
                    ("PORT", "8080"),
                ]),
                want_providers: vec![".envrc.example"],
                ..Default::default()
            },
            LoadCase {
                name: "example key not in defaults ignored",
                defaults: map(&[("PORT", "8080")]),
                files: map(&[(".envrc.example", "export SECRET=hunter2")]),
                want_env: map(&[("PORT", "8080")]),
                ..Default::default()
            },
            LoadCase {
                name: "envrc overrides defaults and declares new keys",
                defaults: map(&[("PORT", "8080")]),
                files: map(&[(".envrc", "export PORT=9090\nexport SECRET=xyz")]),
                want_env: map(&[("PORT", "9090"), ("SECRET", "xyz")]),
                want_providers: vec![".envrc"],
                ..Default::default()
            },
            LoadCase {
                name: "envrc empty value is not a provider",
                files: map(&[(".envrc", "export GOOGLE_CLIENT_ID=\"\"")]),
                want_env: map(&[("GOOGLE_CLIENT_ID", "")]),
                ..Default::default()
            },
            LoadCase {
                name: "full priority chain",
                defaults: map(&[
                    ("A", "default"),
                    ("B", "default"),
                    ("C", "default"),
                    ("D", "default"),
                ]),
                proxy_env: map(&[("B", "proxy"), ("C", "proxy"), ("D", "proxy")]),
                files: map(&[(".envrc", "export C=envrc\nexport D=envrc")]),
                env: map(&[("D", "os")]),
                want_env: map(&[
                    ("A", "default"),
                    ("B", "proxy"),
                    ("C", "envrc"),
                    ("D", "os"),
                ]),
                want_providers: vec!["cheetah", ".envrc"],
                ..Default::default()
            },
        ];

        for c in cases {
            let env = test_env(c.env, c.files);
            let out = load(
                &env,
                Path::new(""),
                LoadIn {
                    defaults: c.defaults,
                    proxy_env: c.proxy_env,
                },
            );
            assert_eq!(out.env, c.want_env, "{}", c.name);
            let providers: Vec<&str> = out.providers.iter().map(String::as_str).collect();
            assert_eq!(providers, c.want_providers, "{}", c.name);
        }
    }

    #[test]
    fn test_parse_env_file() {
        let cases = [
            ("export FOO=bar", vec![("FOO", "bar")]),
            ("FOO=bar", vec![("FOO", "bar")]),
            ("export FOO=\"bar baz\"", vec![("FOO", "bar baz")]),
            ("export FOO='bar baz'", vec![("FOO", "bar baz")]),
            ("# comment\n\nexport FOO=bar\n", vec![("FOO", "bar")]),
            ("export A=1\nexport B=2", vec![("A", "1"), ("B", "2")]),
        ];

        for (data, want) in cases {
            let got = parse_env_file(data);
            let want: Vec<(String, String)> = want
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            assert_eq!(got, want, "input {data:?}");
        }
    }

    #[test]
    fn test_sync() {
        let dir = tempfile::tempdir().unwrap();

        // No .envrc: direnv never runs, even when it would fail
        let mut cmds = HashMap::new();
        cmds.insert(
            "direnv allow".to_string(),
            CmdResult {
                err: "exit status 1".to_string(),
            },
        );
        let cfg = test_config(cmds);
        assert!(sync(&cfg, dir.path()).is_ok());

        std::fs::write(dir.path().join(".envrc"), "export A=1").unwrap();
        let err = sync(&cfg, dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("direnv allow"));

        let ok_cfg = test_config(HashMap::new());
        assert!(sync(&ok_cfg, dir.path()).is_ok());
    }

    #[test]
    fn test_env_or_int_parse_failure_falls_back() {
        std::env::set_var("CHEETAH_TEST_BAD_PORT", "not-a-port");
        assert_eq!(env_or_int("CHEETAH_TEST_BAD_PORT", 4000), 4000);
        std::env::remove_var("CHEETAH_TEST_BAD_PORT");
        assert_eq!(env_or_int("CHEETAH_TEST_BAD_PORT", 4000), 4000);
    }
}
