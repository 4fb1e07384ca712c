//! Polling file watcher
//!
//! Inspired by esbuild's polling watcher: a randomized scan order with a
//! recent-items fast path balances CPU usage against change detection
//! latency. Recently dirty paths are re-checked every tick, the rest of the
//! tree is covered by partial sweeps, and the directory is re-walked every
//! few seconds to pick up created and deleted files.

use glob::Pattern;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::info;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const MAX_RECENT_ITEMS: usize = 16;
const MIN_ITEMS_PER_TICK: usize = 64;
const TICKS_PER_SWEEP: usize = 20;
/// Ticks between full directory re-walks (~5 seconds)
const RESCAN_TICKS: usize = 50;

const DO_NOT_EDIT_MARKER: &[u8] = b"DO NOT EDIT";

pub struct Watcher {
    inner: Arc<Inner>,
    handle: Option<thread::JoinHandle<()>>,
}

struct Inner {
    dir: PathBuf,
    patterns: Vec<Pattern>,
    ignore_patterns: Vec<Pattern>,
    on_change: Box<dyn Fn(&Path) + Send + Sync>,
    state: Mutex<State>,
    should_stop: AtomicBool,
}

#[derive(Default)]
struct State {
    mod_times: HashMap<PathBuf, SystemTime>,
    recent_items: Vec<PathBuf>,
    items_to_scan: Vec<PathBuf>,
    items_per_tick: usize,
}

impl Watcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        patterns: &[&str],
        ignore_patterns: &[&str],
        on_change: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.into(),
                patterns: compile(patterns),
                ignore_patterns: compile(ignore_patterns),
                on_change: Box::new(on_change),
                state: Mutex::new(State::default()),
                should_stop: AtomicBool::new(false),
            }),
            handle: None,
        }
    }

    /// Take an initial snapshot and spawn the tick thread. Stat-heavy work
    /// stays off the async runtime; callers receive change callbacks on the
    /// tick thread and are expected to hand them to a channel.
    pub fn start(&mut self) {
        let initial = self.inner.scan();
        info!(dir = %self.inner.dir.display(), files = initial.len(), "watch");
        self.inner.state.lock().mod_times = initial;

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("cheetah-watch".to_string())
            .spawn(move || {
                let mut rescan_counter = 0;
                while !inner.should_stop.load(Ordering::Relaxed) {
                    thread::sleep(TICK_INTERVAL);

                    rescan_counter += 1;
                    if rescan_counter >= RESCAN_TICKS {
                        inner.refresh_file_list();
                        rescan_counter = 0;
                    }

                    if let Some(dirty) = inner.try_find_dirty_path() {
                        (inner.on_change)(&dirty);
                    }
                }
            })
            .expect("spawn watcher thread");
        self.handle = Some(handle);
    }

    pub fn stop(&mut self) {
        self.inner.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Inner {
    /// Walk the watched tree and return mtimes for every eligible file.
    fn scan(&self) -> HashMap<PathBuf, SystemTime> {
        let mut result = HashMap::new();
        self.walk(&self.dir, &mut result);
        result
    }

    fn walk(&self, dir: &Path, result: &mut HashMap<PathBuf, SystemTime>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                if name.starts_with('.') || name == "node_modules" || name == "vendor" {
                    continue;
                }
                if matches_any(Path::new(&name), &self.ignore_patterns) {
                    continue;
                }
                self.walk(&path, result);
                continue;
            }

            let rel = path.strip_prefix(&self.dir).unwrap_or(&path);
            if !self.patterns.is_empty() && !matches_any(rel, &self.patterns) {
                continue;
            }
            if matches_any(rel, &self.ignore_patterns) {
                continue;
            }
            if has_do_not_edit(&path) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    result.insert(path, modified);
                }
            }
        }
    }

    /// Re-walk the tree, dropping deleted files and adopting new ones
    /// without disturbing mtimes already tracked.
    fn refresh_file_list(&self) {
        let fresh = self.scan();
        let mut state = self.state.lock();

        state.mod_times.retain(|path, _| fresh.contains_key(path));
        for (path, mod_time) in fresh {
            state.mod_times.entry(path).or_insert(mod_time);
        }

        // Force the scan list to rebuild on the next tick
        state.items_to_scan.clear();
    }

    fn try_find_dirty_path(&self) -> Option<PathBuf> {
        let mut state = self.state.lock();

        if state.items_to_scan.is_empty() {
            let mut items: Vec<PathBuf> = state.mod_times.keys().cloned().collect();
            use rand::seq::SliceRandom;
            items.shuffle(&mut rand::thread_rng());

            let per_tick = items.len().div_ceil(TICKS_PER_SWEEP).max(MIN_ITEMS_PER_TICK);
            state.items_to_scan = items;
            state.items_per_tick = per_tick;
        }

        // Recently dirty paths are checked first, every tick
        for i in 0..state.recent_items.len() {
            let path = state.recent_items[i].clone();
            if is_dirty(&mut state.mod_times, &path) {
                let promoted = state.recent_items.remove(i);
                state.recent_items.push(promoted);
                return Some(path);
            }
        }

        let remaining = state.items_to_scan.len().saturating_sub(state.items_per_tick);
        let to_check = state.items_to_scan.split_off(remaining);

        for path in to_check {
            if is_dirty(&mut state.mod_times, &path) {
                state.recent_items.push(path.clone());
                if state.recent_items.len() > MAX_RECENT_ITEMS {
                    state.recent_items.remove(0);
                }
                return Some(path);
            }
        }

        None
    }
}

fn compile(patterns: &[&str]) -> Vec<Pattern> {
    patterns.iter().filter_map(|p| Pattern::new(p).ok()).collect()
}

fn is_dirty(mod_times: &mut HashMap<PathBuf, SystemTime>, path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        // File was deleted
        mod_times.remove(path);
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    match mod_times.get(path) {
        Some(stored) if modified > *stored => {
            mod_times.insert(path.to_path_buf(), modified);
            true
        }
        None => {
            mod_times.insert(path.to_path_buf(), modified);
            true
        }
        _ => false,
    }
}

/// True when the path's basename or the path itself matches any pattern.
pub fn matches_any(path: &Path, patterns: &[Pattern]) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    let full = path.to_string_lossy();
    patterns
        .iter()
        .any(|p| p.matches(&name) || p.matches(&full))
}

fn has_do_not_edit(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 1024];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    buf[..n]
        .windows(DO_NOT_EDIT_MARKER.len())
        .any(|w| w == DO_NOT_EDIT_MARKER)
}
