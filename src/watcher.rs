use std::collections::{BTreeMap, BTreeSet};
use std::future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
    is_dir: bool,
}

type Snapshot = BTreeMap<PathBuf, BTreeMap<PathBuf, Stamp>>;

struct Shared {
    debounce: Duration,
    dirs: Mutex<BTreeSet<PathBuf>>,
    clients: Mutex<Vec<mpsc::Sender<()>>>,
}

/// Watches directories for changes and notifies any number of clients.
///
/// Watched directories are scanned every debounce period, without
/// descending into subdirectories. Clients are notified once a change has
/// been followed by a quiet scan, so bursts of writes produce a single
/// notification. Directories created inside watched directories are watched
/// too, and watched directories that disappear are forgotten.
#[derive(Clone)]
pub struct SharedWatcher {
    shared: Arc<Shared>,
}

impl SharedWatcher {
    pub fn new(debounce: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                debounce,
                dirs: Mutex::new(BTreeSet::new()),
                clients: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts watching a directory.
    pub fn add(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if lock(&self.shared.dirs).insert(dir.clone()) {
            debug!("watching {}", dir.display());
        }
    }

    /// Watches the directory of a file, or the directory itself. Watching
    /// directories rather than files also catches new files that wildcard
    /// rules would pick up.
    pub fn add_dir(&self, name: impl AsRef<Path>) {
        let name = name.as_ref();
        if name.is_dir() {
            self.add(name);
            return;
        }
        match name.parent() {
            Some(parent) if parent.as_os_str().is_empty() => self.add("."),
            Some(parent) => self.add(parent),
            None => self.add(name),
        }
    }

    pub fn remove(&self, dir: &Path) {
        lock(&self.shared.dirs).remove(dir);
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        lock(&self.shared.dirs).iter().cloned().collect()
    }

    pub fn client(&self) -> Client {
        let (tx, rx) = mpsc::channel(1);
        lock(&self.shared.clients).push(tx);
        Client {
            watcher: self.clone(),
            rx: Some(rx),
        }
    }

    /// Gives every client a pending notification, unless it already has one.
    pub fn notify_clients(&self) {
        lock(&self.shared.clients).retain(|client| match client.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
    }

    pub fn start(&self) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move { watcher.run().await })
    }

    async fn run(self) {
        let mut previous: Option<Snapshot> = None;
        let mut changed = false;
        loop {
            tokio::time::sleep(self.shared.debounce).await;

            let dirs = self.dirs();
            let snapshot = match tokio::task::spawn_blocking(move || scan(&dirs)).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Watcher error: {e}");
                    continue;
                }
            };

            if let Some(previous) = &previous {
                if self.compare(previous, &snapshot) {
                    changed = true;
                } else if changed {
                    changed = false;
                    self.notify_clients();
                }
            }
            previous = Some(snapshot);
        }
    }

    /// Returns whether anything changed between two scans, and starts
    /// watching new directories or stops watching removed ones.
    fn compare(&self, previous: &Snapshot, current: &Snapshot) -> bool {
        let mut changed = false;
        for (dir, before) in previous {
            let Some(after) = current.get(dir) else {
                debug!("{} is gone", dir.display());
                self.remove(dir);
                changed = true;
                continue;
            };
            if before != after {
                changed = true;
                for (path, stamp) in after {
                    if stamp.is_dir && !before.contains_key(path) {
                        self.add(path.clone());
                    }
                }
            }
        }
        changed
    }
}

/// A receiver of change notifications from a `SharedWatcher`.
pub struct Client {
    watcher: SharedWatcher,
    rx: Option<mpsc::Receiver<()>>,
}

impl Client {
    /// Waits for the next change. Never resolves once the watcher is gone.
    pub async fn changed(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return future::pending().await;
        };
        if rx.recv().await.is_none() {
            self.rx = None;
            future::pending::<()>().await;
        }
    }

    /// Watches the directories of the given files.
    pub fn watch<I, P>(&self, names: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for name in names {
            self.watcher.add_dir(name);
        }
    }

    pub fn watcher(&self) -> &SharedWatcher {
        &self.watcher
    }
}

fn scan(dirs: &[PathBuf]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for dir in dirs {
        let mut entries = BTreeMap::new();
        let walk = WalkDir::new(dir)
            .max_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));
        let mut missing = false;
        for entry in walk {
            match entry {
                Ok(entry) => {
                    if let Ok(metadata) = entry.metadata() {
                        entries.insert(
                            entry.into_path(),
                            Stamp {
                                modified: metadata.modified().ok(),
                                len: metadata.len(),
                                is_dir: metadata.is_dir(),
                            },
                        );
                    }
                }
                Err(e) if e.depth() == 0 => {
                    debug!("cannot scan {}: {e}", dir.display());
                    missing = true;
                    break;
                }
                Err(e) => debug!("cannot scan entry in {}: {e}", dir.display()),
            }
        }
        if !missing {
            snapshot.insert(dir.clone(), entries);
        }
    }
    snapshot
}

// Dot files are mostly version control and editor state.
fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
