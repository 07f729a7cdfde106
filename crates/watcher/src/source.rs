//! Watch source: raw filesystem events for every account root
//!
//! Every directory below a root gets its own non-recursive watch, so the
//! watch set is explicit and a failure on one subtree never takes down the
//! rest. One task per root owns its `notify` watcher; the watcher's callback
//! thread only forwards into a channel.
//!
//! Directories created at runtime are walked right after their watch is in
//! place, and everything already inside them is reported as created. That
//! closes the window between `mkdir` and watch registration.

use notify::event::{CreateKind, ModifyKind, RemoveKind};
use notify::{ErrorKind, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use mailwatch_core::{ChangeKind, EntryKind, RawEvent};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::resolve::{is_leaf, TMP};

/// Watches a set of account roots
pub struct WatchSource {
    roots: Vec<PathBuf>,
    policy: BackoffPolicy,
    capacity: usize,
}

impl WatchSource {
    /// `capacity` bounds the per-root channel between the notify thread and
    /// the root task
    pub fn new(roots: Vec<PathBuf>, policy: BackoffPolicy, capacity: usize) -> Self {
        Self {
            roots,
            policy,
            capacity: capacity.max(1),
        }
    }

    /// Start one task per root, all sending into `events`
    pub fn spawn(
        self,
        events: mpsc::Sender<RawEvent>,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) {
        for root in self.roots {
            let watcher = RootWatcher::new(
                root,
                self.policy,
                self.capacity,
                events.clone(),
                shutdown.clone(),
            );
            tracker.spawn(watcher.run());
        }
    }
}

type NotifyMessage = notify::Result<Event>;

struct RootWatcher {
    root: PathBuf,
    policy: BackoffPolicy,
    events: mpsc::Sender<RawEvent>,
    shutdown: CancellationToken,

    /// None until created (creation itself can fail and is retried)
    watcher: Option<RecommendedWatcher>,
    notify_tx: mpsc::Sender<NotifyMessage>,
    notify_rx: mpsc::Receiver<NotifyMessage>,

    /// Set by the notify thread when the channel was full and an event dropped
    overflowed: Arc<AtomicBool>,

    /// Directories with an active watch
    watched: HashSet<PathBuf>,

    /// Directories waiting for another registration attempt
    retries: HashMap<PathBuf, Backoff>,
}

impl RootWatcher {
    fn new(
        root: PathBuf,
        policy: BackoffPolicy,
        capacity: usize,
        events: mpsc::Sender<RawEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(capacity);
        Self {
            root,
            policy,
            events,
            shutdown,
            watcher: None,
            notify_tx,
            notify_rx,
            overflowed: Arc::new(AtomicBool::new(false)),
            watched: HashSet::new(),
            retries: HashMap::new(),
        }
    }

    async fn run(mut self) {
        info!(root = %self.root.display(), "Starting watch");
        self.start();

        loop {
            let retry_at = self.next_retry();
            let idle = Instant::now() + Duration::from_secs(3600);

            let keep_going = tokio::select! {
                _ = self.shutdown.cancelled() => false,
                message = self.notify_rx.recv() => match message {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(err)) => {
                        self.handle_error(err);
                        true
                    }
                    None => false,
                },
                _ = sleep_until(retry_at.unwrap_or(idle)), if retry_at.is_some() => {
                    self.retry_due().await
                }
            };

            if !keep_going {
                break;
            }

            if self.overflowed.swap(false, Ordering::Relaxed) && !self.rescan().await {
                break;
            }
        }

        debug!(root = %self.root.display(), watched = self.watched.len(), "Watch stopped");
    }

    /// Create the watcher and register the whole tree
    fn start(&mut self) {
        if let Err(err) = self.create_watcher() {
            warn!(root = %self.root.display(), "Failed to create watcher: {}", err);
            self.schedule_retry(self.root.clone());
            return;
        }

        let root = self.root.clone();
        let (ok, _) = self.register_tree(&root, false);
        if ok {
            info!(root = %root.display(), directories = self.watched.len(), "Watching account root");
        }
    }

    fn create_watcher(&mut self) -> notify::Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let tx = self.notify_tx.clone();
        let overflowed = Arc::clone(&self.overflowed);
        let watcher = RecommendedWatcher::new(
            move |res: NotifyMessage| {
                if tx.try_send(res).is_err() {
                    overflowed.store(true, Ordering::Relaxed);
                }
            },
            notify::Config::default(),
        )?;

        self.watcher = Some(watcher);
        Ok(())
    }

    fn watch_dir(&mut self, path: &Path) -> notify::Result<()> {
        let watcher = self
            .watcher
            .as_mut()
            .ok_or_else(|| notify::Error::generic("watcher not created"))?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        self.watched.insert(path.to_path_buf());
        Ok(())
    }

    /// Watch `top` and every directory below it
    ///
    /// Returns whether `top` itself is watched, plus synthetic created events
    /// for everything found below `top` when `announce` is set. Without
    /// `announce`, `cur`/`new`/`tmp` are watched but not listed.
    fn register_tree(&mut self, top: &Path, announce: bool) -> (bool, Vec<RawEvent>) {
        let mut top_ok = false;
        let mut found = Vec::new();
        let mut walker = WalkDir::new(top).follow_links(false).into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(top).to_path_buf();
                    self.watch_failed(&path, &err.to_string());
                    continue;
                }
            };

            let path = entry.path();
            let is_dir = entry.file_type().is_dir();
            let is_top = entry.depth() == 0;

            if is_dir {
                if let Err(err) = self.watch_dir(path) {
                    self.watch_failed(path, &err.to_string());
                    walker.skip_current_dir();
                    continue;
                }
                if is_top {
                    top_ok = true;
                }

                let name = entry.file_name().to_str().unwrap_or_default();
                if name == TMP || (!announce && !is_top && is_leaf(name)) {
                    walker.skip_current_dir();
                }
            }

            if announce && !is_top {
                let kind = if is_dir { EntryKind::Dir } else { EntryKind::File };
                found.push(RawEvent::new(path, ChangeKind::Created, kind));
            }
        }

        (top_ok, found)
    }

    /// Drop watches for `top` and everything below it
    fn unwatch_tree(&mut self, top: &Path) {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|path| path.starts_with(top))
            .cloned()
            .collect();

        for path in gone {
            if let Some(watcher) = self.watcher.as_mut() {
                // inotify drops watches of deleted directories on its own
                let _ = watcher.unwatch(&path);
            }
            self.watched.remove(&path);
        }
        self.retries.retain(|path, _| path == &self.root || !path.starts_with(top));
    }

    fn watch_failed(&mut self, path: &Path, reason: &str) {
        if path != self.root && !path.exists() {
            debug!(path = %path.display(), "Directory vanished before it could be watched");
            return;
        }
        warn!(path = %path.display(), "Failed to watch directory: {}", reason);
        self.schedule_retry(path.to_path_buf());
    }

    fn schedule_retry(&mut self, path: PathBuf) {
        let policy = self.policy;
        self.retries
            .entry(path)
            .or_insert_with(|| Backoff::new(policy));
    }

    fn next_retry(&self) -> Option<Instant> {
        self.retries.values().map(Backoff::next_attempt).min()
    }

    async fn retry_due(&mut self) -> bool {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .retries
            .iter()
            .filter(|(_, backoff)| backoff.is_due(now))
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            let is_root = path == self.root;
            if !is_root && !path.exists() {
                self.retries.remove(&path);
                debug!(path = %path.display(), "Dropping retry for removed directory");
                continue;
            }

            let registered = match self.create_watcher() {
                Ok(()) => Some(self.register_tree(&path, !is_root)),
                Err(err) => {
                    debug!(root = %self.root.display(), "Watcher still unavailable: {}", err);
                    None
                }
            };

            match registered {
                Some((true, mut events)) => {
                    let attempts = self
                        .retries
                        .remove(&path)
                        .map(|backoff| backoff.attempts() + 1)
                        .unwrap_or(1);
                    info!(path = %path.display(), attempts, "Watch recovered");

                    // Changes made while the root was unwatched are unknown
                    if is_root {
                        events.push(RawEvent::new(path.clone(), ChangeKind::Overflow, EntryKind::Dir));
                    }
                    if !self.emit(events).await {
                        return false;
                    }
                }
                _ => {
                    if let Some(backoff) = self.retries.get_mut(&path) {
                        backoff.failed();
                        debug!(
                            path = %path.display(),
                            attempts = backoff.attempts(),
                            "Watch retry failed"
                        );
                    }
                }
            }
        }

        true
    }

    /// Re-register the tree after lost events and request a full sync
    async fn rescan(&mut self) -> bool {
        warn!(root = %self.root.display(), "Event queue overflowed, rescanning");
        self.watched.retain(|path| path.exists());

        let root = self.root.clone();
        let (ok, _) = self.register_tree(&root, false);
        if !ok {
            return true;
        }
        self.emit(vec![RawEvent::new(root, ChangeKind::Overflow, EntryKind::Dir)])
            .await
    }

    async fn handle_event(&mut self, event: Event) -> bool {
        if event.need_rescan() {
            return self.rescan().await;
        }

        let Some(change) = classify(&event.kind) else {
            return true;
        };

        let mut out = Vec::with_capacity(event.paths.len());
        for path in &event.paths {
            let metadata = std::fs::symlink_metadata(path).ok();
            let entry = self.entry_kind(path, &event.kind, metadata.as_ref());
            out.push(RawEvent::new(path.clone(), change, entry));

            match (change, metadata) {
                (ChangeKind::Created | ChangeKind::Renamed, Some(meta)) if meta.is_dir() => {
                    let (_, found) = self.register_tree(path, true);
                    out.extend(found);
                }
                (ChangeKind::Removed | ChangeKind::Renamed, None) if self.watched.contains(path) => {
                    self.unwatch_tree(path);
                    if *path == self.root {
                        warn!(root = %self.root.display(), "Account root disappeared");
                        self.schedule_retry(self.root.clone());
                    }
                }
                _ => {}
            }
        }

        self.emit(out).await
    }

    fn handle_error(&mut self, err: notify::Error) {
        match &err.kind {
            ErrorKind::PathNotFound | ErrorKind::WatchNotFound => {
                debug!(paths = ?err.paths, "Watch target gone: {}", err);
            }
            ErrorKind::MaxFilesWatch => {
                warn!(root = %self.root.display(), "Watch limit reached: {}", err);
                for path in err.paths.clone() {
                    self.schedule_retry(path);
                }
            }
            _ => {
                warn!(root = %self.root.display(), paths = ?err.paths, "Watch error: {}", err);
                for path in err.paths.clone() {
                    if path.exists() {
                        self.schedule_retry(path);
                    }
                }
            }
        }
    }

    fn entry_kind(&self, path: &Path, kind: &EventKind, metadata: Option<&std::fs::Metadata>) -> EntryKind {
        match kind {
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
                return EntryKind::Dir
            }
            EventKind::Create(CreateKind::File) | EventKind::Remove(RemoveKind::File) => {
                return EntryKind::File
            }
            _ => {}
        }

        match metadata {
            Some(meta) if meta.is_dir() => EntryKind::Dir,
            Some(_) => EntryKind::File,
            None if self.watched.contains(path) => EntryKind::Dir,
            None => EntryKind::Unknown,
        }
    }

    /// Forward events downstream; false once the pipeline is gone
    async fn emit(&self, events: Vec<RawEvent>) -> bool {
        for event in events {
            tokio::select! {
                sent = self.events.send(event) => {
                    if sent.is_err() {
                        return false;
                    }
                }
                _ = self.shutdown.cancelled() => return false,
            }
        }
        true
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeKind::Modified),
        EventKind::Access(_) => None,
    }
}
