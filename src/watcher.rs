//! Config file watching for live reload.

use notify_debouncer_mini::{new_debouncer, DebouncedEventKind, Debouncer};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEBOUNCE: Duration = Duration::from_millis(300);

/// Watches one file for changes.
///
/// The parent directory is watched rather than the file, since editors and
/// [`Config::save`](crate::config::Config::save) replace the file by renaming.
pub struct ConfigWatcher {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    rx: Receiver<Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>>,
    path: PathBuf,
    file_name: OsString,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, notify::Error> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| notify::Error::generic("config path has no file name"))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE, tx)?;
        debouncer
            .watcher()
            .watch(&dir, notify::RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching config");

        Ok(Self {
            _debouncer: debouncer,
            rx,
            path,
            file_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` if the file changed since the last call. Never blocks.
    pub fn changed(&self) -> bool {
        let mut changed = false;
        while let Ok(result) = self.rx.try_recv() {
            match result {
                Ok(events) => {
                    changed |= events.iter().any(|event| {
                        matches!(event.kind, DebouncedEventKind::Any)
                            && event.path.file_name() == Some(self.file_name.as_os_str())
                    });
                }
                Err(e) => warn!(error = ?e, "config watcher error"),
            }
        }
        if changed {
            debug!(path = %self.path.display(), "config changed");
        }
        changed
    }
}
