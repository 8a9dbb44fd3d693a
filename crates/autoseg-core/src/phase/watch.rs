//! Filesystem change subscription for event-driven waits.
//!
//! Linux only: an inotify instance is read from a dedicated thread that
//! forwards entry names over a channel. The thread exits as soon as the
//! receiving side is dropped, so a finished wait never leaves it behind for
//! longer than one nap.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use tokio::sync::mpsc;

/// Capacity of the event channel; the reader blocks when it is full.
const EVENT_BUFFER: usize = 256;

/// Something happened in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// An entry was created, finished writing, or moved in.
    Named(OsString),
    /// The kernel queue overflowed; any name may have been missed.
    Overflow,
}

/// A live subscription to one directory.
#[derive(Debug)]
pub struct DirWatch {
    rx: mpsc::Receiver<WatchEvent>,
}

impl DirWatch {
    /// Wait for an event concerning `name` (or an overflow, which may hide
    /// one). Returns `false` once the subscription has ended.
    pub async fn next_for(&mut self, name: &OsStr) -> bool {
        while let Some(event) = self.rx.recv().await {
            match event {
                WatchEvent::Named(seen) if seen == name => return true,
                WatchEvent::Overflow => return true,
                WatchEvent::Named(_) => {},
            }
        }
        false
    }
}

/// Subscribe to entries appearing in `dir`.
///
/// # Errors
///
/// Returns a description of why events are unavailable; callers fall back
/// to polling.
#[cfg(target_os = "linux")]
pub fn watch_dir(dir: &Path) -> Result<DirWatch, String> {
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    const IDLE_NAP: Duration = Duration::from_millis(50);

    let watch_mask =
        AddWatchFlags::IN_CREATE | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO;

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
        .map_err(|error| format!("inotify init failed: {error}"))?;
    inotify
        .add_watch(dir, watch_mask)
        .map_err(|error| format!("inotify add watch {} failed: {error}", dir.display()))?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    std::thread::Builder::new()
        .name("phase-watch".to_string())
        .spawn(move || {
            let inotify = inotify;
            while !tx.is_closed() {
                match inotify.read_events() {
                    Ok(events) => {
                        for event in events {
                            let forwarded = if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                                WatchEvent::Overflow
                            } else if let Some(name) = event.name {
                                WatchEvent::Named(name)
                            } else {
                                continue;
                            };
                            if tx.blocking_send(forwarded).is_err() {
                                return;
                            }
                        }
                    },
                    Err(Errno::EAGAIN) => std::thread::sleep(IDLE_NAP),
                    Err(Errno::EINTR) => {},
                    // Dropping the sender ends the subscription.
                    Err(_) => return,
                }
            }
        })
        .map_err(|error| format!("cannot start watch thread: {error}"))?;

    Ok(DirWatch { rx })
}

/// Subscribe to entries appearing in `dir`.
///
/// # Errors
///
/// Always fails on this platform; callers fall back to polling.
#[cfg(not(target_os = "linux"))]
pub fn watch_dir(_dir: &Path) -> Result<DirWatch, String> {
    Err("filesystem events unavailable on this platform".to_string())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_reports_matching_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut watch = watch_dir(dir.path()).unwrap();

        std::fs::write(dir.path().join("other.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("target.dcm"), b"x").unwrap();

        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            watch.next_for(OsStr::new("target.dcm")),
        )
        .await
        .unwrap();
        assert!(seen);
    }

    #[tokio::test]
    async fn test_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(watch_dir(&dir.path().join("absent")).is_err());
    }
}
