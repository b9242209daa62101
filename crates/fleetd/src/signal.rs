//! Out-of-band signals from the operator to a running supervisor.
//!
//! A signal is a one-line marker file at `<state_dir>/signals/<service>`.
//! Writer and reader both hold the sibling `.lock` file, so the
//! supervisor never reads a half-written marker and a signal is consumed
//! exactly once.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{info, warn};

use crate::lock::FileLock;

/// Signals the supervisor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSignal {
    /// Tear the service down and remove it.
    Terminate,
}

impl UserSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for UserSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown signal: {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalChannel {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SignalChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raise `signal`, replacing any signal not yet consumed.
    pub fn send(&self, signal: UserSignal) -> io::Result<()> {
        let _lock = FileLock::acquire(&self.lock_path)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, signal.as_str())?;
        info!(path = %self.path.display(), %signal, "signal raised");
        Ok(())
    }

    /// Consume the pending signal, if any.
    ///
    /// The marker is deleted whether or not it parses; unknown content is
    /// logged and dropped.
    pub fn poll(&self) -> io::Result<Option<UserSignal>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = {
            let _lock = FileLock::acquire(&self.lock_path)?;
            let content = match std::fs::read_to_string(&self.path) {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            std::fs::remove_file(&self.path)?;
            content
        };

        match content.parse() {
            Ok(signal) => Ok(Some(signal)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring signal");
                Ok(None)
            }
        }
    }

    /// Remove the marker and its lock file.
    pub fn clear(&self) {
        for path in [&self.path, &self.lock_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove signal file"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(dir: &tempfile::TempDir) -> SignalChannel {
        SignalChannel::new(dir.path().join("signals").join("svc1"))
    }

    #[test]
    fn signal_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let signals = channel(&dir);

        signals.send(UserSignal::Terminate).unwrap();
        assert_eq!(signals.poll().unwrap(), Some(UserSignal::Terminate));
        assert_eq!(signals.poll().unwrap(), None);
        assert!(!signals.path().exists());
    }

    #[test]
    fn nothing_pending() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(channel(&dir).poll().unwrap(), None);
    }

    #[test]
    fn unknown_signal_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let signals = channel(&dir);
        std::fs::create_dir_all(signals.path().parent().unwrap()).unwrap();
        std::fs::write(signals.path(), "reboot").unwrap();

        assert_eq!(signals.poll().unwrap(), None);
        assert!(!signals.path().exists());
    }

    #[test]
    fn lock_file_sits_beside_marker() {
        let dir = tempfile::tempdir().unwrap();
        let signals = channel(&dir);
        signals.send(UserSignal::Terminate).unwrap();
        assert!(dir.path().join("signals").join("svc1.lock").exists());

        signals.clear();
        assert!(!signals.path().exists());
        assert!(!dir.path().join("signals").join("svc1.lock").exists());
    }

    #[test]
    fn parse_tolerates_trailing_newline() {
        assert_eq!("terminate\n".parse::<UserSignal>(), Ok(UserSignal::Terminate));
        assert!("".parse::<UserSignal>().is_err());
    }
}
