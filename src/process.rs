//! Peer process handles.
//!
//! A parent actor serving another process keeps that process open for as long as the actor is
//! alive. [`PeerProcess`] owns such a handle and closes it on drop.

use std::fmt;
use std::sync::Arc;

/// OS process identifier.
pub type ProcessId = u32;

/// An opened reference to a peer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pid: ProcessId,
}

impl ProcessHandle {
    pub fn new(pid: ProcessId) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }
}

/// Opens and closes process handles.
pub trait ProcessTable: Send + Sync + 'static {
    /// Returns `None` if `pid` does not name a live process.
    fn open(&self, pid: ProcessId) -> Option<ProcessHandle>;

    fn close(&self, handle: ProcessHandle);
}

/// Process table backed by the operating system.
///
/// On unix a process counts as live when signal 0 can be delivered to it, or when delivery is
/// refused only for lack of permission.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessTable;

impl ProcessTable for OsProcessTable {
    #[cfg(unix)]
    fn open(&self, pid: ProcessId) -> Option<ProcessHandle> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).ok().filter(|raw| *raw > 0)?;
        match kill(Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => Some(ProcessHandle::new(pid)),
            Err(_) => None,
        }
    }

    #[cfg(not(unix))]
    fn open(&self, pid: ProcessId) -> Option<ProcessHandle> {
        (pid != 0).then(|| ProcessHandle::new(pid))
    }

    fn close(&self, _handle: ProcessHandle) {}
}

/// An open handle on a peer process, closed when dropped.
pub struct PeerProcess {
    handle: ProcessHandle,
    table: Arc<dyn ProcessTable>,
}

impl PeerProcess {
    pub fn open(table: &Arc<dyn ProcessTable>, pid: ProcessId) -> Option<Self> {
        let handle = table.open(pid)?;
        Some(Self {
            handle,
            table: table.clone(),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.handle.pid
    }
}

impl Drop for PeerProcess {
    fn drop(&mut self) {
        self.table.close(self.handle);
    }
}

impl fmt::Debug for PeerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerProcess").field("pid", &self.handle.pid).finish()
    }
}

/// Main-process record of a content process served by parent actors.
///
/// Parents keep it alive while open and drop their reference during teardown.
#[derive(Debug, PartialEq, Eq)]
pub struct ContentProcess {
    pid: ProcessId,
    name: String,
}

impl ContentProcess {
    pub fn new(pid: ProcessId, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: name.into(),
        })
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_live() {
        let table: Arc<dyn ProcessTable> = Arc::new(OsProcessTable);
        let peer = PeerProcess::open(&table, std::process::id()).unwrap();
        assert_eq!(peer.pid(), std::process::id());
    }

    #[cfg(unix)]
    #[test]
    fn reserved_pids_are_refused() {
        assert!(OsProcessTable.open(0).is_none());
        assert!(OsProcessTable.open(u32::MAX).is_none());
    }
}
