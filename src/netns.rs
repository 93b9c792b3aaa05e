//! Network namespace handles
//!
//! A [`NetNs`] is a path to a namespace file: either `/proc/<pid>/ns/net` for a
//! process namespace or a bind-mounted file such as `<dir>/<name>` for a named
//! one. Named namespaces are created by unsharing on a throwaway thread and
//! bind-mounting that thread's namespace onto the handle path.

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("Failed to create netns directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to create netns file: {0}")]
    CreateFile(std::io::Error),

    #[error("Failed to unshare network namespace: {0}")]
    Unshare(nix::Error),

    #[error("Failed to mount namespace: {0}")]
    Mount(nix::Error),

    #[error("Failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("Failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("Failed to remove namespace file: {0}")]
    Remove(std::io::Error),

    #[error("Namespace '{0}' not found")]
    NotFound(String),

    #[error("Namespace worker thread failed: {0}")]
    Thread(String),

    #[error("Insufficient permissions (CAP_SYS_ADMIN required)")]
    Permission,
}

/// Handle to a network namespace, identified by its namespace file
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetNs {
    path: PathBuf,
}

impl NetNs {
    /// Handle for a named namespace bind-mounted at `<dir>/<name>`
    pub fn named_at(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            path: dir.as_ref().join(name),
        }
    }

    /// Handle for the network namespace of a process
    pub fn process(pid: u32) -> Self {
        Self {
            path: PathBuf::from(format!("/proc/{}/ns/net", pid)),
        }
    }

    /// Handle for the namespace this process was started in
    pub fn current() -> Self {
        Self::process(std::process::id())
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Final path component; `net` for process namespaces
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// True for `/proc/<pid>/ns/net` style handles, which can not be created
    /// or removed through this module.
    pub fn is_process(&self) -> bool {
        self.path.starts_with("/proc")
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Open the namespace file for use with `setns`
    pub fn open(&self) -> Result<File, NetNsError> {
        if !self.exists() {
            return Err(NetNsError::NotFound(self.to_string()));
        }
        OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(NetNsError::OpenNs)
    }

    /// Enter this namespace on the current thread; the guard restores the
    /// previous namespace on drop.
    pub fn enter(&self) -> Result<NamespaceGuard, NetNsError> {
        let target = self.open()?;

        let original_ns = OpenOptions::new()
            .read(true)
            .open("/proc/thread-self/ns/net")
            .map_err(NetNsError::OpenNs)?;

        setns(&target, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;

        debug!("Entered namespace: {}", self);

        Ok(NamespaceGuard {
            original_ns,
            current_name: self.to_string(),
        })
    }

    /// Create the namespace if it does not exist yet.
    ///
    /// Returns `true` when a new namespace was created.
    pub fn create(&self) -> Result<bool, NetNsError> {
        if self.exists() {
            return Ok(false);
        }
        if self.is_process() {
            return Err(NetNsError::NotFound(self.to_string()));
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(NetNsError::CreateDir)?;
        }

        debug!("Creating namespace: {}", self);

        File::create(&self.path).map_err(NetNsError::CreateFile)?;

        // unshare() only moves the calling thread, so do it on a thread that
        // exits right after the bind mount pins the new namespace.
        let path = self.path.clone();
        let result = std::thread::Builder::new()
            .name("netns-create".to_string())
            .spawn(move || -> Result<(), NetNsError> {
                unshare(CloneFlags::CLONE_NEWNET).map_err(|e| match e {
                    Errno::EPERM => NetNsError::Permission,
                    e => NetNsError::Unshare(e),
                })?;

                mount(
                    Some("/proc/thread-self/ns/net"),
                    &path,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(NetNsError::Mount)
            })
            .map_err(|e| NetNsError::Thread(e.to_string()))?
            .join()
            .map_err(|_| NetNsError::Thread("namespace creation thread panicked".to_string()))?;

        if let Err(e) = result {
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        info!("Created namespace: {}", self);
        Ok(true)
    }

    /// Unmount and delete the namespace file. Missing namespaces are not an
    /// error.
    pub fn remove(&self) -> Result<(), NetNsError> {
        if self.is_process() {
            return Err(NetNsError::NotFound(self.to_string()));
        }
        if !self.exists() {
            return Ok(());
        }

        debug!("Deleting namespace: {}", self);

        // Lazy unmount avoids EBUSY while a link operation still holds it
        if let Err(e) = umount2(&self.path, MntFlags::MNT_DETACH) {
            warn!("Failed to unmount namespace {}: {}", self, e);
        }
        fs::remove_file(&self.path).map_err(NetNsError::Remove)?;

        info!("Deleted namespace: {}", self);
        Ok(())
    }

    /// Named namespaces found directly under `dir` whose file name starts
    /// with `prefix`.
    pub fn list_at(dir: &Path, prefix: &str) -> Result<Vec<NetNs>, NetNsError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NetNsError::OpenNs(e)),
        };

        let mut namespaces: Vec<NetNs> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
            .map(|entry| NetNs::from_path(entry.path()))
            .collect();
        namespaces.sort();
        Ok(namespaces)
    }
}

impl fmt::Display for NetNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// RAII guard for namespace entry/exit
pub struct NamespaceGuard {
    original_ns: File,
    current_name: String,
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original_ns, CloneFlags::CLONE_NEWNET) {
            warn!(
                "Failed to restore original namespace from {}: {}",
                self.current_name, e
            );
        } else {
            debug!("Restored original namespace from {}", self.current_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_handle_paths() {
        let ns = NetNs::named_at("/tmp", "sitelink-ports");
        assert_eq!(ns.path(), Path::new("/tmp/sitelink-ports"));
        assert_eq!(ns.name(), "sitelink-ports");
        assert!(!ns.is_process());
        assert_eq!(ns.to_string(), "/tmp/sitelink-ports");
    }

    #[test]
    fn test_process_handle() {
        let ns = NetNs::process(42);
        assert_eq!(ns.path(), Path::new("/proc/42/ns/net"));
        assert!(ns.is_process());

        // The running process always has a namespace file
        assert!(NetNs::current().exists());
    }

    #[test]
    fn test_process_namespace_is_not_removable() {
        assert!(matches!(
            NetNs::current().remove(),
            Err(NetNsError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let found = NetNs::list_at(Path::new("/nonexistent/sitelink"), "site-").unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["site-a", "site-b", "other"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let found = NetNs::list_at(dir.path(), "site-").unwrap();
        let names: Vec<String> = found.iter().map(|ns| ns.name()).collect();
        assert_eq!(names, vec!["site-a", "site-b"]);
    }

    #[test]
    #[cfg(feature = "sudo-tests")]
    fn test_namespace_create_enter_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ns = NetNs::named_at(dir.path(), "sitelink-test");

        assert!(ns.create().unwrap());
        // Second call must not re-create
        assert!(!ns.create().unwrap());

        {
            let _guard = ns.enter().unwrap();
        }

        ns.remove().unwrap();
        assert!(!ns.exists());
    }
}
