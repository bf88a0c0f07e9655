//! Runtime environments: the directories a runtime owns, and the
//! process-wide registry that keeps two runtimes from sharing them.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use data_encoding::HEXLOWER;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::err::{Error, Result};

/// A short stable identifier derived from a runtime's work directory.
///
/// Used to tell runtimes apart in logs and UI without printing whole
/// paths everywhere.  Sixteen lowercase hex characters.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Fid {
    /// The first eight bytes of `SHA-256(work_dir)`.
    bytes: [u8; 8],
}

impl Fid {
    /// Derive the fid for `work_dir`.
    fn derive(work_dir: &Path) -> Fid {
        let mut d = Sha256::new();
        d.update(work_dir.to_string_lossy().as_bytes());
        let digest = d.finalize();
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Fid { bytes }
    }
}

impl Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.bytes))
    }
}

impl fmt::Debug for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fid({})", self)
    }
}

/// The directories one runtime owns.
///
/// Identity is the `(work_dir, cache_dir)` pair; no two live runtimes in a
/// process may share either member.  Layout under `work_dir`: `torrc`,
/// `torrc-defaults`, `data/`, `hs/<service>/`, `auth_clients/`; under
/// `cache_dir`: tor's cache tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DaemonEnv {
    /// Where configuration, state, and keys live.
    work_dir: PathBuf,
    /// Where tor's cache lives.
    cache_dir: PathBuf,
    /// Identifier derived from `work_dir`.
    fid: Fid,
}

impl DaemonEnv {
    /// Build an environment over two absolute directories.
    ///
    /// The directories need not exist yet, but must be absolute, distinct
    /// paths.
    pub fn new(work_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Result<DaemonEnv> {
        let work_dir = normalize(work_dir.into(), "work directory")?;
        let cache_dir = normalize(cache_dir.into(), "cache directory")?;
        if work_dir == cache_dir {
            return Err(Error::Torrc(tor_torrc::TorrcError::Invalid {
                option: "cache directory".to_string(),
                problem: "must differ from the work directory".to_string(),
            }));
        }
        let fid = Fid::derive(&work_dir);
        Ok(DaemonEnv {
            work_dir,
            cache_dir,
            fid,
        })
    }

    /// The work directory.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// The cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The runtime's fid.
    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// Path of the torrc we write.
    pub(crate) fn torrc_path(&self) -> PathBuf {
        self.work_dir.join("torrc")
    }

    /// Path of the torrc-defaults we write.
    pub(crate) fn torrc_defaults_path(&self) -> PathBuf {
        self.work_dir.join("torrc-defaults")
    }

    /// Tor's DataDirectory.
    pub(crate) fn data_dir(&self) -> PathBuf {
        self.work_dir.join("data")
    }

    /// Parent of hidden-service directories.
    pub(crate) fn hs_dir(&self) -> PathBuf {
        self.work_dir.join("hs")
    }

    /// Client-authorization key directory.
    pub(crate) fn auth_clients_dir(&self) -> PathBuf {
        self.work_dir.join("auth_clients")
    }

    /// Where tor reports its auto control listener.
    pub(crate) fn control_port_file(&self) -> PathBuf {
        self.work_dir.join("control.txt")
    }
}

/// Check that `path` is absolute and lexically normalize it.
fn normalize(path: PathBuf, what: &str) -> Result<PathBuf> {
    use std::path::Component;
    if !path.is_absolute() {
        return Err(Error::Torrc(tor_torrc::TorrcError::Invalid {
            option: what.to_string(),
            problem: format!("path {:?} is not absolute", path),
        }));
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// The process-wide registry of directories owned by live runtimes.
///
/// Initialized lazily on first use; entries disappear when their runtime
/// is destroyed (see [`EnvGuard`]).
static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Fid>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Registration of one environment's directories.
///
/// Dropping the guard releases both directories for reuse.
#[derive(Debug)]
pub(crate) struct EnvGuard {
    /// The registered directories.
    dirs: Vec<PathBuf>,
}

impl EnvGuard {
    /// Claim `env`'s directories, rejecting any that another live runtime
    /// already owns.
    pub(crate) fn claim(env: &DaemonEnv) -> Result<EnvGuard> {
        let mut registry = REGISTRY.lock().expect("environment registry poisoned");
        for dir in [env.work_dir(), env.cache_dir()] {
            if registry.contains_key(dir) {
                return Err(Error::EnvInUse(dir.display().to_string()));
            }
        }
        let dirs = vec![env.work_dir().to_owned(), env.cache_dir().to_owned()];
        for dir in &dirs {
            registry.insert(dir.clone(), env.fid());
        }
        debug!("[{}] claimed {:?}", env.fid(), dirs);
        Ok(EnvGuard { dirs })
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock().expect("environment registry poisoned");
        for dir in &self.dirs {
            registry.remove(dir);
        }
    }
}
