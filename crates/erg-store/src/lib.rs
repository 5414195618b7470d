use fs2::FileExt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resolved on-disk layout for config, session data, and runtime state.
///
/// Resolution order:
/// 1. `~/.erg/` exists: legacy flat layout, everything under it.
/// 2. Any of `XDG_CONFIG_HOME` / `XDG_DATA_HOME` / `XDG_STATE_HOME` set:
///    XDG layout, unset ones defaulted, each suffixed with `erg`.
/// 3. Otherwise: legacy flat layout at `~/.erg/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub legacy: bool,
}

/// XDG environment values; empty strings count as unset.
#[derive(Debug, Clone, Default)]
pub struct XdgVars {
    pub config_home: Option<String>,
    pub data_home: Option<String>,
    pub state_home: Option<String>,
}

impl XdgVars {
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok().filter(|v| !v.is_empty());
        Self {
            config_home: get("XDG_CONFIG_HOME"),
            data_home: get("XDG_DATA_HOME"),
            state_home: get("XDG_STATE_HOME"),
        }
    }

    fn any_set(&self) -> bool {
        self.config_home.is_some() || self.data_home.is_some() || self.state_home.is_some()
    }
}

impl Paths {
    /// Resolve against the real home directory and environment.
    pub fn resolve() -> anyhow::Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::resolve_with(&home, &XdgVars::from_env()))
    }

    /// Resolve against an explicit home and XDG values (tests build these).
    pub fn resolve_with(home: &Path, xdg: &XdgVars) -> Self {
        let legacy_dir = home.join(".erg");
        if legacy_dir.is_dir() || !xdg.any_set() {
            return Self::rooted(&legacy_dir);
        }

        let pick = |v: &Option<String>, default: PathBuf| {
            v.as_ref().map(PathBuf::from).unwrap_or(default).join("erg")
        };
        Self {
            config_dir: pick(&xdg.config_home, home.join(".config")),
            data_dir: pick(&xdg.data_home, home.join(".local").join("share")),
            state_dir: pick(&xdg.state_home, home.join(".local").join("state")),
            legacy: false,
        }
    }

    /// Flat layout with every directory at `root`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            config_dir: root.to_path_buf(),
            data_dir: root.to_path_buf(),
            state_dir: root.to_path_buf(),
            legacy: true,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.sessions_dir().join("archive")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.state_dir.join("transcripts")
    }

    pub fn status_file(&self) -> PathBuf {
        self.state_dir.join("daemon-status.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("daemon.lock")
    }

    /// Create every directory the daemon writes into.
    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            self.config_dir.clone(),
            self.sessions_dir(),
            self.archive_dir(),
            self.worktrees_dir(),
            self.logs_dir(),
            self.transcripts_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Atomic write: write to temp file in same dir, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

/// File-based exclusive lock guard. Released on drop.
pub struct LockGuard {
    _file: fs::File,
}

/// Acquire an exclusive lock without blocking. Fails if another process
/// (e.g. a second daemon) already holds it.
pub fn try_lock_file(path: &Path) -> anyhow::Result<LockGuard> {
    let file = open_lock(path)?;
    file.try_lock_exclusive()
        .map_err(|e| anyhow::anyhow!("{} is locked by another process: {e}", path.display()))?;
    Ok(LockGuard { _file: file })
}

fn open_lock(path: &Path) -> anyhow::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}
