use crate::session::Session;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Session files on disk: active sessions in `sessions/<id>.json`, finished
/// ones in `sessions/archive/<id>.json`.
pub struct SessionStore {
    dir: PathBuf,
    archive: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: &Path, archive_dir: &Path) -> Self {
        Self {
            dir: sessions_dir.to_path_buf(),
            archive: archive_dir.to_path_buf(),
        }
    }

    pub fn from_paths(paths: &erg_store::Paths) -> Self {
        Self::new(&paths.sessions_dir(), &paths.archive_dir())
    }

    fn active_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn archived_path(&self, id: &str) -> PathBuf {
        self.archive.join(format!("{id}.json"))
    }

    /// Save atomically (temp file, then rename).
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.active_path(&session.id);
        let data = serde_json::to_string_pretty(session)?;
        erg_store::write_atomic(&path, data.as_bytes())
            .with_context(|| format!("saving session: {}", path.display()))
    }

    /// Load an active or archived session. Returns None if neither exists.
    pub fn load(&self, id: &str) -> Result<Option<Session>> {
        for path in [self.active_path(id), self.archived_path(id)] {
            if path.exists() {
                return read_session(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// All active sessions. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<Session>> {
        list_sessions(&self.dir)
    }

    pub fn list_archived(&self) -> Result<Vec<Session>> {
        list_sessions(&self.archive)
    }

    pub fn is_archived(&self, id: &str) -> bool {
        self.archived_path(id).exists()
    }

    /// Write the final copy into the archive and drop the active file.
    pub fn archive(&self, session: &Session) -> Result<()> {
        let path = self.archived_path(&session.id);
        let data = serde_json::to_string_pretty(session)?;
        erg_store::write_atomic(&path, data.as_bytes())
            .with_context(|| format!("archiving session: {}", path.display()))?;
        self.remove(&session.id)
    }

    /// Delete the active file, if present.
    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.active_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading session: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing session: {}", path.display()))
}

fn list_sessions(dir: &Path) -> Result<Vec<Session>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_session(&path) {
            Ok(s) => out.push(s),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
        }
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(out)
}
