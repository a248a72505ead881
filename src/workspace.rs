//! Scratch-directory lifecycle and the bounded cleanup window.
//!
//! Every engine instance owns exactly one scratch directory for its whole
//! run; sibling instances (fan-out children, the obfuscator's verification
//! unpacker) probe a numeric suffix so they never share one.  That exclusive
//! ownership is the only locking discipline in the system.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;

// ── TempWorkspace ────────────────────────────────────────────────────────────

/// A uniquely-named scratch directory, recursively deleted on every exit
/// path.  Engines that must preserve an artifact across an interrupt copy it
/// out *before* releasing.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: PathBuf,
}

impl TempWorkspace {
    /// Create `$TMPDIR/nestpack-<label>-<n>`, probing `n` upward until a
    /// fresh directory is ours.
    pub fn acquire(label: &str) -> io::Result<Self> {
        let base = std::env::temp_dir();
        let mut id = 0u32;
        loop {
            let dir = base.join(format!("nestpack-{label}-{id}"));
            match fs::create_dir_all(dir.parent().unwrap_or(&base))
                .and_then(|_| fs::create_dir(&dir))
            {
                Ok(()) => {
                    debug!("workspace: {}", dir.display());
                    return Ok(Self { dir });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => id += 1,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Bring the given files in, by copy or by move, returning their base
    /// names inside the workspace.
    pub fn ingest(&self, files: &[PathBuf], mv: bool) -> io::Result<Vec<String>> {
        let mut names = Vec::with_capacity(files.len());
        for src in files {
            let name = src
                .file_name()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("not a file path: {}", src.display()),
                    )
                })?
                .to_string_lossy()
                .into_owned();
            let dst = self.dir.join(&name);
            if mv {
                move_file(src, &dst)?;
            } else {
                fs::copy(src, &dst)?;
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Sorted directory listing, the unit of the diff-discovery scheme.
    pub fn listing(&self) -> io::Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            names.insert(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    /// Entries present now but absent from `before`, in sorted order.
    pub fn diff(&self, before: &BTreeSet<String>) -> io::Result<Vec<String>> {
        Ok(self
            .listing()?
            .into_iter()
            .filter(|n| !before.contains(n))
            .collect())
    }

    /// Explicit release; `Drop` covers the error paths.
    pub fn release(self) -> io::Result<()> {
        fs::remove_dir_all(&self.dir)
        // Drop still runs but remove_dir_all on a gone dir is tolerated there.
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Rename, falling back to copy+remove across filesystems.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

// ── HistoryWindow ────────────────────────────────────────────────────────────

/// One unpack iteration's before/after name pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub original: String,
    pub staged:   String,
}

/// Bounded FIFO of recent stage artifacts.  Keeps disk usage flat on deep
/// chains: pushing beyond capacity deletes the oldest staged file, tolerating
/// tools that already removed their input themselves.
#[derive(Debug)]
pub struct HistoryWindow {
    stages:   VecDeque<Stage>,
    capacity: usize,
}

impl HistoryWindow {
    /// Capacity is clamped to at least 2 so the interrupt path always has a
    /// most-recent artifact to preserve.
    pub fn new(capacity: usize) -> Self {
        Self {
            stages:   VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, dir: &Path, original: String, staged: String) {
        self.stages.push_back(Stage { original, staged });
        if self.stages.len() > self.capacity {
            if let Some(evicted) = self.stages.pop_front() {
                debug!("history: evicting '{}'", evicted.staged);
                let _ = fs::remove_file(dir.join(&evicted.staged));
            }
        }
    }

    pub fn latest(&self) -> Option<&Stage> {
        self.stages.back()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn siblings_get_distinct_directories() {
        let a = TempWorkspace::acquire("test").unwrap();
        let b = TempWorkspace::acquire("test").unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert!(b.path().is_dir());
        let pa = a.path().to_path_buf();
        a.release().unwrap();
        assert!(!pa.exists());
        b.release().unwrap();
    }

    #[test]
    fn drop_reclaims_the_directory() {
        let path = {
            let ws = TempWorkspace::acquire("drop").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn ingest_copy_preserves_the_source() {
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("input.bin");
        fs::write(&src, b"bytes").unwrap();

        let ws = TempWorkspace::acquire("ingest").unwrap();
        let names = ws.ingest(&[src.clone()], false).unwrap();
        assert_eq!(names, vec!["input.bin".to_string()]);
        assert!(src.exists());
        assert!(ws.join("input.bin").exists());

        let names = ws.ingest(&[src.clone()], true).unwrap();
        assert_eq!(names, vec!["input.bin".to_string()]);
        assert!(!src.exists());
        ws.release().unwrap();
    }

    #[test]
    fn diff_reports_only_new_entries() {
        let ws = TempWorkspace::acquire("diff").unwrap();
        fs::write(ws.join("old"), b"").unwrap();
        let before = ws.listing().unwrap();
        fs::write(ws.join("b-new"), b"").unwrap();
        fs::write(ws.join("a-new"), b"").unwrap();
        assert_eq!(ws.diff(&before).unwrap(), vec!["a-new", "b-new"]);
        ws.release().unwrap();
    }

    #[test]
    fn history_window_deletes_evicted_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut win = HistoryWindow::new(2);
        for i in 0..4 {
            let staged = format!("stage-{i}");
            fs::write(dir.path().join(&staged), b"x").unwrap();
            win.push(dir.path(), format!("orig-{i}"), staged);
        }
        assert_eq!(win.len(), 2);
        assert!(!dir.path().join("stage-0").exists());
        assert!(!dir.path().join("stage-1").exists());
        assert!(dir.path().join("stage-2").exists());
        assert!(dir.path().join("stage-3").exists());
        assert_eq!(win.latest().unwrap().staged, "stage-3");
    }

    #[test]
    fn history_tolerates_files_removed_by_tools() {
        let dir = tempfile::tempdir().unwrap();
        let mut win = HistoryWindow::new(2);
        // never created on disk — eviction must not fail
        for i in 0..5 {
            win.push(dir.path(), format!("o{i}"), format!("s{i}"));
        }
        assert_eq!(win.len(), 2);
    }

    #[test]
    fn capacity_is_clamped_to_two() {
        let win = HistoryWindow::new(0);
        assert_eq!(win.capacity, 2);
    }
}
