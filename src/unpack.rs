//! Depth-first recursive unpacking engine.
//!
//! The engine is a loop over a LIFO queue of in-scope archive names inside
//! an exclusive scratch workspace: pop, detect, decompress with the format's
//! external tool, then diff the directory listing to find what the tool
//! actually produced (tools disagree about output naming and some remove
//! their input themselves).  Recognised products go back to the front of the
//! queue; everything else is terminal content, content-addressed and moved
//! to the caller's directory.  When one extraction yields several archives,
//! the first stays here and each sibling is handed to an independently
//! scoped child engine, strictly sequentially.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;

use crate::format::{self, FormatId};
use crate::interrupt::InterruptFlag;
use crate::invoke;
use crate::registry::{self, ContentRegistry};
use crate::workspace::{move_file, HistoryWindow, TempWorkspace};

// ── Errors & options ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("input archive not found: {0}")]
    InputMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// History window capacity (clamped to ≥ 2).
    pub keep:        usize,
    /// Log recovered content when it is printable text.
    pub display:     bool,
    /// Move the input into the workspace instead of copying it.
    pub move_input:  bool,
    /// After a fruitless run, retry once with the input's bytes reversed.
    pub try_reverse: bool,
    /// Restrict detection to these formats; `None` means the full table.
    pub formats:     Option<Vec<FormatId>>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            keep:        2,
            display:     false,
            move_input:  false,
            try_reverse: false,
            formats:     None,
        }
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredFile {
    pub name:  String,
    pub hash:  String,
    pub count: u32,
}

#[derive(Debug)]
pub struct UnpackReport {
    /// Number of successful decompressions across this instance and its
    /// delegated children.
    pub rounds:       u32,
    /// Formats in the order they were unwrapped.
    pub formats_used: Vec<FormatId>,
    /// Recovered terminal files, sorted by name.
    pub files:        Vec<RecoveredFile>,
    /// Hidden payload reassembled from zero-length markers, original byte
    /// order restored.
    pub hidden:       Option<Vec<u8>>,
    pub interrupted:  bool,
}

impl UnpackReport {
    pub fn file(&self, name: &str) -> Option<&RecoveredFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Distinct formats encountered.
    pub fn distinct_formats(&self) -> Vec<FormatId> {
        let set: BTreeSet<FormatId> = self.formats_used.iter().copied().collect();
        set.into_iter().collect()
    }
}

/// Outcome of one full pass, before hidden-payload decoding.  Children
/// return this so parents can merge the raw accumulator in order.
struct Pass {
    rounds:       u32,
    formats_used: Vec<FormatId>,
    registry:     ContentRegistry,
    raw_hidden:   String,
    interrupted:  bool,
}

// ── Unpacker ─────────────────────────────────────────────────────────────────

pub struct Unpacker {
    interrupt: InterruptFlag,
    opts:      UnpackOptions,
}

impl Unpacker {
    pub fn new(interrupt: InterruptFlag, opts: UnpackOptions) -> Self {
        Self { interrupt, opts }
    }

    /// Unwrap `archive`, delivering recovered files into `dest`.
    pub fn run(&self, archive: &Path, dest: &Path) -> Result<UnpackReport, UnpackError> {
        if !archive.is_file() {
            return Err(UnpackError::InputMissing(archive.to_path_buf()));
        }
        let pass = self.run_pass(archive, dest, self.opts.move_input)?;

        // Fallback heuristic: a run that never decompressed anything and left
        // exactly one terminal file may be a payload whose bytes were
        // reversed before the outermost compression layer.
        if self.opts.try_reverse
            && !pass.interrupted
            && pass.rounds == 0
            && pass.registry.len() == 1
        {
            return Ok(finish(self.retry_reversed(pass, dest)?));
        }
        Ok(finish(pass))
    }

    fn retry_reversed(&self, first: Pass, dest: &Path) -> Result<Pass, UnpackError> {
        // The single delivered file holds the input verbatim.
        let name = first.registry.iter().next().map(|(n, _)| n.clone());
        let Some(name) = name else { return Ok(first) };
        let delivered = dest.join(&name);
        let mut bytes = fs::read(&delivered)?;
        bytes.reverse();

        debug!("retrying with reversed byte order");
        let scratch = TempWorkspace::acquire("reverse")?;
        let reversed = scratch.join(&name);
        fs::write(&reversed, &bytes)?;
        let second = self.run_pass(&reversed, dest, true)?;
        scratch.release()?;

        if second.rounds > 0 {
            let _ = fs::remove_file(&delivered);
            Ok(second)
        } else {
            // Reversal recovered nothing either: drop its junk output and
            // keep the verbatim first-pass result.
            for (junk, _) in second.registry.iter() {
                let _ = fs::remove_file(dest.join(junk));
            }
            Ok(first)
        }
    }

    /// One complete detect→decompress→diff→branch run in a fresh workspace.
    fn run_pass(&self, archive: &Path, dest: &Path, mv: bool) -> Result<Pass, UnpackError> {
        let ws = TempWorkspace::acquire("unpack")?;
        let names = ws.ingest(&[archive.to_path_buf()], mv)?;
        let mut run = Run {
            engine:       self,
            ws,
            dest:         dest.to_path_buf(),
            queue:        VecDeque::from(names),
            registry:     ContentRegistry::new(),
            history:      HistoryWindow::new(self.opts.keep),
            rounds:       0,
            formats_used: Vec::new(),
            raw_hidden:   String::new(),
            interrupted:  false,
        };
        run.drive()?;
        let Run { ws, registry, rounds, formats_used, raw_hidden, interrupted, .. } = run;
        ws.release()?;
        Ok(Pass { rounds, formats_used, registry, raw_hidden, interrupted })
    }

    fn detect_allowed(&self, path: &Path) -> io::Result<(String, Option<FormatId>)> {
        let (desc, fmt) = format::detect(path)?;
        let fmt = fmt.filter(|f| {
            self.opts.formats.as_ref().map_or(true, |allow| allow.contains(f))
        });
        Ok((desc, fmt))
    }
}

/// Decode the marker-name accumulator back into payload bytes.
fn finish(pass: Pass) -> UnpackReport {
    let hidden = if pass.raw_hidden.is_empty() {
        None
    } else {
        match hex::decode(&pass.raw_hidden) {
            Ok(mut bytes) => {
                bytes.reverse();
                Some(bytes)
            }
            Err(_) => {
                warn!("hidden marker accumulator is not valid hex; discarding");
                None
            }
        }
    };
    let files = pass
        .registry
        .iter()
        .map(|(name, entry)| RecoveredFile {
            name:  name.clone(),
            hash:  entry.hash.clone(),
            count: entry.count,
        })
        .collect();
    UnpackReport {
        rounds:       pass.rounds,
        formats_used: pass.formats_used,
        files,
        hidden,
        interrupted:  pass.interrupted,
    }
}

// ── Per-run state machine ────────────────────────────────────────────────────

struct Run<'a> {
    engine:       &'a Unpacker,
    ws:           TempWorkspace,
    dest:         PathBuf,
    queue:        VecDeque<String>,
    registry:     ContentRegistry,
    history:      HistoryWindow,
    rounds:       u32,
    formats_used: Vec<FormatId>,
    raw_hidden:   String,
    interrupted:  bool,
}

impl Run<'_> {
    fn drive(&mut self) -> Result<(), UnpackError> {
        while let Some(current) = self.queue.pop_front() {
            if self.engine.interrupt.is_set() {
                self.preserve(&current, &current);
                self.interrupted = true;
                break;
            }
            let (desc, fmt) = self.engine.detect_allowed(&self.ws.join(&current))?;
            debug!("'{}': {}", current, desc);
            let Some(fmt) = fmt else {
                self.deliver_terminal(&current)?;
                continue;
            };

            // Stage under a fresh random stem plus the canonical extension;
            // most tools refuse to extract without one, and the random stem
            // avoids colliding with an earlier archive that decompressed to
            // this stem.
            let staged = format!("{}.{}", self.random_stem()?, fmt.extension());
            fs::rename(self.ws.join(&current), self.ws.join(&staged))?;
            self.history
                .push(self.ws.path(), current.clone(), staged.clone());

            let before = self.ws.listing()?;
            if let Err(e) = invoke::decompress(self.ws.path(), &staged, fmt) {
                // Best-effort: anything produced is still picked up by the
                // diff below; a fruitless tool ends this branch as terminal.
                warn!("decompressing '{}' ({}): {}", current, fmt.name(), e);
            }
            if self.engine.interrupt.is_set() {
                self.preserve(&current, &staged);
                self.interrupted = true;
                break;
            }

            let produced = self.flatten_dirs(&before)?;
            if produced.is_empty() {
                // Recognised but unextractable: restore the name and treat
                // the content as final.
                if self.ws.join(&staged).exists() {
                    fs::rename(self.ws.join(&staged), self.ws.join(&current))?;
                    self.deliver_terminal(&current)?;
                }
                continue;
            }

            self.rounds += 1;
            self.formats_used.push(fmt);
            if self.process_produced(&current, &staged, fmt, produced)? {
                self.interrupted = true;
                break;
            }
        }
        Ok(())
    }

    /// Route one extraction's products: hidden markers and terminal files
    /// are consumed here; the first archive re-enters the queue ahead of
    /// everything else and any further archives go to child instances.
    /// Returns true when a child was interrupted.
    fn process_produced(
        &mut self,
        current: &str,
        staged: &str,
        fmt: FormatId,
        produced: Vec<String>,
    ) -> Result<bool, UnpackError> {
        let staged_stem = registry::split_ext(staged).0.to_string();
        let single = produced.len() == 1;
        let mut first_archive_taken = false;

        for mut item in produced {
            let (desc, item_fmt) = self.engine.detect_allowed(&self.ws.join(&item))?;
            debug!("=> {} ({})", item, desc);
            match item_fmt {
                None => {
                    // A lone product of a single-stream layer is the same
                    // logical file the previous stage wrapped: when the tool
                    // named it after the staged stem, give it back its
                    // earlier name.  Names restored by the tool itself
                    // (gunzip -N) are kept.
                    if single
                        && fmt.single_stream()
                        && item == staged_stem
                        && !self.ws.join(current).exists()
                    {
                        fs::rename(self.ws.join(&item), self.ws.join(current))?;
                        item = current.to_string();
                    }
                    self.deliver_terminal(&item)?;
                }
                Some(_) => {
                    // An archive that extracted to its own staged stem keeps
                    // its pre-staging name through the chain.
                    if item == staged_stem && !self.ws.join(current).exists() {
                        fs::rename(self.ws.join(&item), self.ws.join(current))?;
                        item = current.to_string();
                    }
                    if !first_archive_taken {
                        first_archive_taken = true;
                        self.queue.push_front(item);
                    } else if self.delegate_child(&item)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Hand a sibling archive to an independently scoped child engine and
    /// merge its results.  Returns true when the child was interrupted.
    fn delegate_child(&mut self, item: &str) -> Result<bool, UnpackError> {
        info!("delegating '{}' to a child instance", item);
        let child = Unpacker::new(
            self.engine.interrupt.clone(),
            UnpackOptions {
                move_input:  true,
                try_reverse: false,
                ..self.engine.opts.clone()
            },
        );
        let pass = child.run_pass(&self.ws.join(item), &self.dest, true)?;
        self.rounds += pass.rounds;
        self.formats_used.extend(pass.formats_used);
        self.raw_hidden.push_str(&pass.raw_hidden);
        self.registry.absorb(pass.registry);
        Ok(pass.interrupted)
    }

    /// Final-content path: hidden markers are accumulated and dropped,
    /// everything else is content-addressed and moved to the destination.
    fn deliver_terminal(&mut self, name: &str) -> Result<(), UnpackError> {
        let path = self.ws.join(name);
        let hash = registry::hash_file(&path)?;
        if hash == registry::empty_hash() {
            debug!("hidden marker: {}", name);
            self.raw_hidden.push_str(name);
            fs::remove_file(path)?;
            return Ok(());
        }
        if self.engine.opts.display {
            self.display(&path)?;
        }
        let final_name = self.registry.register(&self.dest, name, &hash)?;
        move_file(&path, &self.dest.join(&final_name))?;
        info!("file found: {}", final_name);
        Ok(())
    }

    fn display(&self, path: &Path) -> io::Result<()> {
        let bytes = fs::read(path)?;
        if format::is_mostly_printable(&bytes) {
            info!("{}", String::from_utf8_lossy(&bytes).trim_end());
        } else {
            info!("<<< Non-printable content >>>");
        }
        Ok(())
    }

    /// Flatten any produced directory (children moved up, dir removed) and
    /// re-diff, so archives holding a tree still yield a flat product list.
    fn flatten_dirs(&self, before: &BTreeSet<String>) -> io::Result<Vec<String>> {
        loop {
            let produced = self.ws.diff(before)?;
            let dirs: Vec<String> = produced
                .iter()
                .filter(|n| self.ws.join(n).is_dir())
                .cloned()
                .collect();
            if dirs.is_empty() {
                return Ok(produced);
            }
            for dir in dirs {
                let dir_path = self.ws.join(&dir);
                for entry in fs::read_dir(&dir_path)? {
                    let entry = entry?;
                    let child = entry.file_name().to_string_lossy().into_owned();
                    let target = registry::ensure_new(self.ws.path(), &child);
                    fs::rename(entry.path(), self.ws.join(&target))?;
                }
                fs::remove_dir_all(&dir_path)?;
            }
        }
    }

    /// Interrupt path: copy the current staged form out under a
    /// collision-safe variant of its original name, then halt.
    fn preserve(&self, original: &str, staged: &str) {
        let src = self.ws.join(staged);
        if !src.exists() {
            return;
        }
        let target = registry::ensure_new(&self.dest, original);
        match fs::copy(&src, self.dest.join(&target)) {
            Ok(_) => info!("interrupted: preserved '{}' as '{}'", original, target),
            Err(e) => warn!("interrupted: could not preserve '{}': {}", original, e),
        }
    }

    /// A 64-char hex stem not colliding with any existing entry's stem.
    fn random_stem(&self) -> io::Result<String> {
        const HEX: &[u8] = b"0123456789abcdef";
        let stems: BTreeSet<String> = self
            .ws
            .listing()?
            .iter()
            .map(|n| registry::split_ext(n).0.to_string())
            .collect();
        let mut rng = rand::thread_rng();
        loop {
            let name: String = (0..64)
                .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
                .collect();
            if !stems.contains(&name) {
                return Ok(name);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
