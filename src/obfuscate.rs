//! Recursive wrapping engine, the mirror of [`crate::unpack`].
//!
//! Each round wraps the working file set with a uniformly chosen format and
//! strips the tool-appended extension, so the resulting chain carries no
//! naming hints.  Formats whose tool is missing are excluded for the rest of
//! the run; formats that merely failed are excluded until another format
//! succeeds.  A hidden payload is smuggled in as zero-length marker files,
//! one chunk per embedding interval, named by the chunk's hex encoding.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::format::FormatId;
use crate::interrupt::InterruptFlag;
use crate::invoke::{self, InvokeError};
use crate::registry;
use crate::unpack::{Unpacker, UnpackError, UnpackOptions};
use crate::workspace::{move_file, TempWorkspace};

const DEFAULT_CHARSET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

// ── Errors & options ─────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ObfuscateError {
    #[error("no existing file to be archived")]
    NoInputs,

    #[error(
        "no valid compression format remains \
         (permanently excluded: {permanent:?}; transiently excluded: {transient:?})"
    )]
    NoUsableFormat {
        permanent: Vec<String>,
        transient: Vec<String>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Failure of the integrity-check unpacker itself (not a mismatch).
    #[error(transparent)]
    Verify(#[from] UnpackError),
}

#[derive(Debug, Clone)]
pub struct ObfuscateOptions {
    /// Number of wrap rounds (clamped to ≥ 1).
    pub rounds:      u32,
    /// Charset for generated archive basenames.
    pub charset:     String,
    /// Length of generated archive basenames.
    pub name_len:    usize,
    /// Hidden payload to fragment across the chain.
    pub payload:     Option<Vec<u8>>,
    /// Number of pieces the payload is split into.
    pub chunks:      usize,
    /// Reverse the final artifact's byte order.
    pub reverse:     bool,
    /// Round-trip the artifact through an unpacker before delivering it.
    pub verify:      bool,
    /// Move inputs into the workspace instead of copying them.
    pub move_inputs: bool,
    /// Restrict format choice; `None` means the full table.
    pub formats:     Option<Vec<FormatId>>,
}

impl Default for ObfuscateOptions {
    fn default() -> Self {
        Self {
            rounds:      1000,
            charset:     DEFAULT_CHARSET.to_string(),
            name_len:    8,
            payload:     None,
            chunks:      10,
            reverse:     false,
            verify:      false,
            move_inputs: false,
            formats:     None,
        }
    }
}

#[derive(Debug)]
pub struct ObfuscateReport {
    pub rounds:       u32,
    pub formats_used: Vec<FormatId>,
    pub archive:      PathBuf,
    pub interrupted:  bool,
}

impl ObfuscateReport {
    pub fn distinct_formats(&self) -> Vec<FormatId> {
        let set: BTreeSet<FormatId> = self.formats_used.iter().copied().collect();
        set.into_iter().collect()
    }
}

/// Per-run exclusion sets and trace.
#[derive(Debug, Default)]
struct RoundState {
    used:      Vec<FormatId>,
    permanent: BTreeSet<FormatId>,
    transient: BTreeSet<FormatId>,
    last:      Option<FormatId>,
}

// ── Obfuscator ───────────────────────────────────────────────────────────────

pub struct Obfuscator {
    interrupt: InterruptFlag,
    opts:      ObfuscateOptions,
}

impl Obfuscator {
    pub fn new(interrupt: InterruptFlag, opts: ObfuscateOptions) -> Self {
        Self { interrupt, opts }
    }

    /// Wrap `inputs`, delivering one archive into `dest`.
    pub fn run(&self, inputs: &[PathBuf], dest: &Path) -> Result<ObfuscateReport, ObfuscateError> {
        let mut existing = Vec::new();
        for input in inputs {
            if input.is_file() {
                existing.push(input.clone());
            } else {
                warn!("skipping missing input '{}'", input.display());
            }
        }
        if existing.is_empty() {
            return Err(ObfuscateError::NoInputs);
        }

        let mut attempt = 0u32;
        let report = loop {
            attempt += 1;
            match self.attempt(&existing, dest)? {
                Some(report) => break report,
                None => warn!("integrity check failed; restarting (attempt {attempt})"),
            }
        };
        // With verification on, inputs are only consumed once an attempt has
        // actually passed.
        if self.opts.move_inputs && self.opts.verify && !report.interrupted {
            for input in &existing {
                let _ = fs::remove_file(input);
            }
        }
        Ok(report)
    }

    /// One complete obfuscation run.  `Ok(None)` means the integrity check
    /// rejected the artifact and the caller should start over.
    fn attempt(
        &self,
        inputs: &[PathBuf],
        dest: &Path,
    ) -> Result<Option<ObfuscateReport>, ObfuscateError> {
        let rounds = self.opts.rounds.max(1);
        let ws = TempWorkspace::acquire("pack")?;
        let mv = self.opts.move_inputs && !self.opts.verify;
        let mut files = ws.ingest(inputs, mv)?;
        files.sort();

        let mut originals = Vec::with_capacity(files.len());
        for name in &files {
            originals.push((name.clone(), registry::hash_file(&ws.join(name))?));
        }

        let (mut chunks, step) = self.split_payload(rounds);
        let mut state = RoundState::default();
        let mut round = 0u32;
        let mut interrupted = false;

        for i in 0..rounds {
            if self.interrupt.is_set() {
                info!("interrupted after {round} round(s)");
                interrupted = true;
                break;
            }
            if !chunks.is_empty() && (i > 0 || rounds == 1) && i % step == 0 {
                if let Some(chunk) = chunks.pop() {
                    let marker = hex::encode(&chunk);
                    fs::write(ws.join(&marker), b"")?;
                    debug!("embedding payload chunk as '{marker}'");
                    files.push(marker);
                }
            }
            round = i + 1;
            debug!("round {}: compressing {:?}", round, files);
            if let Err(e) = self.compress_round(&ws, round, &mut files, &mut state) {
                if mv {
                    self.salvage(&ws, &files, inputs, &state, dest);
                }
                return Err(e);
            }
        }

        let result_name = match files.first() {
            Some(name) => name.clone(),
            None => {
                ws.release()?;
                return Err(ObfuscateError::NoInputs);
            }
        };
        if interrupted && mv && files.len() > 1 {
            // a pre-round interrupt leaves moved-in siblings behind the
            // partial artifact
            self.salvage(&ws, &files[1..], inputs, &state, dest);
        }

        if self.opts.verify && !interrupted {
            if !self.verify(&ws, &result_name, round, &originals)? {
                ws.release()?;
                return Ok(None);
            }
        }
        if self.opts.reverse {
            let mut bytes = fs::read(ws.join(&result_name))?;
            bytes.reverse();
            fs::write(ws.join(&result_name), &bytes)?;
        }

        let final_name = registry::ensure_new(dest, &result_name);
        move_file(&ws.join(&result_name), &dest.join(&final_name))?;
        ws.release()?;
        Ok(Some(ObfuscateReport {
            rounds:       round,
            formats_used: state.used,
            archive:      dest.join(final_name),
            interrupted,
        }))
    }

    /// Moved-in inputs must not die with the workspace on a fatal error.
    /// Untouched originals go back to their source paths; an already
    /// part-wrapped working set lands in `dest` instead.
    fn salvage(
        &self,
        ws: &TempWorkspace,
        files: &[String],
        inputs: &[PathBuf],
        state: &RoundState,
        dest: &Path,
    ) {
        for name in files {
            let back = inputs
                .iter()
                .find(|p| p.file_name().map_or(false, |n| n.to_string_lossy() == *name));
            let target = match back {
                Some(src) if state.used.is_empty() => src.clone(),
                _ => dest.join(registry::ensure_new(dest, name)),
            };
            match move_file(&ws.join(name), &target) {
                Ok(()) => warn!("salvaged '{}' to '{}'", name, target.display()),
                Err(e) => warn!("could not salvage '{}': {}", name, e),
            }
        }
    }

    /// One wrap round, retried with shrinking format candidates until a tool
    /// succeeds or no usable format remains.
    fn compress_round(
        &self,
        ws: &TempWorkspace,
        round: u32,
        files: &mut Vec<String>,
        state: &mut RoundState,
    ) -> Result<(), ObfuscateError> {
        loop {
            let fmt = self.choose_format(files.len() > 1, state)?;
            let target = if round == 1 && files.len() == 1 {
                files[0].clone()
            } else {
                self.random_name(ws)?
            };
            debug!("trying {} as '{}'", fmt.name(), target);

            let before = ws.listing()?;
            match invoke::compress(ws.path(), &target, files, fmt) {
                Ok(()) => {
                    let produced: Vec<String> = ws
                        .diff(&before)?
                        .into_iter()
                        .filter(|n| ws.join(n).is_file())
                        .collect();
                    let archive = match produced.as_slice() {
                        [one] => one.clone(),
                        other => {
                            warn!(
                                "{} produced {} new file(s); excluding it for now",
                                fmt.name(),
                                other.len()
                            );
                            state.transient.insert(fmt);
                            continue;
                        }
                    };
                    // strip the tool-appended extension back to the basename
                    if archive != target {
                        fs::rename(ws.join(&archive), ws.join(&target))?;
                    }
                    // consumed inputs go away; the very first round keeps
                    // them so the ingested originals survive to teardown
                    if round > 1 {
                        for f in files.iter().filter(|f| f.as_str() != target) {
                            let _ = fs::remove_file(ws.join(f));
                        }
                    }
                    files.clear();
                    files.push(target);
                    state.transient.clear();
                    state.used.push(fmt);
                    state.last = Some(fmt);
                    return Ok(());
                }
                Err(InvokeError::UnknownFormat(_))
                | Err(InvokeError::ToolUnavailable { .. }) => {
                    debug!("{}: unusable, permanently excluded", fmt.name());
                    state.permanent.insert(fmt);
                }
                Err(InvokeError::Transient { tool, detail }) => {
                    debug!("{} failed ({}: {}); excluded until a success", fmt.name(), tool, detail);
                    state.transient.insert(fmt);
                }
                Err(InvokeError::MissingInput(name)) => {
                    warn!("dropping missing input '{name}'");
                    files.retain(|f| *f != name);
                    if files.is_empty() {
                        return Err(ObfuscateError::NoInputs);
                    }
                }
                Err(InvokeError::Io(e)) => return Err(e.into()),
            }
        }
    }

    /// Uniform choice among the formats still valid for this attempt.
    fn choose_format(
        &self,
        multi: bool,
        state: &RoundState,
    ) -> Result<FormatId, ObfuscateError> {
        let table: Vec<FormatId> = match &self.opts.formats {
            Some(allow) => allow.clone(),
            None => FormatId::ALL.to_vec(),
        };
        let mut candidates: Vec<FormatId> = table
            .into_iter()
            .filter(|f| !state.permanent.contains(f) && !state.transient.contains(f))
            .filter(|f| !(multi && f.single_stream()))
            .collect();
        // avoid wrapping twice in a row with the same format when possible
        if candidates.len() > 1 {
            if let Some(last) = state.last {
                candidates.retain(|f| *f != last);
            }
        }
        let mut rng = rand::thread_rng();
        match candidates.choose(&mut rng) {
            Some(fmt) => Ok(*fmt),
            None => Err(ObfuscateError::NoUsableFormat {
                permanent: state.permanent.iter().map(|f| f.name().to_string()).collect(),
                transient: state.transient.iter().map(|f| f.name().to_string()).collect(),
            }),
        }
    }

    /// Non-colliding random basename from the configured charset.
    fn random_name(&self, ws: &TempWorkspace) -> io::Result<String> {
        let charset: Vec<char> = if self.opts.charset.is_empty() {
            DEFAULT_CHARSET.chars().collect()
        } else {
            self.opts.charset.chars().collect()
        };
        let len = self.opts.name_len.max(1);
        let listing = ws.listing()?;
        let mut rng = rand::thread_rng();
        loop {
            let name: String = (0..len)
                .map(|_| charset[rng.gen_range(0..charset.len())])
                .collect();
            if !listing.contains(&name) {
                return Ok(name);
            }
        }
    }

    /// Reverse the payload, split it into at most `chunks` pieces (consumed
    /// back-to-front), and compute the embedding interval.  The interval
    /// divides `rounds - 1` so every piece lands before the final round; a
    /// one-round run gets its single piece before that round instead.
    fn split_payload(&self, rounds: u32) -> (Vec<Vec<u8>>, u32) {
        match &self.opts.payload {
            Some(data) if !data.is_empty() && rounds >= 1 => {
                let slots = rounds.saturating_sub(1).max(1);
                let count = self
                    .opts
                    .chunks
                    .max(1)
                    .min(data.len())
                    .min(slots as usize);
                let mut reversed = data.clone();
                reversed.reverse();
                let size = (reversed.len() + count - 1) / count;
                let chunks: Vec<Vec<u8>> =
                    reversed.chunks(size).map(<[u8]>::to_vec).collect();
                let step = (slots / chunks.len() as u32).max(1);
                (chunks, step)
            }
            _ => (Vec::new(), u32::MAX),
        }
    }

    /// Unpack the artifact into a scratch area and compare round count and
    /// per-original content hashes.
    fn verify(
        &self,
        ws: &TempWorkspace,
        archive: &str,
        rounds: u32,
        originals: &[(String, String)],
    ) -> Result<bool, ObfuscateError> {
        let check_dir = ws.join("verify");
        fs::create_dir(&check_dir)?;
        let unpacker = Unpacker::new(
            self.interrupt.clone(),
            UnpackOptions::default(),
        );
        let report = unpacker.run(&ws.join(archive), &check_dir)?;
        if report.interrupted {
            // graceful stop wins over an endless retry loop
            return Ok(true);
        }
        if report.rounds != rounds {
            debug!(
                "integrity check failed: {} round(s) back, {} expected",
                report.rounds, rounds
            );
            return Ok(false);
        }
        for (name, hash) in originals {
            match report.file(name) {
                Some(f) if f.hash == *hash => {}
                // Chains of name-blind compressors cannot carry the original
                // name back; the content still has to be there.
                None if report.files.iter().any(|f| f.hash == *hash) => {}
                _ => {
                    debug!("integrity check failed: bad file '{name}'");
                    return Ok(false);
                }
            }
        }
        debug!("integrity check passed");
        Ok(true)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn obfuscator(opts: ObfuscateOptions) -> Obfuscator {
        Obfuscator::new(InterruptFlag::new(), opts)
    }

    #[test]
    fn no_existing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = obfuscator(ObfuscateOptions::default())
            .run(&[dir.path().join("ghost")], dir.path())
            .unwrap_err();
        assert!(matches!(err, ObfuscateError::NoInputs));
    }

    #[test]
    fn empty_candidate_set_reports_both_exclusion_sets() {
        let ob = obfuscator(ObfuscateOptions {
            formats: Some(vec![FormatId::Gzip, FormatId::Tar]),
            ..ObfuscateOptions::default()
        });
        let mut state = RoundState::default();
        state.permanent.insert(FormatId::Gzip);
        state.transient.insert(FormatId::Tar);
        let err = ob.choose_format(false, &state).unwrap_err();
        match err {
            ObfuscateError::NoUsableFormat { permanent, transient } => {
                assert_eq!(permanent, vec!["gz".to_string()]);
                assert_eq!(transient, vec!["tar".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn last_format_is_avoided_when_alternatives_remain() {
        let ob = obfuscator(ObfuscateOptions {
            formats: Some(vec![FormatId::Gzip, FormatId::Tar]),
            ..ObfuscateOptions::default()
        });
        let mut state = RoundState::default();
        state.last = Some(FormatId::Gzip);
        for _ in 0..16 {
            assert_eq!(ob.choose_format(false, &state).unwrap(), FormatId::Tar);
        }
        // with a single candidate the last format is allowed again
        state.permanent.insert(FormatId::Tar);
        assert_eq!(ob.choose_format(false, &state).unwrap(), FormatId::Gzip);
    }

    #[test]
    fn multi_file_sets_exclude_single_stream_formats() {
        let ob = obfuscator(ObfuscateOptions {
            formats: Some(vec![FormatId::Gzip, FormatId::Xz, FormatId::Tar]),
            ..ObfuscateOptions::default()
        });
        let state = RoundState::default();
        for _ in 0..16 {
            assert_eq!(ob.choose_format(true, &state).unwrap(), FormatId::Tar);
        }
    }

    #[test]
    fn payload_split_covers_every_byte_and_fits_the_rounds() {
        let payload = b"attack at dawn".to_vec();
        let ob = obfuscator(ObfuscateOptions {
            payload: Some(payload.clone()),
            chunks: 4,
            ..ObfuscateOptions::default()
        });
        let (chunks, step) = ob.split_payload(9);
        assert_eq!(chunks.len(), 4);
        assert!(step >= 1);
        // every chunk is embeddable at i = k*step with i <= rounds-1
        assert!(chunks.len() as u32 * step <= 8);
        // concatenated chunks reassemble the reversed payload
        let mut joined: Vec<u8> = chunks.concat();
        joined.reverse();
        assert_eq!(joined, payload);
    }

    #[test]
    fn payload_chunks_never_exceed_rounds_minus_one() {
        let ob = obfuscator(ObfuscateOptions {
            payload: Some(vec![0u8; 100]),
            chunks: 50,
            ..ObfuscateOptions::default()
        });
        let (chunks, _) = ob.split_payload(5);
        assert!(chunks.len() <= 4);
    }

    #[test]
    fn single_round_still_carries_the_whole_payload() {
        let ob = obfuscator(ObfuscateOptions {
            payload: Some(b"P".to_vec()),
            chunks: 1,
            ..ObfuscateOptions::default()
        });
        let (chunks, step) = ob.split_payload(1);
        assert_eq!(chunks, vec![b"P".to_vec()]);
        assert_eq!(step, 1);
    }

    #[test]
    fn no_payload_means_no_chunks() {
        let ob = obfuscator(ObfuscateOptions::default());
        let (chunks, _) = ob.split_payload(100);
        assert!(chunks.is_empty());
    }
}
