//! Content-addressed naming of recovered files.
//!
//! Nested archives routinely yield several files under the same name, and a
//! name is itself evidence worth keeping.  The registry therefore never
//! discards either: identical content legitimately reuses its name (tracked
//! with an occurrence counter, which is how repeated hidden drops show up),
//! while different content under a colliding name is shifted to a
//! deterministic `-N` suffixed sibling.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;

// ── Hashing ──────────────────────────────────────────────────────────────────

/// Hex blake3 digest of a file's content.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Digest of empty content.  A produced zero-length file hashing to this is
/// a hidden-payload marker, not user content.
pub fn empty_hash() -> String {
    hash_bytes(&[])
}

// ── Name manipulation ────────────────────────────────────────────────────────

/// Split `name` into (stem, extension-with-dot).  A leading dot is part of
/// the stem, never an extension.
pub fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

/// Derive the next candidate name by bumping a trailing `-N` numeric suffix
/// on the stem (`flag.txt` → `flag-1.txt` → `flag-2.txt` → …).
fn bump_suffix(name: &str) -> String {
    let (stem, ext) = split_ext(name);
    let (base, n) = match stem.rsplit_once('-') {
        Some((base, tail)) => match tail.parse::<u64>() {
            Ok(n) => (base, n),
            Err(_) => (stem, 0),
        },
        None => (stem, 0),
    };
    format!("{}-{}{}", base, n + 1, ext)
}

/// Return a name, derived from `name`, that does not yet exist in `dir`.
pub fn ensure_new(dir: &Path, name: &str) -> String {
    let mut candidate = name.to_string();
    while dir.join(&candidate).exists() {
        candidate = bump_suffix(&candidate);
    }
    candidate
}

// ── ContentRegistry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub hash:  String,
    pub count: u32,
}

/// Name → content mapping for everything delivered to the caller's
/// directory.  See the module docs for the collision rules.
#[derive(Debug, Default)]
pub struct ContentRegistry {
    entries: BTreeMap<String, ContentEntry>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a final name for content `hash` requested under `name`, to be
    /// delivered into `dest`.  Registers the result before returning it.
    pub fn register(&mut self, dest: &Path, name: &str, hash: &str) -> io::Result<String> {
        let mut candidate = name.to_string();
        loop {
            match self.entries.get_mut(&candidate) {
                Some(entry) if entry.hash == hash => {
                    entry.count += 1;
                    return Ok(candidate);
                }
                Some(_) => {
                    // Different content wants this name: shift to a suffixed
                    // sibling and re-check it against the map.
                    candidate = ensure_new(dest, &bump_suffix(&candidate));
                }
                None => {
                    // A file we never registered may still sit in dest
                    // (caller's own data, or a sibling instance's output).
                    // Identical content may overwrite it; anything else is
                    // shifted aside.
                    let occupied = dest.join(&candidate);
                    if occupied.exists() && hash_file(&occupied)? != hash {
                        candidate = ensure_new(dest, &candidate);
                        continue;
                    }
                    self.entries.insert(
                        candidate.clone(),
                        ContentEntry { hash: hash.to_string(), count: 1 },
                    );
                    return Ok(candidate);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ContentEntry> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContentEntry)> {
        self.entries.iter()
    }

    /// Fold another registry in (used when merging child engine reports).
    pub fn absorb(&mut self, other: ContentRegistry) {
        for (name, entry) in other.entries {
            self.entries.entry(name).or_insert(entry);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
