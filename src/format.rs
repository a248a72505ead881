//! Format detection: frozen table of supported archive formats + content
//! sniffing.
//!
//! Detection is **content-based only**.  Extensions are cosmetic in this
//! system (nested archives are deliberately stored without one), so the only
//! trustworthy signal is the magic bytes at the head of the file.  A file
//! that matches no table entry is *terminal content* — that is how both
//! engines' loops end naturally.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Bytes of header examined by [`detect`].  Large enough for the tar
/// signature at offset 257.
const HEADER_LEN: usize = 512;

/// Printable-byte ratio above which content is classified as text.
const PRINTABLE_THRESHOLD: f64 = 0.9;

// ── FormatId ─────────────────────────────────────────────────────────────────

/// One entry of the curated format table.
///
/// Every variant carries a frozen short name, a canonical extension and the
/// external commands that wrap/unwrap it.  The table is finite by design;
/// supporting a format means adding a variant here, nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FormatId {
    SevenZip,
    Arj,
    Bzip2,
    Tar,
    Rar,
    Xz,
    Lzma,
    Gzip,
    Zip,
}

impl FormatId {
    pub const ALL: [FormatId; 9] = [
        FormatId::SevenZip,
        FormatId::Arj,
        FormatId::Bzip2,
        FormatId::Tar,
        FormatId::Rar,
        FormatId::Xz,
        FormatId::Lzma,
        FormatId::Gzip,
        FormatId::Zip,
    ];

    /// Short name, also accepted by [`FormatId::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            FormatId::SevenZip => "7z",
            FormatId::Arj      => "arj",
            FormatId::Bzip2    => "bz2",
            FormatId::Tar      => "tar",
            FormatId::Rar      => "rar",
            FormatId::Xz       => "xz",
            FormatId::Lzma     => "lzma",
            FormatId::Gzip     => "gz",
            FormatId::Zip      => "zip",
        }
    }

    /// Canonical extension appended while an archive is staged for an
    /// external tool (most tools insist on one).
    pub fn extension(self) -> &'static str {
        self.name()
    }

    /// Human-readable type description, phrased like `file(1)` output.
    pub fn description(self) -> &'static str {
        match self {
            FormatId::SevenZip => "7-zip archive data",
            FormatId::Arj      => "ARJ archive data",
            FormatId::Bzip2    => "bzip2 compressed data",
            FormatId::Tar      => "POSIX tar archive",
            FormatId::Rar      => "RAR archive data",
            FormatId::Xz       => "XZ compressed data",
            FormatId::Lzma     => "LZMA compressed data",
            FormatId::Gzip     => "gzip compressed data",
            FormatId::Zip      => "Zip archive data",
        }
    }

    /// Parse a user-supplied format name.  Long aliases are accepted so
    /// filters read naturally on the command line.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "7z" | "7-zip" | "7zip"  => Some(FormatId::SevenZip),
            "arj"                    => Some(FormatId::Arj),
            "bz2" | "bzip2"          => Some(FormatId::Bzip2),
            "tar"                    => Some(FormatId::Tar),
            "rar"                    => Some(FormatId::Rar),
            "xz"                     => Some(FormatId::Xz),
            "lzma"                   => Some(FormatId::Lzma),
            "gz" | "gzip"            => Some(FormatId::Gzip),
            "zip"                    => Some(FormatId::Zip),
            _                        => None,
        }
    }

    /// True for raw compressors that wrap exactly one input stream.
    ///
    /// These can never be chosen when the working set holds more than one
    /// file, and they trigger the unpacker's logical-filename preservation
    /// rule on the way back out.
    pub fn single_stream(self) -> bool {
        matches!(
            self,
            FormatId::Bzip2 | FormatId::Xz | FormatId::Lzma | FormatId::Gzip
        )
    }
}

// ── Detection ────────────────────────────────────────────────────────────────

/// Classify a file's content.
///
/// Returns the raw type description together with the matched format, or
/// `None` when the content is not a recognised archive (terminal content).
pub fn detect(path: &Path) -> io::Result<(String, Option<FormatId>)> {
    let mut buf = [0u8; HEADER_LEN];
    let mut file = File::open(path)?;
    let mut len = 0;
    while len < HEADER_LEN {
        let n = file.read(&mut buf[len..])?;
        if n == 0 {
            break;
        }
        len += n;
    }
    let head = &buf[..len];
    if head.is_empty() {
        return Ok(("empty".to_string(), None));
    }
    if let Some(fmt) = match_magic(head) {
        return Ok((fmt.description().to_string(), Some(fmt)));
    }
    let desc = if is_mostly_printable(head) { "ASCII text" } else { "data" };
    Ok((desc.to_string(), None))
}

fn match_magic(head: &[u8]) -> Option<FormatId> {
    if head.starts_with(b"7z\xbc\xaf\x27\x1c") {
        return Some(FormatId::SevenZip);
    }
    if head.starts_with(b"Rar!\x1a\x07") {
        return Some(FormatId::Rar);
    }
    if head.starts_with(b"\xfd7zXZ\x00") {
        return Some(FormatId::Xz);
    }
    if head.starts_with(b"BZh") {
        return Some(FormatId::Bzip2);
    }
    if head.starts_with(b"\x1f\x8b") {
        return Some(FormatId::Gzip);
    }
    if head.starts_with(b"PK\x03\x04") {
        return Some(FormatId::Zip);
    }
    if head.starts_with(b"\x60\xea") {
        return Some(FormatId::Arj);
    }
    // lzma_alone: properties byte 0x5d followed by a little-endian dictionary
    // size whose low bytes are zero for every size lzma(1) emits.
    if head.len() >= 3 && head[0] == 0x5d && head[1] == 0x00 && head[2] == 0x00 {
        return Some(FormatId::Lzma);
    }
    if head.len() >= 262 && &head[257..262] == b"ustar" {
        return Some(FormatId::Tar);
    }
    None
}

/// Display-purposes classification of terminal content: text vs binary.
pub fn is_mostly_printable(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    let printable = bytes
        .iter()
        .filter(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
        .count();
    printable as f64 / bytes.len() as f64 >= PRINTABLE_THRESHOLD
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn detect_bytes(bytes: &[u8]) -> (String, Option<FormatId>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample");
        File::create(&path).unwrap().write_all(bytes).unwrap();
        detect(&path).unwrap()
    }

    #[test]
    fn gzip_magic_is_recognised() {
        let (desc, fmt) = detect_bytes(&[0x1f, 0x8b, 0x08, 0x00, 0x00]);
        assert_eq!(fmt, Some(FormatId::Gzip));
        assert_eq!(desc, "gzip compressed data");
    }

    #[test]
    fn tar_magic_at_offset_257() {
        let mut data = vec![0u8; 512];
        data[257..262].copy_from_slice(b"ustar");
        assert_eq!(detect_bytes(&data).1, Some(FormatId::Tar));
    }

    #[test]
    fn unknown_content_is_terminal() {
        let (desc, fmt) = detect_bytes(b"just some plain text\n");
        assert_eq!(fmt, None);
        assert_eq!(desc, "ASCII text");

        let (desc, fmt) = detect_bytes(&[0x00, 0x01, 0x02, 0xff, 0xfe, 0xfd]);
        assert_eq!(fmt, None);
        assert_eq!(desc, "data");
    }

    #[test]
    fn empty_file_is_terminal() {
        let (desc, fmt) = detect_bytes(b"");
        assert_eq!(fmt, None);
        assert_eq!(desc, "empty");
    }

    #[test]
    fn reversed_magic_is_not_recognised() {
        // A gzip header with its bytes reversed must fall through to
        // terminal content — the reversal fallback depends on this.
        let mut header = vec![0x1f, 0x8b, 0x08, 0x00, 0x42, 0x42];
        header.reverse();
        assert_eq!(detect_bytes(&header).1, None);
    }

    #[test]
    fn names_round_trip() {
        for fmt in FormatId::ALL {
            assert_eq!(FormatId::from_name(fmt.name()), Some(fmt));
        }
        assert_eq!(FormatId::from_name("gzip"), Some(FormatId::Gzip));
        assert_eq!(FormatId::from_name("7-zip"), Some(FormatId::SevenZip));
        assert_eq!(FormatId::from_name("cab"), None);
    }

    #[test]
    fn single_stream_formats() {
        assert!(FormatId::Gzip.single_stream());
        assert!(FormatId::Xz.single_stream());
        assert!(!FormatId::Tar.single_stream());
        assert!(!FormatId::Zip.single_stream());
    }
}
