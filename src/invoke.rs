//! External codec tool invocation.
//!
//! Every compress/decompress operation shells out to the format's tool
//! inside the calling engine's workspace.  The invoker is stateless and
//! deliberately ignorant of what the tool produced: output naming varies per
//! tool and several delete their input in place, so callers discover side
//! effects with a directory diff instead of trusting any report.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use log::debug;
use thiserror::Error;

use crate::format::FormatId;

// ── Error taxonomy ───────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum InvokeError {
    /// The format name or table entry has no usable command mapping.
    #[error("unknown archive format '{0}'")]
    UnknownFormat(String),

    /// The external tool is not installed.  Callers exclude the format for
    /// the rest of the run.
    #[error("tool '{tool}' is not available")]
    ToolUnavailable { tool: String },

    /// The tool ran and failed.  Callers exclude the format until another
    /// format succeeds, then retry it.
    #[error("tool '{tool}' failed: {detail}")]
    Transient { tool: String, detail: String },

    /// A requested input file does not exist in the working directory.
    #[error("input file '{0}' was not found")]
    MissingInput(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ── Command tables ───────────────────────────────────────────────────────────

/// Extract command for a format.  Overwrite flags are included wherever the
/// tool would otherwise prompt interactively.
fn extract_command(fmt: FormatId) -> &'static [&'static str] {
    match fmt {
        FormatId::SevenZip => &["7za", "e", "-y"],
        FormatId::Arj      => &["arj", "e", "-y"],
        FormatId::Bzip2    => &["bzip2", "-df"],
        FormatId::Tar      => &["tar", "-xf"],
        FormatId::Rar      => &["unrar", "e", "-y"],
        FormatId::Xz       => &["unxz", "-df"],
        FormatId::Lzma     => &["lzma", "-df"],
        FormatId::Gzip     => &["gunzip", "-dfN"],
        FormatId::Zip      => &["unzip", "-o"],
    }
}

/// Create command for a container format: tool + subcommand, invoked as
/// `tool sub <archive> <inputs…>`.  `None` for single-stream compressors,
/// which work in place.
fn create_command(fmt: FormatId) -> Option<&'static [&'static str]> {
    match fmt {
        FormatId::SevenZip => Some(&["7za", "a"]),
        FormatId::Arj      => Some(&["arj", "a"]),
        FormatId::Tar      => Some(&["tar", "-cf"]),
        FormatId::Rar      => Some(&["rar", "a"]),
        FormatId::Zip      => Some(&["zip"]),
        FormatId::Bzip2 | FormatId::Xz | FormatId::Lzma | FormatId::Gzip => None,
    }
}

/// In-place compressor invocation for single-stream formats.
fn stream_command(fmt: FormatId) -> Result<&'static [&'static str], InvokeError> {
    match fmt {
        FormatId::Bzip2 => Ok(&["bzip2", "-zf"]),
        FormatId::Xz    => Ok(&["xz", "-zf"]),
        FormatId::Lzma  => Ok(&["lzma", "-zf"]),
        FormatId::Gzip  => Ok(&["gzip", "-f"]),
        other => Err(InvokeError::UnknownFormat(other.name().to_string())),
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Best-effort extraction of `archive` (a staged name carrying the format's
/// extension) inside `dir`.  Produced files are found by diffing `dir`.
pub fn decompress(dir: &Path, archive: &str, fmt: FormatId) -> Result<(), InvokeError> {
    let cmd = extract_command(fmt);
    let mut args: Vec<&str> = cmd[1..].to_vec();
    args.push(archive);
    run_tool(dir, cmd[0], &args)
}

/// Wrap `inputs` into one archive for `target` (a bare basename).  The
/// materialised file carries the tool-appended extension; the caller strips
/// it back after diff discovery.
pub fn compress(
    dir: &Path,
    target: &str,
    inputs: &[String],
    fmt: FormatId,
) -> Result<(), InvokeError> {
    for input in inputs {
        if !dir.join(input).exists() {
            return Err(InvokeError::MissingInput(input.clone()));
        }
    }
    if fmt.single_stream() {
        let input = match inputs {
            [single] => single,
            _ => {
                return Err(InvokeError::Transient {
                    tool:   fmt.name().to_string(),
                    detail: format!(
                        "single-stream format given {} inputs",
                        inputs.len()
                    ),
                })
            }
        };
        // Compress the input under its own name (gzip records it, which is
        // what lets `gunzip -N` give files their logical names back); the
        // caller renames the produced archive to the chosen basename after
        // diff discovery.
        let cmd = stream_command(fmt)?;
        let mut args: Vec<&str> = cmd[1..].to_vec();
        args.push(input);
        run_tool(dir, cmd[0], &args)
    } else {
        let cmd = create_command(fmt)
            .ok_or_else(|| InvokeError::UnknownFormat(fmt.name().to_string()))?;
        let archive = format!("{}.{}", target, fmt.extension());
        let mut args: Vec<&str> = cmd[1..].to_vec();
        args.push(&archive);
        for input in inputs {
            args.push(input);
        }
        run_tool(dir, cmd[0], &args)
    }
}

fn run_tool(dir: &Path, tool: &str, args: &[&str]) -> Result<(), InvokeError> {
    debug!("exec: {} {}", tool, args.join(" "));
    let output = Command::new(tool)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output();
    match output {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(InvokeError::ToolUnavailable { tool: tool.to_string() })
        }
        Err(e) => Err(InvokeError::Io(e)),
        Ok(out) if !out.status.success() => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let detail = stderr
                .lines()
                .next()
                .map(str::to_string)
                .unwrap_or_else(|| format!("exit status {}", out.status));
            Err(InvokeError::Transient { tool: tool.to_string(), detail })
        }
        Ok(_) => Ok(()),
    }
}

// ── Availability probes ──────────────────────────────────────────────────────

/// Formats whose extract tool is installed.
pub fn usable_unpack_formats() -> Vec<FormatId> {
    FormatId::ALL
        .into_iter()
        .filter(|fmt| which::which(extract_command(*fmt)[0]).is_ok())
        .collect()
}

/// Formats whose create tool is installed.
pub fn usable_pack_formats() -> Vec<FormatId> {
    FormatId::ALL
        .into_iter()
        .filter(|fmt| {
            let tool = match create_command(*fmt) {
                Some(cmd) => cmd[0],
                // single-stream: the compressor binary itself
                None => match stream_command(*fmt) {
                    Ok(cmd) => cmd[0],
                    Err(_) => return false,
                },
            };
            which::which(tool).is_ok()
        })
        .collect()
}

/// Names of referenced tools that are not installed, for startup warnings.
pub fn missing_tools() -> Vec<String> {
    let mut tools: Vec<&str> = Vec::new();
    for fmt in FormatId::ALL {
        tools.push(extract_command(fmt)[0]);
        match create_command(fmt) {
            Some(cmd) => tools.push(cmd[0]),
            None => {
                if let Ok(cmd) = stream_command(fmt) {
                    tools.push(cmd[0]);
                }
            }
        }
    }
    tools.sort_unstable();
    tools.dedup();
    tools
        .into_iter()
        .filter(|tool| which::which(tool).is_err())
        .map(str::to_string)
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────
