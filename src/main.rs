use clap::{Parser, Subcommand};
use nestpack::format::FormatId;
use nestpack::interrupt::InterruptFlag;
use nestpack::invoke;
use nestpack::obfuscate::{ObfuscateOptions, Obfuscator};
use nestpack::unpack::{UnpackOptions, Unpacker};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nestpack", about = "Recursive nested-archive wrapping and unwrapping")]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recursively wrap files into one obfuscated nested archive
    Pack {
        /// Files to be archived
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Number of wrap rounds
        #[arg(short, long, default_value = "1000")]
        rounds: u32,
        /// Charset for generated archive names
        #[arg(long)]
        charset: Option<String>,
        /// Length of generated archive names
        #[arg(short = 'n', long, default_value = "8")]
        name_length: usize,
        /// Hidden data to embed across the nested archives
        #[arg(short, long)]
        data: Option<String>,
        /// Number of chunks the hidden data is split into
        #[arg(long, default_value = "10")]
        chunks: usize,
        /// Reverse the final archive's byte order
        #[arg(long)]
        reverse: bool,
        /// Unpack the result and verify integrity before delivering it
        #[arg(long)]
        check: bool,
        /// Move inputs instead of copying them
        #[arg(long = "move")]
        move_inputs: bool,
        /// Comma-separated format allow-list (e.g. gz,tar,zip)
        #[arg(short, long, value_delimiter = ',')]
        formats: Option<Vec<String>>,
    },
    /// Recursively unwrap a nested archive
    Unpack {
        /// Archive to unwrap
        input: PathBuf,
        /// Number of recent stage artifacts kept on disk
        #[arg(short, long, default_value = "2")]
        keep: usize,
        /// Print recovered content when it is printable text
        #[arg(short, long)]
        display: bool,
        /// Move the archive instead of copying it
        #[arg(long = "move")]
        move_input: bool,
        /// Retry with reversed byte order when nothing unwraps
        #[arg(long)]
        reverse: bool,
        /// Comma-separated format allow-list (e.g. gz,tar,zip)
        #[arg(short, long, value_delimiter = ',')]
        formats: Option<Vec<String>>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let interrupt = InterruptFlag::new();
    {
        let flag = interrupt.clone();
        ctrlc::set_handler(move || flag.set())?;
    }
    for tool in invoke::missing_tools() {
        log::warn!("'{tool}' is not installed; the related formats are limited");
    }

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack {
            input, rounds, charset, name_length, data, chunks,
            reverse, check, move_inputs, formats,
        } => {
            let formats = parse_formats(formats)?;
            let usable = invoke::usable_pack_formats();
            if !usable.iter().any(|f| formats.as_ref().map_or(true, |a| a.contains(f))) {
                return Err("no usable compression tool detected".into());
            }
            let mut opts = ObfuscateOptions {
                rounds,
                name_len: name_length,
                payload: data.map(String::into_bytes),
                chunks,
                reverse,
                verify: check,
                move_inputs,
                formats,
                ..ObfuscateOptions::default()
            };
            if let Some(charset) = charset {
                opts.charset = charset;
            }

            let dest = std::env::current_dir()?;
            let report = Obfuscator::new(interrupt, opts).run(&input, &dest)?;
            println!("Rounds : {}", report.rounds);
            println!("Algos  : {}", report.distinct_formats().len());
            println!("Archive: {}", report.archive.display());
            if report.interrupted {
                println!("(interrupted)");
            }
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, keep, display, move_input, reverse, formats } => {
            let formats = parse_formats(formats)?;
            if invoke::usable_unpack_formats().is_empty() {
                return Err("no usable decompression tool detected".into());
            }
            let opts = UnpackOptions {
                keep,
                display,
                move_input,
                try_reverse: reverse,
                formats,
            };

            let dest = std::env::current_dir()?;
            let report = Unpacker::new(interrupt, opts).run(&input, &dest)?;
            println!("Rounds: {}", report.rounds);
            println!("Algos : {}", report.distinct_formats().len());
            println!("File{}", if report.files.len() > 1 { "s:" } else { " :" });
            for file in &report.files {
                let dup = if file.count > 1 { format!(" x{}", file.count) } else { String::new() };
                println!("- {} ({}){}", file.name, file.hash, dup);
            }
            if let Some(hidden) = &report.hidden {
                println!("Data  : {}", String::from_utf8_lossy(hidden));
            }
            if report.interrupted {
                println!("(interrupted)");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .format_timestamp(None)
        .init();
}

fn parse_formats(names: Option<Vec<String>>) -> Result<Option<Vec<FormatId>>, String> {
    let Some(names) = names else { return Ok(None) };
    let mut formats = Vec::with_capacity(names.len());
    for name in names {
        match FormatId::from_name(&name) {
            Some(fmt) => formats.push(fmt),
            None => return Err(format!("unknown archive format '{name}'")),
        }
    }
    Ok(Some(formats))
}
