use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use xbstream::codec::CodecId;
use xbstream::datasink::{self, fifo, Datasink, DatasinkKind, DatasinkOptions, FileStat, SinkError};
use xbstream::extract::{ExtractOptions, Extractor};
use xbstream::stream::safer_name_suffix;

#[derive(Parser)]
#[command(name = "xbstream", about = "Create and extract xbstream backup streams")]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct FifoArgs {
    /// Directory holding the thread_N FIFOs; stdin/stdout when absent
    #[arg(long)]
    fifo_dir: Option<PathBuf>,
    /// Number of FIFO streams
    #[arg(long, default_value = "1")]
    fifo_streams: usize,
    /// Seconds to wait for the other end of each FIFO
    #[arg(long, default_value = "60")]
    fifo_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream files into xbstream format
    Create {
        /// Directory the input paths are relative to
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,
        #[command(flatten)]
        fifo: FifoArgs,
        /// Compress every file: zstd or lz4
        #[arg(long)]
        compress: Option<String>,
        #[arg(long, default_value = "1")]
        compress_threads: usize,
        #[arg(long, default_value = "3")]
        compress_level: i32,
        /// Encrypt with AES-256-GCM (Argon2id key derivation)
        #[arg(long)]
        encrypt_key: Option<String>,
        /// Number of files streamed concurrently
        #[arg(short, long, default_value = "1")]
        parallel: usize,
        /// Keep leading '/' and '..' components in stored names
        #[arg(long)]
        absolute_names: bool,
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Extract files from an xbstream stream
    Extract {
        /// Directory to extract into
        #[arg(short = 'C', long, default_value = ".")]
        directory: PathBuf,
        #[command(flatten)]
        fifo: FifoArgs,
        /// Worker threads per input stream
        #[arg(short, long, default_value = "1")]
        parallel: usize,
        /// Decompress .zst and .lz4 files
        #[arg(long)]
        decompress: bool,
        /// Decrypt .xbcrypt files
        #[arg(long)]
        decrypt_key: Option<String>,
        /// Allow leading '/' and '..' components in stored names
        #[arg(long)]
        absolute_names: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create {
            directory, fifo: pipes, compress, compress_threads, compress_level,
            encrypt_key, parallel, absolute_names, files,
        } => {
            let mut opts = DatasinkOptions {
                fifo_streams: pipes.fifo_streams.max(1),
                fifo_timeout: Duration::from_secs(pipes.fifo_timeout),
                compress_threads,
                compress_level,
                encrypt_key,
                ..Default::default()
            };
            if let Some(name) = &compress {
                opts.compress = parse_codec(name)?;
            }

            // Built from the terminal outward; deinit runs head first.
            let mut stages: Vec<Arc<dyn Datasink>> = Vec::new();
            let terminal = match &pipes.fifo_dir {
                Some(dir) => datasink::create(DatasinkKind::Fifo, dir, &opts)?,
                None => {
                    opts.fifo_streams = 1;
                    datasink::create(DatasinkKind::Stdout, &directory, &opts)?
                }
            };
            stages.push(Arc::clone(&terminal));
            let mut head = datasink::create_piped(DatasinkKind::Xbstream, &directory, &opts, terminal)?;
            stages.push(Arc::clone(&head));
            if opts.encrypt_key.is_some() {
                head = datasink::create_piped(DatasinkKind::Encrypt, &directory, &opts, head)?;
                stages.push(Arc::clone(&head));
            }
            if compress.is_some() {
                head = datasink::create_piped(DatasinkKind::Compress, &directory, &opts, head)?;
                stages.push(Arc::clone(&head));
            }

            let mut sources = Vec::new();
            for file in &files {
                collect_files(&directory, file, &mut sources)?;
            }
            stream_files(&head, &directory, &sources, parallel.max(1), absolute_names, opts.buffer_size)?;

            for stage in stages.iter().rev() {
                stage.deinit()?;
            }
            info!(files = sources.len(), "stream created");
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { directory, fifo: pipes, parallel, decompress, decrypt_key, absolute_names } => {
            let opts = ExtractOptions {
                threads: parallel.max(1),
                decompress,
                decrypt_key,
                absolute_names,
                verbose: cli.verbose,
            };
            let extractor = Extractor::new(&directory, opts)?;
            let summary = match &pipes.fifo_dir {
                Some(dir) => {
                    let timeout = Duration::from_secs(pipes.fifo_timeout);
                    let paths: Vec<PathBuf> = (0..pipes.fifo_streams.max(1)).map(|i| fifo::fifo_path(dir, i)).collect();
                    let mut inputs = Vec::with_capacity(paths.len());
                    for path in &paths {
                        inputs.push(fifo::open_for_read_with_timeout(path, timeout)?);
                    }
                    let res = extractor.extract_all(inputs);
                    for path in &paths {
                        let _ = fs::remove_file(path);
                    }
                    res?
                }
                None => extractor.extract(std::io::stdin())?,
            };
            info!(files = summary.files, bytes = summary.bytes, "extraction complete");
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn parse_codec(s: &str) -> Result<CodecId, String> {
    CodecId::from_name(s).ok_or_else(|| format!("unknown codec '{s}', expected zstd or lz4"))
}

/// Expand `rel` (relative to `base`) into the regular files beneath it.
fn collect_files(base: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let full = base.join(rel);
    if fs::metadata(&full)?.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(&full)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            collect_files(base, &rel.join(entry.file_name()), out)?;
        }
    } else {
        out.push(rel.to_path_buf());
    }
    Ok(())
}

/// Copy every source file through `head` using `parallel` producer threads.
fn stream_files(
    head: &Arc<dyn Datasink>,
    base: &Path,
    sources: &[PathBuf],
    parallel: usize,
    absolute_names: bool,
    buffer_size: usize,
) -> Result<(), SinkError> {
    let next = &AtomicUsize::new(0);
    thread::scope(|scope| {
        let workers: Vec<_> = (0..parallel)
            .map(|_| {
                scope.spawn(move || -> Result<(), SinkError> {
                    let mut buf = vec![0u8; buffer_size];
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(rel) = sources.get(i) else { return Ok(()) };
                        let name = rel.to_string_lossy();
                        let stored = if absolute_names { &name[..] } else { safer_name_suffix(&name).0 };

                        let io = |source| SinkError::Io { path: name.to_string(), source };
                        let mut src = File::open(base.join(rel)).map_err(io)?;
                        let stat = FileStat::from_metadata(&src.metadata().map_err(io)?);
                        let mut dest = head.open(stored, &stat)?;
                        loop {
                            let n = src.read(&mut buf).map_err(io)?;
                            if n == 0 {
                                break;
                            }
                            dest.write(&buf[..n])?;
                        }
                        dest.close()?;
                        debug!(path = stored, size = stat.size, "streamed");
                    }
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect::<Result<(), _>>()
    })
}
