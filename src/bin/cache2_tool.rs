//! cache2 command line tool
//!
//! Stores, fetches and removes resources of an on-disk cache directory.
//!
//! Usage:
//!   cache2_tool --cache-dir /tmp/cache2 put http://example.com/ ./index.html
//!   cache2_tool --cache-dir /tmp/cache2 get http://example.com/ --output out.html
//!   cache2_tool --cache-dir /tmp/cache2 list --json

use cache2::config::CacheConfig;
use cache2::constants::CHUNK_SIZE;
use cache2::entry::{CacheEntryDoomCallback, CacheEntryOpenCallback, CheckResult, EntryAccess};
use cache2::error::{CacheError, CacheResult};
use cache2::file::metadata::ParseOutcome;
use cache2::file::CacheFileMetadata;
use cache2::io::IoLevel;
use cache2::logging::init_with_hostname;
use cache2::storage::{CacheStorage, CacheStorageService, LoadContextInfo, OpenFlags};
use cache2::CacheEntry;

use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde::Serialize;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{mpsc, Arc};

type ToolResult<T> = Result<T, Box<dyn std::error::Error>>;

/// cache2 command line tool
#[derive(Parser)]
#[command(name = "cache2_tool")]
#[command(about = "Inspect and modify a cache2 cache directory")]
struct Args {
    /// Cache root directory
    #[arg(long, default_value = "/tmp/cache2")]
    cache_dir: PathBuf,

    /// Configuration file (TOML); --cache-dir overrides its storage section
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store the content of a file under a URI
    Put {
        uri: String,
        file: PathBuf,

        /// Expiration time in seconds since the epoch
        #[arg(long)]
        expiration: Option<u32>,

        /// Metadata element as key=value, may be repeated
        #[arg(long)]
        element: Vec<String>,
    },

    /// Print the content stored under a URI
    Get {
        uri: String,

        /// Write the content here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Also print the metadata elements to stderr
        #[arg(long)]
        meta: bool,
    },

    /// Remove the entry of a URI
    Doom { uri: String },

    /// List the entries stored in the cache directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove every entry
    Clear,
}

/// Passes the result of an open to the main thread
struct OpenWaiter {
    check: CheckResult,
    tx: Mutex<Option<mpsc::Sender<CacheResult<Option<EntryAccess>>>>>,
}

impl OpenWaiter {
    fn new(check: CheckResult) -> (Arc<Self>, mpsc::Receiver<CacheResult<Option<EntryAccess>>>) {
        let (tx, rx) = mpsc::channel();
        let waiter = Arc::new(Self {
            check,
            tx: Mutex::new(Some(tx)),
        });
        (waiter, rx)
    }
}

impl CacheEntryOpenCallback for OpenWaiter {
    fn on_cache_entry_check(&self, _entry: &Arc<CacheEntry>) -> CacheResult<CheckResult> {
        Ok(self.check)
    }

    fn on_cache_entry_available(
        &self,
        entry: Option<EntryAccess>,
        _is_new: bool,
        status: CacheResult<()>,
    ) -> CacheResult<()> {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(status.map(|_| entry));
        }
        Ok(())
    }
}

struct DoomWaiter {
    tx: Mutex<Option<mpsc::Sender<CacheResult<()>>>>,
}

impl CacheEntryDoomCallback for DoomWaiter {
    fn on_cache_entry_doomed(&self, result: CacheResult<()>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

/// One row of `list`
#[derive(Debug, Serialize)]
struct ListedEntry {
    hash: String,
    key: String,
    data_size: u64,
    fetch_count: u32,
    last_fetched: u32,
    last_modified: u32,
    expiration_time: u32,
}

fn main() {
    let args = Args::parse();
    init_with_hostname(&args.log_level);

    if let Err(e) = run(args) {
        eprintln!("[cache2_tool] ERROR: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> ToolResult<()> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    config.storage.cache_dir = Some(args.cache_dir.clone());

    if let Command::List { json } = args.command {
        return list(&args.cache_dir, json);
    }

    let service = CacheStorageService::new(config)?;
    let storage = service.disk_cache_storage(&LoadContextInfo::default());

    let result = match args.command {
        Command::Put {
            uri,
            file,
            expiration,
            element,
        } => put(&storage, &uri, &file, expiration, &element),
        Command::Get { uri, output, meta } => get(&storage, &uri, output, meta),
        Command::Doom { uri } => doom(&storage, &uri),
        Command::Clear => service.clear().map_err(Into::into),
        Command::List { .. } => Ok(()),
    };

    drop(storage);
    settle(&service)?;
    service.shutdown();
    result
}

fn put(
    storage: &CacheStorage,
    uri: &str,
    path: &Path,
    expiration: Option<u32>,
    elements: &[String],
) -> ToolResult<()> {
    let content = std::fs::read(path)?;

    let (waiter, rx) = OpenWaiter::new(CheckResult::NotValid);
    storage.async_open_uri(uri, "", OpenFlags::OPEN_TRUNCATE, waiter)?;
    let handle = rx
        .recv()??
        .and_then(EntryAccess::into_writer)
        .ok_or(CacheError::NotAvailable)?;

    for element in elements {
        let (key, value) = element.split_once('=').ok_or_else(|| {
            CacheError::InvalidArgument(format!("element must be key=value: {}", element))
        })?;
        handle.set_meta_data_element(key, Some(value))?;
    }
    if let Some(expiration) = expiration {
        handle.set_expiration_time(expiration)?;
    }

    let output = handle.open_output_stream(0)?;
    let mut written = 0;
    while written < content.len() {
        written += output.write(&content[written..])?;
    }
    output.close();

    handle.meta_data_ready();
    handle.release();
    eprintln!("[cache2_tool] Stored {} bytes under {}", written, uri);
    Ok(())
}

fn get(storage: &CacheStorage, uri: &str, output: Option<PathBuf>, meta: bool) -> ToolResult<()> {
    let (waiter, rx) = OpenWaiter::new(CheckResult::Valid);
    storage.async_open_uri(uri, "", OpenFlags::OPEN_READONLY, waiter)?;

    let entry = match rx.recv()? {
        Ok(Some(access)) => access.entry().clone(),
        Ok(None) | Err(CacheError::KeyNotFound) => {
            // The lookup left an empty entry behind
            let _ = storage.async_doom_uri(uri, "", None);
            return Err(format!("{} is not cached", uri).into());
        }
        Err(e) => return Err(e.into()),
    };

    if meta {
        for (key, value) in entry.meta_data_elements()? {
            eprintln!("{}: {}", key, value);
        }
    }

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };

    let input = entry.open_input_stream(0)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.write_all(&buf[..n])?,
            Err(CacheError::WouldBlock) => {
                let (tx, rx) = mpsc::channel();
                input.async_wait(Some(Box::new(move || {
                    let _ = tx.send(());
                })))?;
                rx.recv()?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    out.flush()?;
    Ok(())
}

fn doom(storage: &CacheStorage, uri: &str) -> ToolResult<()> {
    let (tx, rx) = mpsc::channel();
    let waiter = Arc::new(DoomWaiter {
        tx: Mutex::new(Some(tx)),
    });
    storage.async_doom_uri(uri, "", Some(waiter))?;
    match rx.recv()? {
        Ok(()) => {
            eprintln!("[cache2_tool] Doomed {}", uri);
            Ok(())
        }
        Err(CacheError::NotAvailable) => Err(format!("{} is not cached", uri).into()),
        Err(e) => Err(e.into()),
    }
}

/// Entries are not indexed; every file under `entries/` is parsed
fn list(cache_dir: &Path, json: bool) -> ToolResult<()> {
    let entries_dir = cache_dir.join(cache2::constants::ENTRIES_DIR);
    let mut listed = Vec::new();

    if entries_dir.exists() {
        for dirent in std::fs::read_dir(&entries_dir)? {
            let dirent = dirent?;
            let buf = std::fs::read(dirent.path())?;
            let hash = dirent.file_name().to_string_lossy().into_owned();
            match CacheFileMetadata::parse_any_key(&buf, 0) {
                ParseOutcome::Parsed(metadata) => listed.push(ListedEntry {
                    hash,
                    key: metadata.key().to_string(),
                    data_size: metadata.offset(),
                    fetch_count: metadata.fetch_count(),
                    last_fetched: metadata.last_fetched(),
                    last_modified: metadata.last_modified(),
                    expiration_time: metadata.expiration_time(),
                }),
                _ => tracing::warn!("Skipping {} without valid metadata", hash),
            }
        }
    }
    listed.sort_by(|a, b| a.key.cmp(&b.key));

    if json {
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }

    println!("{:<40} {:>10} {:>6}  KEY", "HASH", "SIZE", "FETCH");
    for entry in &listed {
        println!(
            "{:<40} {:>10} {:>6}  {}",
            entry.hash, entry.data_size, entry.fetch_count, entry.key
        );
    }
    Ok(())
}

/// Wait for the service threads to run everything queued so far
///
/// Several rounds are needed since completions queue follow-up work
/// (an open completing writes out the chunks waiting for it).
fn settle(service: &Arc<CacheStorageService>) -> ToolResult<()> {
    for _ in 0..3 {
        let (tx, rx) = mpsc::channel();
        service.dispatch(move || {
            let _ = tx.send(());
        })?;
        rx.recv()?;

        let (tx, rx) = mpsc::channel();
        service.io().io_thread().dispatch(IoLevel::Evict, move || {
            let _ = tx.send(());
        })?;
        rx.recv()?;
    }
    Ok(())
}
