pub mod cache;
pub mod cancel;
pub mod config;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod types;
pub mod upstream;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cache::{ExportRequest, GitCli, open_store};
use crate::cancel::Cancel;
use crate::config::{CacheArgs, ServeArgs};
use crate::transfer::{TransferOptions, format_bytes};
use crate::types::{Branch, RepoKey};

#[derive(Parser)]
#[command(
    name = "ghmirror",
    about = "Cache GitHub repositories locally and serve them as zips"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve(ServeArgs),

    /// Download a URL with retries (e.g. a /download link of a running server)
    Fetch(FetchArgs),

    /// Run one eviction pass over the snapshot cache
    Sweep {
        /// Evict snapshots not read for this many seconds
        #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
        ttl_secs: u64,

        #[command(flatten)]
        cache: CacheArgs,
    },

    /// Export part of a repository from its shared mirror
    Export(ExportArgs),

    /// Check dependencies
    Doctor {
        #[command(flatten)]
        cache: CacheArgs,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// URL to download
    #[arg(long)]
    url: String,

    /// Destination file
    #[arg(long, short)]
    output: PathBuf,

    /// Total attempts, including the first
    #[arg(long, default_value_t = 4)]
    attempts: u32,

    /// Base delay between attempts, in milliseconds (grows linearly)
    #[arg(long, default_value_t = 500)]
    backoff_ms: u64,

    /// Seconds between progress reports (0 disables them)
    #[arg(long, default_value_t = 2)]
    progress_secs: u64,

    /// Sent as X-User
    #[arg(long)]
    user: Option<String>,

    /// Sent as a bearer token
    #[arg(long)]
    token: Option<String>,
}

#[derive(Args)]
struct ExportArgs {
    /// Repository in owner/repo format
    #[arg(long)]
    repo: String,

    /// Branch (default: the repository's default branch)
    #[arg(long)]
    branch: Option<String>,

    /// Comma-separated path prefixes (default: everything)
    #[arg(long, value_delimiter = ',')]
    paths: Vec<String>,

    /// Output directory, or zip file with --zip
    #[arg(long)]
    out: PathBuf,

    /// Write a zip instead of a directory tree
    #[arg(long)]
    zip: bool,

    #[command(flatten)]
    cache: CacheArgs,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => cmd_serve(&args),
        Commands::Fetch(args) => cmd_fetch(&args),
        Commands::Sweep { ttl_secs, cache } => cmd_sweep(ttl_secs, &cache),
        Commands::Export(args) => cmd_export(&args),
        Commands::Doctor { cache } => cmd_doctor(&cache),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_serve(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config();
    if config.default_token.is_none() {
        log::info!("No GITHUB_TOKEN set; anonymous GitHub requests are heavily rate limited");
    }
    let store = open_store(&config);
    let mut server = server::start(&config, store)?;
    println!("ghmirror listening on http://{}", server.addr());

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })?;
    let _ = stop_rx.recv();

    log::info!("Shutting down");
    server.shutdown();
    Ok(())
}

fn cmd_fetch(args: &FetchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut headers = Vec::new();
    if let Some(user) = &args.user {
        headers.push(("X-User".to_string(), user.clone()));
    }
    if let Some(token) = &args.token {
        headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
    }

    let cancel = Cancel::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || on_interrupt.cancel())?;

    let opts = TransferOptions {
        attempts: args.attempts,
        backoff: Duration::from_millis(args.backoff_ms),
        progress_interval: (args.progress_secs > 0).then(|| Duration::from_secs(args.progress_secs)),
        headers,
        cancel,
    };
    let report = transfer::download(&args.url, &args.output, &opts)?;
    println!(
        "Saved {} to {} ({} attempt{})",
        format_bytes(report.bytes),
        args.output.display(),
        report.attempts,
        if report.attempts == 1 { "" } else { "s" }
    );
    Ok(())
}

fn cmd_sweep(ttl_secs: u64, cache: &CacheArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = cache.to_config();
    let store = open_store(&config);
    let stats = store.cleanup_expired(Duration::from_secs(ttl_secs))?;

    println!("Sweep complete");
    println!("  Scanned:      {}", stats.scanned);
    println!("  Removed:      {}", stats.removed);
    println!("  Busy:         {}", stats.busy);
    println!("  Temp removed: {}", stats.temp_removed);
    println!("  Errors:       {}", stats.errors);
    Ok(())
}

fn cmd_export(args: &ExportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let repo: RepoKey = args
        .repo
        .parse()
        .map_err(|e| format!("Invalid repo format: {}", e))?;
    let branch: Option<Branch> = args.branch.as_deref().map(str::parse).transpose()?;

    let config = args.cache.to_config();
    let store = open_store(&config);
    let request = ExportRequest {
        repo,
        branch,
        paths: args.paths.clone(),
        token: config.default_token.clone(),
    };

    let cancel = Cancel::new();
    let summary = if args.zip {
        store.export_sparse_zip(&request, &args.out, &cancel)?
    } else {
        store.export_sparse_dir(&request, &args.out, &cancel)?
    };

    println!("Exported {}@{}", request.repo, summary.branch);
    println!("  Commit: {}", summary.commit);
    println!("  Files:  {}", summary.files);
    println!("  Size:   {}", format_bytes(summary.bytes));
    println!("  Output: {}", args.out.display());
    Ok(())
}

fn cmd_doctor(cache: &CacheArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("ghmirror System Check\n");

    let git = GitCli::new().version();
    println!(
        "[{}] git: {}",
        if git.is_ok() { "OK" } else { "FAIL" },
        match &git {
            Ok(version) => version.clone(),
            Err(e) => format!("not usable ({})", e),
        }
    );

    let config = cache.to_config();
    let cache_ok = config.cache_dir.exists();
    println!(
        "[{}] Cache dir: {}",
        if cache_ok { "OK" } else { "INFO" },
        config.cache_dir.display()
    );

    println!(
        "[{}] GitHub token: {}",
        if config.default_token.is_some() { "OK" } else { "INFO" },
        if config.default_token.is_some() {
            "set"
        } else {
            "not set (anonymous rate limits apply)"
        }
    );

    if git.is_err() {
        std::process::exit(1);
    }

    Ok(())
}
