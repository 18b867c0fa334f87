//! bulkxfer CLI - Chunked, Resumable Bulk Transfers
//!
//! Drives the transfer engine against a filesystem-backed object store.

use anyhow::Context;
use bulkxfer::config::{CacheAction, CliArgs, Commands, TransferConfig};
use bulkxfer::core::{
    CancellationToken, TransferOutcome, TransferRequest, TransferSession, TransferStatus,
};
use bulkxfer::progress::{EventSink, ProgressReporter, ProgressSummary};
use bulkxfer::sync::TransferCache;
use bulkxfer::transport::{LocalObjectStore, TransportSelector};
use clap::Parser;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Initialize logging
    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    // Handle result
    if let Err(e) = run(args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = TransferConfig::from_cli(&args)
        .map_err(|e| anyhow::anyhow!(e))
        .context("invalid configuration")?;

    if args.verbose > 0 {
        print_config(&config);
    }

    let cache_path = args
        .cache
        .clone()
        .unwrap_or_else(|| args.store.join(".bulkxfer-cache.json"));
    let cache = Arc::new(TransferCache::open(cache_path));

    let request = match &args.command {
        Commands::Upload {
            local,
            remote,
            concurrency,
        } => TransferRequest::upload(local, remote.as_str()).with_concurrency(*concurrency),
        Commands::Download {
            remote,
            local,
            concurrency,
        } => TransferRequest::download(remote.as_str(), local).with_concurrency(*concurrency),
        Commands::Cache { action } => return cmd_cache(&cache, action),
    };

    let store = LocalObjectStore::open(&args.store)
        .with_context(|| format!("cannot open store {}", args.store.display()))?
        .with_direct(args.direct);
    let store = Arc::new(store);

    let mut selector = TransportSelector::new(&config).with_managed(store.clone());
    if args.direct {
        selector = selector.with_direct(store.clone(), store.clone());
    }

    let session = TransferSession::new(config, cache, selector)?.with_registry(store);

    // Progress runs on its own thread and ends when the session drops its sink
    let (session, reporter) = if args.progress {
        let (sink, receiver) = EventSink::channel();
        let handle: JoinHandle<ProgressSummary> = std::thread::spawn(move || {
            let reporter = ProgressReporter::new();
            let summary = reporter.run(receiver);
            if summary.failed > 0 {
                reporter.finish_error("transfer failed");
            } else {
                reporter.finish_success("done");
            }
            summary
        });
        (session.with_events(sink), Some(handle))
    } else {
        (session, None)
    };

    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());

    let result = session.transfer_with_cancel(&request, &cancel);
    session.shutdown().context("failed to flush transfer cache")?;
    drop(session);

    if let Some(handle) = reporter {
        if let Ok(summary) = handle.join() {
            summary.print();
        }
    }

    let outcome = result?;
    print_outcome(&outcome);
    if outcome.status == TransferStatus::Cancelled {
        std::process::exit(2);
    }
    Ok(())
}

/// Cancel `token` on the first Ctrl-C; workers stop at their next part
/// boundary and partial state stays on disk for a later resume
fn watch_ctrl_c(token: CancellationToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Ctrl-C handler unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    eprintln!("Interrupted, cancelling transfer...");
                    token.cancel();
                }
                Err(e) => tracing::warn!("failed to listen for ctrl_c: {}", e),
            }
        });
    });
}

fn cmd_cache(cache: &TransferCache, action: &CacheAction) -> anyhow::Result<()> {
    match action {
        CacheAction::Show => {
            let entries = cache.entries();
            if entries.is_empty() {
                println!("Cache is empty");
                return Ok(());
            }
            println!("{:<48} {:<32} {:>10}  {}", "LOCAL", "REMOTE", "SIZE", "DIGEST");
            for entry in entries {
                println!(
                    "{:<48} {:<32} {:>10}  {} (verified {})",
                    entry.local_path.display(),
                    entry.remote,
                    humansize::format_size(entry.size, humansize::BINARY),
                    entry.digest.short(),
                    entry.last_verified.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        CacheAction::Invalidate { path } => {
            cache.invalidate(path)?;
            cache.flush()?;
            println!("Invalidated cache entries for {}", path.display());
        }
    }
    Ok(())
}

fn print_outcome(outcome: &TransferOutcome) {
    println!();
    println!("=== Transfer {} ===", outcome.status);
    println!("Remote:      {}", outcome.remote);
    println!("Direction:   {}", outcome.direction);
    if let Some(kind) = outcome.transport {
        println!("Transport:   {}", kind);
    }
    println!(
        "Size:        {}",
        humansize::format_size(outcome.size, humansize::BINARY)
    );
    println!(
        "Transferred: {} in {} parts",
        humansize::format_size(outcome.bytes_transferred, humansize::BINARY),
        outcome.parts
    );
    if let Some(digest) = &outcome.digest {
        println!("Digest:      {}", digest);
    }
    println!(
        "Elapsed:     {}",
        humantime::format_duration(std::time::Duration::from_millis(
            outcome.elapsed.as_millis() as u64
        ))
    );
}

fn print_config(config: &TransferConfig) {
    println!("=== Configuration ===");
    println!("Concurrency:        {}", config.max_concurrency);
    println!(
        "Part size:          {}",
        config
            .part_size
            .map(|s| humansize::format_size(s, humansize::BINARY))
            .unwrap_or_else(|| "auto".to_string())
    );
    println!(
        "Min/max part size:  {} / {}",
        humansize::format_size(config.min_part_size, humansize::BINARY),
        humansize::format_size(config.max_part_size, humansize::BINARY)
    );
    println!(
        "Buffered part cap:  {}",
        humansize::format_size(config.max_buffered_part_size, humansize::BINARY)
    );
    println!(
        "Multipart from:     {}",
        humansize::format_size(config.multipart_threshold, humansize::BINARY)
    );
    println!("Retries:            {}", config.max_retry_attempts);
    println!(
        "Max backoff:        {}",
        humantime::format_duration(config.max_backoff)
    );
    println!("Hash:               {}", config.hash_algorithm.name());
    println!("Direct transport:   {}", config.enable_direct_transport);
    if let Some(limit) = config.bandwidth_limit {
        println!(
            "Bandwidth limit:    {}/s",
            humansize::format_size(limit, humansize::BINARY)
        );
    }
    println!();
}
