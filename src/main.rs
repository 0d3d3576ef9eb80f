// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hfcache::cache::{CacheIndex, CachedRepo};
use hfcache::config::Config;
use hfcache::download::{DownloadManager, DownloadRequest, HubFetcher, ManagerConfig, RepoType, TaskStatus};
use hfcache::server::Server;
use hfcache::utils::{format_size, mask_sensitive};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

/// Spinner helpers for consistent progress indicators
mod spinner {
    use colored::Colorize;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::Duration;

    /// Create a percentage bar with a spinner prefix
    pub fn create_bar(message: &str) -> ProgressBar {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos:>3}%")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    }

    pub fn finish_success(bar: &ProgressBar, message: &str) {
        bar.finish_and_clear();
        println!("{} {}", "[OK]".green(), message);
    }

    pub fn finish_warning(bar: &ProgressBar, message: &str) {
        bar.finish_and_clear();
        println!("{} {}", "[!]".yellow(), message);
    }

    pub fn finish_error(bar: &ProgressBar, message: &str) {
        bar.finish_and_clear();
        eprintln!("{} {}", "[X]".red(), message);
    }
}

/// hfcache - Inspect and manage your Hugging Face model cache.
#[derive(Parser)]
#[command(name = "hfcache")]
#[command(version = VERSION)]
#[command(about = "Inspect and manage your Hugging Face model cache.")]
#[command(long_about = "hfcache - Hugging Face cache manager\n\n\
    Start the web UI:    hfcache (or: hfcache serve)\n\
    Cache totals:        hfcache stats\n\
    List repositories:   hfcache ls\n\
    Download a file:     hfcache download gpt2 config.json\n\
    Remove a repository: hfcache rm gpt2\n\
    Clear everything:    hfcache clear")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Cache directory (overrides config and HF_HUB_CACHE / HF_HOME)
    #[arg(long, global = true, value_name = "PATH")]
    cache_dir: Option<PathBuf>,

    /// Quiet mode: only warnings and errors
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and web UI (default)
    ///
    /// Examples:
    ///   hfcache serve
    ///   hfcache serve --port 8080 --bind 0.0.0.0
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(long)]
        bind: Option<String>,
        /// Directory holding the built front end
        #[arg(long, value_name = "PATH")]
        static_dir: Option<PathBuf>,
        /// Downloads allowed to run at the same time
        #[arg(long, value_name = "N")]
        max_concurrent: Option<usize>,
    },

    /// Show cache totals
    Stats,

    /// List cached repositories, largest first
    #[command(alias = "list")]
    Ls,

    /// Download one file into the cache
    ///
    /// Examples:
    ///   hfcache download gpt2 config.json
    ///   hfcache download openai/whisper-tiny model.safetensors --revision main
    Download {
        /// Repository id, e.g. "google/bert-base-uncased"
        repo_id: String,
        /// File path inside the repository
        filename: String,
        /// Branch, tag or commit
        #[arg(short, long)]
        revision: Option<String>,
        /// Repository type: model, dataset or space
        #[arg(long, default_value = "model")]
        repo_type: String,
    },

    /// Remove one repository from the cache
    #[command(alias = "remove")]
    Rm {
        /// Repo id, cache folder name or folder path
        repo: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Remove every repository from the cache
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

/// Set up tracing on stderr. `RUST_LOG` wins over the flags.
fn init_logging(cli: &Cli) {
    let serving = matches!(cli.command, None | Some(Commands::Serve { .. }));
    let default_level = if cli.verbose {
        "hfcache=debug,tower_http=debug"
    } else if cli.quiet || !serving {
        "hfcache=warn,tower_http=warn"
    } else {
        "hfcache=info,tower_http=info"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            std::process::exit(exit_codes::CONFIG);
        }
    };
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }

    match cli.command {
        None => serve(config),
        Some(Commands::Serve { port, bind, static_dir, max_concurrent }) => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if let Some(static_dir) = static_dir {
                config.static_dir = static_dir;
            }
            if let Some(max_concurrent) = max_concurrent {
                config.max_concurrent_downloads = max_concurrent;
            }
            serve(config)
        }
        Some(Commands::Stats) => show_stats(&config),
        Some(Commands::Ls) => list_repos(&config),
        Some(Commands::Download { repo_id, filename, revision, repo_type }) => {
            let repo_type: RepoType = match repo_type.parse() {
                Ok(repo_type) => repo_type,
                Err(e) => {
                    eprintln!("{} {}", "[X]".red(), e);
                    std::process::exit(exit_codes::USAGE);
                }
            };
            let mut request = DownloadRequest::new(repo_id, filename).with_repo_type(repo_type);
            if let Some(revision) = revision {
                request = request.with_revision(revision);
            }
            download(&config, request)
        }
        Some(Commands::Rm { repo, yes }) => remove_repo(&config, &repo, yes),
        Some(Commands::Clear { yes }) => clear_cache(&config, yes),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")
}

/// Run `future` to completion, then shut the runtime down without waiting
/// for blocking work still in flight, such as a cancelled fetch.
fn block_on_detached<F: std::future::Future>(future: F) -> Result<F::Output> {
    let rt = runtime()?;
    let output = rt.block_on(future);
    rt.shutdown_background();
    Ok(output)
}

fn serve(config: Config) -> Result<()> {
    println!("{} v{}", "hfcache".bright_cyan().bold(), VERSION);
    println!("  Cache:    {}", config.resolved_cache_dir().display());
    println!("  Frontend: {}", config.static_dir.display());
    if let Some(token) = config.resolved_token() {
        println!("  Token:    {}", mask_sensitive(&token, 5));
    }
    println!(
        "  Listening on {}\n",
        format!("http://{}:{}", config.bind_address, config.port).cyan()
    );

    let server = Server::from_config(config);
    runtime()?.block_on(server.start())
}

fn scan(config: &Config) -> Result<hfcache::cache::CacheSnapshot> {
    let index = CacheIndex::new(config.resolved_cache_dir());
    index
        .snapshot()
        .with_context(|| format!("Failed to scan {}", index.cache_dir().display()))
}

fn show_stats(config: &Config) -> Result<()> {
    let snapshot = scan(config)?;

    println!("{}", "Cache".bold());
    println!("  Directory:    {}", snapshot.cache_dir.display());
    println!("  Repositories: {}", snapshot.repos.len());
    println!("  Files:        {}", snapshot.total_files());
    println!("  Size:         {}", format_size(snapshot.size_on_disk).green());
    if !snapshot.warnings.is_empty() {
        println!(
            "  {} {} folders skipped (run with -v for details)",
            "[!]".yellow(),
            snapshot.warnings.len()
        );
    }
    Ok(())
}

fn list_repos(config: &Config) -> Result<()> {
    let snapshot = scan(config)?;
    if snapshot.repos.is_empty() {
        println!("Cache is empty ({})", snapshot.cache_dir.display());
        return Ok(());
    }

    let mut repos: Vec<&CachedRepo> = snapshot.repos.iter().collect();
    repos.sort_by(|a, b| b.size_on_disk.cmp(&a.size_on_disk));

    let id_width = repos.iter().map(|r| r.repo_id.len()).max().unwrap_or(0).max(7);
    println!(
        "{}",
        format!("{:<id_width$}  {:<8}  {:>10}  {:>6}  {}", "REPO ID", "TYPE", "SIZE", "FILES", "LAST ACCESSED")
            .bold()
    );
    for repo in repos {
        let accessed = repo
            .last_accessed
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<id_width$}  {:<8}  {:>10}  {:>6}  {}",
            repo.repo_id,
            repo.repo_type.as_str(),
            format_size(repo.size_on_disk),
            repo.nb_files,
            accessed.dimmed()
        );
    }
    println!(
        "\n{} repositories, {}",
        snapshot.repos.len(),
        format_size(snapshot.size_on_disk).green()
    );
    Ok(())
}

/// Ask before deleting. Without a terminal, refuse unless `--yes` was given.
fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("Refusing to delete without confirmation; pass --yes");
    }
    Ok(inquire::Confirm::new(prompt).with_default(false).prompt()?)
}

fn remove_repo(config: &Config, repo: &str, yes: bool) -> Result<()> {
    let index = CacheIndex::new(config.resolved_cache_dir());
    if !confirm(&format!("Remove {} from {}?", repo, index.cache_dir().display()), yes)? {
        println!("Aborted.");
        return Ok(());
    }

    match index.remove(repo) {
        Ok(removed) => {
            println!(
                "{} Removed {} ({})",
                "[OK]".green(),
                removed.repo_id,
                format_size(removed.size_on_disk)
            );
            Ok(())
        }
        Err(hfcache::CacheError::RepoNotFound(_)) => {
            eprintln!("{} Repository not found in cache: {}", "[X]".red(), repo);
            std::process::exit(exit_codes::ERROR);
        }
        Err(e) => Err(e.into()),
    }
}

fn clear_cache(config: &Config, yes: bool) -> Result<()> {
    let index = CacheIndex::new(config.resolved_cache_dir());
    if !confirm(
        &format!("Delete every repository in {}?", index.cache_dir().display()),
        yes,
    )? {
        println!("Aborted.");
        return Ok(());
    }

    let summary = index.clear()?;
    println!(
        "{} Removed {} repositories, freed {}",
        "[OK]".green(),
        summary.removed,
        format_size(summary.freed)
    );
    Ok(())
}

/// Run one download through the task manager, rendering its progress.
/// Ctrl+C cancels the task.
fn download(config: &Config, request: DownloadRequest) -> Result<()> {
    let label = format!("{}/{}", request.repo_id, request.filename);

    let task = block_on_detached(async {
        let fetcher = Arc::new(HubFetcher::from_config(config));
        let manager = DownloadManager::new(fetcher, ManagerConfig::from(config))?;
        let id = manager.enqueue(request)?;

        let bar = spinner::create_bar(&label);
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        let task = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    manager.cancel(&id)?;
                }
                _ = ticker.tick() => {}
            }

            let task = manager.get(&id)?;
            bar.set_position(u64::from(task.progress));
            if task.status.is_terminal() {
                break task;
            }
        };

        match task.status {
            TaskStatus::Completed => spinner::finish_success(&bar, &format!("Downloaded {}", label)),
            TaskStatus::Cancelled => spinner::finish_warning(&bar, "Download cancelled"),
            _ => spinner::finish_error(&bar, &format!("Download failed for {}", label)),
        }
        Ok::<_, anyhow::Error>(task)
    })??;

    match task.status {
        TaskStatus::Completed => {
            if let Some(path) = &task.result_path {
                println!("  {}", path.display());
            }
            Ok(())
        }
        TaskStatus::Failed => {
            eprintln!("  {}", task.error.unwrap_or_default());
            std::process::exit(exit_codes::ERROR);
        }
        _ => std::process::exit(exit_codes::ERROR),
    }
}
