//! Command-line surface and subcommand drivers.

use clap::{ArgAction, Parser, Subcommand};
use futures::StreamExt;
use sfs3::bulk::{join_logical, BulkOptions, BulkOrchestrator, BulkSummary};
use sfs3::config::Config;
use sfs3::crypto::CryptoContext;
use sfs3::error::{Error, Result};
use sfs3::filter::{PathFilter, Pattern};
use sfs3::meta::MetaLayer;
use sfs3::pipeline::{Pipeline, PipelineOptions};
use sfs3::progress::{human_bytes, ProgressAggregator};
use sfs3::skip::{SkipLogic, SkipOracle};
use sfs3::store::{ObjectStore, S3Store};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bulk transfer of file trees between a local filesystem and S3, with
/// md5 sidecars, skip-if-unchanged logic, and optional GPG encryption.
#[derive(Parser, Debug)]
#[command(name = "sfs3")]
#[command(version, author, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (default: ~/.sfs3.conf)
    #[arg(short = 'C', long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Suppress per-file status lines
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Force the status display on
    #[arg(long, global = true, conflicts_with = "no_progress")]
    pub progress: bool,

    /// Force the status display off
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Debug logging (repeat for trace)
    #[arg(short = 'd', long = "debug", action = ArgAction::Count, global = true)]
    pub debug: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List remote paths
    Ls {
        /// Long listing (size and last-modified)
        #[arg(short = 'l')]
        long: bool,
        /// Recurse instead of listing one level
        #[arg(short = 'r')]
        recursive: bool,
        path: Option<String>,
    },

    /// Download one object to a file, or stdout with `-`
    Get {
        /// Transfer even when the local copy is up to date
        #[arg(long)]
        force: bool,
        s3path: String,
        local: Option<String>,
    },

    /// Upload one file, or stdin with `-`
    Put {
        /// Transfer even when the remote copy is up to date
        #[arg(long)]
        force: bool,
        /// Concurrent part uploads
        #[arg(short = 'c', value_name = "N")]
        concurrent: Option<usize>,
        local: String,
        s3path: Option<String>,
    },

    /// Remove objects and their sidecars
    Rm {
        /// Remove everything under the path
        #[arg(short = 'r')]
        recursive: bool,
        pattern: String,
    },

    /// Upload a local tree
    Push {
        local: String,
        s3: String,
        /// Worker count
        #[arg(short = 'c', value_name = "N")]
        concurrent: Option<usize>,
        /// Transfer everything (no skip checks)
        #[arg(long, conflicts_with = "md5sum")]
        all: bool,
        /// Require matching md5 in addition to size and mtime
        #[arg(long)]
        md5sum: bool,
        /// Only transfer paths matching a glob (repeatable)
        #[arg(long = "only", value_name = "GLOB")]
        only: Vec<String>,
        /// Skip paths matching a glob (repeatable)
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude: Vec<String>,
    },

    /// Download a remote tree
    Pull {
        s3: String,
        local: String,
        #[arg(short = 'c', value_name = "N")]
        concurrent: Option<usize>,
        #[arg(long, conflicts_with = "md5sum")]
        all: bool,
        #[arg(long)]
        md5sum: bool,
        #[arg(long = "only", value_name = "GLOB")]
        only: Vec<String>,
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude: Vec<String>,
    },

    /// Compare a remote tree against a local tree
    Cmp {
        s3: String,
        local: String,
        #[arg(short = 'c', value_name = "N")]
        concurrent: Option<usize>,
        #[arg(long = "only", value_name = "GLOB")]
        only: Vec<String>,
        #[arg(long = "exclude", value_name = "GLOB")]
        exclude: Vec<String>,
    },

    /// Verify remote objects against their md5 sidecars
    Md5check {
        s3: String,
        #[arg(short = 'c', value_name = "N")]
        concurrent: Option<usize>,
    },

    /// Print the version
    Version,
}

/// Everything a subcommand needs.
struct App {
    pipeline: Pipeline,
    config: Config,
    quiet: bool,
    progress: bool,
}

impl App {
    async fn build(cli: &Cli) -> Result<Self> {
        let config = Config::load(cli.config.as_deref())?;
        config.validate()?;

        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&config).await?);
        let (_, prefix) = config.bucket_and_prefix()?;
        let meta = MetaLayer::new(store.clone(), &prefix);
        let crypto = CryptoContext::from_env(config.crypto_keyid.clone())?;
        let pipeline = Pipeline::new(store, meta, PipelineOptions::from(&config), crypto);

        let progress = if cli.no_progress {
            false
        } else if cli.progress {
            true
        } else {
            std::io::stderr().is_terminal() && !cli.quiet
        };

        Ok(Self {
            pipeline,
            config,
            quiet: cli.quiet,
            progress,
        })
    }

    fn bulk_options(
        &self,
        concurrent: Option<usize>,
        all: bool,
        md5sum: bool,
        only: &[String],
        exclude: &[String],
    ) -> BulkOptions {
        BulkOptions {
            concurrent: concurrent.unwrap_or(self.config.concurrent),
            policy: if all {
                SkipLogic::All
            } else if md5sum {
                SkipLogic::Md5sum
            } else {
                SkipLogic::Stat
            },
            filter: PathFilter::new(only, exclude),
            progress: self.progress,
            quiet: self.quiet,
        }
    }
}

/// A cancel token wired to Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, aborting transfers");
            token.cancel();
        }
    });
    cancel
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn print_summary(summary: &BulkSummary, quiet: bool) {
    if quiet {
        return;
    }
    eprintln!(
        "{} files ({}) transferred, {} ({}) skipped, {} ({}) aborted",
        summary.completed_files - summary.skipped_files,
        human_bytes(summary.completed_bytes - summary.skipped_bytes),
        summary.skipped_files,
        human_bytes(summary.skipped_bytes),
        summary.aborted_files,
        human_bytes(summary.aborted_bytes),
    );
}

/// Run the parsed command line to an exit code.
pub async fn run(cli: Cli) -> i32 {
    if let Command::Version = cli.command {
        println!("sfs3 {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let app = match App::build(&cli).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("sfs3: {}", e);
            return 1;
        }
    };

    let outcome = dispatch(&app, &cli.command).await;
    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sfs3: {}", e);
            1
        }
    }
}

async fn dispatch(app: &App, command: &Command) -> Result<i32> {
    match command {
        Command::Version => Ok(0),

        Command::Ls {
            long,
            recursive,
            path,
        } => cmd_ls(app, *long, *recursive, path.as_deref().unwrap_or("")).await,

        Command::Get {
            force,
            s3path,
            local,
        } => cmd_get(app, *force, s3path, local.as_deref()).await,

        Command::Put {
            force,
            concurrent,
            local,
            s3path,
        } => cmd_put(app, *force, *concurrent, local, s3path.as_deref()).await,

        Command::Rm { recursive, pattern } => cmd_rm(app, *recursive, pattern).await,

        Command::Push {
            local,
            s3,
            concurrent,
            all,
            md5sum,
            only,
            exclude,
        } => {
            let opts = app.bulk_options(*concurrent, *all, *md5sum, only, exclude);
            let orchestrator = BulkOrchestrator::new(app.pipeline.clone(), opts);
            let cancel = cancel_on_interrupt();
            let summary = orchestrator.push(Path::new(local), s3, &cancel).await?;
            print_summary(&summary, app.quiet);
            Ok(if summary.any_aborted() { 1 } else { 0 })
        }

        Command::Pull {
            s3,
            local,
            concurrent,
            all,
            md5sum,
            only,
            exclude,
        } => {
            let opts = app.bulk_options(*concurrent, *all, *md5sum, only, exclude);
            let orchestrator = BulkOrchestrator::new(app.pipeline.clone(), opts);
            let cancel = cancel_on_interrupt();
            let summary = orchestrator.pull(s3, Path::new(local), &cancel).await?;
            print_summary(&summary, app.quiet);
            Ok(if summary.any_aborted() { 1 } else { 0 })
        }

        Command::Cmp {
            s3,
            local,
            concurrent,
            only,
            exclude,
        } => cmd_cmp(app, s3, local, *concurrent, only, exclude).await,

        Command::Md5check { s3, concurrent } => cmd_md5check(app, s3, *concurrent).await,
    }
}

async fn cmd_ls(app: &App, long: bool, recursive: bool, path: &str) -> Result<i32> {
    let meta = &app.pipeline.meta;
    let base = meta.data_prefix(path);
    let base = if base.ends_with('/') {
        base
    } else {
        format!("{}/", base)
    };
    let delimiter = if recursive { None } else { Some("/") };
    let listing = app.pipeline.store.list(&base, delimiter).await?;

    for prefix in &listing.common_prefixes {
        let rel = prefix.strip_prefix(&base).unwrap_or(prefix);
        if long {
            println!("{:>12}  {:>19}  {}", "-", "-", rel);
        } else {
            println!("{}", rel);
        }
    }
    for object in &listing.objects {
        let rel = object.key.strip_prefix(&base).unwrap_or(&object.key);
        if long {
            let when = object
                .last_modified
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{:>12}  {:>19}  {}", object.size, when, rel);
        } else {
            println!("{}", rel);
        }
    }
    Ok(0)
}

async fn cmd_get(app: &App, force: bool, s3path: &str, local: Option<&str>) -> Result<i32> {
    let local = local.map(str::to_string).unwrap_or_else(|| basename(s3path));

    if local == "-" {
        app.pipeline.get_to_stdout(s3path, None).await?;
        return Ok(0);
    }

    let local_path = PathBuf::from(&local);
    let policy = if force { SkipLogic::All } else { SkipLogic::Stat };
    let oracle = SkipOracle::new(app.pipeline.store.clone(), app.pipeline.meta.clone());
    let decision = oracle.check(&local_path, s3path, policy).await?;
    if decision.skip {
        if !app.quiet {
            eprintln!("SKIP {}", s3path);
        }
        return Ok(0);
    }
    debug!(path = s3path, reason = decision.reason, "not skipping");

    let aggregator = ProgressAggregator::spawn(app.progress);
    let handle = aggregator.handle();
    let size = app
        .pipeline
        .store
        .head(&app.pipeline.meta.data_key(s3path))
        .await
        .map(|h| h.content_length)
        .unwrap_or(0);
    handle.set_totals(1, size);
    let id = handle.start(s3path, size);

    let result = app
        .pipeline
        .get_to_file(s3path, &local_path, Some(handle.transfer_fn(id)))
        .await;
    match &result {
        Ok(()) => handle.finished(id),
        Err(_) => handle.aborted(id),
    }
    aggregator.shutdown().await;
    result?;

    if !app.quiet {
        eprintln!("DONE {}", s3path);
    }
    Ok(0)
}

async fn cmd_put(
    app: &App,
    force: bool,
    concurrent: Option<usize>,
    local: &str,
    s3path: Option<&str>,
) -> Result<i32> {
    let path = s3path.map(str::to_string).unwrap_or_else(|| basename(local));
    let mut pipeline = app.pipeline.clone();
    if let Some(c) = concurrent {
        pipeline.opts.concurrency = c;
    }

    if local == "-" {
        pipeline
            .put_reader(tokio::io::stdin(), None, &path, None)
            .await?;
        return Ok(0);
    }

    let local_path = PathBuf::from(local);
    let policy = if force { SkipLogic::All } else { SkipLogic::Stat };
    let oracle = SkipOracle::new(pipeline.store.clone(), pipeline.meta.clone());
    let decision = oracle.check(&local_path, &path, policy).await?;
    if decision.skip {
        if !app.quiet {
            eprintln!("SKIP {}", path);
        }
        return Ok(0);
    }
    debug!(path, reason = decision.reason, "not skipping");

    let size = tokio::fs::metadata(&local_path).await?.len();
    let aggregator = ProgressAggregator::spawn(app.progress);
    let handle = aggregator.handle();
    handle.set_totals(1, size);
    let id = handle.start(&path, size);

    let result = pipeline
        .put_file(&local_path, &path, Some(handle.transfer_fn(id)))
        .await;
    match &result {
        Ok(()) => handle.finished(id),
        Err(_) => handle.aborted(id),
    }
    aggregator.shutdown().await;
    result?;

    if !app.quiet {
        eprintln!("DONE {}", path);
    }
    Ok(0)
}

async fn cmd_rm(app: &App, recursive: bool, pattern: &str) -> Result<i32> {
    let has_glob = pattern.contains('*') || pattern.contains('?');

    let targets: Vec<String> = if recursive || has_glob {
        let orchestrator =
            BulkOrchestrator::new(app.pipeline.clone(), BulkOptions::default());
        let root = if has_glob { "" } else { pattern };
        let matcher = has_glob.then(|| Pattern::new(pattern));
        orchestrator
            .enumerate_remote(root)
            .await?
            .into_iter()
            .map(|(rel, _)| join_logical(root, &rel))
            .filter(|p| matcher.as_ref().map(|m| m.matches(p)).unwrap_or(true))
            .collect()
    } else {
        vec![pattern.to_string()]
    };

    if targets.is_empty() {
        return Err(Error::NotFound(pattern.to_string()));
    }

    for path in &targets {
        app.pipeline.remove(path).await?;
        if !app.quiet {
            eprintln!("DONE {}", path);
        }
    }
    Ok(0)
}

async fn cmd_cmp(
    app: &App,
    s3_root: &str,
    local_root: &str,
    concurrent: Option<usize>,
    only: &[String],
    exclude: &[String],
) -> Result<i32> {
    let filter = PathFilter::new(only, exclude);
    let opts = BulkOptions {
        filter: filter.clone(),
        ..BulkOptions::default()
    };
    let orchestrator = BulkOrchestrator::new(app.pipeline.clone(), opts);

    let local_root = Path::new(local_root);
    let local_files = sfs3::bulk::enumerate_local(local_root, &filter)?;
    let remote_files = orchestrator.enumerate_remote(s3_root).await?;

    let local_set: std::collections::BTreeSet<&str> =
        local_files.iter().map(|(p, _)| p.as_str()).collect();
    let remote_set: std::collections::BTreeSet<&str> =
        remote_files.iter().map(|(p, _)| p.as_str()).collect();

    // tree-membership differences outrank content differences
    let mut membership_differs = false;
    for missing_remote in local_set.difference(&remote_set) {
        println!("{}: only local", missing_remote);
        membership_differs = true;
    }
    for missing_local in remote_set.difference(&local_set) {
        println!("{}: only remote", missing_local);
        membership_differs = true;
    }

    let common: Vec<&str> = local_set.intersection(&remote_set).copied().collect();
    let results: Vec<Option<String>> = futures::stream::iter(common)
        .map(|rel| {
            let path = join_logical(s3_root, rel);
            let local = local_root.join(rel);
            let pipeline = &app.pipeline;
            async move {
                match pipeline.compare_file(&path, &local).await {
                    Ok(None) => Ok(None),
                    Ok(Some(divergence)) => Ok(Some(format!("{}: {}", rel, divergence))),
                    Err(e) => Err(e),
                }
            }
        })
        .buffer_unordered(concurrent.unwrap_or(app.config.concurrent).max(1))
        .collect::<Vec<Result<Option<String>>>>()
        .await
        .into_iter()
        .collect::<Result<Vec<Option<String>>>>()?;

    let mut content_differs = false;
    for line in results.into_iter().flatten() {
        println!("{}", line);
        content_differs = true;
    }

    Ok(if membership_differs {
        2
    } else if content_differs {
        1
    } else {
        0
    })
}

async fn cmd_md5check(app: &App, s3_root: &str, concurrent: Option<usize>) -> Result<i32> {
    let orchestrator = BulkOrchestrator::new(app.pipeline.clone(), BulkOptions::default());
    let mut paths: Vec<String> = orchestrator
        .enumerate_remote(s3_root)
        .await?
        .into_iter()
        .map(|(rel, _)| join_logical(s3_root, &rel))
        .collect();
    if paths.is_empty() {
        // the root may name a single object
        paths.push(s3_root.to_string());
    }

    let failures: Vec<String> = futures::stream::iter(paths)
        .map(|path| {
            let pipeline = &app.pipeline;
            async move {
                match pipeline.verify_md5(&path).await {
                    Ok(()) => None,
                    Err(e) => Some(format!("{}: {}", path, e)),
                }
            }
        })
        .buffer_unordered(concurrent.unwrap_or(app.config.concurrent).max(1))
        .collect::<Vec<Option<String>>>()
        .await
        .into_iter()
        .flatten()
        .collect();

    for line in &failures {
        eprintln!("{}", line);
    }
    Ok(if failures.is_empty() { 0 } else { 1 })
}
