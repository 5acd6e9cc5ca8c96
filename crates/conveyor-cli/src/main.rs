use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use conveyor::blobstore::FsBackend;
use conveyor::bugs::{BugTracker, BugTrackerClient};
use conveyor::config::{ConfigKey, ConfigStore};
use conveyor::notify::{Notifier, WebhookConfig};
use conveyor::queue::{CancelOutcome, JobStore};
use conveyor::review::{ConduitClient, ReviewService};
use conveyor::treestatus::{TreeStatus, TreeStatusClient};
use conveyor::types::RepoConfig;
use conveyor::worker::{LandingWorker, Reporter, WorkerHarness};

#[derive(Parser, Debug)]
#[command(name = "conveyor", version)]
#[command(about = "Queue-driven landing of reviewed revisions onto upstream repositories")]
struct Cli {
    /// Path to the conveyor configuration file.
    #[arg(long, default_value = "conveyor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the landing worker event loop.
    Worker {
        /// Exit after this many loop iterations (default: run until the
        /// stop key is set).
        #[arg(long)]
        max_loops: Option<u64>,

        /// Seconds to sleep when the queue is empty.
        #[arg(long, default_value_t = 5)]
        sleep: u64,
    },
    /// Print the queued jobs as JSON, one per line.
    Queue,
    /// Cancel a queued or deferred job.
    Cancel {
        #[arg(long)]
        job: i64,
        /// Email of the job's requester; only the owner may cancel.
        #[arg(long)]
        requester: String,
    },
    /// Pause the worker (it keeps running but claims nothing).
    Pause,
    /// Resume a paused worker.
    Resume,
    /// Ask running workers to exit and refuse new starts.
    Stop,
    /// Probe the configured collaborators.
    Doctor,
}

/// One repository entry in the configuration file. The map key supplies
/// the repository name.
#[derive(Debug, Deserialize)]
struct RepoEntry {
    clone_path: PathBuf,
    #[serde(flatten)]
    config: RepoConfig,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    /// Directory holding the job store, locks and runtime config.
    store: PathBuf,
    patch_dir: PathBuf,
    #[serde(default = "default_bucket")]
    patch_bucket: String,
    treestatus_url: String,
    #[serde(default)]
    review_url: Option<String>,
    #[serde(default)]
    review_token: Option<String>,
    #[serde(default)]
    bugzilla_url: Option<String>,
    #[serde(default)]
    bugzilla_api_key: Option<String>,
    #[serde(default)]
    webhook: Option<WebhookConfig>,
    repos: BTreeMap<String, RepoEntry>,
}

fn default_bucket() -> String {
    "patches".to_string()
}

impl FileConfig {
    fn load(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        for (name, entry) in &mut config.repos {
            if entry.config.name.is_empty() {
                entry.config.name = name.clone();
            }
        }
        Ok(config)
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FileConfig::load(&cli.config)?;

    match cli.cmd {
        Commands::Worker { max_loops, sleep } => run_worker(config, max_loops, sleep),
        Commands::Queue => list_queue(config),
        Commands::Cancel { job, requester } => cancel_job(config, job, &requester),
        Commands::Pause => set_flag(config, ConfigKey::LandingWorkerPaused, true),
        Commands::Resume => set_flag(config, ConfigKey::LandingWorkerPaused, false),
        Commands::Stop => set_flag(config, ConfigKey::LandingWorkerStopped, true),
        Commands::Doctor => doctor(config),
    }
}

fn run_worker(config: FileConfig, max_loops: Option<u64>, sleep: u64) -> Result<()> {
    let jobs = JobStore::open(&config.store)?;
    let patches = FsBackend::new(&config.patch_dir, &config.patch_bucket)?;
    let treestatus = TreeStatusClient::new(&config.treestatus_url)?;

    let review: Option<Box<dyn ReviewService>> = match (&config.review_url, &config.review_token) {
        (Some(url), Some(token)) => Some(Box::new(ConduitClient::new(url, token)?)),
        _ => None,
    };
    let bug_tracker: Option<Box<dyn BugTracker>> =
        match (&config.bugzilla_url, &config.bugzilla_api_key) {
            (Some(url), Some(key)) => Some(Box::new(BugTrackerClient::new(url, key)?)),
            _ => None,
        };

    let mut repos = BTreeMap::new();
    let mut clone_paths = BTreeMap::new();
    for (name, entry) in config.repos {
        clone_paths.insert(name.clone(), entry.clone_path);
        repos.insert(name, entry.config);
    }

    let harness = WorkerHarness {
        repos,
        clone_paths,
        jobs,
        patches: Box::new(patches),
        treestatus: Box::new(treestatus),
        review,
        bug_tracker,
        notifier: Notifier::new(config.webhook),
        config: ConfigStore::new(&config.store),
        sleep_seconds: sleep,
    };

    LandingWorker::new(harness).start(max_loops, &mut CliReporter)
}

fn list_queue(config: FileConfig) -> Result<()> {
    let jobs = JobStore::open(&config.store)?;
    for job in jobs.all_jobs()? {
        println!("{}", serde_json::to_string(&job.summary())?);
    }
    Ok(())
}

fn cancel_job(config: FileConfig, job: i64, requester: &str) -> Result<()> {
    let jobs = JobStore::open(&config.store)?;
    match jobs.cancel(job, requester)? {
        CancelOutcome::Cancelled => {
            println!("job {job} cancelled");
            Ok(())
        }
        CancelOutcome::NotFound => bail!("no landing job with id {job}"),
        CancelOutcome::NotOwner => bail!("{requester} is not the requester of job {job}"),
        CancelOutcome::NotCancellable(status) => {
            bail!("job {job} is {status} and cannot be cancelled")
        }
    }
}

fn set_flag(config: FileConfig, key: ConfigKey, value: bool) -> Result<()> {
    let store = ConfigStore::new(&config.store);
    store.set(key, serde_json::Value::Bool(value))?;
    println!("{} = {value}", key.name());
    Ok(())
}

fn doctor(config: FileConfig) -> Result<()> {
    let mut failed = false;

    let treestatus = TreeStatusClient::new(&config.treestatus_url)?;
    report_probe("treestatus", treestatus.healthy(), &mut failed);

    if let (Some(url), Some(token)) = (&config.review_url, &config.review_token) {
        let review = ConduitClient::new(url, token)?;
        report_probe("review", review.healthy(), &mut failed);
    }
    if let (Some(url), Some(key)) = (&config.bugzilla_url, &config.bugzilla_api_key) {
        let tracker = BugTrackerClient::new(url, key)?;
        report_probe("bugzilla", tracker.healthy(), &mut failed);
    }

    let patches = FsBackend::new(&config.patch_dir, &config.patch_bucket)?;
    report_probe(
        "blobstore",
        conveyor::blobstore::StorageBackend::healthy(&patches),
        &mut failed,
    );

    if failed {
        bail!("one or more subsystems are unhealthy");
    }
    println!("all subsystems healthy");
    Ok(())
}

fn report_probe(name: &str, result: Result<()>, failed: &mut bool) {
    match result {
        Ok(()) => println!("{name}: ok"),
        Err(err) => {
            println!("{name}: FAILED ({err:#})");
            *failed = true;
        }
    }
}
