use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use tessera::config::{self, APP_NAME, AppConfig, AppPaths};
use tessera::crypto::FileKeyProvider;
use tessera::db::Database;
use tessera::error::EngineError;
use tessera::identity::IdentityUpdate;
use tessera::launch::ConfiguredLauncher;
use tessera::policy::{PolicyDocument, ResourceLimits};
use tessera::sandbox::{EngineParts, Sandbox, SandboxEngine, SandboxFilter, SandboxStatus};

/// Exit code when the sandbox named on the command line does not exist.
const EXIT_NOT_FOUND: i32 = 2;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        let code = match err.downcast_ref::<EngineError>() {
            Some(e) if e.is_not_found() => EXIT_NOT_FOUND,
            _ => 1,
        };
        std::process::exit(code);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: Command) -> Result<()> {
    let engine = open_engine(&ctx).await?;
    handle_engine(&ctx, &engine, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
        other => async_main(ctx, other),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tessera - run many isolated instances of one application.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Maximum seconds to allow a storage walk or archive operation to run
    #[arg(long = "timeout", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and configure a new sandbox
    Create(CreateCommand),
    /// Mark a sandbox running and print its launch context
    Launch { key: String },
    /// Stop a running sandbox
    Stop { key: String },
    /// Tear a sandbox down completely
    Remove { key: String },
    /// List sandboxes
    List(ListCommand),
    /// Show one sandbox
    Show { key: String },
    /// Print the lifecycle status of a key
    Status { key: String },
    /// Change the display label
    Rename { key: String, label: String },
    /// Per-sandbox statistics, or registry totals without a key
    Stats { key: Option<String> },
    /// Composite health score
    Health { key: String },
    /// Storage usage by category
    Usage { key: String },
    /// Purge stale cache files
    Optimize { key: String },
    /// Show or change resource ceilings
    Limits(LimitsCommand),
    /// Inspect or replace the security policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Inspect or change the synthetic device identity
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    /// Archive a sandbox's storage
    Snapshot { key: String },
    /// Replace a sandbox's storage with an archive
    Restore { key: String, archive: PathBuf },
    /// Manage stored archives
    Archives {
        #[command(subcommand)]
        command: ArchivesCommand,
    },
    /// List launch sessions
    Sessions { key: String },
    /// Map a host path into a sandbox's private tree
    Resolve { key: String, path: String },
    /// Repair disk and registry after a crash
    Reconcile,
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct CreateCommand {
    /// Target application reference
    target: String,
    /// Display label (defaults to the target)
    #[arg(long)]
    label: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ListCommand {
    /// Only sandboxes of this target
    #[arg(long)]
    target: Option<String>,
    /// Only sandboxes in this status
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct LimitsCommand {
    key: String,
    /// Memory ceiling in bytes
    #[arg(long)]
    memory: Option<u64>,
    /// Storage ceiling in bytes
    #[arg(long)]
    storage: Option<u64>,
    /// Concurrency ceiling
    #[arg(long)]
    concurrency: Option<u32>,
}

impl LimitsCommand {
    fn is_change(&self) -> bool {
        self.memory.is_some() || self.storage.is_some() || self.concurrency.is_some()
    }
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    /// Print the applied policy
    Show { key: String },
    /// Replace the policy with a JSON, YAML or TOML document
    Apply { key: String, file: PathBuf },
    /// Evaluate the effective policy for a host and/or permission class
    Check(PolicyCheckCommand),
}

#[derive(Debug, Clone, Args)]
struct PolicyCheckCommand {
    key: String,
    /// Host name to evaluate against the network rules
    #[arg(long)]
    host: Option<String>,
    /// Permission class to look up (camera, location, ...)
    #[arg(long)]
    permission: Option<String>,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    /// Print the identity
    Show { key: String },
    /// Draw a new identity
    Regenerate { key: String },
    /// Overwrite individual identity fields
    Update(IdentityUpdateCommand),
}

#[derive(Debug, Clone, Args)]
struct IdentityUpdateCommand {
    key: String,
    #[arg(long)]
    device_id: Option<String>,
    #[arg(long)]
    platform_id: Option<String>,
    #[arg(long)]
    hardware_serial: Option<String>,
    #[arg(long)]
    serial_number: Option<String>,
    #[arg(long)]
    mac_address: Option<String>,
    #[arg(long)]
    bluetooth_address: Option<String>,
    #[arg(long)]
    carrier: Option<String>,
    #[arg(long)]
    timezone: Option<String>,
}

impl From<IdentityUpdateCommand> for IdentityUpdate {
    fn from(cmd: IdentityUpdateCommand) -> Self {
        Self {
            device_id: cmd.device_id,
            platform_id: cmd.platform_id,
            hardware_serial: cmd.hardware_serial,
            serial_number: cmd.serial_number,
            mac_address: cmd.mac_address,
            bluetooth_address: cmd.bluetooth_address,
            carrier: cmd.carrier,
            timezone: cmd.timezone,
        }
    }
}

#[derive(Debug, Subcommand)]
enum ArchivesCommand {
    /// List archives of a sandbox
    List { key: String },
    /// Delete all archives of a sandbox, removed or not
    Purge { key: String },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init(InitCommand),
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
    /// The default config file was written by this invocation.
    config_created: bool,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config_created = !common.dry_run && !paths.config_file.exists();
        let config = config::load_or_init_config(&paths, common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
            config_created,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("tessera={level},sqlx=warn")));

        // Logs go to stderr so --json/--yaml output stays parseable.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }

    /// Token cancelled after `--timeout` seconds, if given.
    fn cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(secs) = self.common.timeout {
            let child = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                child.cancel();
            });
        }
        token
    }

    /// Print `value` as JSON or YAML when asked, otherwise the human form.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce() -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            human()
        };
        println!("{output}");
        Ok(())
    }

    fn refuse_dry_run(&self, action: &str) -> Result<()> {
        if self.common.dry_run {
            return Err(anyhow!("{action} is not available with --dry-run"));
        }
        Ok(())
    }
}

async fn open_engine(ctx: &RuntimeContext) -> Result<SandboxEngine> {
    let database = Database::new(&ctx.paths.database_file()).await?;
    let paths = ctx.paths.engine_paths();
    let keys = Arc::new(FileKeyProvider::new(&paths.key_dir));
    let launcher = Arc::new(ConfiguredLauncher::from_config(&ctx.config.launch));
    let parts = EngineParts::sqlite(&database, keys, launcher);
    Ok(SandboxEngine::new(ctx.config.engine.clone(), &paths, parts))
}

async fn handle_engine(ctx: &RuntimeContext, engine: &SandboxEngine, cmd: Command) -> Result<()> {
    match cmd {
        Command::Create(cmd) => {
            ctx.refuse_dry_run("create")?;
            let sandbox = engine.create(&cmd.target, cmd.label.as_deref()).await?;
            ctx.emit(&sandbox, || format!("Created {}", describe(&sandbox)))
        }
        Command::Launch { key } => {
            ctx.refuse_dry_run("launch")?;
            match engine.launch(&key).await {
                Ok(launch) => ctx.emit(&launch, || {
                    let mut out = format!(
                        "Launched {} (session {})\n  command: {} {}\n  root:    {}",
                        key,
                        launch.session_id,
                        launch.entry_point.command,
                        launch.entry_point.args.join(" "),
                        launch.storage_root.display()
                    );
                    for redirect in &launch.redirects.entries {
                        out.push_str(&format!(
                            "\n  {} -> {}",
                            redirect.canonical,
                            redirect.target.display()
                        ));
                    }
                    out
                }),
                Err(EngineError::AlreadyRunning(_)) => {
                    let sandbox = engine.get(&key).await?;
                    ctx.emit(&sandbox, || format!("{key} is already running"))
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Stop { key } => {
            ctx.refuse_dry_run("stop")?;
            let sandbox = engine.stop(&key).await?;
            ctx.emit(&sandbox, || format!("Stopped {}", describe(&sandbox)))
        }
        Command::Remove { key } => {
            ctx.refuse_dry_run("remove")?;
            engine.remove(&key).await?;
            ctx.emit(&serde_json::json!({ "removed": &key }), || format!("Removed {key}"))
        }
        Command::List(cmd) => {
            let status = cmd
                .status
                .as_deref()
                .map(str::parse::<SandboxStatus>)
                .transpose()
                .map_err(|e| anyhow!(e))?;
            let filter = SandboxFilter {
                target_app_ref: cmd.target,
                status,
            };
            let sandboxes = engine.list(&filter).await?;
            ctx.emit(&sandboxes, || sandbox_table(&sandboxes))
        }
        Command::Show { key } => {
            let sandbox = engine.get(&key).await?;
            ctx.emit(&sandbox, || format!("{sandbox:#?}"))
        }
        Command::Status { key } => {
            let status = engine.status(&key).await?;
            ctx.emit(&serde_json::json!({ "sandbox_key": &key, "status": status }), || {
                status.to_string()
            })
        }
        Command::Rename { key, label } => {
            ctx.refuse_dry_run("rename")?;
            let sandbox = engine.rename(&key, &label).await?;
            ctx.emit(&sandbox, || format!("Renamed {}", describe(&sandbox)))
        }
        Command::Stats { key: Some(key) } => {
            let stats = engine.statistics(&key).await?;
            ctx.emit(&stats, || {
                format!(
                    "{}\n  storage:   {} of {} ({:.1}%)\n  files:     {}\n  launches:  {} ({}s total)\n  sessions:  {}\n  archives:  {}\n  artifacts: {}/{}\n  policy:    {}\n  optimize:  {}",
                    describe(&stats.sandbox),
                    human_bytes(stats.usage.total_bytes),
                    human_bytes(stats.limits.storage_bytes),
                    stats.storage_ratio * 100.0,
                    stats.usage.file_count,
                    stats.sandbox.launch_count,
                    stats.sandbox.total_runtime_secs,
                    stats.session_count,
                    stats.archive_count,
                    stats.artifacts_present,
                    stats.artifacts_expected,
                    if stats.policy_present { "applied" } else { "missing" },
                    if stats.needs_optimization { "recommended" } else { "not needed" },
                )
            })
        }
        Command::Stats { key: None } => {
            let stats = engine.global_statistics().await?;
            ctx.emit(&stats, || {
                let mut out = format!(
                    "{} sandboxes, {} removed, {} launches, {}s runtime, {} stored",
                    stats.total,
                    stats.retired,
                    stats.total_launches,
                    stats.total_runtime_secs,
                    human_bytes(stats.total_storage_bytes)
                );
                for (status, count) in &stats.by_status {
                    out.push_str(&format!("\n  {status:<12} {count}"));
                }
                out
            })
        }
        Command::Health { key } => {
            let report = engine.health_report(&key).await?;
            ctx.emit(&report, || {
                let mut out = format!(
                    "{}: {} ({})\n  storage {} configuration {} recency {} policy {}",
                    report.sandbox_key,
                    report.score,
                    report.grade,
                    report.sub_scores.storage,
                    report.sub_scores.configuration,
                    report.sub_scores.recency,
                    report.sub_scores.policy
                );
                for rec in &report.recommendations {
                    out.push_str(&format!("\n  - {rec}"));
                }
                out
            })
        }
        Command::Usage { key } => {
            let usage = engine.usage_with(&key, ctx.cancel_token()).await?;
            ctx.emit(&usage, || {
                let mut out = format!(
                    "{}: {} in {} files",
                    key,
                    human_bytes(usage.total_bytes),
                    usage.file_count
                );
                for (category, entry) in &usage.categories {
                    out.push_str(&format!(
                        "\n  {category:<14} {:>10} {:>6} files",
                        human_bytes(entry.bytes),
                        entry.files
                    ));
                }
                if usage.skipped > 0 {
                    out.push_str(&format!("\n  ({} unreadable entries not counted)", usage.skipped));
                }
                out
            })
        }
        Command::Optimize { key } => {
            ctx.refuse_dry_run("optimize")?;
            let report = engine.optimize(&key).await?;
            ctx.emit(&report, || {
                format!(
                    "Purged {} files ({}) from {}",
                    report.purged_files,
                    human_bytes(report.purged_bytes),
                    key
                )
            })
        }
        Command::Limits(cmd) => {
            let sandbox = if cmd.is_change() {
                ctx.refuse_dry_run("limits")?;
                let current = engine.get(&cmd.key).await?.limits();
                let limits = ResourceLimits {
                    memory_bytes: cmd.memory.unwrap_or(current.memory_bytes),
                    storage_bytes: cmd.storage.unwrap_or(current.storage_bytes),
                    max_concurrency: cmd.concurrency.unwrap_or(current.max_concurrency),
                };
                engine.set_limits(&cmd.key, limits).await?
            } else {
                engine.get(&cmd.key).await?
            };
            let limits = sandbox.limits();
            ctx.emit(&limits, || {
                format!(
                    "{}: memory {} storage {} concurrency {}",
                    sandbox.sandbox_key,
                    human_bytes(limits.memory_bytes),
                    human_bytes(limits.storage_bytes),
                    limits.max_concurrency
                )
            })
        }
        Command::Policy { command } => handle_policy(ctx, engine, command).await,
        Command::Identity { command } => handle_identity(ctx, engine, command).await,
        Command::Snapshot { key } => {
            ctx.refuse_dry_run("snapshot")?;
            let handle = engine.snapshot_with(&key, ctx.cancel_token()).await?;
            ctx.emit(&handle, || {
                format!(
                    "Archived {} to {} ({})",
                    key,
                    handle.path.display(),
                    human_bytes(handle.size_bytes)
                )
            })
        }
        Command::Restore { key, archive } => {
            ctx.refuse_dry_run("restore")?;
            let archive = config::expand_path(archive)?;
            engine.restore_with(&key, &archive, ctx.cancel_token()).await?;
            ctx.emit(
                &serde_json::json!({ "restored": &key, "archive": &archive }),
                || format!("Restored {} from {}", key, archive.display()),
            )
        }
        Command::Archives { command } => match command {
            ArchivesCommand::List { key } => {
                let archives = engine.list_archives(&key).await?;
                ctx.emit(&archives, || {
                    archives
                        .iter()
                        .map(|a| format!("{}  {:>10}  {}", a.created_at, human_bytes(a.size_bytes), a.path.display()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
            ArchivesCommand::Purge { key } => {
                ctx.refuse_dry_run("archive purge")?;
                let purged = engine.purge_archives(&key).await?;
                ctx.emit(&serde_json::json!({ "sandbox_key": &key, "purged": purged }), || {
                    format!("Purged {purged} archives of {key}")
                })
            }
        },
        Command::Sessions { key } => {
            let sessions = engine.sessions(&key).await?;
            ctx.emit(&sessions, || {
                sessions
                    .iter()
                    .map(|s| {
                        format!(
                            "#{:<5} {}  {}  {}",
                            s.id,
                            s.started_at,
                            s.ended_at.as_deref().unwrap_or("running"),
                            s.duration_secs.map(|d| format!("{d}s")).unwrap_or_default()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Command::Resolve { key, path } => {
            let resolved = engine.resolve_path(&key, &path).await?;
            ctx.emit(&serde_json::json!({ "host_path": &path, "resolved": &resolved }), || {
                match &resolved {
                    Some(target) => target.display().to_string(),
                    None => format!("{path} is not redirected"),
                }
            })
        }
        Command::Reconcile => {
            ctx.refuse_dry_run("reconcile")?;
            let report = engine.reconcile().await?;
            ctx.emit(&report, || {
                if report.is_clean() {
                    "Nothing to reconcile".to_string()
                } else {
                    format!("{report:#?}")
                }
            })
        }
        Command::Init(_) | Command::Config { .. } | Command::Completions { .. } => {
            Err(anyhow!("command does not need the engine"))
        }
    }
}

async fn handle_policy(ctx: &RuntimeContext, engine: &SandboxEngine, cmd: PolicyCommand) -> Result<()> {
    match cmd {
        PolicyCommand::Show { key } => {
            let applied = engine.policy(&key).await?;
            ctx.emit(&applied, || match &applied {
                Some(applied) => format!("applied {}\n{:#?}", applied.applied_at, applied.document),
                None => format!("{key} has no policy"),
            })
        }
        PolicyCommand::Apply { key, file } => {
            let policy = read_policy(&config::expand_path(file)?)?;
            if ctx.common.dry_run {
                info!("dry-run: would apply policy to {}", key);
                return Ok(());
            }
            engine.apply_policy(&key, &policy).await?;
            ctx.emit(&policy, || format!("Applied policy to {key}"))
        }
        PolicyCommand::Check(cmd) => {
            if cmd.host.is_none() && cmd.permission.is_none() {
                return Err(anyhow!("give --host, --permission or both"));
            }
            let verdict = engine
                .check_policy(&cmd.key, cmd.host.as_deref(), cmd.permission.as_deref())
                .await?;
            ctx.emit(&verdict, || {
                let mut lines = Vec::new();
                if let (Some(host), Some(action)) = (&verdict.host, verdict.network) {
                    lines.push(format!("network {host}: {action}"));
                }
                if let Some(class) = &verdict.permission_class {
                    match verdict.permission {
                        Some(action) => lines.push(format!("permission {class}: {action}")),
                        None => lines.push(format!("permission {class}: not governed")),
                    }
                }
                lines.join("\n")
            })
        }
    }
}

async fn handle_identity(ctx: &RuntimeContext, engine: &SandboxEngine, cmd: IdentityCommand) -> Result<()> {
    let record = match cmd {
        IdentityCommand::Show { key } => engine.identity(&key).await?,
        IdentityCommand::Regenerate { key } => {
            ctx.refuse_dry_run("identity regenerate")?;
            engine.regenerate_identity(&key).await?
        }
        IdentityCommand::Update(cmd) => {
            ctx.refuse_dry_run("identity update")?;
            let key = cmd.key.clone();
            let update = IdentityUpdate::from(cmd);
            if update.is_empty() {
                return Err(anyhow!("no identity fields given"));
            }
            engine.update_identity(&key, &update).await?
        }
    };
    ctx.emit(&record, || {
        let summary = record.summary();
        format!(
            "{} (generation {})\n  device:   {} {} (Android {}, API {})\n  locale:   {} {}\n  carrier:  {}\n  serial:   {}\n  mac:      {}",
            record.sandbox_key,
            record.generation,
            summary.brand,
            summary.model,
            summary.os_release,
            summary.api_level,
            summary.locale,
            summary.timezone,
            summary.carrier,
            record.identifiers.serial_number,
            record.identifiers.mac_address
        )
    })
}

fn read_policy(path: &Path) -> Result<PolicyDocument> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading policy file {}", path.display()))?;
    let policy = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&text).context("parsing YAML policy")?,
        Some("toml") => toml::from_str(&text).context("parsing TOML policy")?,
        _ => serde_json::from_str(&text).context("parsing JSON policy")?,
    };
    Ok(policy)
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.config_created {
        println!("Wrote default config to {}", ctx.paths.config_file.display());
        return Ok(());
    }
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    config::write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => ctx.emit(&ctx.config, || format!("{:#?}", ctx.config)),
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            debug!("{}", ctx.paths);
            Ok(())
        }
        ConfigCommand::Init(cmd) => handle_init(ctx, cmd),
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            config::write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn describe(sandbox: &Sandbox) -> String {
    format!(
        "{} [{}] {} ({})",
        sandbox.sandbox_key, sandbox.status, sandbox.display_label, sandbox.target_app_ref
    )
}

fn sandbox_table(sandboxes: &[Sandbox]) -> String {
    let mut out = format!(
        "{:<48} {:<11} {:>8} {}",
        "KEY", "STATUS", "LAUNCHES", "LABEL"
    );
    for sandbox in sandboxes {
        out.push_str(&format!(
            "\n{:<48} {:<11} {:>8} {}",
            sandbox.sandbox_key,
            sandbox.status.to_string(),
            sandbox.launch_count,
            sandbox.display_label
        ));
    }
    out
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
