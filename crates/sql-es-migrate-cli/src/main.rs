//! sql-es-migrate CLI - relational to search-index migration.

use clap::{Parser, Subcommand};
use sql_es_migrate::{Config, JobController, JobId, JobStatus, MigrateError, MigrationJob, SyncOutcome};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "sql-es-migrate")]
#[command(about = "Relational database to search index migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json [default: from config, else text]
    #[arg(long)]
    log_format: Option<String>,

    /// Log verbosity: debug, info, warn, error [default: from config, else info]
    #[arg(long)]
    verbosity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a migration job for a mapping and wait for it to finish
    Run {
        /// Mapping name
        mapping: String,
    },

    /// Retry a failed job from a persisted job table
    Retry {
        /// Job id
        job_id: u64,
    },

    /// List jobs, or show one job
    Jobs {
        /// Show only this job
        #[arg(long)]
        id: Option<u64>,
    },

    /// Transform sample records without loading them
    Preview {
        /// Mapping name
        mapping: String,

        /// Number of records to sample
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Suggest field mappings for a query and an index
    Suggest {
        /// Source connection name
        #[arg(long)]
        source: String,

        /// Target connection name
        #[arg(long)]
        target: String,

        /// Source query to describe
        #[arg(long)]
        query: String,

        /// Target index name
        #[arg(long)]
        index: String,
    },

    /// Check a mapping's field mappings and transformation rules
    ValidateMapping {
        /// Mapping name
        mapping: String,
    },

    /// Sync changed rows since the stored watermark
    Sync {
        /// Mapping names [default: all mappings with change tracking]
        mappings: Vec<String>,

        /// Keep syncing every engine.cdc_interval_secs until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Re-attempt dead-lettered records for a mapping
    Reprocess {
        /// Mapping name
        mapping: String,
    },

    /// List dead-lettered records
    DeadLetters {
        /// Only records of this mapping
        #[arg(long)]
        mapping: Option<String>,
    },

    /// Validate record counts between source and target
    ValidateCounts {
        /// Mapping names [default: all]
        mappings: Vec<String>,
    },

    /// Test source and target connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?.with_auto_tuning();

    // Flags take precedence over the config's logging section
    let verbosity = cli.verbosity.as_deref().unwrap_or(&config.logging.level);
    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_logging(verbosity, log_format);
    info!("Loaded configuration from {:?}", cli.config);

    let controller = JobController::from_config(&config)?;
    let cancel_token = setup_signal_handler().await?;

    match cli.command {
        Commands::Run { mapping } => {
            let id = controller.submit_job(&mapping).await?;
            let job = wait_or_stop(&controller, id, &cancel_token).await?;
            finish_job(&job, cli.output_json)?;
        }

        Commands::Retry { job_id } => {
            let job = controller.retry_job(JobId(job_id)).await?;
            let job = wait_or_stop(&controller, job.id, &cancel_token).await?;
            finish_job(&job, cli.output_json)?;
        }

        Commands::Jobs { id } => {
            let jobs = match id {
                Some(id) => vec![controller.get_job(JobId(id)).await?],
                None => controller.list_jobs().await?,
            };
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs");
            } else {
                for job in &jobs {
                    print_job_line(job);
                }
            }
        }

        Commands::Preview { mapping, limit } => {
            let result = controller.preview(&mapping, limit).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Preview of '{}':", result.mapping);
                for doc in &result.transformed_documents {
                    println!("{}", serde_json::to_string_pretty(doc)?);
                }
                for err in &result.errors {
                    println!("  Record {}: field '{}': {}", err.record, err.field, err.message);
                }
                println!(
                    "\n  {} source rows, {} documents, {} errors",
                    result.original_rows.len(),
                    result.transformed_documents.len(),
                    result.errors.len()
                );
            }
        }

        Commands::Suggest {
            source,
            target,
            query,
            index,
        } => {
            let suggestion = controller
                .suggest_mapping(&source, &target, &query, &index)
                .await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&suggestion)?);
            } else {
                println!("Suggested field mappings for index '{}':", index);
                for m in &suggestion.field_mappings {
                    println!(
                        "  {} -> {} ({}, confidence {})",
                        m.source_field, m.target_field, m.target_type, m.confidence
                    );
                }
                for rule in &suggestion.transformation_rules {
                    println!("  rule {}: {}", rule.target, rule.rule);
                }
                for (field, note) in &suggestion.notes {
                    println!("  note {}: {}", field, note);
                }
            }
        }

        Commands::ValidateMapping { mapping } => {
            let config_mapping = config
                .mapping(&mapping)
                .ok_or_else(|| MigrateError::Config(format!("mapping '{}' not found", mapping)))?;
            let report = controller.validate_mapping(
                &config_mapping.field_mappings,
                &config_mapping.transformation_rules,
            );
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for err in &report.errors {
                    println!("  ERROR {}", err);
                }
                for w in &report.warnings {
                    println!("  WARN  {}: {}", w.field, w.message);
                }
                println!("Mapping '{}' is {}", mapping, if report.valid { "valid" } else { "INVALID" });
            }
            if !report.valid {
                return Err(MigrateError::Config(format!(
                    "mapping '{}' has {} error(s)",
                    mapping,
                    report.errors.len()
                )));
            }
        }

        Commands::Sync { mappings, watch } => {
            let mappings = if mappings.is_empty() {
                config
                    .mappings
                    .iter()
                    .filter(|m| m.change_tracking.is_some())
                    .map(|m| m.name.clone())
                    .collect()
            } else {
                mappings
            };
            if mappings.is_empty() {
                return Err(MigrateError::Config(
                    "no mappings with change_tracking to sync".into(),
                ));
            }

            let sync = controller.synchronizer();
            if watch {
                sync.run_scheduled(&mappings, config.engine.cdc_interval(), &cancel_token)
                    .await?;
            } else {
                let mut reports = Vec::new();
                for mapping in &mappings {
                    match sync.sync_once(mapping, &cancel_token).await? {
                        SyncOutcome::Synced(report) => reports.push(report),
                        SyncOutcome::Skipped => warn!("{}: skipped, mapping busy", mapping),
                    }
                }
                if cli.output_json {
                    println!("{}", serde_json::to_string_pretty(&reports)?);
                } else {
                    for r in &reports {
                        println!(
                            "  {}: {} processed, {} failed, watermark {}",
                            r.mapping,
                            r.processed,
                            r.failed,
                            r.watermark
                                .as_ref()
                                .map_or_else(|| "-".to_string(), |w| w.to_string())
                        );
                    }
                }
            }
        }

        Commands::Reprocess { mapping } => {
            let report = controller.reprocess_dead_letters(&mapping).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Reprocessed dead letters for '{}':", mapping);
                println!("  Attempted: {}", report.attempted);
                println!("  Succeeded: {}", report.succeeded);
                println!("  Still failing: {}", report.failed);
            }
        }

        Commands::DeadLetters { mapping } => {
            let records = controller.list_dead_letters(mapping.as_deref()).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No dead letters");
            } else {
                for r in &records {
                    println!(
                        "  {} [{}] {} job={} retries={}: {}",
                        r.id,
                        r.stage,
                        r.mapping_id,
                        r.job_id.map_or_else(|| "-".to_string(), |j| j.to_string()),
                        r.retry_count,
                        r.error_message
                    );
                }
            }
        }

        Commands::ValidateCounts { mappings } => {
            let mappings: Vec<String> = if mappings.is_empty() {
                config.mappings.iter().map(|m| m.name.clone()).collect()
            } else {
                mappings
            };
            let mut results = Vec::new();
            for mapping in &mappings {
                results.push(controller.validate_counts(mapping).await?);
            }
            let mismatches = results.iter().filter(|r| !r.matches).count();

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for r in &results {
                    println!(
                        "  {} {}: source={} target={}",
                        if r.matches { "✓" } else { "✗" },
                        r.mapping,
                        count_text(r.source_count),
                        count_text(r.target_count)
                    );
                }
            }
            if mismatches > 0 {
                return Err(MigrateError::Config(format!(
                    "{} mapping(s) with count mismatch",
                    mismatches
                )));
            }
            println!("Validation completed successfully");
        }

        Commands::HealthCheck => {
            let result = controller.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                for (kind, checks) in [("Source", &result.sources), ("Target", &result.targets)] {
                    for c in checks {
                        println!(
                            "  {} {} ({}): {}",
                            kind,
                            c.name,
                            c.system.as_deref().unwrap_or("?"),
                            if c.ok { "OK" } else { "FAILED" }
                        );
                        if let Some(ref err) = c.error {
                            println!("    Error: {}", err);
                        }
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

/// Wait for a job, turning a shutdown signal into a stop request.
async fn wait_or_stop(
    controller: &JobController,
    id: JobId,
    cancel_token: &CancellationToken,
) -> Result<MigrationJob, MigrateError> {
    tokio::select! {
        job = controller.wait_for(id) => job,
        _ = cancel_token.cancelled() => {
            controller.stop_job(id).await?;
            controller.wait_for(id).await
        }
    }
}

fn finish_job(job: &MigrationJob, output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        println!("{}", serde_json::to_string_pretty(job)?);
    } else {
        let metrics = job.metrics();
        println!("\nJob {} {}!", job.id, job.status);
        println!("  Mapping: {}", job.mapping_configuration_id);
        println!("  Duration: {:.2}s", metrics.elapsed_secs);
        println!("  Records: {}/{}", job.processed_records, job.total_records);
        println!("  Failed records: {}", job.failed_records);
        println!("  Throughput: {:.0} records/sec", metrics.records_per_second);
        if let Some(ref err) = job.error_message {
            println!("  Error: {}", err);
        }
    }

    match job.status {
        JobStatus::Failed => Err(MigrateError::State(format!(
            "job {} failed: {}",
            job.id,
            job.error_message.as_deref().unwrap_or("unknown error")
        ))),
        JobStatus::Stopped => Err(MigrateError::Cancelled),
        _ => Ok(()),
    }
}

fn print_job_line(job: &MigrationJob) {
    println!(
        "  {:>4} {:<10} {:<20} {}/{} records, {} failed{}",
        job.id,
        job.status,
        job.mapping_configuration_id,
        job.processed_records,
        job.total_records,
        job.failed_records,
        job.error_message
            .as_ref()
            .map_or_else(String::new, |e| format!(" ({})", e))
    );
}

fn count_text(count: Option<u64>) -> String {
    count.map_or_else(|| "unavailable".to_string(), |n| n.to_string())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays parseable
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Stopping at the next batch boundary..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Stopping at the next batch boundary..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping at the next batch boundary...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
