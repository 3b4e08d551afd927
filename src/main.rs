use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use vpn_merger::cache::Cache;
use vpn_merger::cli::{Cli, Command, ServerKind, SourcesAction};
use vpn_merger::fetcher::circuit_breaker::CircuitBreakerConfig;
use vpn_merger::fetcher::Fetcher;
use vpn_merger::models::Tier;
use vpn_merger::orchestrator::{OrchestratorConfig, PipelineOrchestrator};
use vpn_merger::output::OutputRequest;
use vpn_merger::scorer::HeuristicScorer;
use vpn_merger::source_store::SourceStateStore;
use vpn_merger::source_validator::SourceValidator;
use vpn_merger::tester::{ConnectionTester, NoopCountryLookup};
use vpn_merger::{discovery, event_bus, utils, Config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting vpn-merger v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Dispatch to the requested subcommand, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;

    match cli.command {
        Command::Process {
            output_dir,
            formats,
            force_refresh,
            concurrent,
            timeout,
        } => {
            run_process(
                &config,
                output_dir.unwrap_or_else(|| config.output_dir.clone().into()),
                formats,
                force_refresh,
                concurrent,
                timeout,
            )
            .await
        }
        Command::Sources { action } => run_sources(&config, action).await,
        Command::Validate => run_validate(&config).await,
        Command::Server { kind } => run_server(kind).await,
        Command::Retest { input, output_dir } => {
            run_retest(
                &config,
                input,
                output_dir.unwrap_or_else(|| config.output_dir.clone().into()),
            )
            .await
        }
    }
}

fn sources_path(config: &Config) -> std::path::PathBuf {
    std::path::PathBuf::from(&config.output_dir)
        .parent()
        .map(|p| p.join("sources.yaml"))
        .unwrap_or_else(|| std::path::PathBuf::from("sources.yaml"))
}

async fn build_orchestrator(
    config: &Config,
) -> Result<PipelineOrchestrator, exitcode::ExitCode> {
    let breaker_config = CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker_failure_threshold,
        success_threshold: config.circuit_breaker_success_threshold,
        cooldown: config.circuit_breaker_open_duration,
    };

    let fetcher = Arc::new(
        Fetcher::new(config.rate_limit_rps, config.rate_limit_burst, breaker_config).map_err(
            |e| {
                error!("failed to build fetcher: {e}");
                exitcode::SOFTWARE
            },
        )?,
    );
    let validator = Arc::new(SourceValidator::new(fetcher.clone()));
    let store = Arc::new(SourceStateStore::load(sources_path(config)).await.map_err(|e| {
        error!("failed to load source store: {e}");
        exitcode::SOFTWARE
    })?);
    let scorer: Arc<dyn vpn_merger::scorer::QualityScorer> = Arc::new(HeuristicScorer);
    let tester = Arc::new(ConnectionTester::new(
        config.validate_timeout,
        Arc::new(NoopCountryLookup),
    ));
    let events = event_bus::EventBus::new();
    let discovery = discovery::SourceDiscovery::new();
    let cache = Cache::new(None).with_bounds(config.cache_max_entries, config.cache_max_bytes);

    Ok(PipelineOrchestrator::new(
        discovery, validator, fetcher, store, scorer, tester, events, cache,
    ))
}

async fn run_process(
    config: &Config,
    output_dir: std::path::PathBuf,
    formats: Vec<String>,
    force_refresh: bool,
    concurrent: Option<usize>,
    timeout: Option<u64>,
) -> Result<(), exitcode::ExitCode> {
    let orchestrator = build_orchestrator(config).await?;

    let cfg = OrchestratorConfig {
        discovery_cap: config.discovery_cap,
        fetch_timeout: timeout.map(Duration::from_secs).unwrap_or(config.fetch_timeout),
        validate_timeout: config.validate_timeout,
        validate_concurrency: config.validate_concurrency,
        max_ping_ms: config.max_ping_ms,
        concurrent_fetches: concurrent.unwrap_or(config.concurrent_limit),
        force_refresh,
        max_body_bytes: config.max_body_bytes,
        skip_network: config.skip_network,
        ..OrchestratorConfig::default()
    };

    let mut output_req = OutputRequest::new(output_dir);
    if !formats.is_empty() {
        output_req.formats = formats.into_iter().collect();
    }
    output_req.validate_formats().map_err(|e| {
        error!("invalid --formats value: {e}");
        e.exit_code()
    })?;

    let cancel = CancellationToken::new();
    let run_id = Uuid::new_v4();
    let started_at = Instant::now();

    let record = orchestrator
        .run(run_id, &cfg, &output_req, &cancel)
        .await
        .map_err(|e| {
            error!("pipeline run failed: {e}");
            e.exit_code()
        })?;

    info!(
        run_id = %run_id,
        total_configs = record.total_configs,
        reachable = record.reachable,
        sources = record.sources,
        elapsed_s = started_at.elapsed().as_secs_f64(),
        "run complete"
    );
    vpn_merger::metrics::record_run_duration(started_at.elapsed().as_secs_f64());

    let runs_log = std::path::PathBuf::from(&config.output_dir).join("runs.log");
    if let Err(e) = utils::append_run_record(&runs_log, &record, config.runs_log_max_bytes).await {
        warn!(error = %e, "failed to append run record to runs.log");
    }

    Ok(())
}

async fn run_sources(config: &Config, action: SourcesAction) -> Result<(), exitcode::ExitCode> {
    let store = SourceStateStore::load(sources_path(config)).await.map_err(|e| {
        error!("failed to load source store: {e}");
        exitcode::SOFTWARE
    })?;

    match action {
        SourcesAction::List => {
            let mut sources = store.all().await;
            sources.sort_by(|a, b| tier_rank(a.tier).cmp(&tier_rank(b.tier)).then_with(|| a.url.cmp(&b.url)));
            for source in sources {
                println!("[{:?}] {} (weight={:.2})", source.tier, source.url, source.weight);
            }
        }
        SourcesAction::Add { url, tier } => {
            let tier = parse_tier(&tier);
            let inserted = store.add_atomic(&url, tier, 1.0).await.map_err(|e| {
                error!("failed to add source: {e}");
                exitcode::SOFTWARE
            })?;
            if inserted {
                println!("added {url}");
            } else {
                println!("{url} already tracked");
            }
        }
        SourcesAction::Blacklist { url, reason } => {
            store
                .blacklist(&url, reason.unwrap_or_else(|| "manual".to_string()))
                .await
                .map_err(|e| {
                    error!("failed to blacklist source: {e}");
                    exitcode::SOFTWARE
                })?;
            println!("blacklisted {url}");
        }
        SourcesAction::Whitelist { url } => {
            store.whitelist(&url).await.map_err(|e| {
                error!("failed to whitelist source: {e}");
                exitcode::SOFTWARE
            })?;
            println!("whitelisted {url}");
        }
    }

    Ok(())
}

fn tier_rank(tier: Tier) -> u8 {
    match tier {
        Tier::Premium => 0,
        Tier::Reliable => 1,
        Tier::Bulk => 2,
        Tier::Experimental => 3,
    }
}

fn parse_tier(tier: &str) -> Tier {
    match tier.to_lowercase().as_str() {
        "premium" => Tier::Premium,
        "reliable" => Tier::Reliable,
        "bulk" => Tier::Bulk,
        _ => Tier::Experimental,
    }
}

async fn run_validate(config: &Config) -> Result<(), exitcode::ExitCode> {
    info!("checking configuration and environment...");
    println!("output_dir: {}", config.output_dir);
    println!("concurrent_limit: {}", config.concurrent_limit);
    println!("skip_network: {}", config.skip_network);
    println!("rate_limit_rps: {}", config.rate_limit_rps);

    match SourceStateStore::load(sources_path(config)).await {
        Ok(store) => {
            let count = store.all().await.len();
            println!("sources tracked: {count}");
        }
        Err(e) => {
            error!("source store validation failed: {e}");
            return Err(exitcode::CONFIG);
        }
    }

    println!("configuration OK");
    Ok(())
}

async fn run_server(kind: ServerKind) -> Result<(), exitcode::ExitCode> {
    // The API/web surface sits on top of this pipeline; it's an external
    // interface and intentionally not implemented in this build.
    warn!(?kind, "server subcommand is not implemented in this build");
    Err(exitcode::UNAVAILABLE)
}

async fn run_retest(
    config: &Config,
    input: std::path::PathBuf,
    output_dir: std::path::PathBuf,
) -> Result<(), exitcode::ExitCode> {
    use base64::Engine;

    let raw = tokio::fs::read_to_string(&input).await.map_err(|e| {
        error!("failed to read {}: {e}", input.display());
        exitcode::NOINPUT
    })?;

    let decoded = match base64::engine::general_purpose::STANDARD.decode(raw.trim()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| raw.clone()),
        Err(_) => raw,
    };

    let tester = ConnectionTester::new(config.validate_timeout, Arc::new(NoopCountryLookup));
    let scorer = HeuristicScorer;
    let cancel = CancellationToken::new();

    let mut results: Vec<vpn_merger::models::ConfigResult> = Vec::new();
    for line in decoded.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(protocol) = vpn_merger::protocol::categorize(line) else {
            continue;
        };
        if !vpn_merger::protocol::is_valid_config(line) {
            continue;
        }
        let Ok(hash) = vpn_merger::protocol::semantic_hash(line) else {
            continue;
        };
        let (host, port) = match vpn_merger::protocol::extract_endpoint(line) {
            Ok((h, p)) => (Some(h), Some(p)),
            Err(_) => (None, None),
        };
        let mut result = vpn_merger::models::ConfigResult::new(
            line.to_string(),
            protocol,
            host,
            port,
            input.display().to_string(),
            hash,
        );
        result.quality_score = Some(vpn_merger::scorer::QualityScorer::score_line(&scorer, line));
        tester.test_result(&mut result, config.max_ping_ms, &cancel).await;
        results.push(result);
    }

    results.sort_by(|a, b| b.quality_score.partial_cmp(&a.quality_score).unwrap_or(std::cmp::Ordering::Equal));

    let output_req = OutputRequest::new(output_dir);
    let started_at = Instant::now();
    vpn_merger::output::write_outputs(
        &results,
        serde_json::json!({"retest": true}),
        started_at,
        1,
        &output_req,
    )
    .await
    .map_err(|e| {
        error!("failed to write retest outputs: {e}");
        e.exit_code()
    })?;

    println!("retested {} configs", results.len());
    Ok(())
}
