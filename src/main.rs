use anyhow::{Context, Result};
use chat_stream_bench::config::Config;
use chat_stream_bench::corpus::{load_dictionary, PromptCorpus};
use chat_stream_bench::host::{HostPlan, LoadHost};
use chat_stream_bench::metrics::HistogramSink;
use chat_stream_bench::request::RequestBuilder;
use chat_stream_bench::user::UserContext;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Config::parse()
        .into_settings()
        .context("Invalid configuration")?;

    // Print banner
    info!("════════════════════════════════════════════════════════════");
    info!("           STREAMING CHAT LOAD TEST (Rust)");
    info!("════════════════════════════════════════════════════════════");
    info!("Endpoint: {}", settings.endpoint);
    info!("Model: {}", settings.model);
    info!("Users: {} (spawn rate {:.2}/s)", settings.users, settings.spawn_rate);
    info!("Run Time: {}s", settings.run_time.as_secs());
    info!("Pacing: {:?}", settings.pacing);
    info!(
        "Timeouts: connect {:?}, read {:?}",
        settings.connect_timeout, settings.read_timeout
    );
    info!("Sensitive Ratio: {}%", settings.percent_sensitive);
    info!(
        "Authorization: {}",
        if settings.bearer.is_some() { "bearer" } else { "none" }
    );

    // Load dictionary
    let dictionary = match &settings.sensitive_dict {
        Some(path) => load_dictionary(path).context("Failed to load sensitive dictionary")?,
        None => Vec::new(),
    };

    let corpus = PromptCorpus::new(
        settings.percent_sensitive,
        dictionary,
        settings.dict_sample_min..=settings.dict_sample_max,
    );

    if corpus.dictionary_len() > 0 {
        info!(
            "Dictionary: {} words, {}-{} per prompt",
            corpus.dictionary_len(),
            settings.dict_sample_min,
            settings.dict_sample_max
        );
    } else {
        info!("Dictionary: none, using built-in sensitive prompts");
    }
    info!("════════════════════════════════════════════════════════════");

    // Initialize metrics
    let metrics = Arc::new(HistogramSink::new().context("Failed to create histograms")?);

    let ctx = UserContext {
        corpus: Arc::new(corpus),
        builder: Arc::new(RequestBuilder::from_settings(&settings)),
        sink: metrics.clone(),
        connect_timeout: settings.connect_timeout,
        read_timeout: settings.read_timeout,
    };

    let plan = HostPlan {
        users: settings.users,
        spawn_rate: settings.spawn_rate,
        run_time: settings.run_time,
        pacing: settings.pacing,
        shutdown_grace: settings.shutdown_grace,
    };

    // Run test
    LoadHost::new(plan, ctx, Arc::clone(&metrics))
        .run()
        .await
        .context("Load test aborted")?;

    // Print summary
    metrics.print_summary();

    info!("════════════════════════════════════════════════════════════");
    info!("                 LOAD TEST COMPLETE");
    info!("════════════════════════════════════════════════════════════");

    Ok(())
}
