use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use task_relay::browser::{Browser, ChromiumBrowser};
use task_relay::config::{RelayConfig, Role};
use task_relay::gateway;
use task_relay::llm::{
    HttpSummarizer, LlmConfig, LlmProvider, LlmSummarizer, Summarizer, create_provider,
};
use task_relay::pipeline::{Decomposer, Executor, HandlerRegistry, spawn_poller};
use task_relay::store::{InMemoryStore, RedisStore, SharedStore};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env()?;

    // Must live until main returns to flush the non-blocking file writer.
    let _log_guard = init_tracing(config.log_dir.as_deref())?;

    eprintln!("Task Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Role: {:?}", config.role);

    // ── Shared store ────────────────────────────────────────────────────
    let store: Arc<dyn SharedStore> = match &config.redis_url {
        Some(url) => {
            let redis = RedisStore::connect(url)
                .await
                .with_context(|| format!("connecting to {url}"))?
                .with_prefix(config.key_prefix.clone());
            eprintln!("   Store: Redis");
            Arc::new(redis)
        }
        None => {
            if config.role != Role::All {
                warn!("REDIS_URL not set; the in-memory store is private to this process");
            }
            eprintln!("   Store: in-memory");
            Arc::new(InMemoryStore::new())
        }
    };

    // ── LLM ─────────────────────────────────────────────────────────────
    // The gateway takes an LLM when a key is present but runs without one.
    let wants_llm =
        config.needs_llm() || (config.role.runs_gateway() && config.llm.api_key.is_some());
    let llm: Option<Arc<dyn LlmProvider>> = if wants_llm {
        Some(create_provider(&LlmConfig::from_settings(&config.llm)?)?)
    } else {
        None
    };

    // ── Pollers ─────────────────────────────────────────────────────────
    let mut pollers = Vec::new();
    let mut chromium: Option<Arc<ChromiumBrowser>> = None;

    if config.role.runs_decomposer() {
        let llm = llm.clone().context("decomposer needs an LLM provider")?;
        let decomposer = Arc::new(Decomposer::new(Arc::clone(&store), llm));
        for _ in 0..config.decomposers {
            pollers.push(spawn_poller(
                Arc::clone(&decomposer),
                Arc::clone(&store),
                config.poll_timeout,
                config.backoff.clone(),
            ));
        }
        eprintln!("   Decomposers: {}", config.decomposers);
    }

    if config.role.runs_executor() {
        let summarizer: Arc<dyn Summarizer> = match (&config.llm.engine_url, &llm) {
            (Some(url), _) => Arc::new(HttpSummarizer::new(
                url.clone(),
                config.handlers.summarize_timeout,
            )?),
            (None, Some(llm)) => Arc::new(LlmSummarizer::new(Arc::clone(llm))),
            (None, None) => anyhow::bail!("executor needs LLM_ENGINE_URL or an LLM API key"),
        };
        let handlers = Arc::new(HandlerRegistry::with_defaults(&config.handlers, summarizer));
        let launched = Arc::new(
            ChromiumBrowser::launch(&config.browser)
                .await
                .context("launching Chromium")?,
        );
        let browser: Arc<dyn Browser> = launched.clone();
        chromium = Some(launched);
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            browser,
            handlers,
            config.handlers.subtask_timeout,
        ));
        for _ in 0..config.executors {
            pollers.push(spawn_poller(
                Arc::clone(&executor),
                Arc::clone(&store),
                config.poll_timeout,
                config.backoff.clone(),
            ));
        }
        eprintln!("   Executors: {} (headless Chromium)", config.executors);
    }

    // ── Gateway ─────────────────────────────────────────────────────────
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let server = if config.role.runs_gateway() {
        let summarizer = llm
            .clone()
            .map(|llm| Arc::new(LlmSummarizer::new(llm)) as Arc<dyn Summarizer>);
        if summarizer.is_none() {
            warn!("No LLM key configured; /summarize will answer 503");
        }
        let app = gateway::routes(Arc::clone(&store), summarizer);
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| format!("binding gateway port {}", config.http_port))?;
        eprintln!("   Gateway: http://0.0.0.0:{}", config.http_port);
        info!(port = config.http_port, "Gateway started");

        let mut stop = stop_rx.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %e, "Gateway stopped with error");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested, finishing in-flight work");

    for (_, flag) in &pollers {
        flag.store(true, Ordering::Relaxed);
    }
    let _ = stop_tx.send(true);

    for (handle, _) in pollers {
        if let Err(e) = handle.await {
            warn!(error = %e, "Poller task ended abnormally");
        }
    }
    if let Some(server) = server
        && let Err(e) = server.await
    {
        warn!(error = %e, "Gateway task ended abnormally");
    }
    // Executors are gone, so this is the last reference.
    if let Some(browser) = chromium.and_then(Arc::into_inner) {
        browser.shutdown().await;
    }

    info!("Stopped");
    Ok(())
}

fn init_tracing(
    log_dir: Option<&str>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(dir) = log_dir else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {dir}"))?;
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("task-relay")
        .filename_suffix("log")
        .build(dir)
        .context("creating log appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(Some(guard))
}
