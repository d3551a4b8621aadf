use clap::Parser;
use nostr_engine::{
    Engine, EngineConfig, EventStore, FetchDescriptor, Filter, IdHashVerifier, IngestEvent,
    MemoryStore, RelayEndpoint, TaskOutcome, WsConnector,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nostr-tail",
    about = "Fetch events from Nostr relays and print them as JSON lines",
    version
)]
struct Opts {
    /// Relay URL (repeatable)
    #[arg(long = "relay", short = 'r')]
    relays: Vec<String>,

    /// Engine config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Author pubkey, hex (repeatable)
    #[arg(long = "author")]
    authors: Vec<String>,

    /// Hashtag without '#' (repeatable)
    #[arg(long = "hashtag")]
    hashtags: Vec<String>,

    /// Event kind (repeatable)
    #[arg(long = "kind", short = 'k')]
    kinds: Vec<u16>,

    /// Only events newer than this unix timestamp
    #[arg(long)]
    since: Option<u64>,

    #[arg(long, default_value_t = 50)]
    limit: u64,

    /// Seconds to wait for the first import
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    /// Keep the subscription open and print events as they arrive
    #[arg(long, short = 'f')]
    follow: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_tracing();

    let mut config = match &opts.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    config
        .relays
        .extend(opts.relays.iter().map(|url| RelayEndpoint::new(url.clone()).read_only()));
    if config.relays.is_empty() {
        anyhow::bail!("no relays given; pass --relay or a config file");
    }

    let store = Arc::new(MemoryStore::new());
    let engine = Engine::start(
        config,
        Arc::new(WsConnector),
        store.clone(),
        None,
        Some(Arc::new(IdHashVerifier)),
        None,
    )?;

    let mut descriptor = FetchDescriptor::new()
        .authors(opts.authors.clone())
        .hashtags(opts.hashtags.clone())
        .kinds(opts.kinds.clone())
        .limit(opts.limit);
    if let Some(since) = opts.since {
        descriptor = descriptor.since(since);
    }
    let filters: Vec<Filter> = descriptor
        .filters()
        .into_iter()
        .map(|mut filter| {
            filter.limit = None;
            filter
        })
        .collect();
    let mut printed = HashSet::new();

    if opts.follow {
        let mut imported = engine.subscribe_imported();
        let task = engine
            .fetch_task(descriptor)
            .timeout(Duration::from_secs(opts.timeout));
        let handle = engine.submit(task)?;
        info!("Following {}", handle.subscription_id);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                notice = imported.recv() => match notice {
                    Ok(IngestEvent::Imported(ids)) if ids.contains(&handle.subscription_id) => {
                        print_new(store.as_ref(), &filters, &mut printed)?;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Skipped {} import notices", skipped);
                        print_new(store.as_ref(), &filters, &mut printed)?;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        engine.close(&handle.subscription_id)?;
    } else {
        let task = engine
            .fetch_task(descriptor)
            .timeout(Duration::from_secs(opts.timeout));
        let outcome = engine.request(task).await?;
        match &outcome {
            TaskOutcome::Response(response) => {
                engine.close(&response.subscription_id)?;
                print_new(store.as_ref(), &filters, &mut printed)?;
            }
            TaskOutcome::TimedOut { subscription_id } => {
                engine.close(subscription_id)?;
                warn!("No relay answered within {}s", opts.timeout);
            }
        }
    }

    engine.shutdown();
    Ok(())
}

/// Print stored events matching `filters` that were not printed yet, oldest first.
fn print_new(
    store: &dyn EventStore,
    filters: &[Filter],
    printed: &mut HashSet<String>,
) -> anyhow::Result<()> {
    let mut fresh = Vec::new();
    for filter in filters {
        for stored in store.fetch(filter)? {
            if printed.insert(stored.event.id.clone()) {
                fresh.push(stored.event);
            }
        }
    }
    fresh.sort_by_key(|event| event.created_at);
    for event in fresh {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
