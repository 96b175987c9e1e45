use std::{
    process,
    sync::{Arc, OnceLock},
};

use clusterscope::{
    backend::procfs::ProcfsClient,
    config::Config,
    core::{
        bridge::StreamBridge, error::BridgeError, error::StreamError, fanout::FanoutCollector,
        retry::RetryingClient,
    },
    logger::LoggerManager,
    print_error, report,
    stream::{
        distribution::{Distribution, DistributionSink},
        dump::CollectionDumpSource,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Client = RetryingClient<ProcfsClient>;

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Entities,
    Distribution,
}

impl Command {
    fn from_args() -> Option<Self> {
        match std::env::args().nth(1).as_deref() {
            None | Some("entities") => Some(Command::Entities),
            Some("distribution") => Some(Command::Distribution),
            Some(_) => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(command) = Command::from_args() else {
        print_error!("Usage: clusterscope [entities|distribution]");
        process::exit(1);
    };

    let cfg = config();
    let logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting clusterscope version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.collector);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, initiating graceful shutdown...");
                cancel.cancel();
            }
        });
    }

    let client = Arc::new(RetryingClient::from_config(
        ProcfsClient::new(),
        &cfg.collector,
    ));
    let collector = FanoutCollector::from_config(client, &cfg.collector)
        .unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        })
        .with_cancellation(cancel.clone());

    match command {
        Command::Entities => run_entities(cfg, &collector).await,
        Command::Distribution => run_distribution(cfg, collector, cancel).await,
    }
    Ok(())
}

async fn run_entities(cfg: &Config, collector: &FanoutCollector<Client>) {
    let mut collection = collector.collect_all().await.unwrap_or_else(|e| {
        error!("{}", e);
        process::exit(1);
    });
    collection.sort_by_handle();

    if cfg.collector.raw {
        match report::render_json(&collection) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to encode report: {}", e);
                process::exit(1);
            }
        }
    } else {
        print!("{}", report::render_processes(&collection));
    }
}

async fn run_distribution(
    cfg: &Config,
    collector: FanoutCollector<Client>,
    cancel: CancellationToken,
) {
    let bridge = StreamBridge::from_config(&cfg.distribution)
        .unwrap_or_else(|e| {
            error!("{}", e);
            process::exit(1);
        })
        .with_cancellation(cancel.clone());
    let group_by = &cfg.distribution.group_by;

    let Some(rate) = cfg.distribution.rate() else {
        match distribution_once(&bridge, collector, group_by).await {
            Ok(distribution) => print!("{}", report::render_distribution(&distribution)),
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        }
        return;
    };

    info!("Polling every {}s", rate.as_secs());
    let term = console::Term::stdout();
    let mut ticker = tokio::time::interval(rate);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match distribution_once(&bridge, collector.clone(), group_by).await {
            Ok(distribution) => {
                if let Err(e) = term.clear_screen() {
                    debug!("Failed to clear terminal: {}", e);
                }
                print!("{}", report::render_distribution(&distribution));
            }
            Err(BridgeError::Cancelled) => break,
            Err(e) => warn!("Distribution run failed: {}", e),
        }
    }
    info!("Shutdown complete");
}

async fn distribution_once(
    bridge: &StreamBridge,
    collector: FanoutCollector<Client>,
    group_by: &str,
) -> Result<Distribution, BridgeError> {
    let (sink, done) = DistributionSink::new(group_by);
    bridge
        .bridge(CollectionDumpSource::new(collector), sink)
        .await
        .into_result()?;
    done.await.map_err(|_| {
        BridgeError::Sink(StreamError::Other(
            "distribution was not delivered".to_string(),
        ))
    })
}
