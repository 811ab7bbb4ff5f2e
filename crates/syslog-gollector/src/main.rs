// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io;
use std::process;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use gollector::{
    admin::AdminServer,
    broker::KafkaBroker,
    config::Config,
    constants::DEFAULT_LOG_LEVEL,
    errors::{BindError, BrokerError, ConfigError},
    message::{ParsedMessage, RawMessage},
    parser::HeaderParser,
    pipeline::Pipeline,
    producer::BatchProducer,
    queue::HandoffQueue,
    tcp::TcpServer,
    udp::UdpServer,
};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to determine hostname: {0}")]
    Hostname(#[source] io::Error),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),
}

pub fn main() {
    let started_at = Utc::now();
    let config = Config::from_env();
    let log_level = match &config {
        Ok(config) => config.log_level.as_str(),
        Err(_) => DEFAULT_LOG_LEVEL,
    };
    init_logging(log_level);

    let result = config
        .map_err(StartupError::from)
        .and_then(|config| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(num_cpus::get())
                .enable_all()
                .build()
                .map_err(StartupError::Runtime)
                .map(|runtime| (runtime, config))
        })
        .and_then(|(runtime, config)| runtime.block_on(run(config, started_at)));

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rskafka=warn,{log_level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }
    debug!("Logging subsystem enabled");
}

fn log_startup(config: &Config) -> Result<(), StartupError> {
    let hostname = hostname::get().map_err(StartupError::Hostname)?;
    info!(
        "syslog-gollector starting on {} (pid {}, {} cores)",
        hostname.to_string_lossy(),
        process::id(),
        num_cpus::get()
    );
    info!("admin server address: {}", config.admin_addr);
    info!("tcp listen address: {}", config.tcp_addr);
    info!("udp listen address: {}", config.udp_addr);
    info!("kafka brokers: {}", config.brokers.join(","));
    info!("kafka topic: {}", config.topic);
    info!("batch size: {}", config.batch_size);
    info!("max buffer time: {:?}", config.max_buffer_time);
    info!("max buffer bytes: {}", config.max_buffer_bytes);
    info!("header parsing enabled: {}", config.parse_enabled);
    info!("queue capacity: {}", config.queue_capacity);
    info!("max tcp message size: {}", config.max_message_size);
    info!("max udp datagram size: {}", config.max_datagram_size);
    info!(
        "send retries: {}, initial backoff {:?}",
        config.send_retries, config.retry_backoff
    );
    info!("wire format: {:?}", config.wire_format);
    Ok(())
}

async fn run(config: Config, started_at: DateTime<Utc>) -> Result<(), StartupError> {
    log_startup(&config)?;

    let tcp = TcpServer::bind(config.tcp_config()).await?;
    let udp = UdpServer::bind(config.udp_config()).await?;
    let broker = KafkaBroker::connect(&config.brokers, &config.topic).await?;

    let parser = HeaderParser::new(config.parser_mode());
    let producer = BatchProducer::new(config.producer_config(), Arc::new(broker));
    let pipeline = Arc::new(
        Pipeline::new(
            tcp.statistics(),
            udp.statistics(),
            parser.statistics(),
            producer.statistics(),
        )
        .with_start(started_at),
    );
    let admin = AdminServer::bind(&config.admin_addr, Arc::clone(&pipeline)).await?;

    let raw_queue: HandoffQueue<RawMessage> = HandoffQueue::new(config.queue_capacity);
    let parsed_queue: HandoffQueue<ParsedMessage> = HandoffQueue::new(config.queue_capacity);
    let listeners_cancel = CancellationToken::new();
    let admin_cancel = CancellationToken::new();

    let tcp_task = tokio::spawn(tcp.spin(raw_queue.clone(), listeners_cancel.clone()));
    let udp_task = tokio::spawn(udp.spin(raw_queue.clone(), listeners_cancel.clone()));
    let parser_task = tokio::spawn(parser.run(raw_queue.clone(), parsed_queue.clone()));
    let producer_task = tokio::spawn(producer.run(parsed_queue));
    let admin_task = tokio::spawn(admin.serve(admin_cancel.clone()));

    wait_for_shutdown_signal().await;
    info!("shutting down, draining pipeline");

    listeners_cancel.cancel();
    for (name, task) in [("tcp", tcp_task), ("udp", udp_task)] {
        if let Err(e) = task.await {
            error!("{name} listener failed: {e}");
        }
    }
    raw_queue.close();
    for (name, task) in [("parser", parser_task), ("producer", producer_task)] {
        if let Err(e) = task.await {
            error!("{name} failed: {e}");
        }
    }
    admin_cancel.cancel();
    if let Err(e) = admin_task.await {
        error!("admin server failed: {e}");
    }

    match pipeline.statistics() {
        Ok(statistics) => {
            for (component, counters) in &statistics {
                info!("final {component} statistics: {counters}");
            }
        }
        Err(e) => error!("failed to collect final statistics: {e}"),
    }
    info!("syslog-gollector stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
                return;
            }
            Err(e) => error!("failed to install SIGTERM handler: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {e}");
    }
}
