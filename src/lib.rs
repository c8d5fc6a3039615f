//! kadvisor: aggregated node-exporter metrics for labeled containers
//! on a Docker host.
//!
//! The pieces fit together like this: the [`registry`] watches the
//! runtime's event stream for containers carrying the marker label,
//! the [`agent`] manager injects and supervises an exporter binary in
//! each of them, and the [`server`] answers every scrape by fanning
//! out to all agents through the [`pipeline`] and merging their
//! payloads into one exposition document.

use std::sync::Arc;

pub mod agent;
pub mod config;
pub mod docker;
pub mod error;
pub mod exposition;
pub mod pipeline;
pub mod registry;
pub mod server;

pub use config::Config;

/// Wires up and runs the whole sidecar until interrupted.
///
/// # Errors
///
/// Fails on startup when the Docker endpoint is unusable, the initial
/// container listing or event subscription cannot be established, or
/// the listen address cannot be bound. Per-container failures after
/// startup are logged and isolated instead.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime: Arc<dyn docker::ContainerRuntime> =
        Arc::new(docker::DockerClient::from_uri(&config.docker_uri)?);

    let registry = Arc::new(
        registry::WatchedContainerRegistry::start(
            Arc::clone(&runtime),
            &config.label,
            config.runtime.clone(),
            config.network.clone(),
        )
        .await?,
    );

    let manager = Arc::new(agent::AgentManager::new(
        Arc::clone(&runtime),
        config.agent.clone(),
        &config.params,
    ));
    let subscription = registry.subscribe().await;
    Arc::clone(&manager).run(subscription);

    let aggregator = Arc::new(pipeline::MetricsAggregator::new(
        Arc::clone(&registry) as Arc<dyn pipeline::EndpointSource>
    ));
    let addr = config.listen_addr();
    log::info!("serving aggregated metrics on {addr}");
    let mut server_task = tokio::spawn(server::MetricsServer::new(aggregator).listen(addr));

    tokio::select! {
        result = &mut server_task => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, shutting down");
            registry.stop();
            manager.stop().await;
            server_task.abort();
        }
    }

    Ok(())
}
