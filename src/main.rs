use clap::Parser;

/// Entry point for the kadvisor sidecar.
///
/// Watches labeled containers on the local Docker host, injects a
/// node-exporter agent into each and serves their merged metrics on a
/// single Prometheus endpoint.
///
/// # Errors
///
/// Returns an error if startup fails (e.g., an unreachable Docker
/// socket or an already-bound listen port).
///
/// # Examples
///
/// ```bash
/// kadvisor --agent /opt/node_exporter --label kadvisor --port 1234
/// ```
#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = kadvisor::Config::parse();
    kadvisor::run(config).await
}
