//! Command line configuration.

use std::path::PathBuf;

use clap::Parser;

/// Watches labeled containers on a Docker host, injects a
/// node-exporter agent into each and serves their merged metrics on a
/// single endpoint.
#[derive(Debug, Parser)]
#[command(name = "kadvisor", version)]
pub struct Config {
    /// Docker daemon endpoint.
    #[arg(long = "docker", default_value = "unix:///var/run/docker.sock")]
    pub docker_uri: String,

    /// Only watch containers launched with this OCI runtime.
    #[arg(long = "runtime")]
    pub runtime: Option<String>,

    /// Marker label a container must carry to be watched.
    #[arg(long = "label", default_value = "kadvisor")]
    pub label: String,

    /// Network to scrape containers over. Without it the attached
    /// network with the lexicographically smallest name is used.
    #[arg(long = "network")]
    pub network: Option<String>,

    /// Port the aggregated metrics endpoint listens on.
    #[arg(long = "port", default_value_t = 1234)]
    pub port: u16,

    /// Path to the statically linked agent binary injected into each
    /// container.
    #[arg(long = "agent")]
    pub agent: PathBuf,

    /// Extra arguments passed to the injected agent, as one
    /// whitespace-separated string.
    #[arg(long = "params", default_value = "")]
    pub params: String,

    /// Bind dual-stack instead of IPv4 only.
    #[arg(long = "ipv6")]
    pub ipv6: bool,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        if self.ipv6 {
            format!("[::]:{}", self.port)
        } else {
            format!("0.0.0.0:{}", self.port)
        }
    }
}
