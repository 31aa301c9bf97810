use clap::Parser;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// API listen address
    #[arg(
        env = "MERIDIAN_LISTEN_ADDRESS",
        long = "listen-address",
        value_name = "addr",
        default_value = "0.0.0.0:1337"
    )]
    pub listen_address: SocketAddr,

    /// JSON file with the initial store contents
    #[arg(env = "MERIDIAN_SEED", long = "seed", value_name = "path")]
    pub seed: Option<PathBuf>,

    /// Minimum interval between two metrics writes of a device in milliseconds
    #[arg(
        env = "MERIDIAN_METRICS_INTERVAL_MS",
        long = "metrics-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "300000"
    )]
    pub metrics_interval: Duration,

    /// How long API key lookups are cached in milliseconds
    #[arg(
        env = "MERIDIAN_API_KEY_CACHE_TTL_MS",
        long = "api-key-cache-ttl-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "60000"
    )]
    pub api_key_cache_ttl: Duration,

    /// Cache namespace version. Changing it discards previously cached entries
    #[arg(
        env = "MERIDIAN_CACHE_VERSION",
        long = "cache-version",
        value_name = "str",
        default_value = env!("CARGO_PKG_VERSION")
    )]
    pub cache_version: String,

    /// Take client addresses from the X-Forwarded-For header
    #[arg(env = "MERIDIAN_TRUST_PROXY", long = "trust-proxy")]
    pub trust_proxy: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
