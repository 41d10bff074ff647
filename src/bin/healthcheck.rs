use clap::Parser;
use decypharr::config::{self, get_config};
use decypharr::helpers::get_user_agent;
use std::path::PathBuf;
use std::time::Duration;

/// `healthcheck --config <dir> [--basic] [--debug]` (§6 CLI). Probes the
/// process's own HTTP surface the way a container orchestrator would,
/// exiting 0 iff every probe is healthy.
#[derive(Parser, Debug)]
#[command(name = "healthcheck")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip the per-debrid WebDAV `PROPFIND` probes.
    #[arg(long)]
    basic: bool,
    #[arg(long)]
    debug: bool,
}

async fn probe(client: &reqwest::Client, method: reqwest::Method, url: &str, ok_statuses: &[u16]) -> bool {
    match client.request(method, url).timeout(Duration::from_secs(5)).send().await {
        Ok(response) => {
            let ok = ok_statuses.contains(&response.status().as_u16());
            if !ok {
                tracing::warn!(url, status = %response.status(), "healthcheck probe unhealthy");
            }
            ok
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "healthcheck probe failed");
            false
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(level)).init();

    if let Err(e) = config::load_config(cli.config) {
        tracing::error!(error = %e, "healthcheck: failed to load config");
        std::process::exit(1);
    }
    let cfg = get_config();

    let port = std::env::var("QBIT_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8282);
    let base = format!("http://127.0.0.1:{}", port);

    let client = reqwest::Client::builder().user_agent(get_user_agent()).build().expect("failed to build healthcheck http client");

    let mut healthy = true;
    healthy &= probe(&client, reqwest::Method::GET, &format!("{}/api/v2/app/version", base), &[200]).await;
    healthy &= probe(&client, reqwest::Method::GET, &format!("{}/", base), &[200]).await;

    if !cli.basic {
        for debrid in cfg.debrids.iter().filter(|d| d.use_webdav) {
            let url = format!("{}/webdav/{}", base, debrid.name);
            let propfind = reqwest::Method::from_bytes(b"PROPFIND").expect("PROPFIND is a valid HTTP method token");
            healthy &= probe(&client, propfind, &url, &[200, 207]).await;
        }
    }

    if healthy {
        tracing::info!("healthcheck: all probes healthy");
        std::process::exit(0);
    }
    std::process::exit(1);
}
