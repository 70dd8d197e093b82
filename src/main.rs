use std::time::Duration;

use httpsim::{start_server, Config, Mode};
use structopt::StructOpt;

/// Holds command line parameters provided by the user.
#[derive(StructOpt, Debug)]
pub struct CommandLineParameters {
    #[structopt(short, long, default_value = "8500")]
    pub port: u16,

    /// Operating mode: 'capture' or 'simulate'.
    #[structopt(short, long, default_value = "simulate")]
    pub mode: Mode,

    /// Address the proxy directly instead of through proxy settings; the
    /// request host is ignored when matching.
    #[structopt(long)]
    pub webserver: bool,

    /// Bind on all interfaces instead of loopback only.
    #[structopt(long)]
    pub expose: bool,

    /// Bearer token required by the admin API.
    #[structopt(long)]
    pub auth_token: Option<String>,

    /// Evict cached payloads after this many seconds.
    #[structopt(long)]
    pub cache_ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() {
    let params: CommandLineParameters = CommandLineParameters::from_args();
    env_logger::init();

    let config = Config {
        port: params.port,
        mode: params.mode,
        webserver: params.webserver,
        expose: params.expose,
        auth_token: params.auth_token,
        cache_ttl: params.cache_ttl_secs.map(Duration::from_secs),
    };

    if let Err(err) = start_server(config).await {
        log::error!("server error: {}", err);
        std::process::exit(1);
    }
}
