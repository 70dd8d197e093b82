//! `httpsim` is an HTTP service virtualization proxy. It sits between
//! clients and real HTTP services and either **captures** traffic (forward
//! the request upstream, persist the request/response pair) or
//! **simulates** it (answer from previously captured pairs and imported
//! response templates, never contacting the upstream).
//!
//! The pipeline for every inbound request is the same: normalize the
//! request, compute its fingerprint, look the fingerprint up in the payload
//! cache, and on a miss consult the ordered template store. In simulate
//! mode a miss on both is answered with `412 Precondition Failed`; in
//! capture mode it triggers the upstream fetch and a cache write.
//!
//! Captured payloads and templates are managed over a small JSON admin API
//! (`/api/records`, `/api/templates`) that supports export, all-or-nothing
//! import, and wiping.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, InMemoryCache};
use crate::matching::templates::TemplateStore;
use crate::server::handler::SimulationHandler;
use crate::server::server::{ProxyServer, ServerConfig};
use crate::server::upstream::{HttpUpstreamClient, UpstreamClient};

pub mod cache;
pub mod common;
pub mod matching;
pub mod server;

/// The operating mode, chosen at startup and immutable for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Forward requests upstream and persist the exchanged pairs.
    Capture,
    /// Serve exclusively from the cache and template store.
    Simulate,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capture" => Ok(Mode::Capture),
            "simulate" => Ok(Mode::Simulate),
            other => Err(format!(
                "unknown mode '{}', expected 'capture' or 'simulate'",
                other
            )),
        }
    }
}

pub struct Config {
    pub port: u16,
    pub mode: Mode,
    /// Webserver deployments are addressed directly, so the host carries no
    /// meaning and is elided from fingerprints and template matching.
    pub webserver: bool,
    /// Bind on all interfaces instead of loopback only.
    pub expose: bool,
    /// Bearer token required by the admin API; `None` leaves it open.
    pub auth_token: Option<String>,
    /// Uniform TTL for cached payloads; `None` keeps them until wiped.
    pub cache_ttl: Option<Duration>,
}

/// Builds the pipeline around an in-memory cache and runs the proxy until
/// the process is terminated.
pub async fn start_server(config: Config) -> Result<(), server::server::Error> {
    let cache: Arc<dyn Cache> = match config.cache_ttl {
        Some(ttl) => Arc::new(InMemoryCache::with_ttl(ttl)),
        None => Arc::new(InMemoryCache::new()),
    };
    let templates = Arc::new(TemplateStore::new());
    let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new());

    let handler = SimulationHandler::new(
        config.mode,
        config.webserver,
        config.auth_token,
        cache,
        templates,
        upstream,
    );

    let server = ProxyServer::new(
        Box::new(handler),
        ServerConfig {
            static_port: Some(config.port),
            expose: config.expose,
        },
    );

    server.start().await
}
