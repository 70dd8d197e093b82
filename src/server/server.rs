use std::future::{pending, Future};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::FutureExt;
use http::{Request, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::Method;
use hyper_util::rt::tokio::TokioIo;
use hyper_util::rt::TokioExecutor;
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot::Sender;
use tokio::task::spawn;

use crate::server::handler::Handler;
use crate::server::server::Error::{
    BufferError, HandlerError, LocalSocketAddrError, PublishSocketAddrError, SocketBindError,
};
use crate::server::RequestMetadata;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot bind to socket addr {0}: {1}")]
    SocketBindError(SocketAddr, std::io::Error),
    #[error("cannot parse socket address: {0}")]
    SocketAddrParseError(#[from] std::net::AddrParseError),
    #[error("cannot obtain local socket address: {0}")]
    LocalSocketAddrError(std::io::Error),
    #[error("cannot send reserved TCP address to caller {0}")]
    PublishSocketAddrError(SocketAddr),
    #[error("buffering error: {0}")]
    BufferError(hyper::Error),
    #[error("HTTP error: {0}")]
    HTTPError(#[from] http::Error),
    #[error("cannot process request: {0}")]
    HandlerError(#[from] super::handler::Error),
    #[error("cannot normalize request URI: {0}")]
    UriNormalizationError(String),
    #[error("server connection error: {0}")]
    ServerConnectionError(Box<dyn std::error::Error + Send + Sync>),
}

pub struct ServerConfig {
    /// Fixed port, or `None` to let the OS pick a free one.
    pub static_port: Option<u16>,
    /// Bind on all interfaces instead of loopback only.
    pub expose: bool,
}

/// The accept loop: owns the listener and drives every connection through
/// the configured [`Handler`].
pub struct ProxyServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    handler: Box<H>,
    config: ServerConfig,
}

impl<H> ProxyServer<H>
where
    H: Handler + Send + Sync + 'static,
{
    pub fn new(handler: Box<H>, config: ServerConfig) -> Self {
        ProxyServer { handler, config }
    }

    /// Runs the server until the process is terminated.
    pub async fn start(self) -> Result<(), Error> {
        self.start_with_signals(None, pending()).await
    }

    /// Runs the server, optionally publishing the bound address (useful when
    /// the port is OS-assigned) and shutting down when `shutdown` resolves.
    pub async fn start_with_signals<F>(
        self,
        socket_addr_sender: Option<Sender<SocketAddr>>,
        shutdown: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let host = if self.config.expose {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        let addr: SocketAddr =
            format!("{}:{}", host, self.config.static_port.unwrap_or(0)).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| SocketBindError(addr, err))?;

        if let Some(sender) = socket_addr_sender {
            let addr = listener.local_addr().map_err(LocalSocketAddrError)?;
            sender.send(addr).map_err(PublishSocketAddrError)?;
        }

        log::info!("listening on {}", addr);
        self.run_accept_loop(listener, shutdown).await
    }

    async fn run_accept_loop<F>(self, listener: TcpListener, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let shutdown = shutdown.shared();
        let server = Arc::new(self);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp_stream, remote_address)) => {
                            log::trace!("new TCP connection from {}", remote_address);
                            let server = server.clone();
                            spawn(async move {
                                if let Err(err) = serve_connection(server, tcp_stream).await {
                                    log::error!("{:?}", err);
                                }
                            });
                        },
                        Err(err) => {
                            log::error!("TCP accept error: {:?}", err);
                        },
                    };
                }
                _ = shutdown.clone() => {
                    break;
                }
            }
        }

        Ok(())
    }

    async fn service(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<hyper::Response<BoxBody<Bytes, hyper::Error>>, Error> {
        log::trace!("new HTTP request received: {}", req.uri());

        if req.method() == Method::CONNECT {
            // TLS interception happens in front of this core; a CONNECT
            // arriving here has nowhere to tunnel to.
            log::warn!("rejecting CONNECT request for {:?}", req.uri());
            return Ok(hyper::Response::builder()
                .status(StatusCode::NOT_IMPLEMENTED)
                .body(boxed_body(Bytes::new()))?);
        }

        // Bodies are read fully before any matching happens.
        let (head, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, BufferError(err));
            }
        };

        // Fold origin-form requests into absolute-form so the handler can
        // always read scheme and destination from the URI. Proxy-addressed
        // clients send absolute-form already.
        let req = match into_absolute_form(Request::from_parts(head, body)) {
            Ok(req) => req,
            Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
        };

        match self.handler.handle(req).await {
            Ok(response) => Ok(response.map(boxed_body)),
            Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, HandlerError(err)),
        }
    }
}

async fn serve_connection<H>(server: Arc<ProxyServer<H>>, stream: TcpStream) -> Result<(), Error>
where
    H: Handler + Send + Sync + 'static,
{
    let mut server_builder = ServerBuilder::new(TokioExecutor::new());
    server_builder.http1().preserve_header_case(true);

    server_builder
        .serve_connection(
            TokioIo::new(stream),
            service_fn(|mut req| {
                req.extensions_mut().insert(RequestMetadata::new("http"));
                server.clone().service(req)
            }),
        )
        .await
        .map_err(Error::ServerConnectionError)
}

/// Requests addressed to the proxy itself arrive in origin-form with a Host
/// header; rebuild a full URI from it so the rest of the pipeline has one
/// place to read scheme and destination from.
fn into_absolute_form(req: Request<Bytes>) -> Result<Request<Bytes>, Error> {
    if req.uri().scheme().is_some() && req.uri().authority().is_some() {
        return Ok(req);
    }

    let scheme = req
        .extensions()
        .get::<RequestMetadata>()
        .map_or("http", |metadata| metadata.scheme);

    let Some(authority) = req
        .headers()
        .get(http::header::HOST)
        .and_then(|host| host.to_str().ok())
    else {
        return Err(Error::UriNormalizationError(
            "origin-form request without a Host header".to_string(),
        ));
    };

    let uri = http::Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(req.uri().path_and_query().map_or("/", |pq| pq.as_str()))
        .build()
        .map_err(|err| Error::UriNormalizationError(err.to_string()))?;

    let (mut head, body) = req.into_parts();
    head.uri = uri;
    Ok(Request::from_parts(head, body))
}

fn boxed_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn error_response(
    code: StatusCode,
    err: Error,
) -> Result<hyper::Response<BoxBody<Bytes, hyper::Error>>, Error> {
    log::error!("failed to process request: {}", err);
    Ok(hyper::Response::builder()
        .status(code)
        .body(boxed_body(Bytes::from(err.to_string())))?)
}
