use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use thiserror::Error;

use crate::cache::Cache;
use crate::common::data::{Payload, RequestDetails, ResponseDetails};
use crate::common::util::BodyBytes;
use crate::matching::templates::TemplateStore;
use crate::matching::{MatchingError, RequestMatcher};
use crate::server::routes::{self, RECORDS_PATH, TEMPLATES_PATH};
use crate::server::upstream::UpstreamClient;
use crate::server::{headers_from_map, normalize_destination, RequestMetadata};
use crate::Mode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot build response: {0}")]
    ResponseBuildError(#[from] http::Error),
    #[error("cannot convert request: {0}")]
    RequestConversionError(String),
    #[error("cannot serialize body: {0}")]
    JSONConversionError(#[from] serde_json::Error),
}

/// Processes one fully buffered request into one response. Implementations
/// are shared across connections, so they must be internally synchronized.
#[async_trait]
pub trait Handler {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error>;
}

/// The per-request pipeline: fingerprint, cache lookup, template lookup,
/// and in capture mode the upstream fetch and write-back. Also serves the
/// admin API under `/api`.
pub struct SimulationHandler {
    mode: Mode,
    webserver: bool,
    auth_token: Option<String>,
    matcher: RequestMatcher,
    cache: Arc<dyn Cache>,
    templates: Arc<TemplateStore>,
    upstream: Arc<dyn UpstreamClient>,
}

impl SimulationHandler {
    pub fn new(
        mode: Mode,
        webserver: bool,
        auth_token: Option<String>,
        cache: Arc<dyn Cache>,
        templates: Arc<TemplateStore>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        SimulationHandler {
            mode,
            webserver,
            auth_token,
            matcher: RequestMatcher::new(cache.clone(), templates.clone(), webserver),
            cache,
            templates,
            upstream,
        }
    }

    async fn handle_admin(&self, req: &Request<Bytes>) -> Result<Response<Bytes>, Error> {
        if !routes::authorized(self.auth_token.as_deref(), req) {
            return routes::unauthorized();
        }

        match (req.method(), req.uri().path()) {
            (&Method::GET, RECORDS_PATH) => routes::records_get(self.cache.as_ref()).await,
            (&Method::POST, RECORDS_PATH) => {
                routes::records_post(self.cache.as_ref(), self.webserver, req.body()).await
            }
            (&Method::DELETE, RECORDS_PATH) => routes::records_delete(self.cache.as_ref()).await,
            (&Method::GET, TEMPLATES_PATH) => routes::templates_get(&self.templates),
            (&Method::POST, TEMPLATES_PATH) => {
                routes::templates_post(&self.templates, req.body())
            }
            (&Method::DELETE, TEMPLATES_PATH) => routes::templates_delete(&self.templates),
            _ => routes::method_not_allowed(),
        }
    }

    async fn handle_proxy(&self, req: &Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let details = request_details_from(req)?;

        match self.mode {
            // Serve exclusively from the cache and template store.
            Mode::Simulate => match self.matcher.get_payload(&details).await {
                Ok(payload) => response_from_details(&payload.response),
                Err(err) => matching_error_response(&err),
            },
            // A cache miss goes straight upstream; templates are a
            // simulate-mode concern.
            Mode::Capture => match self.matcher.get_cached_payload(&details).await {
                Ok(Some(payload)) => response_from_details(&payload.response),
                Ok(None) => self.capture(details).await,
                Err(err) => matching_error_response(&err),
            },
        }
    }

    /// Capture-mode miss path: fetch the real response, persist the pair
    /// under the request fingerprint, then return the response. Upstream
    /// failures are 502 and nothing is cached.
    async fn capture(&self, request: RequestDetails) -> Result<Response<Bytes>, Error> {
        let response = match self.upstream.fetch(&request).await {
            Ok(response) => response,
            Err(err) => {
                log::error!(
                    "upstream fetch failed, destination={}, path={}, method={}, error={}",
                    request.destination,
                    request.path,
                    request.method,
                    err
                );
                return Ok(Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Bytes::from("Upstream fetch failed"))?);
            }
        };

        let payload = Payload { request, response };

        if let Err(err) = self.matcher.save_payload(&payload).await {
            return matching_error_response(&err);
        }

        response_from_details(&payload.response)
    }
}

#[async_trait]
impl Handler for SimulationHandler {
    async fn handle(&self, req: Request<Bytes>) -> Result<Response<Bytes>, Error> {
        let path = req.uri().path();
        if path == RECORDS_PATH || path == TEMPLATES_PATH {
            return self.handle_admin(&req).await;
        }

        self.handle_proxy(&req).await
    }
}

/// Normalizes a buffered request into the stored representation. The URI
/// must be in absolute form; the accept loop rewrites origin-form requests
/// before they get here.
fn request_details_from(req: &Request<Bytes>) -> Result<RequestDetails, Error> {
    let uri = req.uri();

    let scheme = uri
        .scheme_str()
        .map(|scheme| scheme.to_string())
        .or_else(|| {
            req.extensions()
                .get::<RequestMetadata>()
                .map(|metadata| metadata.scheme.to_string())
        })
        .unwrap_or_else(|| "http".to_string());

    let host = uri.host().ok_or_else(|| {
        Error::RequestConversionError(format!("request URI has no host: {}", uri))
    })?;
    let destination = normalize_destination(host, uri.port_u16(), &scheme);

    Ok(RequestDetails {
        path: uri.path().to_string(),
        method: req.method().as_str().to_string(),
        destination,
        scheme,
        query: uri.query().unwrap_or("").to_string(),
        body: BodyBytes::from(req.body().clone()),
        headers: headers_from_map(req.headers()),
    })
}

fn response_from_details(details: &ResponseDetails) -> Result<Response<Bytes>, Error> {
    let status = StatusCode::from_u16(details.status).map_err(http::Error::from)?;
    let mut builder = Response::builder().status(status);

    for (name, values) in &details.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    Ok(builder.body(details.body.to_bytes())?)
}

fn matching_error_response(err: &MatchingError) -> Result<Response<Bytes>, Error> {
    let status = StatusCode::from_u16(err.status_code).map_err(http::Error::from)?;

    Ok(Response::builder()
        .status(status)
        .body(Bytes::from(err.description.clone()))?)
}
