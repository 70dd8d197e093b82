use std::sync::Arc;

use thiserror::Error;

use crate::cache::{self, Cache};
use crate::common::data::{Payload, RequestDetails};
use crate::matching::templates::TemplateStore;

pub mod fingerprint;
pub mod templates;

pub use fingerprint::fingerprint;

pub const NO_MATCH_DESCRIPTION: &str =
    "Could not find recorded request, please record it first!";

/// The terminal error of the matching pipeline, carrying the HTTP status the
/// client observes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description}")]
pub struct MatchingError {
    pub status_code: u16,
    pub description: String,
}

impl MatchingError {
    pub fn no_match() -> Self {
        MatchingError {
            status_code: 412,
            description: NO_MATCH_DESCRIPTION.to_string(),
        }
    }

    pub fn decode_failure() -> Self {
        MatchingError {
            status_code: 500,
            description: "Failed to decode payload".to_string(),
        }
    }

    pub fn backend_failure() -> Self {
        MatchingError {
            status_code: 500,
            description: "Cache backend failure".to_string(),
        }
    }

    pub fn capture_failure() -> Self {
        MatchingError {
            status_code: 500,
            description: "Failed to store captured payload".to_string(),
        }
    }
}

/// Resolves inbound requests against the payload cache and, on miss, the
/// template store. This is the lookup half of the pipeline; writing captured
/// payloads back goes through [`RequestMatcher::save_payload`].
pub struct RequestMatcher {
    cache: Arc<dyn Cache>,
    templates: Arc<TemplateStore>,
    webserver: bool,
}

impl RequestMatcher {
    pub fn new(cache: Arc<dyn Cache>, templates: Arc<TemplateStore>, webserver: bool) -> Self {
        RequestMatcher {
            cache,
            templates,
            webserver,
        }
    }

    /// Looks the request up in the cache only. `Ok(None)` is a genuine
    /// miss; a decode failure on a retrieved value is surfaced as an error
    /// and never reported as a miss, since that would mask data corruption.
    pub async fn get_cached_payload(
        &self,
        request: &RequestDetails,
    ) -> Result<Option<Payload>, MatchingError> {
        let key = fingerprint(request, self.webserver);

        match self.cache.get(key.as_bytes()).await {
            Ok(bytes) => match Payload::decode(&bytes) {
                Ok(payload) => {
                    log::info!(
                        "payload found in cache, key={}, path={}, method={}, destination={}, status={}",
                        key,
                        request.path,
                        request.method,
                        request.destination,
                        payload.response.status
                    );
                    Ok(Some(payload))
                }
                Err(err) => {
                    log::error!(
                        "failed to decode payload, key={}, error={}, value={}",
                        key,
                        err,
                        String::from_utf8_lossy(&bytes)
                    );
                    Err(MatchingError::decode_failure())
                }
            },
            Err(cache::Error::NotFound) => Ok(None),
            Err(err) => {
                log::error!("failed to read from cache, key={}, error={}", key, err);
                Err(MatchingError::backend_failure())
            }
        }
    }

    /// The full simulate-mode lookup: the cache is consulted exactly once,
    /// and only a genuine miss falls through to the template store. Missing
    /// both yields the distinguished no-match error.
    pub async fn get_payload(&self, request: &RequestDetails) -> Result<Payload, MatchingError> {
        if let Some(payload) = self.get_cached_payload(request).await? {
            return Ok(payload);
        }

        match self.templates.find_response(request, self.webserver) {
            Some(response) => {
                log::info!(
                    "found matching request template, path={}, method={}, destination={}",
                    request.path,
                    request.method,
                    request.destination
                );
                Ok(Payload {
                    request: request.clone(),
                    response,
                })
            }
            None => {
                log::warn!(
                    "no recorded request or template matched, path={}, query={}, method={}, destination={}",
                    request.path,
                    request.query,
                    request.method,
                    request.destination
                );
                Err(MatchingError::no_match())
            }
        }
    }

    /// Serializes a captured payload and stores it under the fingerprint of
    /// its request, host included or elided per the deployment mode.
    pub async fn save_payload(&self, payload: &Payload) -> Result<(), MatchingError> {
        let key = if self.webserver {
            payload.id_without_host()
        } else {
            payload.id()
        };

        log::debug!(
            "capturing payload, path={}, query={}, method={}, destination={}, body_len={}, key={}",
            payload.request.path,
            payload.request.query,
            payload.request.method,
            payload.request.destination,
            payload.request.body.len(),
            key
        );

        let bytes = payload.encode().map_err(|err| {
            log::error!("failed to encode captured payload, key={}, error={}", key, err);
            MatchingError::capture_failure()
        })?;

        self.cache.set(key.as_bytes(), &bytes).await.map_err(|err| {
            log::error!("failed to write captured payload, key={}, error={}", key, err);
            MatchingError::capture_failure()
        })
    }
}
