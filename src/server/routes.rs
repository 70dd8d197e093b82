use bytes::Bytes;
use http::{Request, Response, StatusCode};
use serde::Serialize;

use crate::cache::Cache;
use crate::common::data::{Payload, RecordsView};
use crate::matching::fingerprint;
use crate::matching::templates::{TemplateStore, TemplatesView};
use crate::server::handler::Error;

pub(crate) const RECORDS_PATH: &str = "/api/records";
pub(crate) const TEMPLATES_PATH: &str = "/api/templates";

#[derive(Serialize, Debug)]
struct ErrorResponse {
    message: String,
}

impl ErrorResponse {
    fn new<T: ToString>(message: &T) -> Self {
        ErrorResponse {
            message: message.to_string(),
        }
    }
}

#[derive(Serialize, Debug)]
struct MessageResponse {
    message: String,
}

/// When a bearer token is configured, every admin request has to present it
/// before any core operation runs. Without a configured token the admin
/// surface is open.
pub(crate) fn authorized(auth_token: Option<&str>, req: &Request<Bytes>) -> bool {
    let Some(expected) = auth_token else {
        return true;
    };

    req.headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

pub(crate) fn unauthorized() -> Result<Response<Bytes>, Error> {
    create_json_response(
        StatusCode::UNAUTHORIZED,
        &ErrorResponse::new(&"Authentication required"),
    )
}

pub(crate) fn method_not_allowed() -> Result<Response<Bytes>, Error> {
    create_response(StatusCode::METHOD_NOT_ALLOWED, Bytes::new())
}

/// Exports every cached payload. A payload that no longer decodes is a
/// corruption signal, so the export fails as a whole instead of silently
/// dropping entries.
pub(crate) async fn records_get(cache: &dyn Cache) -> Result<Response<Bytes>, Error> {
    let entries = match cache.iterate().await {
        Ok(entries) => entries,
        Err(err) => {
            return create_json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorResponse::new(&err),
            )
        }
    };

    let mut data = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match Payload::decode(&value) {
            Ok(payload) => data.push(payload.to_view()),
            Err(err) => {
                log::error!(
                    "failed to decode payload during export, key={}, error={}",
                    String::from_utf8_lossy(&key),
                    err
                );
                return create_json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ErrorResponse::new(&err),
                );
            }
        }
    }

    create_json_response(StatusCode::OK, &RecordsView { data })
}

/// Imports payloads: every view is converted before anything is written, so
/// a malformed entry rejects the whole request.
pub(crate) async fn records_post(
    cache: &dyn Cache,
    webserver: bool,
    body: &Bytes,
) -> Result<Response<Bytes>, Error> {
    let records: RecordsView = match serde_json::from_slice(body) {
        Ok(records) => records,
        Err(err) => {
            return create_json_response(StatusCode::BAD_REQUEST, &ErrorResponse::new(&err))
        }
    };

    if records.data.is_empty() {
        return create_json_response(
            StatusCode::BAD_REQUEST,
            &ErrorResponse::new(&"Bad request. Nothing to import!"),
        );
    }

    let mut payloads = Vec::with_capacity(records.data.len());
    for view in records.data {
        match Payload::from_view(view) {
            Ok(payload) => payloads.push(payload),
            Err(err) => {
                return create_json_response(StatusCode::BAD_REQUEST, &ErrorResponse::new(&err))
            }
        }
    }

    let total = payloads.len();
    for payload in payloads {
        let key = fingerprint(&payload.request, webserver);
        let bytes = match payload.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                return create_json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ErrorResponse::new(&err),
                )
            }
        };
        if let Err(err) = cache.set(key.as_bytes(), &bytes).await {
            return create_json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ErrorResponse::new(&err),
            );
        }
    }

    log::info!("payloads imported, total={}", total);

    create_json_response(
        StatusCode::OK,
        &MessageResponse {
            message: format!("{} payloads import complete.", total),
        },
    )
}

pub(crate) async fn records_delete(cache: &dyn Cache) -> Result<Response<Bytes>, Error> {
    if let Err(err) = cache.wipe().await {
        return create_json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ErrorResponse::new(&err),
        );
    }

    create_json_response(
        StatusCode::OK,
        &MessageResponse {
            message: "Proxy cache deleted successfully".to_string(),
        },
    )
}

pub(crate) fn templates_get(store: &TemplateStore) -> Result<Response<Bytes>, Error> {
    create_json_response(StatusCode::OK, &store.export())
}

pub(crate) fn templates_post(
    store: &TemplateStore,
    body: &Bytes,
) -> Result<Response<Bytes>, Error> {
    let templates: TemplatesView = match serde_json::from_slice(body) {
        Ok(templates) => templates,
        Err(err) => {
            return create_json_response(StatusCode::BAD_REQUEST, &ErrorResponse::new(&err))
        }
    };

    match store.import(templates.data) {
        Ok(count) => create_json_response(
            StatusCode::OK,
            &MessageResponse {
                message: format!("{} templates import complete.", count),
            },
        ),
        Err(err) => create_json_response(StatusCode::BAD_REQUEST, &ErrorResponse::new(&err)),
    }
}

pub(crate) fn templates_delete(store: &TemplateStore) -> Result<Response<Bytes>, Error> {
    store.wipe();

    create_json_response(
        StatusCode::OK,
        &MessageResponse {
            message: "Template store deleted successfully".to_string(),
        },
    )
}

fn create_json_response<T: Serialize>(
    status: StatusCode,
    body: &T,
) -> Result<Response<Bytes>, Error> {
    let body = serde_json::to_vec(body)?;

    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Bytes::from(body))?)
}

fn create_response(status: StatusCode, body: Bytes) -> Result<Response<Bytes>, Error> {
    Ok(Response::builder().status(status).body(body)?)
}
