use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::tokio::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::common::data::{RequestDetails, ResponseDetails};
use crate::common::util::BodyBytes;
use crate::server::headers_from_map;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot connect to upstream {0}: {1}")]
    ConnectError(String, std::io::Error),
    #[error("cannot build upstream request: {0}")]
    RequestBuildError(#[from] http::Error),
    #[error("upstream request failed: {0}")]
    RequestError(#[from] hyper::Error),
    #[error("unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),
}

/// The capture-mode collaborator that fetches the real response for a
/// request the cache has never seen.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn fetch(&self, request: &RequestDetails) -> Result<ResponseDetails, Error>;
}

/// Speaks origin-form HTTP/1.1 to the request's destination over a fresh
/// TCP connection. TLS to the upstream is terminated outside the core, so
/// an `https` destination reaching this client is a configuration error.
pub struct HttpUpstreamClient;

impl HttpUpstreamClient {
    pub fn new() -> Self {
        HttpUpstreamClient
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        HttpUpstreamClient::new()
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn fetch(&self, request: &RequestDetails) -> Result<ResponseDetails, Error> {
        if !request.scheme.eq_ignore_ascii_case("http") {
            return Err(Error::UnsupportedScheme(request.scheme.clone()));
        }

        let address = connect_address(&request.destination);
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|err| Error::ConnectError(address.clone(), err))?;
        let io = TokioIo::new(stream);

        let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await?;

        tokio::task::spawn(async move {
            if let Err(err) = connection.await {
                log::warn!("upstream connection failed: {:?}", err);
            }
        });

        let mut builder = http::Request::builder()
            .method(request.method.as_str())
            .uri(origin_form(request));

        let mut has_host = false;
        for (name, values) in &request.headers {
            if name.eq_ignore_ascii_case("host") {
                has_host = true;
            }
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if !has_host {
            builder = builder.header("Host", request.destination.as_str());
        }

        let upstream_request = builder.body(Full::new(request.body.to_bytes()))?;

        log::debug!(
            "forwarding request upstream, destination={}, path={}, method={}",
            request.destination,
            request.path,
            request.method
        );

        let response = sender.send_request(upstream_request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();

        Ok(ResponseDetails {
            status: parts.status.as_u16(),
            body: BodyBytes::from(body),
            headers: headers_from_map(&parts.headers),
        })
    }
}

/// The destination keeps a non-default port if the client sent one;
/// otherwise connect on port 80.
fn connect_address(destination: &str) -> String {
    if destination.contains(':') {
        destination.to_string()
    } else {
        format!("{}:80", destination)
    }
}

fn origin_form(request: &RequestDetails) -> String {
    if request.query.is_empty() {
        request.path.clone()
    } else {
        format!("{}?{}", request.path, request.query)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::Headers;

    fn request(path: &str, query: &str) -> RequestDetails {
        RequestDetails {
            path: path.to_string(),
            method: "GET".to_string(),
            destination: "example.com".to_string(),
            scheme: "http".to_string(),
            query: query.to_string(),
            body: BodyBytes::default(),
            headers: Headers::new(),
        }
    }

    #[test]
    fn origin_form_includes_query_when_present() {
        assert_eq!(origin_form(&request("/ping", "")), "/ping");
        assert_eq!(origin_form(&request("/ping", "a=1&b=2")), "/ping?a=1&b=2");
    }

    #[test]
    fn connect_address_defaults_to_port_80() {
        assert_eq!(connect_address("example.com"), "example.com:80");
        assert_eq!(connect_address("example.com:8080"), "example.com:8080");
    }

    #[tokio::test]
    async fn https_destinations_are_rejected() {
        let mut https_request = request("/", "");
        https_request.scheme = "https".to_string();

        let result = HttpUpstreamClient::new().fetch(&https_request).await;

        assert!(matches!(result, Err(Error::UnsupportedScheme(_))));
    }
}
