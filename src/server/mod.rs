use crate::common::data::Headers;
use crate::common::util::canonical_header_name;

pub mod handler;
pub mod routes;
pub mod server;
pub mod upstream;

/// Connection-level facts the accept loop attaches to every request before
/// it reaches a handler.
#[derive(Clone, Debug)]
pub struct RequestMetadata {
    pub scheme: &'static str,
}

impl RequestMetadata {
    pub fn new(scheme: &'static str) -> Self {
        RequestMetadata { scheme }
    }
}

/// Converts a wire header map into the stored representation: canonical
/// names, value order preserved per name.
pub(crate) fn headers_from_map(map: &http::HeaderMap) -> Headers {
    let mut headers = Headers::new();

    for name in map.keys() {
        let values = map
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).to_string())
            .collect();
        headers.insert(canonical_header_name(name.as_str()), values);
    }

    headers
}

/// Lowercases the host and drops the default port for the scheme, so the
/// same upstream never maps to several destinations.
pub(crate) fn normalize_destination(host: &str, port: Option<u16>, scheme: &str) -> String {
    let host = host.to_ascii_lowercase();
    let default_port = if scheme.eq_ignore_ascii_case("https") {
        443
    } else {
        80
    };

    match port {
        Some(port) if port != default_port => format!("{}:{}", host, port),
        _ => host,
    }
}
