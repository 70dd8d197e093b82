use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::util::{canonical_header_name, detect_mime_type, BodyBytes};

/// MIME type fragments whose response bodies are exported as plain text.
/// Everything else is base64-encoded so arbitrary bytes survive the JSON
/// round trip.
const TEXTUAL_MIME_PARTS: &[&str] = &[
    "text",
    "plain",
    "css",
    "html",
    "json",
    "xml",
    "js",
    "javascript",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot encode payload: {0}")]
    PayloadEncodeError(#[from] rmp_serde::encode::Error),
    #[error("cannot decode payload: {0}")]
    PayloadDecodeError(#[from] rmp_serde::decode::Error),
    #[error("cannot decode base64 body: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),
}

/// Header values are an ordered list per name; names are stored in canonical
/// MIME-title-case (see [`canonical_header_name`]).
pub type Headers = BTreeMap<String, Vec<String>>;

/// The normalized view of an inbound HTTP request. This is the single input
/// to fingerprinting and template matching, and the request half of every
/// stored [`Payload`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestDetails {
    /// URL path without the host.
    pub path: String,
    /// Uppercase HTTP verb.
    pub method: String,
    /// Host the request addresses, lowercase, default ports elided.
    pub destination: String,
    /// `http` or `https`.
    pub scheme: String,
    /// Raw query string, unescaped form preserved.
    pub query: String,
    pub body: BodyBytes,
    pub headers: Headers,
}

/// The canned response half of a [`Payload`]. The body is kept as raw bytes;
/// headers carry whatever the client needs to decode it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResponseDetails {
    pub status: u16,
    pub body: BodyBytes,
    pub headers: Headers,
}

/// A bundled request/response pair. Identity is the fingerprint of the
/// request component: two payloads with equal fingerprints are the same
/// cache entry and the later write wins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub request: RequestDetails,
    pub response: ResponseDetails,
}

impl Payload {
    pub fn id(&self) -> String {
        self.request.hash()
    }

    pub fn id_without_host(&self) -> String {
        self.request.hash_without_host()
    }

    /// Serializes the payload with a self-describing binary codec
    /// (MessagePack with named fields). The bytes are independent of this
    /// runtime, so persisted caches can be read back by other
    /// implementations of the same data model.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes bytes previously produced by [`Payload::encode`].
    pub fn decode(data: &[u8]) -> Result<Payload, Error> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

// ************************************************************************************************
// JSON views for the admin import/export surface
// ************************************************************************************************

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestDetailsView {
    pub path: String,
    pub method: String,
    pub destination: String,
    pub scheme: String,
    pub query: String,
    pub body: String,
    pub headers: Headers,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseDetailsView {
    pub status: u16,
    pub body: String,
    #[serde(rename = "encodedBody")]
    pub encoded_body: bool,
    pub headers: Headers,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PayloadView {
    pub request: RequestDetailsView,
    pub response: ResponseDetailsView,
}

/// The `{ "data": [...] }` envelope used by `GET`/`POST /api/records`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecordsView {
    pub data: Vec<PayloadView>,
}

impl RequestDetails {
    pub fn to_view(&self) -> RequestDetailsView {
        RequestDetailsView {
            path: self.path.clone(),
            method: self.method.clone(),
            destination: self.destination.clone(),
            scheme: self.scheme.clone(),
            query: self.query.clone(),
            body: self.body.to_maybe_lossy_str().into_owned(),
            headers: self.headers.clone(),
        }
    }

    pub fn from_view(view: RequestDetailsView) -> RequestDetails {
        RequestDetails {
            path: view.path,
            method: view.method,
            destination: view.destination,
            scheme: view.scheme,
            query: view.query,
            body: BodyBytes::from(view.body),
            headers: canonicalize_headers(view.headers),
        }
    }
}

impl ResponseDetails {
    /// Exports the response for the JSON admin surface. The body is
    /// base64-encoded when it carries a `Content-Encoding` (e.g. gzip) or
    /// its sniffed MIME type is not a textual one; otherwise it is embedded
    /// as a UTF-8 string.
    pub fn to_view(&self) -> ResponseDetailsView {
        let needs_encoding = if self.headers.contains_key("Content-Encoding") {
            true
        } else {
            let mime_type = detect_mime_type(self.body.as_ref());
            !TEXTUAL_MIME_PARTS.iter().any(|part| mime_type.contains(part))
        };

        let body = if needs_encoding {
            BASE64.encode(self.body.as_ref())
        } else {
            self.body.to_maybe_lossy_str().into_owned()
        };

        ResponseDetailsView {
            status: self.status,
            body,
            encoded_body: needs_encoding,
            headers: self.headers.clone(),
        }
    }

    pub fn from_view(view: ResponseDetailsView) -> Result<ResponseDetails, Error> {
        let body = if view.encoded_body {
            BodyBytes::from(BASE64.decode(view.body.as_bytes())?)
        } else {
            BodyBytes::from(view.body)
        };

        Ok(ResponseDetails {
            status: view.status,
            body,
            headers: canonicalize_headers(view.headers),
        })
    }
}

impl Payload {
    pub fn to_view(&self) -> PayloadView {
        PayloadView {
            request: self.request.to_view(),
            response: self.response.to_view(),
        }
    }

    pub fn from_view(view: PayloadView) -> Result<Payload, Error> {
        Ok(Payload {
            request: RequestDetails::from_view(view.request),
            response: ResponseDetails::from_view(view.response)?,
        })
    }
}

/// Rewrites imported header names into their canonical stored form.
pub fn canonicalize_headers(headers: Headers) -> Headers {
    headers
        .into_iter()
        .map(|(name, values)| (canonical_header_name(&name), values))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn booking_payload() -> Payload {
        let mut request_headers = Headers::new();
        request_headers.insert(
            "Content-Type".to_string(),
            vec!["application/json".to_string()],
        );

        let mut response_headers = Headers::new();
        response_headers.insert(
            "Location".to_string(),
            vec!["http://localhost/api/bookings/1".to_string()],
        );

        Payload {
            request: RequestDetails {
                path: "/api/bookings".to_string(),
                method: "POST".to_string(),
                destination: "www.my-test.com".to_string(),
                scheme: "http".to_string(),
                query: "".to_string(),
                body: BodyBytes::from(r#"{"flightId":"1"}"#),
                headers: request_headers,
            },
            response: ResponseDetails {
                status: 201,
                body: BodyBytes::default(),
                headers: response_headers,
            },
        }
    }

    #[test]
    fn codec_round_trip() {
        let payload = booking_payload();

        let encoded = payload.encode().unwrap();
        let decoded = Payload::decode(&encoded).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn codec_round_trip_binary_body() {
        let mut payload = booking_payload();
        payload.response.body = BodyBytes::from(vec![0x1f, 0x8b, 0x00, 0xff, 0xfe]);

        let encoded = payload.encode().unwrap();
        let decoded = Payload::decode(&encoded).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Payload::decode(b"not a payload").is_err());
    }

    #[test]
    fn text_body_exports_as_plain_string() {
        let response = ResponseDetails {
            status: 200,
            body: BodyBytes::from(r#"{"ok":true}"#),
            headers: Headers::new(),
        };

        let view = response.to_view();

        assert!(!view.encoded_body);
        assert_eq!(view.body, r#"{"ok":true}"#);
        assert_eq!(ResponseDetails::from_view(view).unwrap(), response);
    }

    #[test]
    fn binary_body_exports_base64_and_round_trips() {
        let response = ResponseDetails {
            status: 200,
            body: BodyBytes::from(vec![0x1f, 0x8b, 0x08, 0x00, 0xff]),
            headers: Headers::new(),
        };

        let view = response.to_view();

        assert!(view.encoded_body);
        assert_eq!(ResponseDetails::from_view(view).unwrap(), response);
    }

    #[test]
    fn content_encoding_forces_base64() {
        let mut headers = Headers::new();
        headers.insert("Content-Encoding".to_string(), vec!["gzip".to_string()]);

        let response = ResponseDetails {
            status: 200,
            body: BodyBytes::from("looks like text but is declared encoded"),
            headers,
        };

        let view = response.to_view();

        assert!(view.encoded_body);
        assert_eq!(ResponseDetails::from_view(view).unwrap(), response);
    }

    #[test]
    fn imported_header_names_are_canonicalized() {
        let view = RequestDetailsView {
            path: "/".to_string(),
            method: "GET".to_string(),
            destination: "example.com".to_string(),
            scheme: "http".to_string(),
            query: "".to_string(),
            body: "".to_string(),
            headers: Headers::from([(
                "content-type".to_string(),
                vec!["text/plain".to_string()],
            )]),
        };

        let details = RequestDetails::from_view(view);

        assert!(details.headers.contains_key("Content-Type"));
    }
}
