use once_cell::sync::Lazy;
use regex::Regex;

use crate::common::data::RequestDetails;

static JSON_MEDIA_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[/+]json$").unwrap());
static XML_MEDIA_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[/+]xml$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaType {
    Json,
    Xml,
    Other,
}

/// Computes the cache key for a request. With `omit_host` set the
/// destination does not participate in the digest, so the same path served
/// under different hosts maps to a single entry (webserver deployments,
/// where the host is the proxy itself and carries no meaning).
pub fn fingerprint(request: &RequestDetails, omit_host: bool) -> String {
    if omit_host {
        request.hash_without_host()
    } else {
        request.hash()
    }
}

impl RequestDetails {
    /// Lowercase hex MD5 digest over the canonicalized request, destination
    /// included.
    pub fn hash(&self) -> String {
        md5_hex(&self.concatenate(true))
    }

    /// Like [`RequestDetails::hash`] but with the destination elided.
    pub fn hash_without_host(&self) -> String {
        md5_hex(&self.concatenate(false))
    }

    /// Builds the canonical byte sequence the digest is computed over:
    /// destination (optional), path, method, query, then the body. JSON and
    /// XML bodies are minified first so that insignificant whitespace does
    /// not change the key; all other bodies are hashed byte-exact.
    ///
    /// Every fragment is length-prefixed, so adjacent fields cannot bleed
    /// into each other (`path="/aB"` with `method="C"` must not collide with
    /// `path="/a"` and `method="BC"`).
    fn concatenate(&self, with_host: bool) -> Vec<u8> {
        let mut buffer = Vec::new();

        if with_host {
            append_fragment(&mut buffer, self.destination.as_bytes());
        }

        append_fragment(&mut buffer, self.path.as_bytes());
        append_fragment(&mut buffer, self.method.as_bytes());
        append_fragment(&mut buffer, self.query.as_bytes());

        if !self.body.is_empty() {
            let media_type = self.media_type();
            match media_type {
                MediaType::Json | MediaType::Xml => {
                    append_fragment(&mut buffer, &self.minified_body(media_type));
                }
                MediaType::Other => {
                    log::debug!(
                        "body is neither JSON nor XML, hashing raw bytes, content_type={:?}",
                        self.headers.get("Content-Type")
                    );
                    append_fragment(&mut buffer, self.body.as_ref());
                }
            }
        }

        buffer
    }

    /// Determines the body media type from the first `Content-Type` value
    /// matching `[/+]json$` or `[/+]xml$`, which also covers suffixed types
    /// such as `application/vnd.api+json`.
    fn media_type(&self) -> MediaType {
        if let Some(values) = self.headers.get("Content-Type") {
            for value in values {
                if JSON_MEDIA_TYPE.is_match(value) {
                    return MediaType::Json;
                }
                if XML_MEDIA_TYPE.is_match(value) {
                    return MediaType::Xml;
                }
            }
        }
        MediaType::Other
    }

    /// Minifies the body for hashing. Minification failure is non-fatal:
    /// the raw body is hashed instead, which keeps the fingerprint defined
    /// but may make matching against a well-formed capture fail.
    fn minified_body(&self, media_type: MediaType) -> Vec<u8> {
        let result = match media_type {
            MediaType::Json => minify_json(self.body.as_ref()),
            MediaType::Xml => minify_xml(self.body.as_ref()),
            MediaType::Other => return self.body.to_vec(),
        };

        match result {
            Ok(minified) => minified,
            Err(err) => {
                log::error!(
                    "failed to minify request body, media_type={:?}, destination={}, path={}, method={}, error={}; request matching might fail",
                    media_type,
                    self.destination,
                    self.path,
                    self.method,
                    err
                );
                self.body.to_vec()
            }
        }
    }
}

fn append_fragment(buffer: &mut Vec<u8>, fragment: &[u8]) {
    buffer.extend_from_slice(fragment.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend_from_slice(fragment);
}

fn md5_hex(input: &[u8]) -> String {
    format!("{:x}", md5::compute(input))
}

fn minify_json(body: &[u8]) -> Result<Vec<u8>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| err.to_string())?;
    serde_json::to_vec(&value).map_err(|err| err.to_string())
}

fn minify_xml(body: &[u8]) -> Result<Vec<u8>, String> {
    use quick_xml::events::Event;
    use quick_xml::{Reader, Writer};

    let body = std::str::from_utf8(body).map_err(|err| err.to_string())?;

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut writer = Writer::new(Vec::new());

    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(event) => writer
                .write_event(event)
                .map_err(|err| err.to_string())?,
            Err(err) => return Err(err.to_string()),
        }
    }

    Ok(writer.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::Headers;
    use crate::common::util::BodyBytes;

    fn request(body: &str, content_type: Option<&str>) -> RequestDetails {
        let mut headers = Headers::new();
        if let Some(content_type) = content_type {
            headers.insert(
                "Content-Type".to_string(),
                vec![content_type.to_string()],
            );
        }

        RequestDetails {
            path: "/api/bookings".to_string(),
            method: "POST".to_string(),
            destination: "www.my-test.com".to_string(),
            scheme: "http".to_string(),
            query: "".to_string(),
            body: BodyBytes::from(body),
            headers,
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let r = request(r#"{"flightId":"1"}"#, Some("application/json"));

        assert_eq!(fingerprint(&r, false), fingerprint(&r, false));
        assert_eq!(fingerprint(&r, true), fingerprint(&r, true));
        // 32 lowercase hex chars
        let digest = fingerprint(&r, false);
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn host_participates_unless_omitted() {
        let mut a = request("", None);
        let mut b = request("", None);
        a.destination = "first.example.com".to_string();
        b.destination = "second.example.com".to_string();

        assert_ne!(fingerprint(&a, false), fingerprint(&b, false));
        assert_eq!(fingerprint(&a, true), fingerprint(&b, true));
    }

    #[test]
    fn json_whitespace_is_insignificant() {
        let compact = request(r#"{"flightId":"1"}"#, Some("application/json"));
        let pretty = request("{\n  \"flightId\": \"1\"\n}", Some("application/json"));

        assert_eq!(fingerprint(&compact, false), fingerprint(&pretty, false));
    }

    #[test]
    fn json_suffix_media_types_are_canonicalized() {
        let compact = request(r#"{"a":1}"#, Some("application/vnd.api+json"));
        let pretty = request("{ \"a\": 1 }", Some("application/vnd.api+json"));

        assert_eq!(fingerprint(&compact, false), fingerprint(&pretty, false));
    }

    #[test]
    fn xml_whitespace_is_insignificant() {
        let compact = request("<booking><id>1</id></booking>", Some("application/xml"));
        let pretty = request(
            "<booking>\n    <id>1</id>\n</booking>",
            Some("application/xml"),
        );

        assert_eq!(fingerprint(&compact, false), fingerprint(&pretty, false));
    }

    #[test]
    fn unknown_media_types_hash_byte_exact() {
        let a = request("a  b", Some("text/plain"));
        let b = request("a b", Some("text/plain"));

        assert_ne!(fingerprint(&a, false), fingerprint(&b, false));
    }

    #[test]
    fn malformed_json_falls_back_to_raw_body() {
        let broken = request("{not json", Some("application/json"));
        let same = request("{not json", Some("application/json"));
        let different = request("{not  json", Some("application/json"));

        assert_eq!(fingerprint(&broken, false), fingerprint(&same, false));
        assert_ne!(fingerprint(&broken, false), fingerprint(&different, false));
    }

    #[test]
    fn adjacent_fields_cannot_collide() {
        let mut a = request("", None);
        a.path = "/aB".to_string();
        a.method = "C".to_string();

        let mut b = request("", None);
        b.path = "/a".to_string();
        b.method = "BC".to_string();

        assert_ne!(fingerprint(&a, false), fingerprint(&b, false));
    }

    #[test]
    fn empty_body_is_not_hashed() {
        // with no body fragment appended, headers cannot influence the key
        let with_content_type = request("", Some("application/json"));
        let without_content_type = request("", None);

        assert_eq!(
            fingerprint(&with_content_type, false),
            fingerprint(&without_content_type, false)
        );
    }
}
