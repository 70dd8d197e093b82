use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::data::{
    self, canonicalize_headers, Headers, RequestDetails, ResponseDetails, ResponseDetailsView,
};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Bad request. Nothing to import!")]
    NothingToImport,
    #[error("cannot convert template payload: {0}")]
    ConversionError(#[from] data::Error),
}

/// A pattern of optional request fields. A present field must equal the
/// inbound value exactly; an absent field matches anything. Listed headers
/// must appear in the inbound request with an equal value list; inbound
/// headers that are not listed are ignored.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestTemplate {
    pub path: Option<String>,
    pub method: Option<String>,
    pub destination: Option<String>,
    // TODO: scheme is accepted on import but not yet part of the match chain
    pub scheme: Option<String>,
    pub query: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub headers: Headers,
}

/// A template paired with the response it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePayload {
    pub template: RequestTemplate,
    pub response: ResponseDetails,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TemplatePayloadView {
    #[serde(rename = "requestTemplate")]
    pub request_template: RequestTemplate,
    pub response: ResponseDetailsView,
}

/// The `{ "data": [...] }` envelope used by `GET`/`POST /api/templates`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TemplatesView {
    pub data: Vec<TemplatePayloadView>,
}

impl TemplatePayload {
    pub fn to_view(&self) -> TemplatePayloadView {
        TemplatePayloadView {
            request_template: self.template.clone(),
            response: self.response.to_view(),
        }
    }

    pub fn from_view(view: TemplatePayloadView) -> Result<TemplatePayload, data::Error> {
        let mut template = view.request_template;
        template.headers = canonicalize_headers(template.headers);

        Ok(TemplatePayload {
            template,
            response: ResponseDetails::from_view(view.response)?,
        })
    }
}

/// An ordered, append-only sequence of template payloads.
///
/// Matching is read-mostly and runs against an immutable snapshot, so
/// concurrent imports or wipes never disturb an evaluation that is already
/// in flight; they publish a new snapshot atomically instead.
pub struct TemplateStore {
    entries: ArcSwap<Vec<TemplatePayload>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        TemplateStore {
            entries: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Walks the entries in insertion order and returns the response of the
    /// first template the request satisfies.
    pub fn find_response(
        &self,
        request: &RequestDetails,
        omit_host: bool,
    ) -> Option<ResponseDetails> {
        let entries = self.entries.load();

        'entry: for entry in entries.iter() {
            let template = &entry.template;

            if let Some(body) = &template.body {
                if body.as_bytes() != request.body.as_ref() {
                    continue;
                }
            }
            if !omit_host {
                if let Some(destination) = &template.destination {
                    if *destination != request.destination {
                        continue;
                    }
                }
            }
            if let Some(path) = &template.path {
                if *path != request.path {
                    continue;
                }
            }
            if let Some(query) = &template.query {
                if *query != request.query {
                    continue;
                }
            }
            for (name, values) in &template.headers {
                match request.headers.get(name) {
                    Some(request_values) if request_values == values => {}
                    _ => continue 'entry,
                }
            }
            if let Some(method) = &template.method {
                if *method != request.method {
                    continue;
                }
            }

            return Some(entry.response.clone());
        }

        None
    }

    /// Appends the given views to the store. All views are converted before
    /// anything is published, so a malformed entry leaves the store
    /// untouched. An empty import is an error.
    pub fn import(&self, views: Vec<TemplatePayloadView>) -> Result<usize, ImportError> {
        if views.is_empty() {
            return Err(ImportError::NothingToImport);
        }

        let imported = views
            .into_iter()
            .map(TemplatePayload::from_view)
            .collect::<Result<Vec<_>, _>>()?;
        let count = imported.len();

        self.entries.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + imported.len());
            next.extend(current.iter().cloned());
            next.extend(imported.iter().cloned());
            next
        });

        log::info!("templates imported, added={}, total={}", count, self.len());

        Ok(count)
    }

    pub fn export(&self) -> TemplatesView {
        TemplatesView {
            data: self
                .entries
                .load()
                .iter()
                .map(TemplatePayload::to_view)
                .collect(),
        }
    }

    pub fn wipe(&self) {
        self.entries.store(Arc::new(Vec::new()));
        log::debug!("template store wiped");
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        TemplateStore::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::util::BodyBytes;

    fn ping_request() -> RequestDetails {
        RequestDetails {
            path: "/ping".to_string(),
            method: "GET".to_string(),
            destination: "anything.example.com".to_string(),
            scheme: "http".to_string(),
            query: "cachebuster=1".to_string(),
            body: BodyBytes::default(),
            headers: Headers::from([("X-Request-Id".to_string(), vec!["42".to_string()])]),
        }
    }

    fn pong_response() -> ResponseDetails {
        ResponseDetails {
            status: 200,
            body: BodyBytes::from("pong"),
            headers: Headers::new(),
        }
    }

    fn template_entry(template: RequestTemplate, response: ResponseDetails) -> TemplatePayload {
        TemplatePayload { template, response }
    }

    fn store_with(entries: Vec<TemplatePayload>) -> TemplateStore {
        let store = TemplateStore::new();
        store
            .import(entries.iter().map(TemplatePayload::to_view).collect())
            .unwrap();
        store
    }

    #[test]
    fn absent_fields_are_wildcards() {
        let store = store_with(vec![template_entry(
            RequestTemplate {
                path: Some("/ping".to_string()),
                method: Some("GET".to_string()),
                ..RequestTemplate::default()
            },
            pong_response(),
        )]);

        let found = store.find_response(&ping_request(), false).unwrap();

        assert_eq!(found.status, 200);
        assert_eq!(found.body, BodyBytes::from("pong"));
    }

    #[test]
    fn present_fields_must_match_exactly() {
        let store = store_with(vec![template_entry(
            RequestTemplate {
                path: Some("/ping".to_string()),
                query: Some("other=2".to_string()),
                ..RequestTemplate::default()
            },
            pong_response(),
        )]);

        assert!(store.find_response(&ping_request(), false).is_none());
    }

    #[test]
    fn destination_is_ignored_in_webserver_mode() {
        let store = store_with(vec![template_entry(
            RequestTemplate {
                path: Some("/ping".to_string()),
                destination: Some("only-this-host.example.com".to_string()),
                ..RequestTemplate::default()
            },
            pong_response(),
        )]);

        assert!(store.find_response(&ping_request(), false).is_none());
        assert!(store.find_response(&ping_request(), true).is_some());
    }

    #[test]
    fn body_must_equal_when_present() {
        let store = store_with(vec![template_entry(
            RequestTemplate {
                body: Some(r#"{"flightId":"1"}"#.to_string()),
                ..RequestTemplate::default()
            },
            pong_response(),
        )]);

        let mut matching = ping_request();
        matching.body = BodyBytes::from(r#"{"flightId":"1"}"#);
        assert!(store.find_response(&matching, false).is_some());

        let mut mismatching = ping_request();
        mismatching.body = BodyBytes::from(r#"{"flightId":"2"}"#);
        assert!(store.find_response(&mismatching, false).is_none());
    }

    #[test]
    fn required_headers_match_on_exact_value_list() {
        let template = RequestTemplate {
            headers: Headers::from([("X-Trace".to_string(), vec!["abc".to_string()])]),
            ..RequestTemplate::default()
        };
        let store = store_with(vec![template_entry(template, pong_response())]);

        let mut exact = ping_request();
        exact
            .headers
            .insert("X-Trace".to_string(), vec!["abc".to_string()]);
        assert!(store.find_response(&exact, false).is_some());

        let mut extra_value = ping_request();
        extra_value.headers.insert(
            "X-Trace".to_string(),
            vec!["abc".to_string(), "def".to_string()],
        );
        assert!(store.find_response(&extra_value, false).is_none());

        // header missing entirely
        assert!(store.find_response(&ping_request(), false).is_none());
    }

    #[test]
    fn header_names_are_canonicalized_on_import() {
        let template = RequestTemplate {
            headers: Headers::from([("x-trace".to_string(), vec!["abc".to_string()])]),
            ..RequestTemplate::default()
        };
        let store = store_with(vec![template_entry(template, pong_response())]);

        let mut request = ping_request();
        request
            .headers
            .insert("X-Trace".to_string(), vec!["abc".to_string()]);

        assert!(store.find_response(&request, false).is_some());
    }

    #[test]
    fn first_matching_template_wins() {
        let first = template_entry(
            RequestTemplate {
                path: Some("/ping".to_string()),
                ..RequestTemplate::default()
            },
            ResponseDetails {
                status: 200,
                body: BodyBytes::from("first"),
                headers: Headers::new(),
            },
        );
        let second = template_entry(
            RequestTemplate {
                path: Some("/ping".to_string()),
                ..RequestTemplate::default()
            },
            ResponseDetails {
                status: 200,
                body: BodyBytes::from("second"),
                headers: Headers::new(),
            },
        );
        let store = store_with(vec![first, second]);

        let found = store.find_response(&ping_request(), false).unwrap();

        assert_eq!(found.body, BodyBytes::from("first"));
    }

    #[test]
    fn import_preserves_insertion_order_across_calls() {
        let store = TemplateStore::new();
        let entry = |body: &str| {
            template_entry(
                RequestTemplate::default(),
                ResponseDetails {
                    status: 200,
                    body: BodyBytes::from(body),
                    headers: Headers::new(),
                },
            )
            .to_view()
        };

        store.import(vec![entry("imported-first")]).unwrap();
        store.import(vec![entry("imported-second")]).unwrap();

        let found = store.find_response(&ping_request(), false).unwrap();
        assert_eq!(found.body, BodyBytes::from("imported-first"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn empty_import_is_rejected() {
        let store = TemplateStore::new();

        let result = store.import(Vec::new());

        assert!(matches!(result, Err(ImportError::NothingToImport)));
        assert!(store.is_empty());
    }

    #[test]
    fn wipe_empties_the_store() {
        let store = store_with(vec![template_entry(
            RequestTemplate::default(),
            pong_response(),
        )]);

        store.wipe();

        assert!(store.is_empty());
        assert!(store.find_response(&ping_request(), false).is_none());
    }
}
