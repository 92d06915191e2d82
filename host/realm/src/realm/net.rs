use std::{
    cell::{Cell, RefCell},
    fmt,
};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    call::{Completion, Scope},
    json,
    realm::{Job, Realm, promise},
    value::{HostValue, Obj, ObjectKind},
};

// === Headers === //

#[derive(Debug, Default)]
pub struct Headers {
    entries: RefCell<Vec<(String, String)>>,
}

impl Headers {
    /// Sets `name` to `value`, replacing any previous value. Names are case-insensitive.
    pub fn set(&self, name: &str, value: &str) -> Result<(), String> {
        if !is_token(name) {
            return Err(format!("'{name}' is an invalid header name."));
        }

        let value = value.trim_matches(|c| matches!(c, ' ' | '\t' | '\n' | '\r'));
        if value.contains(['\0', '\r', '\n']) {
            return Err(format!("'{value}' is an invalid header value."));
        }

        let name = name.to_ascii_lowercase();
        let mut entries = self.entries.borrow_mut();

        match entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value.to_string(),
            None => entries.push((name, value.to_string())),
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();

        self.entries
            .borrow()
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.entries.borrow().clone()
    }
}

fn is_token(text: &str) -> bool {
    !text.is_empty()
        && text.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

// === Request & Response === //

pub struct Request {
    url: String,
    method: String,
    headers: Obj,
    body: Option<String>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl Request {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn headers(&self) -> &Obj {
        &self.headers
    }

    fn snapshot(&self) -> FetchRequest {
        let headers = match self.headers.kind() {
            ObjectKind::Headers(headers) => headers.entries(),
            _ => Vec::new(),
        };

        FetchRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            headers,
            body: self.body.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Response {
    url: String,
    status: u16,
    body: RefCell<Option<String>>,
    body_used: Cell<bool>,
}

impl Response {
    pub fn new(url: String, status: u16, body: String) -> Self {
        Self {
            url,
            status,
            body: RefCell::new(Some(body)),
            body_used: Cell::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_used(&self) -> bool {
        self.body_used.get()
    }
}

fn normalize_method(method: &str) -> Result<String, String> {
    if !is_token(method) {
        return Err(format!("'{method}' is not a valid HTTP method."));
    }

    let upper = method.to_ascii_uppercase();

    if matches!(upper.as_str(), "CONNECT" | "TRACE" | "TRACK") {
        return Err(format!("'{method}' HTTP method is unsupported."));
    }

    if matches!(
        upper.as_str(),
        "DELETE" | "GET" | "HEAD" | "OPTIONS" | "POST" | "PUT"
    ) {
        Ok(upper)
    } else {
        Ok(method.to_string())
    }
}

fn is_valid_url(url: &str) -> bool {
    !url.is_empty() && !url.chars().any(|c| c.is_whitespace() || c.is_control())
}

// === FetchBackend === //

/// A request as seen by a [`FetchBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Error)]
#[error("request to {url} failed: {reason}")]
pub struct FetchError {
    pub url: String,
    pub reason: String,
}

/// Where the realm's network requests go.
pub trait FetchBackend {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub enum StaticRoute {
    Respond(FetchResponse),
    Unreachable,
}

/// Serves fixed bodies by URL and answers 404 for everything else.
#[derive(Debug, Clone, Default)]
pub struct StaticFetch {
    routes: FxHashMap<String, StaticRoute>,
}

impl StaticFetch {
    pub fn with_route(
        mut self,
        url: impl Into<String>,
        status: u16,
        body: impl Into<String>,
    ) -> Self {
        let response = FetchResponse {
            status,
            body: body.into(),
        };

        self.insert(url.into(), StaticRoute::Respond(response));
        self
    }

    pub fn insert(&mut self, url: String, route: StaticRoute) {
        self.routes.insert(url, route);
    }
}

impl FetchBackend for StaticFetch {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        match self.routes.get(&request.url) {
            Some(StaticRoute::Respond(response)) => Ok(response.clone()),
            Some(StaticRoute::Unreachable) => Err(FetchError {
                url: request.url.clone(),
                reason: "host unreachable".to_string(),
            }),
            None => Ok(FetchResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

// === Jobs === //

pub fn complete_fetch(realm: &mut Realm, promise: &Obj, request: FetchRequest) {
    match realm.fetch_backend().fetch(&request) {
        Ok(response) => {
            tracing::debug!(url = %request.url, status = response.status, "fetch completed");

            let response = Obj::new(ObjectKind::Response(Response::new(
                request.url,
                response.status,
                response.body,
            )));

            promise::resolve(realm, promise, response.into());
        }
        Err(err) => {
            tracing::debug!("{err}");
            promise::reject(realm, promise, HostValue::type_error("Failed to fetch"));
        }
    }
}

pub fn complete_json(realm: &mut Realm, promise: &Obj, body: &str) {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => promise::resolve(realm, promise, json::from_json(&value)),
        Err(err) => promise::reject(
            realm,
            promise,
            HostValue::syntax_error(format!("JSON.parse: {err}")),
        ),
    }
}

// === Capabilities === //

fn illegal_invocation() -> anyhow::Result<Completion> {
    Ok(Err(HostValue::type_error("Illegal invocation")))
}

pub fn headers_set(
    _scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let Some(ObjectKind::Headers(headers)) = this.as_object().map(Obj::kind) else {
        return illegal_invocation();
    };

    let name = args.first().map(HostValue::to_display_string).unwrap_or_default();
    let value = args.get(1).map(HostValue::to_display_string).unwrap_or_default();

    Ok(match headers.set(&name, &value) {
        Ok(()) => Ok(HostValue::Undefined),
        Err(message) => Err(HostValue::type_error(message)),
    })
}

/// `new Request(url, init)`.
pub fn request_constructor(
    _scope: &mut dyn Scope,
    _this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    let url = args.first().map(HostValue::to_display_string).unwrap_or_default();
    if !is_valid_url(&url) {
        return Ok(Err(HostValue::type_error(format!(
            "Failed to parse URL from {url}"
        ))));
    }

    let init = args
        .get(1)
        .and_then(HostValue::as_object)
        .cloned();

    let mut method = "GET".to_string();
    let headers = Headers::default();
    let mut body = None;

    if let Some(init) = init {
        if let Some(value) = init.get_str("method").filter(|v| !v.is_nullish()) {
            match normalize_method(&value.to_display_string()) {
                Ok(normalized) => method = normalized,
                Err(message) => return Ok(Err(HostValue::type_error(message))),
            }
        }

        if let Some(value) = init.get_str("headers").filter(|v| !v.is_nullish()) {
            let entries = match value.as_object().map(|obj| (obj, obj.kind())) {
                Some((_, ObjectKind::Headers(source))) => source.entries(),
                Some((obj, _)) => obj
                    .props()
                    .iter()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.to_display_string())))
                    .collect(),
                None => {
                    return Ok(Err(HostValue::type_error(
                        "The provided value is not of type 'HeadersInit'.",
                    )));
                }
            };

            for (name, value) in entries {
                if let Err(message) = headers.set(&name, &value) {
                    return Ok(Err(HostValue::type_error(message)));
                }
            }
        }

        if let Some(value) = init.get_str("body").filter(|v| !v.is_nullish()) {
            body = Some(value.to_display_string());
        }
    }

    if body.is_some() && matches!(method.as_str(), "GET" | "HEAD") {
        return Ok(Err(HostValue::type_error(
            "Request with GET/HEAD method cannot have body.",
        )));
    }

    let request = Request {
        url,
        method,
        headers: Obj::new(ObjectKind::Headers(headers)),
        body,
    };

    Ok(Ok(Obj::new(ObjectKind::Request(request)).into()))
}

pub fn request_headers(
    _scope: &mut dyn Scope,
    this: &HostValue,
    _args: &[HostValue],
) -> anyhow::Result<Completion> {
    match this.as_object().map(Obj::kind) {
        Some(ObjectKind::Request(request)) => Ok(Ok(request.headers.clone().into())),
        _ => illegal_invocation(),
    }
}

pub fn response_json(
    scope: &mut dyn Scope,
    this: &HostValue,
    _args: &[HostValue],
) -> anyhow::Result<Completion> {
    let Some(ObjectKind::Response(response)) = this.as_object().map(Obj::kind) else {
        return illegal_invocation();
    };

    let realm = scope.realm();
    let promise = promise::new_promise();

    if response.body_used.replace(true) {
        promise::reject(
            realm,
            &promise,
            HostValue::type_error("body stream already read"),
        );
    } else {
        let body = response.body.borrow_mut().take().unwrap_or_default();
        realm.enqueue(Job::ParseJson {
            promise: promise.clone(),
            body,
        });
    }

    Ok(Ok(promise.into()))
}

pub fn window_fetch(
    scope: &mut dyn Scope,
    this: &HostValue,
    args: &[HostValue],
) -> anyhow::Result<Completion> {
    if !matches!(this.as_object().map(Obj::kind), Some(ObjectKind::Window(_))) {
        return illegal_invocation();
    }

    let promise = promise::new_promise();

    let request = match args.first() {
        Some(HostValue::Object(obj)) => match obj.kind() {
            ObjectKind::Request(request) => Some(request.snapshot()),
            _ => None,
        },
        Some(HostValue::String(url)) if is_valid_url(url) => Some(FetchRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        }),
        _ => None,
    };

    // A malformed request rejects the returned promise rather than throwing.
    let Some(request) = request else {
        let reason = HostValue::type_error("Failed to parse request");
        promise::reject(scope.realm(), &promise, reason);
        return Ok(Ok(promise.into()));
    };

    tracing::debug!(url = %request.url, method = %request.method, "queued fetch");

    scope.realm().enqueue(Job::Fetch {
        promise: promise.clone(),
        request,
    });

    Ok(Ok(promise.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_names_are_case_insensitive() {
        let headers = Headers::default();
        headers.set("Accept", "text/html").unwrap();
        headers.set("ACCEPT", "  application/json ").unwrap();

        assert_eq!(headers.get("accept").as_deref(), Some("application/json"));
        assert_eq!(headers.entries().len(), 1);
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let headers = Headers::default();

        assert!(headers.set("bad name", "x").is_err());
        assert!(headers.set("", "x").is_err());
        assert!(headers.set("x-ok", "line\nbreak").is_err());
        assert!(headers.entries().is_empty());
    }

    #[test]
    fn methods_are_normalized() {
        assert_eq!(normalize_method("post").unwrap(), "POST");
        assert_eq!(normalize_method("patch").unwrap(), "patch");
        assert!(normalize_method("TRACE").is_err());
        assert!(normalize_method("GE T").is_err());
    }

    #[test]
    fn static_fetch_serves_routes() {
        let mut backend = StaticFetch::default().with_route("/sensors", 200, "[1,2]");
        backend.insert("/down".to_string(), StaticRoute::Unreachable);

        let request = |url: &str| FetchRequest {
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
        };

        assert_eq!(backend.fetch(&request("/sensors")).unwrap().body, "[1,2]");
        assert_eq!(backend.fetch(&request("/missing")).unwrap().status, 404);
        assert!(backend.fetch(&request("/down")).is_err());
    }
}
