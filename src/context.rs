use std::net::SocketAddr;

use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, request::Parts};

/// The request fields the limiter reads. Built by the transport layer.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub peer_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            method,
            uri,
            headers,
            peer_addr,
        }
    }

    pub fn from_parts(parts: &Parts, peer_addr: Option<SocketAddr>) -> Self {
        Self::new(
            parts.method.clone(),
            parts.uri.clone(),
            parts.headers.clone(),
            peer_addr,
        )
    }

    /// Shorthand for tests and adapters that only know a method and a path.
    pub fn get(path: &str) -> Self {
        Self::with_method(Method::GET, path)
    }

    pub fn with_method(method: Method, path_and_query: &str) -> Self {
        let uri = path_and_query.parse::<Uri>().unwrap_or_else(|_| Uri::from_static("/"));
        Self::new(method, uri, HeaderMap::new(), None)
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// First value of `name`, empty when absent or not valid UTF-8.
    pub fn header_value(&self, name: &HeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// First decoded value of the query parameter `name`, empty when absent.
    pub fn query_param(&self, name: &str) -> String {
        self.uri
            .query()
            .and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == name)
                    .map(|(_, value)| value.into_owned())
            })
            .unwrap_or_default()
    }
}
