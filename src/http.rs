//! HTTP over the engine
//!
//! ```no_run
//! use curlev::{Engine, Http};
//!
//! let engine = Engine::new();
//! engine.start()?;
//!
//! let http = Http::create(&engine)?;
//! http.post("https://httpbin.org/post", "text/plain", "hello")
//!     .add_headers([("X-Trace", "1")])
//!     .exec();
//! assert!(http.code().is_success());
//! println!("{}", http.text());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::code::{Code, Internal};
use crate::error::ConfigError;
use crate::headers::{Headers, KeyValues};
use crate::mime::{Mime, Part};
use crate::options::Options;
use crate::sink::Sink;
use crate::url;
use crate::wrapper::{Handle, Protocol};
use curl::easy::{Easy2, List};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// A handle speaking HTTP.
pub type Http = Handle<HttpProtocol>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Delete,
    Post,
    Put,
    Patch,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Delete => "DELETE",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }

    /// Whether requests with this method carry a body.
    #[must_use]
    pub fn has_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            Self::Get,
            Self::Delete,
            Self::Post,
            Self::Put,
            Self::Patch,
        ]
        .into_iter()
        .find(|method| method.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| ConfigError::invalid("method", value))
    }
}

/// What an HTTP transfer left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub headers: Headers,
    pub content_type: String,
    /// Where a redirect pointed when it was not followed
    pub redirect_url: String,
    pub body: Vec<u8>,
}

impl Response {
    /// Interpret the body as UTF-8 (lossy).
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    ///
    /// Requires the `json` feature.
    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Default)]
pub struct HttpProtocol {
    method: Option<Method>,
    url: String,
    query_parameters: KeyValues,
    headers: KeyValues,
    body_parameters: KeyValues,
    content_type: String,
    body: Vec<u8>,
    mime_parts: Vec<Part>,
    // Attached through `CURLOPT_MIMEPOST` while a MIME request runs.
    mime: Option<Mime>,
    response: Response,
}

fn header_line(key: &str, value: &str) -> String {
    // A bare `Key:` removes a header libcurl would add on its own.
    if value.is_empty() {
        format!("{key}:")
    } else {
        format!("{key}: {value}")
    }
}

impl HttpProtocol {
    fn set_method(&mut self, easy: &mut Easy2<Sink>) -> Result<Method, Code> {
        let method = self.method.ok_or(Code::Internal(Internal::Method))?;
        easy.custom_request(method.as_str()).map_err(|err| {
            warn!(%err, %method, "failed to set method");
            Internal::Method
        })?;
        Ok(method)
    }

    fn set_body(&mut self, easy: &mut Easy2<Sink>, method: Method) -> Result<(), curl::Error> {
        Mime::detach(easy)?;
        self.mime = None;
        if !method.has_body() {
            easy.get(true)?;
            easy.get_mut().set_upload(Vec::new());
            return Ok(());
        }

        if !self.mime_parts.is_empty() {
            // libcurl writes the multipart Content-Type with its boundary.
            easy.get_mut().set_upload(Vec::new());
            return Ok(());
        }

        if !self.body_parameters.is_empty() {
            self.content_type = "application/x-www-form-urlencoded".to_string();
            self.body = url::encode_parameters(&self.body_parameters).into_bytes();
        }
        easy.post(true)?;
        easy.post_field_size(self.body.len() as u64)?;
        easy.get_mut().set_upload(self.body.clone());
        self.headers
            .insert("Content-Type".to_string(), self.content_type.clone());
        Ok(())
    }

    /// Attach the MIME document last: it switches libcurl to a MIME post.
    fn set_mime(&mut self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        let mime = Mime::build(easy, &self.mime_parts)?;
        mime.attach(easy)?;
        self.mime = Some(mime);
        Ok(())
    }

    fn set_headers(&self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        let mut list = List::new();
        for (key, value) in &self.headers {
            list.append(&header_line(key, value))?;
        }
        easy.http_headers(list)
    }
}

impl Protocol for HttpProtocol {
    type Response = Response;

    fn prepare_protocol(&mut self, easy: &mut Easy2<Sink>, _options: &Options) -> Result<(), Code> {
        self.response = Response::default();
        // Keeps libcurl from waiting on `100 Continue` before sending a body.
        self.headers.insert("Expect".to_string(), String::new());

        let target = url::with_parameters(&self.url, &self.query_parameters);
        easy.url(&target).map_err(|err| {
            warn!(%err, url = %target, "failed to set url");
            Internal::Prepare
        })?;

        let method = self.set_method(easy)?;
        self.set_body(easy, method).map_err(|err| {
            warn!(%err, "failed to set body");
            Internal::Prepare
        })?;
        self.set_headers(easy).map_err(|err| {
            warn!(%err, "failed to set headers");
            Internal::Headers
        })?;
        if method.has_body() && !self.mime_parts.is_empty() {
            self.set_mime(easy).map_err(|err| {
                warn!(%err, "failed to build MIME body");
                Internal::Mime
            })?;
        }
        Ok(())
    }

    fn finalize_protocol(&mut self, easy: &mut Easy2<Sink>) {
        let content_type = easy
            .content_type()
            .ok()
            .flatten()
            .map(str::to_owned)
            .unwrap_or_default();
        let redirect_url = easy
            .redirect_url()
            .ok()
            .flatten()
            .map(str::to_owned)
            .unwrap_or_default();

        let sink = easy.get_mut();
        sink.set_upload(Vec::new());
        self.response = Response {
            headers: sink.take_headers(),
            content_type,
            redirect_url,
            body: sink.take_body(),
        };
    }

    fn clear_protocol(&mut self) {
        *self = Self::default();
    }

    fn retries_on_status(&self, status: u32) -> bool {
        matches!(status, 429 | 503)
    }

    fn take_response(&mut self) -> Response {
        std::mem::take(&mut self.response)
    }
}

fn extend<K, V>(target: &mut KeyValues, pairs: impl IntoIterator<Item = (K, V)>)
where
    K: Into<String>,
    V: Into<String>,
{
    target.extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
}

impl Handle<HttpProtocol> {
    /// Reset the handle and target `url` with `method`.
    ///
    /// Bodiless methods ignore any body set afterwards.
    pub fn request(&self, method: Method, url: &str) -> &Self {
        self.clear();
        self.do_if_idle(|inner| {
            inner.protocol.method = Some(method);
            inner.protocol.url = url.to_string();
        });
        self
    }

    pub fn get(&self, url: &str) -> &Self {
        self.request(Method::Get, url)
    }

    pub fn delete(&self, url: &str) -> &Self {
        self.request(Method::Delete, url)
    }

    pub fn post(&self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> &Self {
        self.request(Method::Post, url).body(content_type, body)
    }

    pub fn put(&self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> &Self {
        self.request(Method::Put, url).body(content_type, body)
    }

    pub fn patch(&self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> &Self {
        self.request(Method::Patch, url).body(content_type, body)
    }

    /// Serialize `value` as the `application/json` body of a `method`
    /// request. A serialization failure is recorded as
    /// [`Internal::Prepare`].
    ///
    /// Requires the `json` feature.
    #[cfg(feature = "json")]
    pub fn json<T: serde::Serialize>(&self, method: Method, url: &str, value: &T) -> &Self {
        self.request(method, url);
        match serde_json::to_vec(value) {
            Ok(bytes) => self.body("application/json", bytes),
            Err(err) => {
                warn!(%err, "JSON serialization failed");
                self.do_if_idle(|inner| inner.reject(Internal::Prepare));
                self
            }
        }
    }

    /// Replace the raw request body.
    pub fn body(&self, content_type: &str, body: impl Into<Vec<u8>>) -> &Self {
        let body = body.into();
        self.do_if_idle(|inner| {
            inner.protocol.content_type = content_type.to_string();
            inner.protocol.body = body;
        });
        self
    }

    pub fn add_headers<K, V>(&self, headers: impl IntoIterator<Item = (K, V)>) -> &Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.do_if_idle(|inner| extend(&mut inner.protocol.headers, headers));
        self
    }

    pub fn add_query_parameters<K, V>(&self, parameters: impl IntoIterator<Item = (K, V)>) -> &Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.do_if_idle(|inner| extend(&mut inner.protocol.query_parameters, parameters));
        self
    }

    /// Parts of a `multipart/form-data` body. They take precedence over
    /// body parameters and any raw body.
    pub fn add_mime_parameters(&self, parts: impl IntoIterator<Item = Part>) -> &Self {
        self.do_if_idle(|inner| inner.protocol.mime_parts.extend(parts));
        self
    }

    /// Form fields sent `application/x-www-form-urlencoded`. They replace
    /// any raw body.
    pub fn add_body_parameters<K, V>(&self, parameters: impl IntoIterator<Item = (K, V)>) -> &Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.do_if_idle(|inner| extend(&mut inner.protocol.body_parameters, parameters));
        self
    }

    /// Response headers; empty while running.
    pub fn headers(&self) -> Headers {
        self.read_protocol(|http| http.response.headers.clone())
            .unwrap_or_default()
    }

    pub fn content_type(&self) -> String {
        self.read_protocol(|http| http.response.content_type.clone())
            .unwrap_or_default()
    }

    pub fn redirect_url(&self) -> String {
        self.read_protocol(|http| http.response.redirect_url.clone())
            .unwrap_or_default()
    }

    pub fn body_bytes(&self) -> Vec<u8> {
        self.read_protocol(|http| http.response.body.clone())
            .unwrap_or_default()
    }

    /// Response body as UTF-8 (lossy).
    pub fn text(&self) -> String {
        self.read_protocol(|http| http.response.text())
            .unwrap_or_default()
    }

    /// Deserialize the response body as JSON.
    ///
    /// Requires the `json` feature.
    #[cfg(feature = "json")]
    pub fn response_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body_bytes())
    }
}
