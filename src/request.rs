//! Mutable request model.
//!
//! A [`Request`] is editable while its exchange is building and freezes at
//! send: the editable parts are swapped for an immutable snapshot shared
//! with the connection, and every mutator from then on fails with an
//! illegal-state error. Accessors keep working in both states.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use http::{HeaderMap, HeaderValue, Method, header};

use crate::collab::{MediaTypeService, Resource, UriBuilder};
use crate::payload::Payload;

/// Default target builder: path validation plus appended query parameters.
struct SimpleTarget {
    path: String,
    raw_query: Option<String>,
    parameters: Vec<(String, String)>,
}

impl SimpleTarget {
    fn new() -> Self {
        Self {
            path: "/".to_owned(),
            raw_query: None,
            parameters: Vec::new(),
        }
    }
}

impl UriBuilder for SimpleTarget {
    fn set_path(&mut self, path: &str) -> crate::Result<()> {
        let (path, query) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let absolute = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        // Reparse through the http-types grammar; resets cached state.
        http::uri::PathAndQuery::try_from(absolute.as_str())
            .map_err(|err| crate::Error::new_illegal_state().with(err))?;
        self.path = absolute;
        self.raw_query = query.map(str::to_owned);
        self.parameters.clear();
        Ok(())
    }

    fn add_query_parameter(&mut self, name: &str, value: &str) {
        self.parameters
            .push((percent_encode(name), percent_encode(value)));
    }

    fn build_path(&self) -> String {
        self.path.clone()
    }

    fn build_raw_query(&self) -> Option<String> {
        let mut query = self.raw_query.clone().unwrap_or_default();
        for (name, value) in &self.parameters {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(name);
            query.push('=');
            query.push_str(value);
        }
        if query.is_empty() { None } else { Some(query) }
    }
}

fn percent_encode(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0xf) as usize] as char);
            }
        }
    }
    out
}

/// The frozen request shared with the connection after send.
pub(crate) struct SentRequest {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) authority: Option<String>,
    pub(crate) headers: HeaderMap,
}

struct Building {
    method: Method,
    target: Box<dyn UriBuilder>,
    authority: Option<String>,
    headers: HeaderMap,
    payload: Option<Payload>,
}

enum State {
    Building(Building),
    Sent(Arc<SentRequest>),
}

/// A mutable request, frozen once its exchange is sent.
pub struct Request {
    state: State,
    media_types: Arc<dyn MediaTypeService>,
}

impl Request {
    pub(crate) fn new(method: Method, target: &str, media_types: Arc<dyn MediaTypeService>) -> crate::Result<Self> {
        let mut builder = SimpleTarget::new();
        builder.set_path(target)?;
        Ok(Self {
            state: State::Building(Building {
                method,
                target: Box::new(builder),
                authority: None,
                headers: HeaderMap::new(),
                payload: None,
            }),
            media_types,
        })
    }

    fn building(&mut self) -> crate::Result<&mut Building> {
        match self.state {
            State::Building(ref mut building) => Ok(building),
            State::Sent(_) => Err(crate::Error::new_illegal_state()),
        }
    }

    /// Set the request method.
    pub fn method(&mut self, method: Method) -> crate::Result<&mut Self> {
        self.building()?.method = method;
        Ok(self)
    }

    /// Replace the request target, reparsing path and query.
    pub fn path(&mut self, path: &str) -> crate::Result<&mut Self> {
        self.building()?.target.set_path(path)?;
        Ok(self)
    }

    /// Append a query parameter to the target.
    pub fn query_parameter(&mut self, name: &str, value: &str) -> crate::Result<&mut Self> {
        self.building()?.target.add_query_parameter(name, value);
        Ok(self)
    }

    /// Replace the default target builder with a caller-provided one.
    pub fn target(&mut self, target: Box<dyn UriBuilder>) -> crate::Result<&mut Self> {
        self.building()?.target = target;
        Ok(self)
    }

    /// Set the authority explicitly, overriding derivation from the remote.
    pub fn authority(&mut self, authority: impl Into<String>) -> crate::Result<&mut Self> {
        self.building()?.authority = Some(authority.into());
        Ok(self)
    }

    /// Configure the outgoing headers.
    pub fn headers<F>(&mut self, f: F) -> crate::Result<&mut Self>
    where
        F: FnOnce(&mut HeaderMap),
    {
        f(&mut self.building()?.headers);
        Ok(self)
    }

    /// Append a single header.
    pub fn header<V>(&mut self, name: header::HeaderName, value: V) -> crate::Result<&mut Self>
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<crate::BoxError>,
    {
        let value = value.try_into().map_err(|err| crate::Error::new_illegal_state().with(err))?;
        self.building()?.headers.append(name, value);
        Ok(self)
    }

    /// Configure the request body.
    ///
    /// Multiple calls compose: each configurator runs in order against the
    /// same body state, so a later one may override the payload installed by
    /// an earlier one while keeping its header side effects.
    pub fn body<F>(&mut self, f: F) -> crate::Result<&mut Self>
    where
        F: FnOnce(&mut RequestBody<'_>) -> crate::Result<()>,
    {
        let media_types = self.media_types.clone();
        let building = self.building()?;
        let mut body = RequestBody {
            headers: &mut building.headers,
            payload: &mut building.payload,
            media_types: &*media_types,
        };
        f(&mut body)?;
        Ok(self)
    }

    /// Request method, in any state.
    #[must_use]
    pub fn method_ref(&self) -> &Method {
        match self.state {
            State::Building(ref b) => &b.method,
            State::Sent(ref s) => &s.method,
        }
    }

    /// The request-target (path and query), in any state.
    #[must_use]
    pub fn target_ref(&self) -> String {
        match self.state {
            State::Building(ref b) => b.target.build_path_and_query(),
            State::Sent(ref s) => s.target.clone(),
        }
    }

    /// The explicit authority, when one was set.
    #[must_use]
    pub fn authority_ref(&self) -> Option<&str> {
        match self.state {
            State::Building(ref b) => b.authority.as_deref(),
            State::Sent(ref s) => s.authority.as_deref(),
        }
    }

    /// Request headers, in any state.
    #[must_use]
    pub fn headers_ref(&self) -> &HeaderMap {
        match self.state {
            State::Building(ref b) => &b.headers,
            State::Sent(ref s) => &s.headers,
        }
    }

    /// Whether the request has been frozen by sending its exchange.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self.state, State::Sent(_))
    }

    /// Whether a body configurator installed a payload.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        match self.state {
            State::Building(ref b) => b.payload.is_some(),
            State::Sent(_) => false,
        }
    }

    /// Freeze into the sent snapshot, handing the payload to the caller.
    pub(crate) fn freeze(&mut self) -> crate::Result<(Arc<SentRequest>, Payload)> {
        let building = self.building()?;
        let payload = building.payload.take().unwrap_or_default();
        let sent = Arc::new(SentRequest {
            method: building.method.clone(),
            target: building.target.build_path_and_query(),
            authority: building.authority.take(),
            headers: std::mem::take(&mut building.headers),
        });
        self.state = State::Sent(sent.clone());
        Ok((sent, payload))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", self.method_ref())
            .field("target", &self.target_ref())
            .field("sent", &self.is_sent())
            .finish()
    }
}

/// Body configurator handle, polymorphic over the recognized body kinds.
pub struct RequestBody<'a> {
    headers: &'a mut HeaderMap,
    payload: &'a mut Option<Payload>,
    media_types: &'a dyn MediaTypeService,
}

impl RequestBody<'_> {
    /// No body at all.
    pub fn empty(&mut self) {
        *self.payload = Some(Payload::empty());
    }

    /// A single-shot raw byte body.
    pub fn bytes(&mut self, chunk: impl Into<Bytes>) {
        *self.payload = Some(Payload::full(chunk));
    }

    /// A UTF-8 text body; stamps `Content-Type: text/plain` when absent.
    pub fn string(&mut self, text: impl Into<String>) {
        if !self.headers.contains_key(header::CONTENT_TYPE) {
            self.headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
        }
        *self.payload = Some(Payload::full(text.into()));
    }

    /// A streaming body of chunks.
    pub fn stream<S>(&mut self, stream: S)
    where
        S: Stream<Item = crate::Result<Bytes>> + Send + 'static,
    {
        *self.payload = Some(Payload::stream(stream));
    }

    /// Install an already-built payload.
    pub fn payload(&mut self, payload: Payload) {
        *self.payload = Some(payload);
    }

    /// A body read from a [`Resource`].
    ///
    /// Auto-populates `Content-Length`, `Content-Type` (detected media
    /// type) and `Last-Modified` when not already set.
    pub fn resource(&mut self, resource: &dyn Resource) -> crate::Result<()> {
        if !self.headers.contains_key(header::CONTENT_LENGTH)
            && let Some(size) = resource.size()?
        {
            let mut buf = itoa::Buffer::new();
            self.headers.insert(
                header::CONTENT_LENGTH,
                HeaderValue::from_str(buf.format(size))
                    .map_err(|err| crate::Error::new_illegal_state().with(err))?,
            );
        }
        if !self.headers.contains_key(header::CONTENT_TYPE) {
            let media_type = resource.media_type().or_else(|| {
                resource
                    .filename()
                    .and_then(|name| self.media_types.for_filename(name))
                    .or_else(|| resource.uri().and_then(|uri| self.media_types.for_uri(uri)))
            });
            if let Some(media_type) = media_type {
                self.headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_str(media_type.as_ref())
                        .map_err(|err| crate::Error::new_illegal_state().with(err))?,
                );
            }
        }
        if !self.headers.contains_key(header::LAST_MODIFIED)
            && let Some(modified) = resource.last_modified()?
        {
            self.headers.insert(
                header::LAST_MODIFIED,
                HeaderValue::from_str(&httpdate::fmt_http_date(modified))
                    .map_err(|err| crate::Error::new_illegal_state().with(err))?,
            );
        }
        *self.payload = Some(resource.read()?);
        Ok(())
    }

    /// A `application/x-www-form-urlencoded` parameter body.
    pub fn url_encoded<'p>(&mut self, parameters: impl IntoIterator<Item = (&'p str, &'p str)>) {
        let mut encoded = String::new();
        for (name, value) in parameters {
            if !encoded.is_empty() {
                encoded.push('&');
            }
            encoded.push_str(&percent_encode(name));
            encoded.push('=');
            encoded.push_str(&percent_encode(value));
        }
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        *self.payload = Some(Payload::full(encoded));
    }

    /// A multipart body encoded by an external codec.
    ///
    /// The caller provides the boundary and the already-encoded part
    /// stream; only the `Content-Type` stamp happens here.
    pub fn multipart(&mut self, boundary: &str, payload: Payload) -> crate::Result<()> {
        self.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
                .map_err(|err| crate::Error::new_illegal_state().with(err))?,
        );
        *self.payload = Some(payload);
        Ok(())
    }
}

/// Derive the effective authority for a request.
///
/// Explicit authority wins; otherwise the remote host, with the port
/// suppressed when it is the default for the scheme.
pub(crate) fn effective_authority(
    explicit: Option<&str>,
    host: &str,
    port: u16,
    tls: bool,
) -> String {
    if let Some(authority) = explicit {
        return authority.to_owned();
    }
    let default_port = if tls { 443 } else { 80 };
    if port == default_port {
        host.to_owned()
    } else {
        format!("{host}:{port}")
    }
}
