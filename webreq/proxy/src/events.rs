//! Interception events and their wire representation.
//!
//! Each point in the request life cycle where listeners may observe or
//! mutate behavior is an [`EventKind`]. A dispatch builds the matching
//! [`EventDetails`] variant, which carries exactly the fields that event
//! exposes to listeners, and serializes it in one place ([`EventDetails::to_wire`])
//! into the JSON record consumed by host-side listener code.
//!
//! Replies from blocking listeners come back as JSON as well and are parsed
//! leniently by [`BlockingResponse::from_wire`] - a structurally invalid
//! field is ignored rather than failing the request.

use std::{
    collections::BTreeMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use http::{header::HeaderName, HeaderMap, HeaderValue, Uri};
use serde::Serialize;
use serde_json::Value;

/// The eight stages of the request life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeRequest,
    BeforeSendHeaders,
    SendHeaders,
    HeadersReceived,
    BeforeRedirect,
    ResponseStarted,
    ErrorOccurred,
    Completed,
}

impl EventKind {
    /// Whether listeners for this event may mutate or cancel the request.
    /// Non-blocking events are informational only.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::BeforeRequest | Self::BeforeSendHeaders | Self::HeadersReceived
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeRequest => "beforeRequest",
            Self::BeforeSendHeaders => "beforeSendHeaders",
            Self::SendHeaders => "sendHeaders",
            Self::HeadersReceived => "headersReceived",
            Self::BeforeRedirect => "beforeRedirect",
            Self::ResponseStarted => "responseStarted",
            Self::ErrorOccurred => "errorOccurred",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Caller-declared kind of the resource being fetched.
/// Propagated verbatim into details records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Xhr,
    Other,
}

/// Fields common to the details records of all events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub id: u64,
    pub url: String,
    pub method: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

impl RequestInfo {
    /// Current wall-clock time in the details record format.
    pub fn now_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRequestDetails {
    #[serde(flatten)]
    pub info: RequestInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeadersDetails {
    #[serde(flatten)]
    pub info: RequestInfo,
    pub request_headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDetails {
    #[serde(flatten)]
    pub info: RequestInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRedirectDetails {
    #[serde(flatten)]
    pub response: ResponseDetails,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(flatten)]
    pub info: RequestInfo,
    pub error: String,
}

/// A details record, one variant per [`EventKind`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum EventDetails {
    #[serde(rename = "beforeRequest")]
    BeforeRequest(BeforeRequestDetails),
    #[serde(rename = "beforeSendHeaders")]
    BeforeSendHeaders(RequestHeadersDetails),
    #[serde(rename = "sendHeaders")]
    SendHeaders(RequestHeadersDetails),
    #[serde(rename = "headersReceived")]
    HeadersReceived(ResponseDetails),
    #[serde(rename = "beforeRedirect")]
    BeforeRedirect(BeforeRedirectDetails),
    #[serde(rename = "responseStarted")]
    ResponseStarted(ResponseDetails),
    #[serde(rename = "errorOccurred")]
    ErrorOccurred(ErrorDetails),
    #[serde(rename = "completed")]
    Completed(ResponseDetails),
}

impl EventDetails {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::BeforeRequest(..) => EventKind::BeforeRequest,
            Self::BeforeSendHeaders(..) => EventKind::BeforeSendHeaders,
            Self::SendHeaders(..) => EventKind::SendHeaders,
            Self::HeadersReceived(..) => EventKind::HeadersReceived,
            Self::BeforeRedirect(..) => EventKind::BeforeRedirect,
            Self::ResponseStarted(..) => EventKind::ResponseStarted,
            Self::ErrorOccurred(..) => EventKind::ErrorOccurred,
            Self::Completed(..) => EventKind::Completed,
        }
    }

    /// Serializes this record into the listener wire format.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|error| {
            tracing::error!(?error, event = %self.kind(), "failed to serialize details record");
            Value::Null
        })
    }
}

/// Converts headers into the `{name: [values]}` wire shape.
pub fn headers_to_wire(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut wire: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        wire.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    wire
}

/// Parses the `{name: [values]}` wire shape back into headers.
///
/// Returns [`None`] when the value is not an object at all. Individual
/// entries that do not form valid header names/values are skipped with a
/// warning.
pub fn headers_from_wire(value: &Value) -> Option<HeaderMap> {
    let object = value.as_object()?;

    let mut headers = HeaderMap::new();
    for (name, values) in object {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(name = %name, "ignoring invalid header name from listener");
            continue;
        };

        // A single string is accepted as a one-element list.
        let values: Vec<&str> = match values {
            Value::String(value) => vec![value.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => {
                tracing::warn!(name = %name, "ignoring invalid header values from listener");
                continue;
            }
        };

        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(..) => {
                    tracing::warn!(name = %name, "ignoring invalid header value from listener");
                }
            }
        }
    }

    Some(headers)
}

/// A blocking listener's reply, parsed from the wire.
///
/// Absent fields keep their defaults, which together mean "proceed
/// unmodified".
#[derive(Debug, Default, Clone)]
pub struct BlockingResponse {
    pub cancel: bool,
    pub redirect_url: Option<Uri>,
    pub request_headers: Option<HeaderMap>,
    pub response_headers: Option<HeaderMap>,
    pub status_line: Option<String>,
}

impl BlockingResponse {
    /// Lenient parse: any field that does not have the expected shape is
    /// ignored, never an error.
    pub fn from_wire(value: &Value) -> Self {
        let mut response = Self::default();

        let Some(object) = value.as_object() else {
            if !value.is_null() {
                tracing::warn!(?value, "ignoring malformed listener response");
            }
            return response;
        };

        if let Some(cancel) = object.get("cancel") {
            match cancel.as_bool() {
                Some(cancel) => response.cancel = cancel,
                None => tracing::warn!("ignoring non-boolean `cancel` in listener response"),
            }
        }

        if let Some(redirect) = object.get("redirectURL") {
            match redirect.as_str().map(str::parse::<Uri>) {
                Some(Ok(url)) => response.redirect_url = Some(url),
                _ => tracing::warn!("ignoring unparsable `redirectURL` in listener response"),
            }
        }

        if let Some(headers) = object.get("requestHeaders") {
            match headers_from_wire(headers) {
                Some(headers) => response.request_headers = Some(headers),
                None => tracing::warn!("ignoring malformed `requestHeaders` in listener response"),
            }
        }

        if let Some(headers) = object.get("responseHeaders") {
            match headers_from_wire(headers) {
                Some(headers) => response.response_headers = Some(headers),
                None => tracing::warn!("ignoring malformed `responseHeaders` in listener response"),
            }
        }

        if let Some(status_line) = object.get("statusLine") {
            match status_line.as_str() {
                Some(status_line) => response.status_line = Some(status_line.to_string()),
                None => tracing::warn!("ignoring non-string `statusLine` in listener response"),
            }
        }

        response
    }
}
