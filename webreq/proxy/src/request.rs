//! Per-request state threaded through the interception stages.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::{
    error::NetError,
    events::{
        headers_to_wire, BeforeRedirectDetails, BeforeRequestDetails, ErrorDetails, EventDetails,
        RequestHeadersDetails, RequestInfo, ResourceType, ResponseDetails,
    },
};

/// Process-unique id of a proxied request, assigned by the factory.
/// Distinct from any transport-level id.
pub type RequestId = u64;

/// A request handed to the factory for interception and forwarding.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub url: Uri,
    pub method: Method,
    pub headers: HeaderMap,
    pub referrer: Option<Uri>,
    pub resource_type: Option<ResourceType>,
    /// Whether the caller wants transport redirects followed without
    /// resurfacing them through the interception pipeline. Only honored
    /// when no listener needs header visibility.
    pub follow_redirects: bool,
}

impl ProxiedRequest {
    pub fn new(url: Uri, method: Method) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            referrer: None,
            resource_type: None,
            follow_redirects: false,
        }
    }
}

/// Events delivered to the original caller.
#[derive(Debug)]
pub enum ClientEvent {
    /// Response headers are final; body bytes follow.
    ResponseStarted {
        status: StatusCode,
        status_line: Option<String>,
        headers: HeaderMap,
    },
    /// A chunk of response body, forwarded verbatim.
    BodyData(Bytes),
    /// The exchange finished successfully.
    Completed,
    /// The exchange terminated with a failure. No response data follows.
    Failed(NetError),
}

/// The mutable per-request record.
///
/// Exclusively owned by the state machine driving the request; destroyed
/// when the request reaches a terminal state.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub url: Uri,
    pub method: Method,
    pub request_headers: HeaderMap,
    pub referrer: Option<Uri>,
    pub resource_type: Option<ResourceType>,
    pub response_headers: Option<HeaderMap>,
    pub status_code: Option<StatusCode>,
    pub status_line: Option<String>,
    pub redirect_url: Option<Uri>,
    /// Whether the transport was asked to expose synchronous header
    /// interception for this request. Fixed at creation time.
    pub is_using_header_client: bool,
    /// Guard for the one-blocking-dispatch-at-a-time invariant.
    pub(crate) dispatch_in_flight: bool,
    completed: bool,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: RequestId,
        request: &ProxiedRequest,
        is_using_header_client: bool,
    ) -> Self {
        Self {
            request_id,
            url: request.url.clone(),
            method: request.method.clone(),
            request_headers: request.headers.clone(),
            referrer: request.referrer.clone(),
            resource_type: request.resource_type,
            response_headers: None,
            status_code: None,
            status_line: None,
            redirect_url: None,
            is_using_header_client,
            dispatch_in_flight: false,
            completed: false,
        }
    }

    /// Marks the request as completed. Returns `false` if it already was -
    /// at most one termination path may run its notifications.
    pub(crate) fn mark_completed(&mut self) -> bool {
        !std::mem::replace(&mut self.completed, true)
    }

    /// Clears response state before re-running the pipeline for a redirect.
    pub(crate) fn reset_for_redirect(&mut self, target: Uri) {
        self.url = target;
        self.response_headers = None;
        self.status_code = None;
        self.status_line = None;
    }

    fn info(&self) -> RequestInfo {
        RequestInfo {
            id: self.request_id,
            url: self.url.to_string(),
            method: self.method.to_string(),
            timestamp: RequestInfo::now_timestamp(),
            resource_type: self.resource_type,
            referrer: self.referrer.as_ref().map(Uri::to_string),
        }
    }

    fn response_details(&self) -> ResponseDetails {
        ResponseDetails {
            info: self.info(),
            status_line: self.status_line.clone(),
            status_code: self.status_code.map(|status| status.as_u16()),
            response_headers: self.response_headers.as_ref().map(headers_to_wire),
        }
    }

    pub(crate) fn before_request_details(&self) -> EventDetails {
        EventDetails::BeforeRequest(BeforeRequestDetails { info: self.info() })
    }

    pub(crate) fn before_send_headers_details(&self) -> EventDetails {
        EventDetails::BeforeSendHeaders(RequestHeadersDetails {
            info: self.info(),
            request_headers: headers_to_wire(&self.request_headers),
        })
    }

    pub(crate) fn send_headers_details(&self) -> EventDetails {
        EventDetails::SendHeaders(RequestHeadersDetails {
            info: self.info(),
            request_headers: headers_to_wire(&self.request_headers),
        })
    }

    pub(crate) fn headers_received_details(&self) -> EventDetails {
        EventDetails::HeadersReceived(self.response_details())
    }

    pub(crate) fn before_redirect_details(&self, target: &Uri) -> EventDetails {
        EventDetails::BeforeRedirect(BeforeRedirectDetails {
            response: self.response_details(),
            redirect_url: target.to_string(),
        })
    }

    pub(crate) fn response_started_details(&self) -> EventDetails {
        EventDetails::ResponseStarted(self.response_details())
    }

    pub(crate) fn error_details(&self, error: &NetError) -> EventDetails {
        EventDetails::ErrorOccurred(ErrorDetails {
            info: self.info(),
            error: error.to_string(),
        })
    }

    pub(crate) fn completed_details(&self) -> EventDetails {
        EventDetails::Completed(self.response_details())
    }
}
