//! Listener registration and lookup.
//!
//! One [`ListenerRegistry`] exists per isolated network context and is
//! shared (cheaply cloned) between the host configuration path, which
//! mutates it, and the dispatcher, which only reads snapshots. Mutation goes
//! through a single write lock; [`ListenerRegistry::find_matching`] clones
//! the matching registration out, so a listener replaced mid-dispatch does
//! not race the dispatch that already started.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use http::Uri;
use webreq_match_pattern::MatchPatternSet;

use crate::{events::EventKind, invocation::ListenerHandle};

/// A single registered listener: the callback handle plus the URL patterns
/// scoping it. An empty pattern set matches every URL.
#[derive(Debug, Clone)]
pub struct ListenerRegistration {
    pub patterns: MatchPatternSet,
    pub callback: ListenerHandle,
}

#[derive(Debug, Default)]
struct Inner {
    listeners: HashMap<EventKind, ListenerRegistration>,
}

/// Stores at most one listener per [`EventKind`].
///
/// Registering a listener for an event replaces any previous one;
/// registering [`None`] removes it.
#[derive(Debug, Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Replaces the registration for `event`. A [`None`] callback removes
    /// the registration. Always succeeds.
    pub fn set_listener(
        &self,
        event: EventKind,
        patterns: MatchPatternSet,
        callback: Option<ListenerHandle>,
    ) {
        let mut inner = self.write();
        match callback {
            Some(callback) => {
                inner
                    .listeners
                    .insert(event, ListenerRegistration { patterns, callback });
            }
            None => {
                inner.listeners.remove(&event);
            }
        }
    }

    /// True iff at least one event has a registered listener.
    pub fn has_any_listener(&self) -> bool {
        !self.read().listeners.is_empty()
    }

    pub fn has_listener(&self, event: EventKind) -> bool {
        self.read().listeners.contains_key(&event)
    }

    /// Whether any currently-registered listener needs visibility into
    /// headers the transport would otherwise handle opaquely.
    pub(crate) fn uses_header_client(&self) -> bool {
        let inner = self.read();
        inner.listeners.contains_key(&EventKind::BeforeSendHeaders)
            || inner.listeners.contains_key(&EventKind::HeadersReceived)
    }

    /// Returns the callback registered for `event` iff its pattern set
    /// matches `url`. The returned handle is a snapshot - later registry
    /// mutations do not affect it.
    pub fn find_matching(&self, event: EventKind, url: &Uri) -> Option<ListenerHandle> {
        let inner = self.read();
        let registration = inner.listeners.get(&event)?;
        registration
            .patterns
            .matches(url)
            .then(|| registration.callback.clone())
    }

    pub fn on_before_request(&self, filter: Option<MatchPatternSet>, listener: Option<ListenerHandle>) {
        self.set_listener(EventKind::BeforeRequest, filter.unwrap_or_default(), listener);
    }

    pub fn on_before_send_headers(
        &self,
        filter: Option<MatchPatternSet>,
        listener: Option<ListenerHandle>,
    ) {
        self.set_listener(EventKind::BeforeSendHeaders, filter.unwrap_or_default(), listener);
    }

    pub fn on_send_headers(&self, filter: Option<MatchPatternSet>, listener: Option<ListenerHandle>) {
        self.set_listener(EventKind::SendHeaders, filter.unwrap_or_default(), listener);
    }

    pub fn on_headers_received(
        &self,
        filter: Option<MatchPatternSet>,
        listener: Option<ListenerHandle>,
    ) {
        self.set_listener(EventKind::HeadersReceived, filter.unwrap_or_default(), listener);
    }

    pub fn on_before_redirect(
        &self,
        filter: Option<MatchPatternSet>,
        listener: Option<ListenerHandle>,
    ) {
        self.set_listener(EventKind::BeforeRedirect, filter.unwrap_or_default(), listener);
    }

    pub fn on_response_started(
        &self,
        filter: Option<MatchPatternSet>,
        listener: Option<ListenerHandle>,
    ) {
        self.set_listener(EventKind::ResponseStarted, filter.unwrap_or_default(), listener);
    }

    pub fn on_error_occurred(
        &self,
        filter: Option<MatchPatternSet>,
        listener: Option<ListenerHandle>,
    ) {
        self.set_listener(EventKind::ErrorOccurred, filter.unwrap_or_default(), listener);
    }

    pub fn on_completed(&self, filter: Option<MatchPatternSet>, listener: Option<ListenerHandle>) {
        self.set_listener(EventKind::Completed, filter.unwrap_or_default(), listener);
    }
}
