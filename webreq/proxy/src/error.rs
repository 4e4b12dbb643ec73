use thiserror::Error;

use crate::transport::TransportError;

/// Terminal failure of a proxied request, as observed by the original
/// caller and by `errorOccurred` listeners.
///
/// These are outcome values, not propagated errors - a request that fails
/// still runs its cleanup and notification path exactly once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// A blocking-stage listener cancelled the request.
    #[error("request blocked by a listener")]
    BlockedByClient,
    /// The underlying transport failed; surfaced verbatim, never retried
    /// here.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
