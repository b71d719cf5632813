use std::sync::{Arc, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::err::ProbeError;

/// Process wide cap on concurrently open transports.
///
/// Keeps kernel resource use bounded when the binary runs setuid; the
/// permit is held by the socket and returned when it is dropped.
pub const MAX_OPEN_TRANSPORTS: usize = 100;

fn permits() -> &'static Arc<Semaphore> {
    static PERMITS: OnceLock<Arc<Semaphore>> = OnceLock::new();
    PERMITS.get_or_init(|| Arc::new(Semaphore::new(MAX_OPEN_TRANSPORTS)))
}

/// Claims one transport slot or fails with
/// [`ProbeError::TooManySockets`] without waiting.
pub(crate) fn acquire_transport_slot() -> Result<OwnedSemaphorePermit, ProbeError> {
    permits()
        .clone()
        .try_acquire_owned()
        .map_err(|_| ProbeError::TooManySockets)
}
