//! Arena of in-flight requests, keyed by request id.
//!
//! A record is inserted before its frame is written and removed exactly once:
//! when its response arrives, when the caller gives up, or when the socket it
//! was written on closes. Removal is what makes delivery at-most-once; a second
//! response for the same id finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::trace;

use crate::error::RpcError;
use crate::protocol::DeviceResponse;

pub(crate) type Reply = Result<DeviceResponse, RpcError>;

struct PendingRequest {
    request_type: &'static str,
    generation: u64,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a request written on connection `generation`.
    pub(crate) fn register(
        &self,
        id: String,
        request_type: &'static str,
        generation: u64,
    ) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            PendingRequest {
                request_type,
                generation,
                reply: tx,
            },
        );
        rx
    }

    /// Deliver a response to its waiting caller.
    ///
    /// Returns `false` if no request with that id is in flight.
    pub(crate) fn resolve(&self, response: DeviceResponse) -> bool {
        let Some(pending) = self.lock().remove(response.id()) else {
            return false;
        };

        let reply = if response.envelope.is_success() {
            Ok(response)
        } else {
            Err(RpcError::Device {
                request_type: pending.request_type,
                message: response
                    .envelope
                    .error_message()
                    .unwrap_or("unknown device error")
                    .to_string(),
            })
        };

        // The caller may have timed out between removal and send.
        if pending.reply.send(reply).is_err() {
            trace!(request_type = pending.request_type, "caller no longer waiting");
        }
        true
    }

    /// Forget a request without answering it.
    pub(crate) fn abandon(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Reject every request written on a connection that has closed.
    pub(crate) fn fail_generation(&self, generation: u64) -> usize {
        let failed: Vec<PendingRequest> = {
            let mut map = self.lock();
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, p)| p.generation == generation)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };

        let count = failed.len();
        for pending in failed {
            let _ = pending.reply.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Guard that abandons `id` when dropped, so a caller that stops polling
    /// (cancelled in a `select!`, task aborted) does not leave its record
    /// behind.
    pub(crate) fn abandon_on_drop(self: &Arc<Self>, id: &str) -> AbandonOnDrop {
        AbandonOnDrop {
            pending: self.clone(),
            id: id.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }
}

pub(crate) struct AbandonOnDrop {
    pending: Arc<PendingRequests>,
    id: String,
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        // No-op once the record was resolved or failed.
        if self.pending.abandon(&self.id) {
            trace!(request_id = %self.id, "pending request abandoned");
        }
    }
}
