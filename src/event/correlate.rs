use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use hashbrown::HashMap;
use tokio::{select, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    channel::Channel,
    error::{Error, Unanswered},
    wire::{EventId, Method, RequestEvent, ResponseEvent},
};

// Turns a pushed request event into an awaitable call.
//
// Every outgoing request gets a fresh ID and a pending record holding the
// sender half of a oneshot. The first response carrying that ID takes the
// record out of the table and completes the call; anything arriving later,
// or carrying an ID nobody is waiting for, finds no record and is dropped.
// The record is also removed whenever the waiting call gives up, so nothing
// outlives its caller.

struct PendingRequest {
    method: Method,
    created_at: DateTime<Utc>,
    result_tx: oneshot::Sender<ResponseEvent>,
}

#[derive(Default)]
pub(crate) struct Correlator {
    pending: Mutex<HashMap<EventId, PendingRequest>>,
}

/// Removes the pending record when the waiting call ends, however it ends.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: EventId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.table().remove(&self.id);
    }
}

impl Correlator {
    fn table(&self) -> MutexGuard<'_, HashMap<EventId, PendingRequest>> {
        // the table stays consistent even if a holder panicked
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.table().len()
    }

    /// Pushes a request to `channels` and waits for the first matching
    /// response, the caller's cancellation, `timeout`, or every target
    /// closing, whichever comes first.
    pub(crate) async fn send_request(
        &self,
        ctx: &CancellationToken,
        channels: Vec<Arc<Channel>>,
        method: Method,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        if channels.is_empty() {
            return Err(Error::NoPeerAvailable);
        }

        let event = RequestEvent::new(method, payload);
        let id = event.id;
        let (result_tx, result_rx) = oneshot::channel();
        self.table().insert(
            id,
            PendingRequest {
                method,
                created_at: event.create_time,
                result_tx,
            },
        );
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        let mut targets = Vec::with_capacity(channels.len());
        let mut last_err = None;
        for channel in channels {
            match channel.push(event.clone()) {
                Ok(()) => {
                    trace!(request = %id, channel = %channel.id(), %method, "pushed request");
                    targets.push(channel.closed_token());
                }
                Err(e) => {
                    warn!(request = %id, channel = %channel.id(), "failed to push request: {}", e);
                    last_err = Some(e);
                }
            }
        }
        if targets.is_empty() {
            return Err(last_err.unwrap_or(Error::NoPeerAvailable));
        }

        let all_targets_closed = join_all(targets.iter().map(|t| t.cancelled()));
        let response = select! {
            response = result_rx => match response {
                Ok(response) => response,
                // the record vanished without being resolved
                Err(_) => return Err(Error::Unanswered { id, reason: Unanswered::PeersGone }),
            },
            _ = ctx.cancelled() => {
                debug!(request = %id, %method, "request cancelled by caller");
                return Err(Error::Unanswered { id, reason: Unanswered::Cancelled });
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(request = %id, %method, ?timeout, "request timed out");
                return Err(Error::Unanswered { id, reason: Unanswered::TimedOut });
            }
            _ = all_targets_closed => {
                debug!(request = %id, %method, "all target channels closed");
                return Err(Error::Unanswered { id, reason: Unanswered::PeersGone });
            }
        };

        match response.error {
            Some(error) => Err(Error::Remote(error)),
            None => Ok(response.payload),
        }
    }

    /// Hands a response to the call waiting on its ID. Returns false if
    /// nobody was waiting, in which case the response is discarded.
    pub(crate) fn resolve(&self, response: ResponseEvent) -> bool {
        let pending = self.table().remove(&response.id);
        match pending {
            Some(pending) => {
                let elapsed = Utc::now() - pending.created_at;
                debug!(
                    request = %response.id,
                    method = %pending.method,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "response matched"
                );
                // the caller may have given up between removal and send
                pending.result_tx.send(response).is_ok()
            }
            None => {
                debug!(request = %response.id, "discarding unsolicited response");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel(capacity: usize) -> (Arc<Channel>, mpsc::Receiver<RequestEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Channel::new(0, None, tx, CancellationToken::new());
        (Arc::new(channel), rx)
    }

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_empty_target_set_fails_fast() {
        let correlator = Correlator::default();
        let ctx = CancellationToken::new();
        let err = correlator
            .send_request(&ctx, vec![], Method::HasResource, vec![], LONG)
            .await
            .unwrap_err();
        assert!(err.is_no_peer());
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_response_completes_request() {
        let correlator = Arc::new(Correlator::default());
        let (ch, mut rx) = channel(4);
        let ctx = CancellationToken::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_request(&ctx, vec![ch], Method::GetResource, vec![], LONG)
                    .await
            })
        };

        let request = rx.recv().await.unwrap();
        assert_eq!(request.method, Method::GetResource);
        assert!(correlator.resolve(ResponseEvent::ok(request.id, b"abc".to_vec())));
        assert_eq!(waiter.await.unwrap().unwrap(), b"abc");
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_second_response_is_discarded() {
        let correlator = Arc::new(Correlator::default());
        let (ch, mut rx) = channel(4);
        let ctx = CancellationToken::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_request(&ctx, vec![ch], Method::GetResource, vec![], LONG)
                    .await
            })
        };

        let request = rx.recv().await.unwrap();
        assert!(correlator.resolve(ResponseEvent::ok(request.id, b"first".to_vec())));
        assert!(!correlator.resolve(ResponseEvent::ok(request.id, b"second".to_vec())));
        assert_eq!(waiter.await.unwrap().unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let correlator = Arc::new(Correlator::default());
        let (ch, mut rx) = channel(4);
        let ctx = CancellationToken::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_request(&ctx, vec![ch], Method::GetResource, vec![], LONG)
                    .await
            })
        };

        let request = rx.recv().await.unwrap();
        correlator.resolve(ResponseEvent::err(request.id, "no such piece"));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Remote(msg) if msg == "no such piece"));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending() {
        let correlator = Correlator::default();
        let (ch, _rx) = channel(4);
        let ctx = CancellationToken::new();

        let err = correlator
            .send_request(
                &ctx,
                vec![ch],
                Method::HasResource,
                vec![],
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.unanswered(), Some(Unanswered::TimedOut));
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let correlator = Correlator::default();
        let (ch, _rx) = channel(1);
        ch.push(RequestEvent::new(Method::InitConnect, vec![])).unwrap();
        let ctx = CancellationToken::new();

        let err = correlator
            .send_request(&ctx, vec![ch], Method::HasResource, vec![], LONG)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(_)));
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_closing_target_wakes_waiter() {
        let correlator = Correlator::default();
        let (ch, _rx) = channel(4);
        let ctx = CancellationToken::new();

        let closer = {
            let ch = ch.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ch.close();
            }
        };
        let (result, ()) = tokio::join!(
            correlator.send_request(&ctx, vec![ch], Method::GetResource, vec![], LONG),
            closer
        );
        assert_eq!(result.unwrap_err().unanswered(), Some(Unanswered::PeersGone));
    }
}
