//! Command dispatch and acknowledgement correlation.
//!
//! Outbound commands are stamped with a per-device monotonically
//! increasing sequence number; devices acknowledge with
//! `message_id = "<type>:<seq>"`, so correlation works even for
//! message types that carry no natural key. The group barrier awaits
//! all targets in parallel under ONE shared deadline — device latency
//! does not stack — and an abort token releases every waiter
//! immediately.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{Message, Payload};
use crate::net::ConnectionSender;

// ── AckOutcome ───────────────────────────────────────────────────

/// Per-device result of an awaited command.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    /// The device acknowledged within the deadline.
    Acked {
        success: bool,
        rtt: Duration,
        error: Option<String>,
    },
    /// No acknowledgement arrived before the deadline.
    TimedOut,
    /// The message never left: the connection channel is gone.
    SendFailed,
    /// The wait was cancelled by a session abort.
    Cancelled,
}

impl AckOutcome {
    /// Whether the device positively acknowledged.
    pub fn is_success(&self) -> bool {
        matches!(self, AckOutcome::Acked { success: true, .. })
    }
}

#[derive(Debug)]
struct AckReply {
    success: bool,
    error: Option<String>,
}

// ── Dispatcher ───────────────────────────────────────────────────

/// Sends typed commands to devices and correlates their replies.
#[derive(Debug, Default)]
pub struct Dispatcher {
    /// Waiters keyed by `"<device>/<type>:<seq>"`.
    pending: Mutex<HashMap<String, oneshot::Sender<AckReply>>>,
    /// Per-device outbound sequence counters.
    seqs: Mutex<HashMap<String, u64>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self, device_id: &str) -> u64 {
        let mut seqs = self.seqs.lock().unwrap();
        let seq = seqs.entry(device_id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Fire-and-forget send. Transport errors are logged, never
    /// surfaced — the fault manager learns about dead connections
    /// from the read loop.
    pub async fn send_to(&self, device_id: &str, sender: &ConnectionSender, payload: Payload) {
        let seq = self.next_seq(device_id);
        let msg = Message::with_seq(payload, seq);
        if sender.send(msg).await.is_err() {
            warn!(device = device_id, "send failed: connection gone");
        }
    }

    /// Send one command and await its acknowledgement until
    /// `deadline`, or until `cancel` fires.
    pub async fn send_await_ack(
        &self,
        device_id: &str,
        sender: &ConnectionSender,
        payload: Payload,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> AckOutcome {
        let seq = self.next_seq(device_id);
        let msg = Message::with_seq(payload, seq);
        // expects_ack payloads always carry a seq, so this is Some.
        let Some(correlation) = msg.correlation_id() else {
            warn!(device = device_id, kind = msg.payload.kind(), "awaiting ack for unstamped message");
            return AckOutcome::SendFailed;
        };
        let key = format!("{device_id}/{correlation}");

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(key.clone(), reply_tx);

        let sent_at = Instant::now();
        if sender.send(msg).await.is_err() {
            self.pending.lock().unwrap().remove(&key);
            warn!(device = device_id, "send failed: connection gone");
            return AckOutcome::SendFailed;
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => AckOutcome::Cancelled,
            reply = reply_rx => match reply {
                Ok(AckReply { success, error }) => AckOutcome::Acked {
                    success,
                    rtt: sent_at.elapsed(),
                    error,
                },
                // Waiter dropped without a reply; treat as timeout.
                Err(_) => AckOutcome::TimedOut,
            },
            _ = tokio::time::sleep_until(deadline.into()) => AckOutcome::TimedOut,
        };

        if !matches!(outcome, AckOutcome::Acked { .. }) {
            self.pending.lock().unwrap().remove(&key);
        }
        outcome
    }

    /// The barrier primitive: send to every target and collect
    /// per-device outcomes under a single group timeout.
    pub async fn send_to_all_await_ack<F>(
        &self,
        targets: &[(String, ConnectionSender)],
        factory: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HashMap<String, AckOutcome>
    where
        F: Fn(&str) -> Payload,
    {
        let deadline = Instant::now() + timeout;
        let waits = targets.iter().map(|(device_id, sender)| {
            let payload = factory(device_id);
            async move {
                let outcome = self
                    .send_await_ack(device_id, sender, payload, deadline, cancel)
                    .await;
                (device_id.clone(), outcome)
            }
        });
        join_all(waits).await.into_iter().collect()
    }

    /// Route an inbound `ack` to its waiter.
    ///
    /// Returns `false` for acks nobody is waiting on (late arrivals
    /// after a timeout, or duplicates) — logged, not an error.
    pub fn resolve_ack(
        &self,
        device_id: &str,
        message_id: &str,
        success: bool,
        error: Option<String>,
    ) -> bool {
        let key = format!("{device_id}/{message_id}");
        match self.pending.lock().unwrap().remove(&key) {
            Some(reply_tx) => reply_tx.send(AckReply { success, error }).is_ok(),
            None => {
                debug!(device = device_id, message_id, "ack with no waiter");
                false
            }
        }
    }

    /// Number of in-flight awaited commands.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn channel_pair() -> (ConnectionSender, mpsc::Receiver<Message>) {
        mpsc::channel(16)
    }

    fn prepare_payload(_: &str) -> Payload {
        Payload::Prepare {
            session_id: "s_20250101_000000".into(),
        }
    }

    #[tokio::test]
    async fn ack_resolves_waiter() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, mut rx) = channel_pair();
        let cancel = CancellationToken::new();

        let d = Arc::clone(&dispatcher);
        let wait = tokio::spawn(async move {
            d.send_await_ack(
                "phone_1",
                &tx,
                prepare_payload("phone_1"),
                Instant::now() + Duration::from_secs(5),
                &cancel,
            )
            .await
        });

        // Receive the stamped command and ack it the way a device would.
        let sent = rx.recv().await.unwrap();
        let message_id = sent.correlation_id().unwrap();
        assert_eq!(message_id, "prepare:1");
        assert!(dispatcher.resolve_ack("phone_1", &message_id, true, None));

        let outcome = wait.await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let dispatcher = Dispatcher::new();
        let (tx, _rx) = channel_pair();
        let cancel = CancellationToken::new();

        let outcome = dispatcher
            .send_await_ack(
                "phone_1",
                &tx,
                prepare_payload("phone_1"),
                Instant::now() + Duration::from_millis(20),
                &cancel,
            )
            .await;
        assert_eq!(outcome, AckOutcome::TimedOut);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_is_send_failed() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = channel_pair();
        drop(rx);
        let cancel = CancellationToken::new();

        let outcome = dispatcher
            .send_await_ack(
                "phone_1",
                &tx,
                prepare_payload("phone_1"),
                Instant::now() + Duration::from_secs(1),
                &cancel,
            )
            .await;
        assert_eq!(outcome, AckOutcome::SendFailed);
    }

    #[tokio::test]
    async fn cancel_releases_waiter_immediately() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (tx, _rx) = channel_pair();
        let cancel = CancellationToken::new();

        let d = Arc::clone(&dispatcher);
        let c = cancel.clone();
        let wait = tokio::spawn(async move {
            d.send_await_ack(
                "phone_1",
                &tx,
                prepare_payload("phone_1"),
                Instant::now() + Duration::from_secs(3600),
                &c,
            )
            .await
        });

        tokio::task::yield_now().await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), wait)
            .await
            .expect("cancel did not release the waiter")
            .unwrap();
        assert_eq!(outcome, AckOutcome::Cancelled);
    }

    #[tokio::test]
    async fn group_barrier_mixes_outcomes() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (tx_a, mut rx_a) = channel_pair();
        let (tx_b, _rx_b) = channel_pair(); // b never acks
        let cancel = CancellationToken::new();

        // Device A acks whatever it receives.
        let d = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while let Some(msg) = rx_a.recv().await {
                let message_id = msg.correlation_id().unwrap();
                d.resolve_ack("a", &message_id, true, None);
            }
        });

        let targets = vec![("a".to_string(), tx_a), ("b".to_string(), tx_b)];
        let started = Instant::now();
        let outcomes = dispatcher
            .send_to_all_await_ack(
                &targets,
                prepare_payload,
                Duration::from_millis(200),
                &cancel,
            )
            .await;

        assert!(outcomes["a"].is_success());
        assert_eq!(outcomes["b"], AckOutcome::TimedOut);
        // One shared deadline for the group, not one per device.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn late_ack_is_ignored() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.resolve_ack("phone_1", "prepare:99", true, None));
    }

    #[tokio::test]
    async fn seq_numbers_are_per_device_and_monotonic() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = channel_pair();

        dispatcher
            .send_to("a", &tx, Payload::Heartbeat)
            .await;
        dispatcher
            .send_to("a", &tx, Payload::Heartbeat)
            .await;
        dispatcher
            .send_to("b", &tx, Payload::Heartbeat)
            .await;

        assert_eq!(rx.recv().await.unwrap().seq, Some(1));
        assert_eq!(rx.recv().await.unwrap().seq, Some(2));
        // Fresh counter for a different device.
        assert_eq!(rx.recv().await.unwrap().seq, Some(1));
    }
}
