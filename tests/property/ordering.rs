//! Property-based tests for relay fan-out and ordering.
//!
//! Drives a [`Relay`] with random join/message/disconnect sequences over a
//! handful of connection slots and checks, after every step:
//! 1. Every live connection received exactly one copy of the emitted event,
//!    or nothing when no event was emitted.
//! 2. A departing connection never receives its own leave notice.
//! 3. Authors are the bound display name, or `Anonymous` before joining.
//! 4. Timestamps never decrease.

use std::sync::Arc;
use std::time::Duration;

use babble_proto::event::{ChatEvent, Timestamp};
use babble_relay::registry::ConnectionId;
use babble_relay::relay::{ANONYMOUS, Relay};
use proptest::prelude::*;
use tokio::sync::mpsc;

const SLOTS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Connect,
    Join(String),
    Message(String),
    Disconnect,
}

/// Text that is sometimes blank, sometimes padded.
fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("   ".to_string()),
        "[a-zA-Z]{1,8}",
        " [a-z]{1,6} ",
    ]
}

fn arb_op() -> impl Strategy<Value = (usize, Op)> {
    (
        0..SLOTS,
        prop_oneof![
            Just(Op::Connect),
            arb_text().prop_map(Op::Join),
            arb_text().prop_map(Op::Message),
            Just(Op::Disconnect),
        ],
    )
}

struct Slot {
    id: ConnectionId,
    name: Option<String>,
    rx: mpsc::Receiver<Arc<ChatEvent>>,
}

/// A relay plus a simple model of what it should contain.
struct Harness {
    relay: Relay,
    slots: Vec<Option<Slot>>,
    next_id: u64,
    last_timestamp: Option<Timestamp>,
}

impl Harness {
    fn new() -> Self {
        Self {
            relay: Relay::new(),
            slots: (0..SLOTS).map(|_| None).collect(),
            next_id: 1,
            last_timestamp: None,
        }
    }

    /// Id used for an empty slot; never registered.
    fn stale_id(slot: usize) -> ConnectionId {
        ConnectionId::new(u64::MAX - slot as u64)
    }

    fn apply(&mut self, slot: usize, op: Op) -> Result<(), TestCaseError> {
        match op {
            Op::Connect => {
                if self.slots[slot].is_none() {
                    let (tx, rx) = mpsc::channel(1024);
                    let id = ConnectionId::new(self.next_id);
                    self.next_id += 1;
                    self.relay.register(id, tx);
                    self.slots[slot] = Some(Slot { id, name: None, rx });
                }
                self.check_fanout(None)
            }
            Op::Join(raw) => {
                let trimmed = raw.trim().to_string();
                let (id, expected) = match &self.slots[slot] {
                    Some(s) if s.name.is_none() && !trimmed.is_empty() => {
                        (s.id, Some(format!("{trimmed} has joined the chat")))
                    }
                    Some(s) => (s.id, None),
                    None => (Self::stale_id(slot), None),
                };

                let event = self.relay.handle_join(id, &raw);
                prop_assert_eq!(event.as_ref().map(|e| e.body.clone()), expected);
                if event.is_some()
                    && let Some(s) = self.slots[slot].as_mut()
                {
                    s.name = Some(trimmed);
                }
                self.check_fanout(event)
            }
            Op::Message(raw) => {
                let trimmed = raw.trim();
                let (id, expected_author) = match &self.slots[slot] {
                    Some(s) if !trimmed.is_empty() => (
                        s.id,
                        Some(s.name.clone().unwrap_or_else(|| ANONYMOUS.to_string())),
                    ),
                    Some(s) => (s.id, None),
                    None => (Self::stale_id(slot), None),
                };

                let event = self.relay.handle_message(id, &raw);
                prop_assert_eq!(
                    event.as_ref().and_then(|e| e.author().map(str::to_string)),
                    expected_author
                );
                if let Some(e) = &event {
                    prop_assert_eq!(e.body.as_str(), trimmed);
                }
                self.check_fanout(event)
            }
            Op::Disconnect => {
                let departing = self.slots[slot].take();
                let id = departing
                    .as_ref()
                    .map_or_else(|| Self::stale_id(slot), |s| s.id);
                let expected = departing
                    .as_ref()
                    .and_then(|s| s.name.as_ref())
                    .map(|name| format!("{name} has left the chat"));

                let event = self.relay.handle_disconnect(id);
                prop_assert_eq!(event.as_ref().map(|e| e.body.clone()), expected);

                if let Some(mut s) = departing {
                    prop_assert!(drain(&mut s.rx).is_empty(), "departing connection got an event");
                }
                self.check_fanout(event)
            }
        }
    }

    fn check_fanout(&mut self, event: Option<Arc<ChatEvent>>) -> Result<(), TestCaseError> {
        let live = self.slots.iter().flatten().count();
        prop_assert_eq!(self.relay.connection_count(), live);

        for slot in self.slots.iter_mut().flatten() {
            let received = drain(&mut slot.rx);
            match &event {
                Some(e) => {
                    prop_assert_eq!(received, vec![Arc::clone(e)]);
                }
                None => {
                    prop_assert!(received.is_empty());
                }
            }
        }

        if let Some(e) = &event {
            if let Some(last) = self.last_timestamp {
                prop_assert!(last <= e.timestamp, "timestamp went backwards");
            }
            self.last_timestamp = Some(e.timestamp);
        }
        Ok(())
    }
}

fn drain(rx: &mut mpsc::Receiver<Arc<ChatEvent>>) -> Vec<Arc<ChatEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

proptest! {
    #[test]
    fn fanout_is_exactly_once_per_live_connection(
        ops in prop::collection::vec(arb_op(), 1..80)
    ) {
        let mut harness = Harness::new();
        for (slot, op) in ops {
            harness.apply(slot, op)?;
        }
    }
}

/// Many senders racing through handles still produce one global order.
#[tokio::test]
async fn concurrent_senders_get_non_decreasing_timestamps() {
    const SENDERS: usize = 8;
    const PER_SENDER: usize = 25;

    let relay = Relay::spawn(64);
    let (observer_tx, mut observer_rx) = mpsc::channel(SENDERS * PER_SENDER + 16);
    relay.connect(observer_tx).await.unwrap();

    let mut tasks = Vec::new();
    for sender in 0..SENDERS {
        let relay = relay.clone();
        tasks.push(tokio::spawn(async move {
            let (tx, rx) = mpsc::channel(SENDERS * PER_SENDER + 16);
            let id = relay.connect(tx).await.unwrap();
            for n in 0..PER_SENDER {
                relay.message(id, format!("{sender}:{n}")).await.unwrap();
            }
            // Keep the outbox alive until every message is queued.
            drop(rx);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut events = Vec::new();
    for _ in 0..SENDERS * PER_SENDER {
        let event = tokio::time::timeout(Duration::from_secs(5), observer_rx.recv())
            .await
            .expect("recv timed out")
            .expect("observer outbox closed");
        events.push(event);
    }

    assert!(
        events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
        "timestamps must be non-decreasing"
    );

    // Each sender's own messages keep their send order.
    for sender in 0..SENDERS {
        let prefix = format!("{sender}:");
        let seq: Vec<usize> = events
            .iter()
            .filter_map(|e| e.body.strip_prefix(&prefix)?.parse().ok())
            .collect();
        assert_eq!(seq, (0..PER_SENDER).collect::<Vec<_>>());
    }
}
