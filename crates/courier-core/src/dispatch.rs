//! Fanout dispatch for Courier.
//!
//! Takes a resolved event and a recipient set, looks up channels in the
//! registry, and pushes the event to each. Message delivery runs two
//! passes: the canonical copy to every recipient channel and a self-echo to
//! every channel of the sender, so the sender's other devices stay in sync.
//!
//! A channel that fails or times out is logged and skipped; the user is
//! effectively offline on that channel and the normal disconnect path will
//! clean it up. One bad channel never blocks the rest of a dispatch.

use crate::event::{ServerEvent, StoredMessage, UserId};
use crate::registry::{Channel, Registry};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{trace, warn};

/// Default per-channel send timeout.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome counts for one dispatch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Channels the event was handed to.
    pub delivered: usize,
    /// Channels that were closed, full past the timeout, or otherwise failed.
    pub failed: usize,
}

impl DeliveryReport {
    fn absorb(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// The fanout dispatcher.
pub struct Dispatcher {
    registry: Arc<Registry>,
    send_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over a registry with the default send timeout.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_timeout(registry, DEFAULT_SEND_TIMEOUT)
    }

    /// Create a dispatcher with a specific per-channel send timeout.
    #[must_use]
    pub fn with_timeout(registry: Arc<Registry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Deliver a persisted message.
    ///
    /// Pass one sends the canonical copy to every channel of every target
    /// except the sender; pass two sends the self-echo to every channel of
    /// the sender. Both copies carry the same id and timestamp. A sender
    /// with no remaining channels simply gets no echo.
    pub async fn deliver_message(
        &self,
        message: &StoredMessage,
        targets: &HashSet<UserId>,
        sender: UserId,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let receive = Arc::new(ServerEvent::Receive(message.clone()));
        let mut recipient_channels = Vec::new();
        for &user in targets {
            // a sender inside the target set gets the echo pass only
            if user == sender {
                continue;
            }
            recipient_channels.extend(self.registry.channels_for(user));
        }
        report.absorb(self.push_all(recipient_channels, receive).await);

        let echo = Arc::new(ServerEvent::Echo(message.clone()));
        report.absorb(self.push_all(self.registry.channels_for(sender), echo).await);

        trace!(
            message = message.id,
            delivered = report.delivered,
            failed = report.failed,
            "Message dispatched"
        );
        report
    }

    /// Deliver a transient signal to the target set. No self-echo.
    pub async fn deliver_signal(
        &self,
        event: ServerEvent,
        targets: &HashSet<UserId>,
    ) -> DeliveryReport {
        let event = Arc::new(event);
        let mut channels = Vec::new();
        for &user in targets {
            channels.extend(self.registry.channels_for(user));
        }
        self.push_all(channels, event).await
    }

    /// Deliver an event to every channel of every connected user.
    ///
    /// Used for presence changes, which go to everyone rather than being
    /// conversation-scoped.
    pub async fn broadcast(&self, event: ServerEvent) -> DeliveryReport {
        let event = Arc::new(event);
        self.push_all(self.registry.all_channels(), event).await
    }

    /// Push one event to a set of channels.
    ///
    /// Sends run as joined futures so a hung channel delays nobody else;
    /// each send is bounded by the configured timeout. Failures are logged
    /// and swallowed, never retried, never surfaced to the sender.
    async fn push_all(&self, channels: Vec<Channel>, event: Arc<ServerEvent>) -> DeliveryReport {
        let send_timeout = self.send_timeout;
        let sends = channels.into_iter().map(|channel| {
            let event = Arc::clone(&event);
            async move {
                match timeout(send_timeout, channel.tx.send(event)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(_)) => {
                        warn!(
                            connection = channel.connection_id,
                            user = channel.user_id,
                            "Delivery failed: channel closed"
                        );
                        false
                    }
                    Err(_) => {
                        warn!(
                            connection = channel.connection_id,
                            user = channel.user_id,
                            "Delivery failed: send timed out"
                        );
                        false
                    }
                }
            }
        });

        let mut report = DeliveryReport::default();
        for ok in join_all(sends).await {
            if ok {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ConversationTarget, MessageKind};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn stored(id: i64, sender: UserId, target: ConversationTarget) -> StoredMessage {
        StoredMessage {
            id,
            sender,
            target,
            content: "hello".into(),
            kind: MessageKind::Text,
            file_url: None,
            reply_to: None,
            reactions: HashMap::new(),
            is_read: false,
            timestamp: 1000,
        }
    }

    fn connect(
        registry: &Registry,
        user: UserId,
    ) -> (u64, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(8);
        let (conn, _) = registry.register(user, "user", tx);
        (conn, rx)
    }

    #[tokio::test]
    async fn test_peer_message_receive_and_echo() {
        let registry = Arc::new(Registry::new());
        let (_c1, mut sender_rx) = connect(&registry, 1);
        let (_c2, mut peer_rx) = connect(&registry, 2);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let message = stored(7, 1, ConversationTarget::Peer(2));
        let report = dispatcher
            .deliver_message(&message, &HashSet::from([2]), 1)
            .await;
        assert_eq!(report, DeliveryReport { delivered: 2, failed: 0 });

        let got = peer_rx.try_recv().unwrap();
        assert!(matches!(&*got, ServerEvent::Receive(m) if m.id == 7));
        assert!(peer_rx.try_recv().is_err());

        let got = sender_rx.try_recv().unwrap();
        assert!(matches!(&*got, ServerEvent::Echo(m) if m.id == 7 && m.timestamp == 1000));
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_echo_reaches_all_sender_devices() {
        let registry = Arc::new(Registry::new());
        let (_c1, mut dev1) = connect(&registry, 1);
        let (_c2, mut dev2) = connect(&registry, 1);
        let (_c3, mut peer) = connect(&registry, 2);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let message = stored(1, 1, ConversationTarget::Peer(2));
        dispatcher
            .deliver_message(&message, &HashSet::from([2]), 1)
            .await;

        assert!(matches!(&*dev1.try_recv().unwrap(), ServerEvent::Echo(_)));
        assert!(matches!(&*dev2.try_recv().unwrap(), ServerEvent::Echo(_)));
        assert!(matches!(&*peer.try_recv().unwrap(), ServerEvent::Receive(_)));
    }

    #[tokio::test]
    async fn test_group_sender_in_member_set_gets_echo_only() {
        let registry = Arc::new(Registry::new());
        let (_c1, mut sender_rx) = connect(&registry, 1);
        let (_c2, mut a_rx) = connect(&registry, 2);
        let (_c3, mut b_rx) = connect(&registry, 3);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let message = stored(2, 1, ConversationTarget::Group(10));
        dispatcher
            .deliver_message(&message, &HashSet::from([1, 2, 3]), 1)
            .await;

        assert!(matches!(&*a_rx.try_recv().unwrap(), ServerEvent::Receive(_)));
        assert!(matches!(&*b_rx.try_recv().unwrap(), ServerEvent::Receive(_)));
        // exactly one event for the sender, and it is the echo
        assert!(matches!(&*sender_rx.try_recv().unwrap(), ServerEvent::Echo(_)));
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_block_others() {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = mpsc::channel(8);
        registry.register(2, "bob", tx);
        drop(rx); // bob's channel dies between lookup and send
        let (_c, mut carol_rx) = connect(&registry, 3);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let message = stored(3, 1, ConversationTarget::Group(10));
        let report = dispatcher
            .deliver_message(&message, &HashSet::from([2, 3]), 1)
            .await;

        assert_eq!(report.failed, 1);
        assert!(matches!(&*carol_rx.try_recv().unwrap(), ServerEvent::Receive(_)));
    }

    #[tokio::test]
    async fn test_offline_sender_echo_is_noop() {
        let registry = Arc::new(Registry::new());
        let (_c, mut peer_rx) = connect(&registry, 2);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        // sender 1 has no channels; dispatch still proceeds
        let message = stored(4, 1, ConversationTarget::Peer(2));
        let report = dispatcher
            .deliver_message(&message, &HashSet::from([2]), 1)
            .await;

        assert_eq!(report, DeliveryReport { delivered: 1, failed: 0 });
        assert!(matches!(&*peer_rx.try_recv().unwrap(), ServerEvent::Receive(_)));
    }

    #[tokio::test]
    async fn test_full_channel_times_out_without_stalling() {
        let registry = Arc::new(Registry::new());
        let (tx, _rx_keep) = mpsc::channel(1);
        tx.send(Arc::new(ServerEvent::PresenceChanged {
            user_id: 0,
            online: true,
            last_seen: None,
        }))
        .await
        .unwrap(); // buffer now full, receiver never drains
        registry.register(2, "bob", tx);
        let (_c, mut carol_rx) = connect(&registry, 3);

        let dispatcher =
            Dispatcher::with_timeout(Arc::clone(&registry), Duration::from_millis(20));
        let message = stored(5, 1, ConversationTarget::Group(10));
        let report = dispatcher
            .deliver_message(&message, &HashSet::from([2, 3]), 1)
            .await;

        assert_eq!(report.failed, 1);
        assert!(matches!(&*carol_rx.try_recv().unwrap(), ServerEvent::Receive(_)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_channel() {
        let registry = Arc::new(Registry::new());
        let (_c1, mut rx1) = connect(&registry, 1);
        let (_c2, mut rx2) = connect(&registry, 1);
        let (_c3, mut rx3) = connect(&registry, 2);
        let dispatcher = Dispatcher::new(Arc::clone(&registry));

        let report = dispatcher
            .broadcast(ServerEvent::PresenceChanged {
                user_id: 3,
                online: true,
                last_seen: None,
            })
            .await;

        assert_eq!(report.delivered, 3);
        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            assert!(matches!(
                &*rx.try_recv().unwrap(),
                ServerEvent::PresenceChanged { user_id: 3, .. }
            ));
        }
    }
}
