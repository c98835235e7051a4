use lifeline_dedup::{DedupLog, DedupStats, DeduplicationManager, MemoryDedupLog, SqliteDedupLog};
use lifeline_geo::{GeoRouter, GeoZone, PeerGeoInfo, PeerScore};
use lifeline_protocol::{Clock, MessageId, PeerId, WireMessage};
use lifeline_store::{
    create_stored_message, MemoryMessageStore, MessagePriority, MessageStatus, MessageStore,
    QuotaInfo, QuotaManager, SqliteMessageStore, StoreOptions, StoreStats, StoredMessage,
};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, StorageBackend};
use crate::error::Result;

/// What happened to a message handed to the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Stored(MessageId),
    /// Already seen; dropped
    Duplicate(MessageId),
    /// No room even after eviction; caller should reject or defer
    NoRoom(MessageId),
}

impl InboundOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, InboundOutcome::Stored(_))
    }
}

/// Combined node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub dedup: DedupStats,
    pub store: StoreStats,
    pub quota: QuotaInfo,
}

/// Store-and-forward relay node
pub struct RelayNode {
    clock: Arc<dyn Clock>,
    dedup: DeduplicationManager,
    store: Arc<dyn MessageStore>,
    quota: QuotaManager,
    router: GeoRouter,
}

impl RelayNode {
    pub async fn new(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        info!("Initializing relay node components...");
        config.validate()?;

        let backend = config.storage.backend;
        let (store, log): (Arc<dyn MessageStore>, Arc<dyn DedupLog>) = match backend {
            StorageBackend::Memory => (
                Arc::new(MemoryMessageStore::new(Arc::clone(&clock))),
                Arc::new(MemoryDedupLog::new()),
            ),
            StorageBackend::Sqlite => {
                let dir = &config.storage.data_directory;
                fs::create_dir_all(dir)?;
                (
                    Arc::new(SqliteMessageStore::open(dir, Arc::clone(&clock)).await?),
                    Arc::new(SqliteDedupLog::open(dir).await?),
                )
            }
        };
        info!("✓ Storage initialized ({:?})", backend);

        let dedup = DeduplicationManager::new(config.dedup.clone(), log, Arc::clone(&clock))?;
        let restored = dedup.rebuild_from_log().await?;
        info!("✓ Deduplication initialized ({} known messages)", restored);

        let quota =
            QuotaManager::new(config.quota.clone(), Arc::clone(&store), Arc::clone(&clock))?;
        info!("✓ Quota manager initialized ({} bytes)", config.quota.max_bytes);

        let local_zone = config.parsed_local_zone();
        match &local_zone {
            Some(zone) => info!("✓ Geo router initialized (zone {})", zone.zone_id),
            None => info!("✓ Geo router initialized (no local zone)"),
        }
        let router = GeoRouter::new(local_zone, config.geo.clone());

        Ok(Self {
            clock,
            dedup,
            store,
            quota,
            router,
        })
    }

    pub fn dedup(&self) -> &DeduplicationManager {
        &self.dedup
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn router(&self) -> &GeoRouter {
        &self.router
    }

    pub fn set_local_zone(&mut self, zone: Option<GeoZone>) {
        self.router.set_local_zone(zone);
    }

    /// Accept a message received from a peer for delivery or forwarding
    pub async fn accept_inbound(
        &self,
        message: WireMessage,
        recipient: PeerId,
        mut options: StoreOptions,
    ) -> Result<InboundOutcome> {
        let id = message.id();
        if !self.dedup.check_and_mark(&id).await? {
            debug!("Dropping duplicate message {}", id);
            return Ok(InboundOutcome::Duplicate(id));
        }

        options.is_own_message = false;
        let stored = create_stored_message(message, recipient, options, self.clock.now_ms());
        self.admit(stored).await
    }

    /// Queue a message originated on this node
    ///
    /// The ID is recorded as seen so copies echoed back by peers are dropped.
    /// A message refused for lack of room is not recorded.
    pub async fn submit_outbound(
        &self,
        message: WireMessage,
        recipient: PeerId,
        priority: MessagePriority,
        destination_zone: Option<GeoZone>,
    ) -> Result<InboundOutcome> {
        let options = StoreOptions {
            priority,
            is_own_message: true,
            geo_zone: self.router.local_zone().cloned(),
            destination_geo_zone: destination_zone,
            ..Default::default()
        };
        let stored = create_stored_message(message, recipient, options, self.clock.now_ms());

        self.dedup.mark_seen(&stored.id).await?;
        self.admit(stored).await
    }

    async fn admit(&self, stored: StoredMessage) -> Result<InboundOutcome> {
        let id = stored.id;
        if !self.quota.ensure_room(stored.size_bytes).await? {
            warn!(
                "No room for message {} ({} bytes, {:?})",
                id, stored.size_bytes, stored.priority
            );
            // Not stored, so a later offer is not a duplicate
            if !self.store.has(&id).await? {
                self.dedup.forget(&id).await?;
            }
            return Ok(InboundOutcome::NoRoom(id));
        }

        self.store.store(stored).await?;
        Ok(InboundOutcome::Stored(id))
    }

    /// Messages waiting to be forwarded, best first
    pub async fn relay_queue(&self, limit: Option<usize>) -> Result<Vec<StoredMessage>> {
        Ok(self.store.get_for_relay(&HashSet::new(), limit).await?)
    }

    /// Messages held for `recipient` that can be handed over directly
    pub async fn pending_for(&self, recipient: &PeerId) -> Result<Vec<StoredMessage>> {
        Ok(self.store.get_pending_for_recipient(recipient).await?)
    }

    /// Rank candidate next hops for a stored message
    ///
    /// Peers already tried for this message are skipped. Returns nothing for
    /// missing, expired or finished messages and for messages out of hops.
    pub async fn select_relay_targets(
        &self,
        id: &MessageId,
        peers: &[PeerGeoInfo],
        max_peers: usize,
    ) -> Result<Vec<PeerScore>> {
        let Some(message) = self.store.get(id).await? else {
            return Ok(Vec::new());
        };
        if !message.is_relay_eligible(self.clock.now_ms()) || !message.has_hops_remaining() {
            return Ok(Vec::new());
        }

        let untried: Vec<PeerGeoInfo> = peers
            .iter()
            .filter(|p| !message.route_attempts.contains(&p.peer_id))
            .cloned()
            .collect();

        let targets = self.router.select_relay_peers(
            &untried,
            message.destination_geo_zone.as_ref(),
            max_peers,
        );
        debug!(
            "Selected {} of {} peers for message {}",
            targets.len(),
            peers.len(),
            id
        );
        Ok(targets)
    }

    /// Record a forwarding attempt and mark the message sent
    pub async fn record_relay_attempt(&self, id: &MessageId, peer: PeerId) -> Result<bool> {
        if !self.store.record_attempt(id, peer).await? {
            return Ok(false);
        }
        self.store.update_status(id, MessageStatus::Sent).await?;
        Ok(true)
    }

    pub async fn mark_delivered(&self, id: &MessageId) -> Result<bool> {
        let delivered = self.store.update_status(id, MessageStatus::Delivered).await?;
        if delivered {
            info!("Message {} delivered", id);
        }
        Ok(delivered)
    }

    pub async fn mark_failed(&self, id: &MessageId) -> Result<bool> {
        Ok(self.store.update_status(id, MessageStatus::Failed).await?)
    }

    /// Start dedup pruning and quota checks
    pub fn start(&mut self) {
        self.dedup.start();
        self.quota.start();
        info!("Relay node maintenance running");
    }

    pub fn stop(&mut self) {
        self.dedup.stop();
        self.quota.stop();
        info!("Relay node maintenance stopped");
    }

    pub fn is_running(&self) -> bool {
        self.dedup.is_running() && self.quota.is_running()
    }

    pub async fn stats(&self) -> Result<NodeStats> {
        Ok(NodeStats {
            dedup: self.dedup.stats().await?,
            store: self.store.get_stats().await?,
            quota: self.quota.get_quota_info().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifeline_geo::{ConnectionQuality, TransportType};
    use lifeline_protocol::{ManualClock, MessageType};

    const T0: u64 = 1_700_000_000_000;

    fn wire(seed: u8) -> WireMessage {
        WireMessage::new(
            PeerId::from_bytes([seed; 32]),
            MessageType::Text,
            T0,
            vec![seed; 64],
        )
        .unwrap()
    }

    fn peer(seed: u8, zone: Option<&str>) -> PeerGeoInfo {
        PeerGeoInfo {
            peer_id: PeerId::from_bytes([seed; 32]),
            geo_zone: zone.and_then(GeoZone::from_locator),
            known_peers: 5,
            in_flight: 0,
            is_courier: false,
            connection_quality: ConnectionQuality::Good,
            transport: TransportType::WifiDirect,
        }
    }

    async fn node() -> (RelayNode, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let node = RelayNode::new(Config::default(), clock.clone()).await.unwrap();
        (node, clock)
    }

    #[tokio::test]
    async fn test_inbound_duplicate_dropped() {
        let (node, _clock) = node().await;
        let recipient = PeerId::from_bytes([9; 32]);

        let first = node
            .accept_inbound(wire(1), recipient, StoreOptions::relay(MessagePriority::High))
            .await
            .unwrap();
        assert!(first.is_stored());

        let second = node
            .accept_inbound(wire(1), recipient, StoreOptions::relay(MessagePriority::High))
            .await
            .unwrap();
        assert!(matches!(second, InboundOutcome::Duplicate(_)));

        let stats = node.stats().await.unwrap();
        assert_eq!(stats.store.total_messages, 1);
        assert_eq!(stats.store.relay_messages, 1);
        assert_eq!(stats.dedup.duplicates_detected, 1);
    }

    #[tokio::test]
    async fn test_outbound_echo_is_duplicate() {
        let (node, _clock) = node().await;
        let recipient = PeerId::from_bytes([9; 32]);

        let outcome = node
            .submit_outbound(wire(2), recipient, MessagePriority::Normal, None)
            .await
            .unwrap();
        let InboundOutcome::Stored(id) = outcome else {
            panic!("expected stored, got {:?}", outcome);
        };
        assert!(node.store().get(&id).await.unwrap().unwrap().is_own_message);

        let echo = node
            .accept_inbound(wire(2), recipient, StoreOptions::relay(MessagePriority::Normal))
            .await
            .unwrap();
        assert_eq!(echo, InboundOutcome::Duplicate(id));
    }

    #[tokio::test]
    async fn test_relay_targets_skip_tried_peers() {
        let (node, _clock) = node().await;
        let InboundOutcome::Stored(id) = node
            .submit_outbound(
                wire(3),
                PeerId::from_bytes([9; 32]),
                MessagePriority::Normal,
                GeoZone::from_locator("DM04"),
            )
            .await
            .unwrap()
        else {
            panic!("not stored");
        };

        let peers = vec![peer(1, Some("DM04")), peer(2, Some("FN31")), peer(3, None)];
        let targets = node.select_relay_targets(&id, &peers, 3).await.unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].peer_id, peers[0].peer_id);

        assert!(node.record_relay_attempt(&id, peers[0].peer_id).await.unwrap());
        let targets = node.select_relay_targets(&id, &peers, 3).await.unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|t| t.peer_id != peers[0].peer_id));

        let stored = node.store().get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_delivered_and_expired_not_relayed() {
        let (node, clock) = node().await;
        let recipient = PeerId::from_bytes([9; 32]);
        let peers = vec![peer(1, None)];

        let InboundOutcome::Stored(delivered) = node
            .accept_inbound(wire(4), recipient, StoreOptions::relay(MessagePriority::Emergency))
            .await
            .unwrap()
        else {
            panic!("not stored");
        };
        let InboundOutcome::Stored(short_lived) = node
            .accept_inbound(wire(5), recipient, StoreOptions::relay(MessagePriority::Low))
            .await
            .unwrap()
        else {
            panic!("not stored");
        };

        assert!(node.mark_delivered(&delivered).await.unwrap());
        assert!(node.select_relay_targets(&delivered, &peers, 3).await.unwrap().is_empty());

        clock.advance(MessagePriority::Low.ttl());
        assert!(node.select_relay_targets(&short_lived, &peers, 3).await.unwrap().is_empty());
        assert!(node.relay_queue(None).await.unwrap().is_empty());

        // Missing IDs are a no-op
        let missing = MessageId::from_bytes([0xEE; 16]);
        assert!(!node.mark_delivered(&missing).await.unwrap());
        assert!(!node.record_relay_attempt(&missing, peers[0].peer_id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop() {
        let (mut node, _clock) = node().await;
        assert!(!node.is_running());

        node.start();
        node.start();
        assert!(node.is_running());

        node.stop();
        assert!(!node.is_running());
    }
}
