/**
 * End-to-end tests for the relay node
 *
 * Covers:
 * - Store-and-forward flow across two nodes
 * - Restart with the sqlite backend
 * - Quota pressure with own and relayed messages
 * - Retrying a message refused for lack of room
 * - Concurrent duplicate admission
 * - Relay scoring toward a destination zone
 */
use lifeline_core::{Config, InboundOutcome, RelayNode, StorageBackend};
use lifeline_dedup::{DedupConfig, DedupLog, DeduplicationManager, MemoryDedupLog};
use lifeline_geo::{
    encode_geo_zone, ConnectionQuality, GeoRouter, GeoRouterConfig, GeoZone, LocationPrecision,
    PeerGeoInfo, ScoringWeights, TransportType,
};
use lifeline_protocol::{ManualClock, MessageId, MessageType, PeerId, WireMessage};
use lifeline_protocol::message::HEADER_SIZE;
use lifeline_store::{
    create_stored_message, MessagePriority, MessageQuery, MessageStatus, StoreOptions,
    METADATA_OVERHEAD,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const T0: u64 = 1_700_000_000_000;

fn peer_id(seed: u8) -> PeerId {
    PeerId::from_bytes([seed; 32])
}

/// Wire message whose stored footprint is exactly `size` bytes
fn wire(seed: u8, size: usize) -> WireMessage {
    let payload = vec![seed; size - HEADER_SIZE - METADATA_OVERHEAD];
    WireMessage::new(peer_id(seed), MessageType::Text, T0, payload).unwrap()
}

fn peer(seed: u8, zone: Option<GeoZone>) -> PeerGeoInfo {
    PeerGeoInfo {
        peer_id: peer_id(seed),
        geo_zone: zone,
        known_peers: 4,
        in_flight: 2,
        is_courier: false,
        connection_quality: ConnectionQuality::Good,
        transport: TransportType::Lora,
    }
}

fn stored_id(outcome: InboundOutcome) -> MessageId {
    match outcome {
        InboundOutcome::Stored(id) => id,
        other => panic!("expected stored, got {:?}", other),
    }
}

// ====================
// Store-and-forward
// ====================

#[tokio::test]
async fn test_two_hop_delivery() {
    let clock = Arc::new(ManualClock::new(T0));
    let sender = RelayNode::new(Config::default(), clock.clone()).await.unwrap();
    let relay = RelayNode::new(Config::default(), clock.clone()).await.unwrap();

    let recipient = peer_id(0xAA);
    let destination = encode_geo_zone(34.05, -118.24, LocationPrecision::Grid100Km);

    let message = wire(1, 600);
    let id = stored_id(
        sender
            .submit_outbound(
                message.clone(),
                recipient,
                MessagePriority::High,
                Some(destination.clone()),
            )
            .await
            .unwrap(),
    );

    // Sender picks the relay peer sitting in the destination zone
    let peers = vec![
        peer(2, Some(encode_geo_zone(40.71, -74.0, LocationPrecision::Grid100Km))),
        peer(3, Some(destination.clone())),
    ];
    let targets = sender.select_relay_targets(&id, &peers, 1).await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].peer_id, peer_id(3));
    assert!(sender.record_relay_attempt(&id, peer_id(3)).await.unwrap());

    // Relay receives it, then receives it again from another path
    let options = StoreOptions {
        hop_count: 1,
        destination_geo_zone: Some(destination),
        ..StoreOptions::relay(MessagePriority::High)
    };
    let relayed = stored_id(
        relay
            .accept_inbound(message.clone(), recipient, options.clone())
            .await
            .unwrap(),
    );
    assert_eq!(relayed, id);
    assert_eq!(
        relay.accept_inbound(message, recipient, options).await.unwrap(),
        InboundOutcome::Duplicate(id)
    );

    // Recipient shows up at the relay
    let pending = relay.pending_for(&recipient).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].is_own_message);
    assert_eq!(pending[0].hop_count, 1);

    assert!(relay.mark_delivered(&id).await.unwrap());
    assert!(sender.mark_delivered(&id).await.unwrap());
    assert!(relay.pending_for(&recipient).await.unwrap().is_empty());

    let delivered = sender.store().get(&id).await.unwrap().unwrap();
    assert_eq!(delivered.status, MessageStatus::Delivered);
    assert_eq!(delivered.delivered_at, Some(T0));
    // Terminal states stay terminal
    assert!(!sender.mark_failed(&id).await.unwrap());
}

#[tokio::test]
async fn test_sqlite_node_survives_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));

    let mut config = Config::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.data_directory = dir.path().join("data");

    let message = wire(7, 500);
    let id = {
        let node = RelayNode::new(config.clone(), clock.clone()).await.unwrap();
        stored_id(
            node.accept_inbound(
                message.clone(),
                peer_id(9),
                StoreOptions::relay(MessagePriority::Normal),
            )
            .await
            .unwrap(),
        )
    };

    let node = RelayNode::new(config, clock).await.unwrap();
    assert!(node.store().has(&id).await.unwrap());
    assert_eq!(
        node.accept_inbound(message, peer_id(9), StoreOptions::relay(MessagePriority::Normal))
            .await
            .unwrap(),
        InboundOutcome::Duplicate(id)
    );

    let stats = node.stats().await.unwrap();
    assert_eq!(stats.store.total_messages, 1);
    assert_eq!(stats.store.total_bytes, 500);
    assert_eq!(stats.dedup.log_entries, 1);
}

// ====================
// Quota pressure
// ====================

#[tokio::test]
async fn test_quota_pressure_protects_own_messages() {
    let clock = Arc::new(ManualClock::new(T0));
    let mut config = Config::default();
    config.quota.max_bytes = 2_000;
    let node = RelayNode::new(config, clock.clone()).await.unwrap();

    let mut own = Vec::new();
    for seed in 1..=2 {
        own.push(stored_id(
            node.submit_outbound(wire(seed, 500), peer_id(0xF0), MessagePriority::Low, None)
                .await
                .unwrap(),
        ));
    }
    for (seed, priority) in [(11, MessagePriority::Low), (12, MessagePriority::High)] {
        node.accept_inbound(wire(seed, 500), peer_id(0xF1), StoreOptions::relay(priority))
            .await
            .unwrap();
    }
    assert_eq!(node.quota().get_quota_info().await.unwrap().used_bytes, 2_000);

    // Lowest-priority relay message makes room
    node.accept_inbound(wire(13, 500), peer_id(0xF1), StoreOptions::relay(MessagePriority::Normal))
        .await
        .unwrap();
    let relays = node
        .store()
        .query(&MessageQuery {
            is_own_message: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut priorities: Vec<_> = relays.iter().map(|m| m.priority).collect();
    priorities.sort();
    assert_eq!(priorities, vec![MessagePriority::Normal, MessagePriority::High]);

    // Own messages displace the remaining relays, then run out of room
    for seed in 3..=4 {
        own.push(stored_id(
            node.submit_outbound(wire(seed, 500), peer_id(0xF0), MessagePriority::Low, None)
                .await
                .unwrap(),
        ));
    }
    let blocked = node
        .submit_outbound(wire(5, 500), peer_id(0xF0), MessagePriority::Emergency, None)
        .await
        .unwrap();
    assert!(matches!(blocked, InboundOutcome::NoRoom(_)));

    let stats = node.stats().await.unwrap();
    assert_eq!(stats.store.own_messages, 4);
    assert_eq!(stats.store.relay_messages, 0);
    for id in &own {
        assert!(node.store().has(id).await.unwrap());
    }
}

#[tokio::test]
async fn test_refused_message_accepted_once_room_frees() {
    let clock = Arc::new(ManualClock::new(T0));
    let mut config = Config::default();
    config.quota.max_bytes = 1_000;
    let node = RelayNode::new(config, clock).await.unwrap();

    let own = stored_id(
        node.submit_outbound(wire(1, 800), peer_id(0xF0), MessagePriority::Normal, None)
            .await
            .unwrap(),
    );

    let relayed = wire(2, 400);
    let options = StoreOptions::relay(MessagePriority::Normal);
    let refused = node
        .accept_inbound(relayed.clone(), peer_id(0xF1), options.clone())
        .await
        .unwrap();
    assert_eq!(refused, InboundOutcome::NoRoom(relayed.id()));
    assert_eq!(node.stats().await.unwrap().dedup.log_entries, 1);

    // Delivery unprotects the own message, so the retry can evict it
    assert!(node.mark_delivered(&own).await.unwrap());
    let id = stored_id(
        node.accept_inbound(relayed.clone(), peer_id(0xF1), options.clone())
            .await
            .unwrap(),
    );
    assert_eq!(id, relayed.id());
    assert!(node.store().has(&id).await.unwrap());
    assert!(!node.store().has(&own).await.unwrap());

    assert_eq!(
        node.accept_inbound(relayed, peer_id(0xF1), options).await.unwrap(),
        InboundOutcome::Duplicate(id)
    );
}

#[tokio::test]
async fn test_quota_warning_transitions() {
    let clock = Arc::new(ManualClock::new(T0));
    let mut config = Config::default();
    config.quota.max_bytes = 10_000;
    let node = RelayNode::new(config, clock).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    node.quota().on_quota_warning(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    node.submit_outbound(wire(1, 8_000), peer_id(9), MessagePriority::Normal, None)
        .await
        .unwrap();
    node.quota().check_and_evict().await.unwrap();
    node.quota().check_and_evict().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    node.submit_outbound(wire(2, 1_500), peer_id(9), MessagePriority::Normal, None)
        .await
        .unwrap();
    node.quota().check_and_evict().await.unwrap();
    node.quota().check_and_evict().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ====================
// Deduplication
// ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_check_and_mark_admits_once() {
    let clock = Arc::new(ManualClock::new(T0));
    let log = Arc::new(MemoryDedupLog::new());
    let config = DedupConfig {
        expected_items: 1_000,
        ..Default::default()
    };
    let manager = Arc::new(DeduplicationManager::new(config, log.clone(), clock).unwrap());
    let id = wire(1, 400).id();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.check_and_mark(&id).await.unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(log.count().await.unwrap(), 1);
    assert!(!manager.should_process(&id).await.unwrap());
}

// ====================
// Lifecycle and scoring
// ====================

#[test]
fn test_ttl_matches_priority() {
    for priority in MessagePriority::ALL {
        let stored = create_stored_message(
            wire(1, 400),
            peer_id(2),
            StoreOptions {
                priority,
                ..Default::default()
            },
            T0,
        );
        assert_eq!(
            stored.expires_at - stored.created_at,
            priority.ttl().as_millis() as u64
        );
    }
}

#[test]
fn test_destination_zone_peer_always_wins() {
    let destination = encode_geo_zone(51.5, -0.12, LocationPrecision::Grid100Km);
    let elsewhere = encode_geo_zone(48.85, 2.35, LocationPrecision::Grid100Km);
    let local = encode_geo_zone(40.71, -74.0, LocationPrecision::Grid100Km);

    for proximity in [0.05, 0.25, 0.4, 0.7, 1.0] {
        let rest = (1.0 - proximity) / 3.0;
        let config = GeoRouterConfig {
            weights: ScoringWeights {
                proximity,
                direction: rest,
                connectivity: rest,
                load: rest,
            },
            ..Default::default()
        };

        for local_zone in [None, Some(local.clone())] {
            let router = GeoRouter::new(local_zone, config.clone());
            let inside = router
                .score_peer_for_message(&peer(1, Some(destination.clone())), Some(&destination));
            let outside = router
                .score_peer_for_message(&peer(2, Some(elsewhere.clone())), Some(&destination));
            assert!(
                inside.total_score > outside.total_score,
                "proximity weight {}: {} <= {}",
                proximity,
                inside.total_score,
                outside.total_score
            );
        }
    }
}
