//! Geographic relay selection
//!
//! Scores candidate peers for carrying a message toward a destination zone.
//! Every component is on a 0-100 scale; the weighted sum of proximity,
//! direction, connectivity and load is topped up with a flat courier bonus
//! and a lightly weighted transport bonus.

use lifeline_protocol::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::debug;

use crate::zone::{geo_distance, get_direction, is_on_path, CompassDirection, GeoZone};
use crate::DEFAULT_PATH_TOLERANCE_KM;

/// Proximity score when the peer's zone is unknown
const UNKNOWN_PEER_ZONE_SCORE: f64 = 40.0;

/// Neutral score when the destination (or local) zone is unknown
const NEUTRAL_SCORE: f64 = 50.0;

/// Best proximity a peer outside the destination zone can reach
const MAX_NEARBY_SCORE: f64 = 95.0;

/// Half the Earth's circumference; no two zones are farther apart
const MAX_SURFACE_DISTANCE_KM: f64 = 20_015.0;

/// Assumed distance covered by one relay hop
const KM_PER_HOP: f64 = 100.0;

/// Fallback estimate when no direction can be derived
const DEFAULT_HOPS: u32 = 10;
const DEFAULT_DELIVERY: Duration = Duration::from_secs(24 * 3600);

/// Score threshold for a "good" relay
pub const GOOD_RELAY_SCORE: f64 = 50.0;

/// Default shortlist size for relay selection
pub const DEFAULT_MAX_RELAY_PEERS: usize = 3;

/// Transport a peer is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    Meshtastic,
    Lora,
    WifiDirect,
    Webrtc,
    Bluetooth,
}

impl TransportType {
    /// Long-range suitability bonus (0-100)
    pub fn range_bonus(&self) -> f64 {
        match self {
            TransportType::Meshtastic => 100.0,
            TransportType::Lora => 80.0,
            TransportType::WifiDirect => 60.0,
            TransportType::Webrtc => 40.0,
            TransportType::Bluetooth => 20.0,
        }
    }
}

/// Observed link quality to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

/// What the router knows about a candidate peer
#[derive(Debug, Clone)]
pub struct PeerGeoInfo {
    pub peer_id: PeerId,
    pub geo_zone: Option<GeoZone>,
    /// Number of peers this peer reports knowing
    pub known_peers: u32,
    /// Messages currently queued on this peer
    pub in_flight: u32,
    pub is_courier: bool,
    pub connection_quality: ConnectionQuality,
    pub transport: TransportType,
}

impl PeerGeoInfo {
    fn known_zone(&self) -> Option<&GeoZone> {
        self.geo_zone.as_ref().filter(|z| z.is_known())
    }
}

/// Weights for the weighted part of the peer score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub proximity: f64,
    pub direction: f64,
    pub connectivity: f64,
    pub load: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            proximity: 0.40,
            direction: 0.20,
            connectivity: 0.20,
            load: 0.20,
        }
    }
}

impl ScoringWeights {
    /// Validate that weights sum to 1.0 (or very close)
    pub fn is_valid(&self) -> bool {
        let sum = self.proximity + self.direction + self.connectivity + self.load;
        (sum - 1.0).abs() < 0.01
    }

    /// Normalize weights to ensure they sum to 1.0
    pub fn normalize(&mut self) {
        let sum = self.proximity + self.direction + self.connectivity + self.load;
        if sum > 0.0 {
            self.proximity /= sum;
            self.direction /= sum;
            self.connectivity /= sum;
            self.load /= sum;
        }
    }
}

/// Geo router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoRouterConfig {
    pub weights: ScoringWeights,
    /// Added unweighted when the peer is a courier
    pub courier_bonus: f64,
    /// Multiplier applied to the transport range bonus
    pub transport_weight: f64,
    /// In-flight count at which the load score reaches zero
    pub max_peer_load: u32,
    /// Known-peer count is multiplied by this, capped at 100
    pub connectivity_per_peer: f64,
    pub path_tolerance_km: f64,
}

impl Default for GeoRouterConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            courier_bonus: 20.0,
            transport_weight: 0.1,
            max_peer_load: 50,
            connectivity_per_peer: 10.0,
            path_tolerance_km: DEFAULT_PATH_TOLERANCE_KM,
        }
    }
}

/// Routing hint toward a destination
#[derive(Debug, Clone, PartialEq)]
pub struct RouteHint {
    pub is_local: bool,
    pub direction: Option<CompassDirection>,
    pub distance_km: Option<f64>,
    pub estimated_hops: u32,
    pub estimated_delivery: Duration,
}

/// Calculated score for a peer
#[derive(Debug, Clone)]
pub struct PeerScore {
    pub peer_id: PeerId,
    pub total_score: f64,
    pub proximity_score: f64,
    pub direction_score: f64,
    pub connectivity_score: f64,
    pub load_score: f64,
    pub courier_bonus: f64,
    pub transport_bonus: f64,
    connection_quality: ConnectionQuality,
}

/// Aggregate view over a candidate set
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingStats {
    pub total_peers: usize,
    /// Share of peers with a known zone (0.0 to 1.0)
    pub known_zone_ratio: f64,
    /// Share of peers scoring at least [`GOOD_RELAY_SCORE`]
    pub good_relay_ratio: f64,
    pub best_score: f64,
    pub average_score: f64,
    pub preferred_direction: Option<CompassDirection>,
}

/// Peer scorer biased toward the destination zone
#[derive(Debug, Clone)]
pub struct GeoRouter {
    local_zone: Option<GeoZone>,
    config: GeoRouterConfig,
}

impl GeoRouter {
    pub fn new(local_zone: Option<GeoZone>, config: GeoRouterConfig) -> Self {
        Self { local_zone, config }
    }

    pub fn new_with_defaults() -> Self {
        Self::new(None, GeoRouterConfig::default())
    }

    /// Update this node's own zone (e.g. after the location provider moves)
    pub fn set_local_zone(&mut self, zone: Option<GeoZone>) {
        self.local_zone = zone;
    }

    pub fn local_zone(&self) -> Option<&GeoZone> {
        self.local_zone.as_ref()
    }

    pub fn config(&self) -> &GeoRouterConfig {
        &self.config
    }

    fn known_local_zone(&self) -> Option<&GeoZone> {
        self.local_zone.as_ref().filter(|z| z.is_known())
    }

    /// Direction and cost estimate from `source` to `destination`
    pub fn calculate_route(&self, source: &GeoZone, destination: Option<&GeoZone>) -> RouteHint {
        let Some(destination) = destination.filter(|z| z.is_known()) else {
            return RouteHint {
                is_local: false,
                direction: None,
                distance_km: None,
                estimated_hops: DEFAULT_HOPS,
                estimated_delivery: DEFAULT_DELIVERY,
            };
        };

        if source.is_known() && source.zone_id == destination.zone_id {
            return RouteHint {
                is_local: true,
                direction: None,
                distance_km: Some(0.0),
                estimated_hops: 0,
                estimated_delivery: Duration::ZERO,
            };
        }

        let distance = geo_distance(source, destination);
        if !distance.is_finite() {
            return RouteHint {
                is_local: false,
                direction: None,
                distance_km: None,
                estimated_hops: DEFAULT_HOPS,
                estimated_delivery: DEFAULT_DELIVERY,
            };
        }

        let hops = ((distance / KM_PER_HOP).ceil() as u32).max(1);
        RouteHint {
            is_local: false,
            direction: get_direction(source, destination),
            distance_km: Some(distance),
            estimated_hops: hops,
            estimated_delivery: Duration::from_secs(hops as u64 * 3600),
        }
    }

    /// Score a peer for carrying a message toward `destination`
    pub fn score_peer_for_message(
        &self,
        peer: &PeerGeoInfo,
        destination: Option<&GeoZone>,
    ) -> PeerScore {
        let destination = destination.filter(|z| z.is_known());

        let proximity_score = self.score_proximity(peer, destination);
        let direction_score = self.score_direction(peer, destination);
        let connectivity_score =
            (peer.known_peers as f64 * self.config.connectivity_per_peer).min(100.0);
        let load_score = self.score_load(peer.in_flight);
        let courier_bonus = if peer.is_courier {
            self.config.courier_bonus
        } else {
            0.0
        };
        let transport_bonus = peer.transport.range_bonus() * self.config.transport_weight;

        let weights = &self.config.weights;
        let total_score = proximity_score * weights.proximity
            + direction_score * weights.direction
            + connectivity_score * weights.connectivity
            + load_score * weights.load
            + courier_bonus
            + transport_bonus;

        debug!(
            "Peer {} score: {:.1} (prox={:.1}, dir={:.1}, conn={:.1}, load={:.1}, courier={:.1}, transport={:.1})",
            peer.peer_id,
            total_score,
            proximity_score,
            direction_score,
            connectivity_score,
            load_score,
            courier_bonus,
            transport_bonus
        );

        PeerScore {
            peer_id: peer.peer_id,
            total_score,
            proximity_score,
            direction_score,
            connectivity_score,
            load_score,
            courier_bonus,
            transport_bonus,
            connection_quality: peer.connection_quality,
        }
    }

    /// Score all candidates and return the best `max_peers`, highest first
    ///
    /// Equal scores are broken by connection quality.
    pub fn select_relay_peers(
        &self,
        peers: &[PeerGeoInfo],
        destination: Option<&GeoZone>,
        max_peers: usize,
    ) -> Vec<PeerScore> {
        let mut scores: Vec<PeerScore> = peers
            .iter()
            .map(|peer| self.score_peer_for_message(peer, destination))
            .collect();

        scores.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.connection_quality.cmp(&a.connection_quality))
        });
        scores.truncate(max_peers);

        scores
    }

    /// Whether the peer clears `min_score` for this destination
    pub fn is_good_relay(
        &self,
        peer: &PeerGeoInfo,
        destination: Option<&GeoZone>,
        min_score: f64,
    ) -> bool {
        self.score_peer_for_message(peer, destination).total_score >= min_score
    }

    /// Aggregate scores over a candidate set
    pub fn get_routing_stats(
        &self,
        peers: &[PeerGeoInfo],
        destination: Option<&GeoZone>,
    ) -> RoutingStats {
        let preferred_direction = match (self.known_local_zone(), destination) {
            (Some(local), Some(dest)) => get_direction(local, dest),
            _ => None,
        };

        if peers.is_empty() {
            return RoutingStats {
                total_peers: 0,
                known_zone_ratio: 0.0,
                good_relay_ratio: 0.0,
                best_score: 0.0,
                average_score: 0.0,
                preferred_direction,
            };
        }

        let scores: Vec<f64> = peers
            .iter()
            .map(|peer| self.score_peer_for_message(peer, destination).total_score)
            .collect();
        let total = peers.len() as f64;
        let with_zone = peers.iter().filter(|p| p.known_zone().is_some()).count();
        let good = scores.iter().filter(|s| **s >= GOOD_RELAY_SCORE).count();

        RoutingStats {
            total_peers: peers.len(),
            known_zone_ratio: with_zone as f64 / total,
            good_relay_ratio: good as f64 / total,
            best_score: scores.iter().copied().fold(f64::MIN, f64::max),
            average_score: scores.iter().sum::<f64>() / total,
            preferred_direction,
        }
    }

    /// 100 inside the destination zone, otherwise relative to how much
    /// closer the peer is than this node
    fn score_proximity(&self, peer: &PeerGeoInfo, destination: Option<&GeoZone>) -> f64 {
        let Some(destination) = destination else {
            return NEUTRAL_SCORE;
        };
        let Some(peer_zone) = peer.known_zone() else {
            return UNKNOWN_PEER_ZONE_SCORE;
        };

        if peer_zone.zone_id == destination.zone_id {
            return 100.0;
        }

        let peer_distance = geo_distance(peer_zone, destination);
        let local_distance = self
            .known_local_zone()
            .map(|local| geo_distance(local, destination))
            .filter(|d| d.is_finite() && *d > 0.0);

        let score = match local_distance {
            Some(local_distance) => {
                // Positive when the peer is closer than we are, negative when farther
                let improvement = (local_distance - peer_distance) / local_distance;
                NEUTRAL_SCORE + NEUTRAL_SCORE * improvement
            }
            None => MAX_NEARBY_SCORE * (1.0 - peer_distance / MAX_SURFACE_DISTANCE_KM),
        };

        score.clamp(0.0, MAX_NEARBY_SCORE)
    }

    /// Bonus when the peer's zone lies on the local-to-destination path
    fn score_direction(&self, peer: &PeerGeoInfo, destination: Option<&GeoZone>) -> f64 {
        match (self.known_local_zone(), peer.known_zone(), destination) {
            (Some(local), Some(peer_zone), Some(dest)) => {
                if is_on_path(peer_zone, local, dest, self.config.path_tolerance_km) {
                    100.0
                } else {
                    25.0
                }
            }
            _ => NEUTRAL_SCORE,
        }
    }

    fn score_load(&self, in_flight: u32) -> f64 {
        if self.config.max_peer_load == 0 {
            return 0.0;
        }
        let ratio = (in_flight as f64 / self.config.max_peer_load as f64).min(1.0);
        100.0 * (1.0 - ratio)
    }
}
