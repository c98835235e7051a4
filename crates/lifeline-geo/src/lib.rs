//! Lifeline Geo Routing
//!
//! Privacy-preserving location hints for relay selection:
//! - Maidenhead-style grid zones that collapse coordinates to cell centers
//! - Great-circle distance, bearing and path-detour math between zones
//! - Peer scoring that biases relay choice toward a destination zone

pub mod router;
pub mod zone;

pub use router::{
    ConnectionQuality, GeoRouter, GeoRouterConfig, PeerGeoInfo, PeerScore, RouteHint,
    RoutingStats, ScoringWeights, TransportType,
};
pub use zone::{
    encode_geo_zone, geo_distance, get_adjacent_zones, get_direction, is_on_path,
    lat_lon_to_maidenhead, maidenhead_to_lat_lon, CompassDirection, GeoZone, LocationPrecision,
};

/// Mean Earth radius used for haversine distances (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default detour tolerance for on-path checks (km)
pub const DEFAULT_PATH_TOLERANCE_KM: f64 = 200.0;
