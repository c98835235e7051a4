//! Geographic zones on a simplified Maidenhead grid
//!
//! A zone is the grid cell a coordinate falls into, represented by its
//! locator string and the cell's center. The original coordinate is never
//! kept: every point inside a cell maps to the same zone ID and center.
//!
//! Locator layout (each pair is longitude then latitude):
//! - field: two letters `A`-`R`, 20° x 10°
//! - square: two digits, 2° x 1°
//! - subsquare: two letters `a`-`x`, 5' x 2.5'
//! - extended square: two digits, 30" x 15"

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DEFAULT_PATH_TOLERANCE_KM, EARTH_RADIUS_KM};

/// Cell sizes in degrees (longitude, latitude) for each locator pair
const FIELD_DEG: (f64, f64) = (20.0, 10.0);
const SQUARE_DEG: (f64, f64) = (2.0, 1.0);
const SUBSQUARE_DEG: (f64, f64) = (2.0 / 24.0, 1.0 / 24.0);
const EXTENDED_DEG: (f64, f64) = (2.0 / 240.0, 1.0 / 240.0);

/// Number of 100km cells along each axis (18 fields x 10 squares)
const SQUARES_PER_AXIS: i32 = 180;

/// How coarsely a location is shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationPrecision {
    #[serde(rename = "exact")]
    Exact,
    #[serde(rename = "grid_10km")]
    Grid10Km,
    #[serde(rename = "grid_100km")]
    Grid100Km,
    #[serde(rename = "region")]
    Region,
    #[serde(rename = "none")]
    None,
}

impl LocationPrecision {
    /// Locator length for this precision
    pub fn locator_len(&self) -> usize {
        match self {
            LocationPrecision::Exact => 8,
            LocationPrecision::Grid10Km => 6,
            LocationPrecision::Grid100Km => 4,
            LocationPrecision::Region => 2,
            LocationPrecision::None => 0,
        }
    }

    fn from_locator_len(len: usize) -> Option<Self> {
        match len {
            8 => Some(LocationPrecision::Exact),
            6 => Some(LocationPrecision::Grid10Km),
            4 => Some(LocationPrecision::Grid100Km),
            2 => Some(LocationPrecision::Region),
            _ => None,
        }
    }
}

impl Default for LocationPrecision {
    fn default() -> Self {
        LocationPrecision::Grid100Km
    }
}

impl fmt::Display for LocationPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocationPrecision::Exact => "exact",
            LocationPrecision::Grid10Km => "grid_10km",
            LocationPrecision::Grid100Km => "grid_100km",
            LocationPrecision::Region => "region",
            LocationPrecision::None => "none",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LocationPrecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(LocationPrecision::Exact),
            "grid_10km" | "10km" => Ok(LocationPrecision::Grid10Km),
            "grid_100km" | "100km" => Ok(LocationPrecision::Grid100Km),
            "region" => Ok(LocationPrecision::Region),
            "none" => Ok(LocationPrecision::None),
            _ => Err(format!("invalid location precision: {s}")),
        }
    }
}

/// A quantized, privacy-preserving location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoZone {
    /// Maidenhead locator of the cell (empty for unknown)
    pub zone_id: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub precision: LocationPrecision,
}

impl GeoZone {
    /// A zone that carries no location
    pub fn unknown() -> Self {
        GeoZone {
            zone_id: String::new(),
            center_lat: 0.0,
            center_lon: 0.0,
            precision: LocationPrecision::None,
        }
    }

    /// Rebuild a zone from its locator string
    pub fn from_locator(locator: &str) -> Option<Self> {
        let precision = LocationPrecision::from_locator_len(locator.len())?;
        let (center_lat, center_lon) = maidenhead_to_lat_lon(locator)?;
        Some(GeoZone {
            zone_id: normalize_locator(locator),
            center_lat,
            center_lon,
            precision,
        })
    }

    pub fn is_known(&self) -> bool {
        self.precision != LocationPrecision::None
    }
}

/// Eight-point compass direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompassDirection {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl CompassDirection {
    const ALL: [CompassDirection; 8] = [
        CompassDirection::N,
        CompassDirection::NE,
        CompassDirection::E,
        CompassDirection::SE,
        CompassDirection::S,
        CompassDirection::SW,
        CompassDirection::W,
        CompassDirection::NW,
    ];

    /// Nearest compass point for a bearing in degrees
    pub fn from_bearing(bearing: f64) -> Self {
        let idx = (bearing.rem_euclid(360.0) / 45.0).round() as usize % 8;
        Self::ALL[idx]
    }
}

impl fmt::Display for CompassDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompassDirection::N => "N",
            CompassDirection::NE => "NE",
            CompassDirection::E => "E",
            CompassDirection::SE => "SE",
            CompassDirection::S => "S",
            CompassDirection::SW => "SW",
            CompassDirection::W => "W",
            CompassDirection::NW => "NW",
        };
        write!(f, "{s}")
    }
}

/// Cell index along one axis: floor(value / size), clamped to `max`
fn cell_index(value: f64, size: f64, max: u32) -> u32 {
    ((value / size).floor().max(0.0) as u32).min(max)
}

/// Encode a coordinate as a locator at the given precision
///
/// Returns `None` for `LocationPrecision::None` or non-finite input.
pub fn lat_lon_to_maidenhead(lat: f64, lon: f64, precision: LocationPrecision) -> Option<String> {
    if precision == LocationPrecision::None || !lat.is_finite() || !lon.is_finite() {
        return None;
    }

    let mut lon_n = (lon + 180.0).rem_euclid(360.0);
    if lon_n >= 360.0 {
        lon_n = 0.0;
    }
    // The north pole belongs to the last row of cells
    let lat_n = (lat.clamp(-90.0, 90.0) + 90.0).min(180.0 - 1e-9);

    let len = precision.locator_len();
    let mut locator = String::with_capacity(len);

    let field_lon = cell_index(lon_n, FIELD_DEG.0, 17);
    let field_lat = cell_index(lat_n, FIELD_DEG.1, 17);
    locator.push((b'A' + field_lon as u8) as char);
    locator.push((b'A' + field_lat as u8) as char);
    if len == 2 {
        return Some(locator);
    }

    let rem_lon = lon_n - field_lon as f64 * FIELD_DEG.0;
    let rem_lat = lat_n - field_lat as f64 * FIELD_DEG.1;
    let square_lon = cell_index(rem_lon, SQUARE_DEG.0, 9);
    let square_lat = cell_index(rem_lat, SQUARE_DEG.1, 9);
    locator.push((b'0' + square_lon as u8) as char);
    locator.push((b'0' + square_lat as u8) as char);
    if len == 4 {
        return Some(locator);
    }

    let rem_lon = rem_lon - square_lon as f64 * SQUARE_DEG.0;
    let rem_lat = rem_lat - square_lat as f64 * SQUARE_DEG.1;
    let sub_lon = cell_index(rem_lon, SUBSQUARE_DEG.0, 23);
    let sub_lat = cell_index(rem_lat, SUBSQUARE_DEG.1, 23);
    locator.push((b'a' + sub_lon as u8) as char);
    locator.push((b'a' + sub_lat as u8) as char);
    if len == 6 {
        return Some(locator);
    }

    let rem_lon = rem_lon - sub_lon as f64 * SUBSQUARE_DEG.0;
    let rem_lat = rem_lat - sub_lat as f64 * SUBSQUARE_DEG.1;
    let ext_lon = cell_index(rem_lon, EXTENDED_DEG.0, 9);
    let ext_lat = cell_index(rem_lat, EXTENDED_DEG.1, 9);
    locator.push((b'0' + ext_lon as u8) as char);
    locator.push((b'0' + ext_lat as u8) as char);

    Some(locator)
}

/// Uppercase fields, lowercase subsquares
fn normalize_locator(locator: &str) -> String {
    locator
        .char_indices()
        .map(|(i, c)| {
            if (4..6).contains(&i) {
                c.to_ascii_lowercase()
            } else {
                c.to_ascii_uppercase()
            }
        })
        .collect()
}

/// Decode one locator pair into (lon index, lat index)
fn decode_pair(pair: &[u8], base: u8, count: u8) -> Option<(u32, u32)> {
    let lon = pair[0].checked_sub(base)?;
    let lat = pair[1].checked_sub(base)?;
    if lon >= count || lat >= count {
        return None;
    }
    Some((lon as u32, lat as u32))
}

/// Decode a locator into the center of its cell as (lat, lon)
///
/// Returns `None` for malformed locators. Subsquare letters are accepted in
/// either case.
pub fn maidenhead_to_lat_lon(locator: &str) -> Option<(f64, f64)> {
    let precision = LocationPrecision::from_locator_len(locator.len())?;
    let bytes = normalize_locator(locator).into_bytes();
    if bytes.len() != precision.locator_len() {
        return None;
    }

    let pairs: [(u8, u8, (f64, f64)); 4] = [
        (b'A', 18, FIELD_DEG),
        (b'0', 10, SQUARE_DEG),
        (b'a', 24, SUBSQUARE_DEG),
        (b'0', 10, EXTENDED_DEG),
    ];

    let mut lon = 0.0;
    let mut lat = 0.0;
    let mut cell = FIELD_DEG;
    for (chunk, (base, count, size)) in bytes.chunks(2).zip(pairs.iter()) {
        let (lon_idx, lat_idx) = decode_pair(chunk, *base, *count)?;
        lon += lon_idx as f64 * size.0;
        lat += lat_idx as f64 * size.1;
        cell = *size;
    }

    let center_lon = lon + cell.0 / 2.0 - 180.0;
    let center_lat = lat + cell.1 / 2.0 - 90.0;
    Some((center_lat, center_lon))
}

/// Quantize a coordinate into a zone
pub fn encode_geo_zone(lat: f64, lon: f64, precision: LocationPrecision) -> GeoZone {
    lat_lon_to_maidenhead(lat, lon, precision)
        .and_then(|locator| GeoZone::from_locator(&locator))
        .unwrap_or_else(GeoZone::unknown)
}

/// Haversine distance between zone centers in km
///
/// Unknown zones are infinitely far away.
pub fn geo_distance(a: &GeoZone, b: &GeoZone) -> f64 {
    if !a.is_known() || !b.is_known() {
        return f64::INFINITY;
    }

    let lat1 = a.center_lat.to_radians();
    let lat2 = b.center_lat.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (b.center_lon - a.center_lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Initial great-circle bearing from `from` to `to` in degrees [0, 360)
pub fn bearing(from: &GeoZone, to: &GeoZone) -> f64 {
    let lat1 = from.center_lat.to_radians();
    let lat2 = to.center_lat.to_radians();
    let dlon = (to.center_lon - from.center_lon).to_radians();

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Compass direction from `from` toward `to`
pub fn get_direction(from: &GeoZone, to: &GeoZone) -> Option<CompassDirection> {
    if !from.is_known() || !to.is_known() {
        return None;
    }
    Some(CompassDirection::from_bearing(bearing(from, to)))
}

/// The up to eight 100km cells surrounding a 100km zone
///
/// Longitude wraps at the dateline; latitude does not wrap past the poles.
/// Any other precision, or a malformed zone ID, yields no neighbors.
pub fn get_adjacent_zones(zone: &GeoZone) -> Vec<GeoZone> {
    if zone.precision != LocationPrecision::Grid100Km {
        return Vec::new();
    }

    let bytes = normalize_locator(&zone.zone_id).into_bytes();
    if bytes.len() != 4 {
        return Vec::new();
    }
    let (Some(field), Some(square)) = (
        decode_pair(&bytes[0..2], b'A', 18),
        decode_pair(&bytes[2..4], b'0', 10),
    ) else {
        return Vec::new();
    };

    let lon_idx = (field.0 * 10 + square.0) as i32;
    let lat_idx = (field.1 * 10 + square.1) as i32;

    let mut neighbors = Vec::with_capacity(8);
    for dlat in -1..=1 {
        for dlon in -1..=1 {
            if dlat == 0 && dlon == 0 {
                continue;
            }
            let lat = lat_idx + dlat;
            if !(0..SQUARES_PER_AXIS).contains(&lat) {
                continue;
            }
            let lon = (lon_idx + dlon).rem_euclid(SQUARES_PER_AXIS);

            let locator: String = [
                (b'A' + (lon / 10) as u8) as char,
                (b'A' + (lat / 10) as u8) as char,
                (b'0' + (lon % 10) as u8) as char,
                (b'0' + (lat % 10) as u8) as char,
            ]
            .iter()
            .collect();

            if let Some(neighbor) = GeoZone::from_locator(&locator) {
                neighbors.push(neighbor);
            }
        }
    }

    neighbors
}

/// Whether routing through `zone` adds at most `tolerance_km` of detour
/// compared to going straight from `from` to `to`
pub fn is_on_path(zone: &GeoZone, from: &GeoZone, to: &GeoZone, tolerance_km: f64) -> bool {
    if !zone.is_known() || !from.is_known() || !to.is_known() {
        return false;
    }

    let direct = geo_distance(from, to);
    let via = geo_distance(from, zone) + geo_distance(zone, to);
    via - direct <= tolerance_km
}

/// [`is_on_path`] with the default 200km tolerance
pub fn is_on_default_path(zone: &GeoZone, from: &GeoZone, to: &GeoZone) -> bool {
    is_on_path(zone, from, to, DEFAULT_PATH_TOLERANCE_KM)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRECISIONS: [LocationPrecision; 4] = [
        LocationPrecision::Region,
        LocationPrecision::Grid100Km,
        LocationPrecision::Grid10Km,
        LocationPrecision::Exact,
    ];

    #[test]
    fn test_known_locators() {
        // New York City, Los Angeles, Sydney
        assert_eq!(
            lat_lon_to_maidenhead(40.7128, -74.0060, LocationPrecision::Grid100Km).unwrap(),
            "FN20"
        );
        assert_eq!(
            lat_lon_to_maidenhead(34.0522, -118.2437, LocationPrecision::Grid100Km).unwrap(),
            "DM04"
        );
        assert_eq!(
            lat_lon_to_maidenhead(-33.8688, 151.2093, LocationPrecision::Region).unwrap(),
            "QF"
        );
        assert_eq!(
            lat_lon_to_maidenhead(40.7128, -74.0060, LocationPrecision::Grid10Km).unwrap(),
            "FN20xr"
        );
    }

    #[test]
    fn test_none_precision() {
        assert!(lat_lon_to_maidenhead(10.0, 10.0, LocationPrecision::None).is_none());
        let zone = encode_geo_zone(10.0, 10.0, LocationPrecision::None);
        assert_eq!(zone, GeoZone::unknown());
        assert!(!zone.is_known());
    }

    #[test]
    fn test_round_trip_including_poles_and_dateline() {
        let coords = [
            (0.0, 0.0),
            (40.7128, -74.0060),
            (-33.8688, 151.2093),
            (51.5074, -0.1278),
            (90.0, 0.0),
            (-90.0, 0.0),
            (89.9999, 179.9999),
            (-89.9999, -179.9999),
            (0.0, 180.0),
            (0.0, -180.0),
            (12.3456, 179.99),
            (-12.3456, -179.99),
        ];

        for (lat, lon) in coords {
            for precision in PRECISIONS {
                let locator = lat_lon_to_maidenhead(lat, lon, precision).unwrap();
                assert_eq!(locator.len(), precision.locator_len());

                let (clat, clon) = maidenhead_to_lat_lon(&locator).unwrap();
                let again = lat_lon_to_maidenhead(clat, clon, precision).unwrap();
                assert_eq!(locator, again, "({lat}, {lon}) at {precision}");
            }
        }
    }

    #[test]
    fn test_dateline_wraps() {
        let east = lat_lon_to_maidenhead(0.0, 180.0, LocationPrecision::Grid100Km).unwrap();
        let west = lat_lon_to_maidenhead(0.0, -180.0, LocationPrecision::Grid100Km).unwrap();
        assert_eq!(east, west);
        assert_eq!(east, "AJ00");
    }

    #[test]
    fn test_center_collapse() {
        // Two distinct points in one cell are indistinguishable
        let a = encode_geo_zone(40.71, -74.50, LocationPrecision::Grid100Km);
        let b = encode_geo_zone(40.20, -75.90, LocationPrecision::Grid100Km);
        assert_eq!(a, b);
        assert_eq!(a.center_lat, 40.5);
        assert_eq!(a.center_lon, -75.0);
    }

    #[test]
    fn test_malformed_locators() {
        assert!(maidenhead_to_lat_lon("").is_none());
        assert!(maidenhead_to_lat_lon("F").is_none());
        assert!(maidenhead_to_lat_lon("ZZ").is_none());
        assert!(maidenhead_to_lat_lon("FNAA").is_none());
        assert!(maidenhead_to_lat_lon("FN20zz").is_none());
        assert!(maidenhead_to_lat_lon("FN20xrA").is_none());
        assert!(maidenhead_to_lat_lon("fn20XR").is_some());
    }

    #[test]
    fn test_distance_properties() {
        let nyc = encode_geo_zone(40.7128, -74.0060, LocationPrecision::Grid100Km);
        let la = encode_geo_zone(34.0522, -118.2437, LocationPrecision::Grid100Km);

        let d = geo_distance(&nyc, &la);
        assert!(d > 3800.0 && d < 4000.0, "NYC-LA distance {d}");
        assert_eq!(d, geo_distance(&la, &nyc));
        assert_eq!(geo_distance(&nyc, &nyc), 0.0);

        let unknown = GeoZone::unknown();
        assert_eq!(geo_distance(&nyc, &unknown), f64::INFINITY);
        assert_eq!(geo_distance(&unknown, &nyc), f64::INFINITY);
    }

    #[test]
    fn test_direction() {
        let nyc = encode_geo_zone(40.7128, -74.0060, LocationPrecision::Grid100Km);
        let la = encode_geo_zone(34.0522, -118.2437, LocationPrecision::Grid100Km);
        let north = encode_geo_zone(60.0, -75.0, LocationPrecision::Grid100Km);

        assert_eq!(get_direction(&nyc, &la), Some(CompassDirection::W));
        assert_eq!(get_direction(&nyc, &north), Some(CompassDirection::N));
        assert_eq!(get_direction(&nyc, &GeoZone::unknown()), None);
        assert_eq!(CompassDirection::from_bearing(359.0), CompassDirection::N);
        assert_eq!(CompassDirection::from_bearing(135.0), CompassDirection::SE);
    }

    #[test]
    fn test_adjacent_zones() {
        let zone = GeoZone::from_locator("FN20").unwrap();
        let neighbors = get_adjacent_zones(&zone);
        assert_eq!(neighbors.len(), 8);

        let mut ids: Vec<&str> = neighbors.iter().map(|z| z.zone_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(
            ids,
            vec!["FM19", "FM29", "FM39", "FN10", "FN11", "FN21", "FN30", "FN31"]
        );
    }

    #[test]
    fn test_adjacent_zones_overflow_and_dateline() {
        // Square 9 rolls into the next field
        let zone = GeoZone::from_locator("FN99").unwrap();
        let ids: Vec<String> = get_adjacent_zones(&zone)
            .into_iter()
            .map(|z| z.zone_id)
            .collect();
        assert!(ids.contains(&"GO00".to_string()));
        assert!(ids.contains(&"GN09".to_string()));

        // Westmost column wraps to the eastmost one
        let zone = GeoZone::from_locator("AJ05").unwrap();
        let ids: Vec<String> = get_adjacent_zones(&zone)
            .into_iter()
            .map(|z| z.zone_id)
            .collect();
        assert_eq!(ids.len(), 8);
        assert!(ids.contains(&"RJ95".to_string()));
    }

    #[test]
    fn test_adjacent_zones_at_pole() {
        let zone = GeoZone::from_locator("AR09").unwrap();
        assert_eq!(get_adjacent_zones(&zone).len(), 5);
    }

    #[test]
    fn test_adjacent_zones_degrade_gracefully() {
        let fine = encode_geo_zone(40.7, -74.0, LocationPrecision::Grid10Km);
        assert!(get_adjacent_zones(&fine).is_empty());
        assert!(get_adjacent_zones(&GeoZone::unknown()).is_empty());

        let mut broken = GeoZone::from_locator("FN20").unwrap();
        broken.zone_id = "F!20".to_string();
        assert!(get_adjacent_zones(&broken).is_empty());
        broken.zone_id = String::new();
        assert!(get_adjacent_zones(&broken).is_empty());
    }

    #[test]
    fn test_is_on_path() {
        let nyc = encode_geo_zone(40.7128, -74.0060, LocationPrecision::Grid100Km);
        let la = encode_geo_zone(34.0522, -118.2437, LocationPrecision::Grid100Km);
        let chicago = encode_geo_zone(41.8781, -87.6298, LocationPrecision::Grid100Km);
        let miami = encode_geo_zone(25.7617, -80.1918, LocationPrecision::Grid100Km);

        assert!(is_on_default_path(&nyc, &nyc, &la));
        assert!(is_on_default_path(&la, &nyc, &la));
        assert!(!is_on_default_path(&miami, &nyc, &la));
        assert!(is_on_path(&chicago, &nyc, &la, 500.0));
        assert!(!is_on_path(&GeoZone::unknown(), &nyc, &la, 500.0));
    }

    #[test]
    fn test_precision_parse() {
        assert_eq!(
            "grid_10km".parse::<LocationPrecision>().unwrap(),
            LocationPrecision::Grid10Km
        );
        assert_eq!(LocationPrecision::Grid100Km.to_string(), "grid_100km");
        assert!("street".parse::<LocationPrecision>().is_err());
    }
}
