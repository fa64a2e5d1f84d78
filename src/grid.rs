use std::sync::LazyLock;

use geographiclib_rs::{DirectGeodesic, Geodesic};
use serde::Serialize;

use crate::domain::{Bounds, Resolution};
use crate::error::StageError;

const KM_PER_DEGREE_LAT: f64 = 111.32;
const MIN_PAD_DEGREES: f64 = 2.0;
const PAD_FRACTION: f64 = 0.1;
// Half the meridional circumference; anything larger wraps the globe.
pub const MAX_RADIUS_KM: f64 = 20_000.0;
pub const PARENT_GRID_RATIO: u32 = 3;

static WGS84: LazyLock<Geodesic> = LazyLock::new(Geodesic::wgs84);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Center {
    pub lat: f64,
    pub lon: f64,
}

impl Center {
    pub fn new(lat: f64, lon: f64) -> Result<Self, StageError> {
        if !(-90.0..=90.0).contains(&lat) || !lat.is_finite() {
            return Err(StageError::InvalidDomain(format!(
                "latitude {lat} outside [-90, 90]"
            )));
        }
        if !(-360.0..=360.0).contains(&lon) || !lon.is_finite() {
            return Err(StageError::InvalidDomain(format!(
                "longitude {lon} outside [-360, 360]"
            )));
        }
        Ok(Self { lat, lon })
    }
}

/// WGS84 direct geodesic problem. Longitude is normalised to [-180, 180).
pub fn destination(center: Center, azimuth_deg: f64, distance_km: f64) -> (f64, f64) {
    let (lat, lon): (f64, f64) =
        WGS84.direct(center.lat, center.lon, azimuth_deg, distance_km * 1000.0);
    (lat, normalize_180(lon))
}

fn check_radius(radius_km: f64) -> Result<(), StageError> {
    if !radius_km.is_finite() || radius_km <= 0.0 {
        return Err(StageError::InvalidDomain(format!(
            "radius must be positive, got {radius_km}"
        )));
    }
    if radius_km > MAX_RADIUS_KM {
        return Err(StageError::InvalidDomain(format!(
            "radius {radius_km} km exceeds {MAX_RADIUS_KM} km"
        )));
    }
    Ok(())
}

fn normalize_180(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

fn normalize_360(lon: f64) -> f64 {
    lon.rem_euclid(360.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DomainBox {
    pub center: Center,
    pub radius_km: f64,
    pub inner: Bounds,
    pub padded: Bounds,
}

impl DomainBox {
    pub fn new(center: Center, radius_km: f64) -> Result<Self, StageError> {
        check_radius(radius_km)?;
        let inner = unpadded_bounds(center, radius_km);
        let padded = pad_bounds(&inner);
        Ok(Self {
            center,
            radius_km,
            inner,
            padded,
        })
    }
}

fn unpadded_bounds(center: Center, radius_km: f64) -> Bounds {
    let north = destination(center, 0.0, radius_km);
    let south = destination(center, 180.0, radius_km);
    let east = destination(center, 90.0, radius_km);
    let west = destination(center, 270.0, radius_km);

    let top = north.0.max(south.0);
    let bottom = north.0.min(south.0);
    let mut left = normalize_360(west.1);
    let mut right = normalize_360(east.1);
    if left > right {
        std::mem::swap(&mut left, &mut right);
    }
    Bounds {
        top,
        bottom,
        left,
        right,
    }
}

// Each edge grows by max(10% of the span, 2 degrees), clamped to the valid range.
pub fn pad_bounds(bounds: &Bounds) -> Bounds {
    let lat_pad = ((bounds.top - bounds.bottom) * PAD_FRACTION).max(MIN_PAD_DEGREES);
    let lon_pad = ((bounds.right - bounds.left) * PAD_FRACTION).max(MIN_PAD_DEGREES);
    Bounds {
        top: (bounds.top + lat_pad).clamp(-90.0, 90.0),
        bottom: (bounds.bottom - lat_pad).clamp(-90.0, 90.0),
        left: (bounds.left - lon_pad).clamp(0.0, 360.0),
        right: (bounds.right + lon_pad).clamp(0.0, 360.0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NestLevel {
    pub size_km: u32,
    pub spacing_m: u32,
    pub points: u32,
}

impl NestLevel {
    fn new(size_km: u32, spacing_m: u32) -> Self {
        Self {
            size_km,
            spacing_m,
            points: (u64::from(size_km) * 1000 / u64::from(spacing_m) + 1) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridSpec {
    pub resolution: Resolution,
    pub outer: NestLevel,
    pub inner: NestLevel,
    pub parent_grid_ratio: u32,
    pub parent_start: u32,
    pub truelat1: f64,
    pub truelat2: f64,
    pub ref_lat: f64,
    pub ref_lon: f64,
    pub stand_lon: f64,
}

pub fn derive_grid(
    center: Center,
    radius_km: f64,
    resolution: Resolution,
) -> Result<GridSpec, StageError> {
    check_radius(radius_km)?;

    let inner_size = ((2.0 * radius_km).round() as u32).max(1);
    let outer_size = inner_size * PARENT_GRID_RATIO;
    let outer_spacing = resolution.km_per_pixel() * 1000;
    let inner_spacing = outer_spacing / PARENT_GRID_RATIO;

    let outer = NestLevel::new(outer_size, outer_spacing);
    let inner = NestLevel::new(inner_size, inner_spacing);
    let inner_span_in_parent = (inner.points - 1) / PARENT_GRID_RATIO;
    let parent_start = (outer.points - 1).saturating_sub(inner_span_in_parent) / 2 + 1;

    let span_deg = f64::from(outer_size) / KM_PER_DEGREE_LAT;
    let lat_lo = center.lat - span_deg / 2.0;
    let truelat1 = round4((lat_lo + span_deg / 6.0).clamp(-90.0, 90.0));
    let truelat2 = round4((lat_lo + 5.0 * span_deg / 6.0).clamp(-90.0, 90.0));

    Ok(GridSpec {
        resolution,
        outer,
        inner,
        parent_grid_ratio: PARENT_GRID_RATIO,
        parent_start,
        truelat1,
        truelat2,
        ref_lat: center.lat,
        ref_lon: center.lon,
        stand_lon: center.lon,
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SquareMode {
    Halfside,
    EncloseCircle,
    InscribeInCircle,
}

impl SquareMode {
    pub fn half_side_km(self, radius_km: f64) -> f64 {
        match self {
            SquareMode::Halfside | SquareMode::EncloseCircle => radius_km,
            SquareMode::InscribeInCircle => radius_km / std::f64::consts::SQRT_2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Corner {
    pub name: &'static str,
    pub east_km: f64,
    pub north_km: f64,
    pub bearing_deg: f64,
    pub distance_km: f64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Square {
    pub center: Center,
    pub mode: SquareMode,
    pub half_side_km: f64,
    pub side_km: f64,
    pub diagonal_km: f64,
    pub corners: Vec<Corner>,
}

pub fn square_corners(
    center: Center,
    radius_km: f64,
    mode: SquareMode,
) -> Result<Square, StageError> {
    check_radius(radius_km)?;
    let half = mode.half_side_km(radius_km);
    let offsets = [
        ("NW", -half, half),
        ("NE", half, half),
        ("SE", half, -half),
        ("SW", -half, -half),
    ];

    let corners = offsets
        .into_iter()
        .map(|(name, east_km, north_km)| {
            let distance_km = east_km.hypot(north_km);
            let bearing_deg = east_km.atan2(north_km).to_degrees().rem_euclid(360.0);
            let (lat, lon) = destination(center, bearing_deg, distance_km);
            Corner {
                name,
                east_km,
                north_km,
                bearing_deg,
                distance_km,
                lat,
                lon,
            }
        })
        .collect();

    let side_km = half * 2.0;
    Ok(Square {
        center,
        mode,
        half_side_km: half,
        side_km,
        diagonal_km: side_km * std::f64::consts::SQRT_2,
        corners,
    })
}
