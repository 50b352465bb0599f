use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::raster::Band;
use crate::remote::stac::SceneCandidate;

/// Geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Builds a box from the STAC `[west, south, east, north]` ordering.
    pub fn from_array(values: [f64; 4]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }

    pub fn is_valid(&self) -> bool {
        let values = self.as_array();
        values.iter().all(|v| v.is_finite())
            && self.min_lon <= self.max_lon
            && self.min_lat <= self.max_lat
            && (-180.0..=180.0).contains(&self.min_lon)
            && (-180.0..=180.0).contains(&self.max_lon)
            && (-90.0..=90.0).contains(&self.min_lat)
            && (-90.0..=90.0).contains(&self.max_lat)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && other.min_lon <= self.max_lon
            && self.min_lat <= other.max_lat
            && other.min_lat <= self.max_lat
    }

    /// Computes the envelope of every coordinate pair in a GeoJSON geometry.
    /// Returns `None` when the geometry holds no coordinates.
    pub fn from_geojson(geometry: &Value) -> Option<Self> {
        let coordinates = geometry.get("coordinates")?;
        let mut envelope: Option<BoundingBox> = None;
        collect_positions(coordinates, &mut |lon, lat| {
            envelope = Some(match envelope {
                None => BoundingBox::new(lon, lat, lon, lat),
                Some(b) => BoundingBox::new(
                    b.min_lon.min(lon),
                    b.min_lat.min(lat),
                    b.max_lon.max(lon),
                    b.max_lat.max(lat),
                ),
            });
        });
        envelope
    }

    /// GeoJSON polygon covering the box.
    pub fn to_polygon(&self) -> Value {
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [[
                [self.min_lon, self.min_lat],
                [self.max_lon, self.min_lat],
                [self.max_lon, self.max_lat],
                [self.min_lon, self.max_lat],
                [self.min_lon, self.min_lat],
            ]],
        })
    }
}

fn collect_positions(value: &Value, visit: &mut dyn FnMut(f64, f64)) {
    if let Value::Array(items) = value {
        if let (Some(lon), Some(lat)) = (
            items.first().and_then(Value::as_f64),
            items.get(1).and_then(Value::as_f64),
        ) {
            visit(lon, lat);
            return;
        }
        for item in items {
            collect_positions(item, visit);
        }
    }
}

/// Preprocessing state of a scene.
///
/// Only moves forward: `raw -> corrected -> ready`, or from any
/// non-terminal state to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Raw,
    Corrected,
    Ready,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Raw => "raw",
            ProcessingStatus::Corrected => "corrected",
            ProcessingStatus::Ready => "ready",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Ready | ProcessingStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        Self::predecessors(next).contains(self)
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: ProcessingStatus) -> &'static [ProcessingStatus] {
        match next {
            ProcessingStatus::Raw => &[],
            ProcessingStatus::Corrected => &[ProcessingStatus::Raw],
            ProcessingStatus::Ready => &[ProcessingStatus::Corrected],
            ProcessingStatus::Failed => &[ProcessingStatus::Raw, ProcessingStatus::Corrected],
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ProcessingStatus::Raw),
            "corrected" => Ok(ProcessingStatus::Corrected),
            "ready" => Ok(ProcessingStatus::Ready),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(format!("unknown processing status '{}'", other)),
        }
    }
}

/// A satellite scene known to the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagerySource {
    /// Catalog identifier (UUID).
    pub id: String,
    /// Imagery provider, e.g. `earth-search`.
    pub provider: String,
    /// Provider-side scene identifier.
    pub scene_id: String,
    pub acquired_at: DateTime<Utc>,
    /// Cloud cover reported by the provider, in percent.
    pub cloud_cover: f64,
    /// GeoJSON footprint geometry.
    pub footprint: Value,
    pub bbox: BoundingBox,
    /// Ground sample distance in meters, if known.
    pub resolution_m: Option<f64>,
    pub bands: Vec<Band>,
    /// Blob key of the analysis-ready raster, set once `ready`.
    pub storage_uri: Option<String>,
    pub status: ProcessingStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImagerySource {
    /// Creates a `raw` record for a freshly discovered scene.
    pub fn discovered(provider: &str, candidate: &SceneCandidate) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            scene_id: candidate.id.clone(),
            acquired_at: candidate.acquired_at,
            cloud_cover: candidate.cloud_cover,
            footprint: candidate.footprint.clone(),
            bbox: candidate.bbox,
            resolution_m: candidate.resolution_m,
            bands: candidate.assets.keys().copied().collect(),
            storage_uri: None,
            status: ProcessingStatus::Raw,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ProcessingStatus::Ready
    }
}
