//! Sidecar-based coordinate lookup.
//!
//! GPS fixes arrive as Takeout-style JSON sidecars next to the media file.
//! Absence or unparsable JSON means "no coordinates", never an error.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model::Coordinates;

/// Async lookup of a GPS fix for a media file.
#[async_trait]
pub trait CoordinateProvider: Send + Sync {
    async fn coordinates_for(&self, path: &Path) -> Option<Coordinates>;
}

#[derive(Debug, Deserialize)]
struct SidecarGeo {
    #[serde(default)]
    latitude: f64,
    #[serde(default)]
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct SidecarTime {
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Sidecar {
    #[serde(rename = "geoData")]
    geo_data: Option<SidecarGeo>,
    #[serde(rename = "geoDataExif")]
    geo_data_exif: Option<SidecarGeo>,
    #[serde(rename = "photoTakenTime")]
    photo_taken_time: Option<SidecarTime>,
}

impl Sidecar {
    /// Prefer the app-reported fix, fall back to the EXIF-copied one; zero
    /// coordinates mean no fix was recorded.
    pub fn coordinates(&self) -> Option<Coordinates> {
        for geo in [self.geo_data.as_ref(), self.geo_data_exif.as_ref()] {
            if let Some(geo) = geo {
                let coords = Coordinates::new(geo.latitude, geo.longitude);
                if !coords.is_zero() {
                    return Some(coords);
                }
            }
        }
        None
    }

    /// Unix timestamp of the capture time, when present.
    pub fn taken_timestamp(&self) -> Option<i64> {
        self.photo_taken_time
            .as_ref()?
            .timestamp
            .as_ref()?
            .parse()
            .ok()
    }
}

/// Candidate sidecar paths for a media file: `photo.jpg.json` and
/// `photo.json`.
fn sidecar_candidates(path: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::with_capacity(2);
    let mut with_suffix = path.as_os_str().to_os_string();
    with_suffix.push(".json");
    candidates.push(PathBuf::from(with_suffix));
    candidates.push(path.with_extension("json"));
    candidates
}

/// Locate and parse the sidecar for a file, if any.
pub async fn read_sidecar(path: &Path) -> Option<Sidecar> {
    for candidate in sidecar_candidates(path) {
        match tokio::fs::read_to_string(&candidate).await {
            Ok(contents) => match serde_json::from_str::<Sidecar>(&contents) {
                Ok(sidecar) => return Some(sidecar),
                Err(e) => {
                    log::debug!("Unparsable sidecar {}: {e}", candidate.display());
                }
            },
            Err(_) => {}
        }
    }
    None
}

/// The default provider: JSON sidecars on disk.
#[derive(Debug, Default)]
pub struct JsonSidecarProvider;

#[async_trait]
impl CoordinateProvider for JsonSidecarProvider {
    async fn coordinates_for(&self, path: &Path) -> Option<Coordinates> {
        read_sidecar(path).await?.coordinates()
    }
}
