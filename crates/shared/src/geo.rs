//! GeoJSON feature collections of sector polygons.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Boundary, LngLat, Sector, SectorId, SectorStatus};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid feature collection: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected a FeatureCollection, got {0}")]
    NotAFeatureCollection(String),
    #[error("feature {index} has no usable polygon ring")]
    EmptyRing { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: FeatureProperties,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureProperties {
    #[serde(default)]
    pub id: Option<SectorId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: SectorStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
}

impl Geometry {
    fn outer_ring(&self) -> Vec<LngLat> {
        let Geometry::Polygon { coordinates } = self;
        coordinates
            .first()
            .map(|ring| {
                ring.iter()
                    .filter(|position| position.len() >= 2)
                    .map(|position| LngLat {
                        lng: position[0],
                        lat: position[1],
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl FeatureCollection {
    pub fn from_sectors(sectors: &[Sector]) -> Self {
        Self {
            kind: "FeatureCollection".into(),
            features: sectors.iter().map(Feature::from_sector).collect(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, GeoError> {
        let collection: FeatureCollection = serde_json::from_str(raw)?;
        if collection.kind != "FeatureCollection" {
            return Err(GeoError::NotAFeatureCollection(collection.kind));
        }
        Ok(collection)
    }

    /// Converts features into sector records. Features without an `id`
    /// property get a generated one; features without a name are named after
    /// their id.
    pub fn into_sectors(self) -> Result<Vec<Sector>, GeoError> {
        self.features
            .into_iter()
            .enumerate()
            .map(|(index, feature)| {
                let ring = feature.geometry.outer_ring();
                if ring.is_empty() {
                    return Err(GeoError::EmptyRing { index });
                }
                let id = feature
                    .properties
                    .id
                    .filter(|id| !id.is_blank())
                    .unwrap_or_else(SectorId::generate);
                let name = feature
                    .properties
                    .name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| id.to_string());
                Ok(Sector {
                    id,
                    name,
                    status: feature.properties.status,
                    boundary: Boundary(ring),
                    last_updated: None,
                })
            })
            .collect()
    }
}

impl Feature {
    pub fn from_sector(sector: &Sector) -> Self {
        Self {
            kind: "Feature".into(),
            properties: FeatureProperties {
                id: Some(sector.id.clone()),
                name: Some(sector.name.clone()),
                status: sector.status,
            },
            geometry: Geometry::Polygon {
                coordinates: vec![sector
                    .boundary
                    .closed_ring()
                    .into_iter()
                    .map(|[lng, lat]| vec![lng, lat])
                    .collect()],
            },
        }
    }
}
