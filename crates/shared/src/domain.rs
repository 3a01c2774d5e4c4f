use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(HistoryEntryId);
id_newtype!(NotificationId);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectorId(pub String);

impl SectorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Collection progress of a sector.
///
/// Decoding is lenient: a missing, null or unrecognized token reads as
/// [`SectorStatus::Pending`], so every consumer sees one of the three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectorStatus {
    #[default]
    Pending,
    EnRoute,
    Collected,
}

impl SectorStatus {
    pub const ALL: [SectorStatus; 3] = [
        SectorStatus::Pending,
        SectorStatus::EnRoute,
        SectorStatus::Collected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SectorStatus::Pending => "pending",
            SectorStatus::EnRoute => "en_route",
            SectorStatus::Collected => "collected",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "pending" => Some(SectorStatus::Pending),
            "en_route" => Some(SectorStatus::EnRoute),
            "collected" => Some(SectorStatus::Collected),
            _ => None,
        }
    }

    pub fn from_token(token: Option<&str>) -> Self {
        token.and_then(Self::parse).unwrap_or_default()
    }

    /// Upper-case label with underscores replaced, e.g. `EN ROUTE`.
    pub fn label(self) -> String {
        self.as_str().replace('_', " ").to_uppercase()
    }

    /// Decoder for write requests: the token must be present and known.
    pub fn deserialize_strict<'de, D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("unknown sector status '{raw}'"))
        })
    }
}

impl fmt::Display for SectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SectorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown sector status '{s}'"))
    }
}

impl<'de> Deserialize<'de> for SectorStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(SectorStatus::from_token(
            raw.as_ref().and_then(serde_json::Value::as_str),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

/// Outer ring of a sector polygon, in drawing order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Boundary(pub Vec<LngLat>);

impl Boundary {
    pub fn points(&self) -> &[LngLat] {
        &self.0
    }

    /// Ring as GeoJSON positions, closed if the stored ring is open.
    pub fn closed_ring(&self) -> Vec<[f64; 2]> {
        let mut ring: Vec<[f64; 2]> = self.0.iter().map(|p| [p.lng, p.lat]).collect();
        if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
            if ring.len() > 1 && first != last {
                ring.push(first);
            }
        }
        ring
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    pub id: SectorId,
    pub name: String,
    #[serde(default)]
    pub status: SectorStatus,
    #[serde(default)]
    pub boundary: Boundary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryEntryId,
    pub sector_id: SectorId,
    pub sector_name: String,
    pub previous_status: SectorStatus,
    pub new_status: SectorStatus,
    #[serde(default)]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationReport {
    pub id: NotificationId,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub sector_id: Option<SectorId>,
    #[serde(default)]
    pub reporter: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub email: String,
}

impl Actor {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }

    pub fn is_supervisor(&self, domain_suffix: &str) -> bool {
        !domain_suffix.is_empty()
            && self
                .email
                .to_ascii_lowercase()
                .ends_with(&domain_suffix.to_ascii_lowercase())
    }

    /// Local part of the email, used as a short display name.
    pub fn display_name(&self) -> &str {
        self.email.split('@').next().unwrap_or(&self.email)
    }
}
