use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lab {
    Ginkgo,
    Transcriptic,
    Biofab,
    Emerald,
}

impl Lab {
    pub const ALL: [Lab; 4] = [Lab::Ginkgo, Lab::Transcriptic, Lab::Biofab, Lab::Emerald];

    /// Upload-path key, which is also the value stored in `properties.lab`.
    pub fn as_key(&self) -> &'static str {
        match self {
            Lab::Ginkgo => "ginkgo",
            Lab::Transcriptic => "transcriptic",
            Lab::Biofab => "biofab",
            Lab::Emerald => "emerald",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Lab::Ginkgo => "Ginkgo",
            Lab::Transcriptic => "Transcriptic",
            Lab::Biofab => "UW_BIOFAB",
            Lab::Emerald => "Emerald",
        }
    }
}

impl fmt::Display for Lab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

impl FromStr for Lab {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        Lab::ALL
            .into_iter()
            .find(|lab| lab.as_key() == normalized)
            .ok_or_else(|| CatalogError::Data(format!("\"{value}\" is not a known uploads path")))
    }
}

/// Infer the owning lab from a normalized upload path.
///
/// Strict: rejects paths that still carry a leading separator and first
/// segments outside the known lab set.
pub fn lab_from_path(path: &str) -> Result<Lab, CatalogError> {
    if path.starts_with('/') {
        return Err(CatalogError::Data(format!(
            "\"{path}\" is not a normalized path"
        )));
    }
    let first = path.split('/').next().unwrap_or_default();
    first.parse()
}

/// Display name for a lab key. Unlike [`lab_from_path`] this never fails:
/// keys outside the mapping are reported as `"Unknown"`.
pub fn lab_display_name(key: &str) -> &'static str {
    key.parse::<Lab>()
        .map(|lab| lab.display_name())
        .unwrap_or("Unknown")
}

/// Display name of the lab owning a normalized upload path.
pub fn lab_name_from_path(path: &str) -> Result<&'static str, CatalogError> {
    let lab = lab_from_path(path)?;
    Ok(lab_display_name(lab.as_key()))
}

/// Namespaced (version 5) identifier of a catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogId(String);

impl CatalogId {
    pub(crate) fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CatalogId {
    type Err = CatalogError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parsed = Uuid::parse_str(value.trim())
            .map_err(|_| CatalogError::Data(format!("invalid catalog uuid: {value}")))?;
        Ok(Self::from_uuid(parsed))
    }
}
