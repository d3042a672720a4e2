use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PortalError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    SingleCell,
    Spatial,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::SingleCell, Modality::Spatial];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::SingleCell => "SINGLE_CELL",
            Modality::Spatial => "SPATIAL",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Modality {
    type Err = PortalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match normalize_key(value).as_str() {
            "SINGLE_CELL" => Ok(Modality::SingleCell),
            "SPATIAL" => Ok(Modality::Spatial),
            _ => Err(PortalError::InvalidModality(value.to_string())),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Format {
    SingleCellExperiment,
    AnnData,
    Metadata,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::SingleCellExperiment => "SINGLE_CELL_EXPERIMENT",
            Format::AnnData => "ANN_DATA",
            Format::Metadata => "METADATA",
        }
    }

    /// AnnData packaging cannot carry spatial data.
    pub fn supports_modality(self, modality: Modality) -> bool {
        !(self == Format::AnnData && modality == Modality::Spatial)
    }

    /// AnnData packaging cannot contain multiplexed samples.
    pub fn supports_multiplexed(self) -> bool {
        self != Format::AnnData
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Format {
    type Err = PortalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match normalize_key(value).as_str() {
            "SINGLE_CELL_EXPERIMENT" | "SCE" => Ok(Format::SingleCellExperiment),
            "ANN_DATA" | "ANNDATA" => Ok(Format::AnnData),
            "METADATA" => Ok(Format::Metadata),
            _ => Err(PortalError::InvalidFormat(value.to_string())),
        }
    }
}

fn normalize_key(value: &str) -> String {
    value.trim().replace('-', "_").to_uppercase()
}

macro_rules! opaque_id {
    ($name:ident, $what:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = PortalError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(PortalError::InvalidSelection(format!("empty {}", $what)));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(SampleId, "sample id");
opaque_id!(ProjectId, "project id");
opaque_id!(DatasetId, "dataset id");

/// Server-side identifier of a computed file; the API emits integers, older
/// snapshots strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileLocator {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for FileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileLocator::Numeric(id) => write!(f, "{id}"),
            FileLocator::Text(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileScope {
    #[serde(default, alias = "project")]
    pub project_id: Option<ProjectId>,
    #[serde(default, alias = "sample")]
    pub sample_id: Option<SampleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedFileDescriptor {
    #[serde(default)]
    pub modality: Option<Modality>,
    #[serde(default)]
    pub format: Option<Format>,
    #[serde(default)]
    pub includes_merged: bool,
    #[serde(default, alias = "has_multiplexed_data")]
    pub includes_multiplexed: bool,
    #[serde(default)]
    pub metadata_only: bool,
    #[serde(flatten)]
    pub scope: FileScope,
    #[serde(default)]
    pub size_in_bytes: u64,
    #[serde(alias = "id")]
    pub locator: FileLocator,
}

impl ComputedFileDescriptor {
    pub fn key(&self) -> DescriptorKey {
        DescriptorKey {
            modality: self.modality,
            format: self.format,
            includes_merged: self.includes_merged,
            includes_multiplexed: self.includes_multiplexed,
            metadata_only: self.metadata_only,
        }
    }
}

/// The discriminating tuple of a computed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorKey {
    pub modality: Option<Modality>,
    pub format: Option<Format>,
    pub includes_merged: bool,
    pub includes_multiplexed: bool,
    pub metadata_only: bool,
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modality = self.modality.map(Modality::as_str).unwrap_or("-");
        let format = self.format.map(Format::as_str).unwrap_or("-");
        write!(
            f,
            "modality={modality} format={format} merged={} multiplexed={} metadata_only={}",
            self.includes_merged, self.includes_multiplexed, self.metadata_only
        )
    }
}

/// A sample row as the portal lists it for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    #[serde(alias = "scpca_id")]
    pub id: SampleId,
    #[serde(default)]
    pub has_single_cell_data: bool,
    #[serde(default)]
    pub has_spatial_data: bool,
    #[serde(default)]
    pub has_multiplexed_data: bool,
    #[serde(default)]
    pub has_bulk_rna_seq: bool,
}

impl SampleRecord {
    pub fn has_modality(&self, modality: Modality) -> bool {
        match modality {
            Modality::SingleCell => self.has_single_cell_data,
            Modality::Spatial => self.has_spatial_data,
        }
    }
}
