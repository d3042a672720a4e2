use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetId, Format, Modality, ProjectId, SampleId, SampleRecord};
use crate::error::PortalError;
use crate::lifecycle::DatasetStatus;

const MERGED: &str = "MERGED";

/// Single-cell part of a project selection: either every eligible sample as
/// one merged object, or an explicit set of samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSingleCell", into = "RawSingleCell")]
pub enum SingleCellSelection {
    Merged,
    Samples(BTreeSet<SampleId>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSingleCell {
    Marker(String),
    Samples(Vec<SampleId>),
}

impl TryFrom<RawSingleCell> for SingleCellSelection {
    type Error = PortalError;

    fn try_from(raw: RawSingleCell) -> Result<Self, Self::Error> {
        match raw {
            RawSingleCell::Marker(value) if value == MERGED => Ok(SingleCellSelection::Merged),
            RawSingleCell::Marker(value) => Err(PortalError::InvalidSelection(format!(
                "unexpected single-cell marker {value}"
            ))),
            RawSingleCell::Samples(ids) => {
                Ok(SingleCellSelection::Samples(ids.into_iter().collect()))
            }
        }
    }
}

impl From<SingleCellSelection> for RawSingleCell {
    fn from(selection: SingleCellSelection) -> Self {
        match selection {
            SingleCellSelection::Merged => RawSingleCell::Marker(MERGED.to_string()),
            SingleCellSelection::Samples(ids) => RawSingleCell::Samples(ids.into_iter().collect()),
        }
    }
}

impl Default for SingleCellSelection {
    fn default() -> Self {
        SingleCellSelection::Samples(BTreeSet::new())
    }
}

impl SingleCellSelection {
    pub fn is_empty(&self) -> bool {
        matches!(self, SingleCellSelection::Samples(ids) if ids.is_empty())
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, SingleCellSelection::Merged)
    }

    /// `MERGED` absorbs any explicit set.
    pub fn union(&self, other: &SingleCellSelection) -> SingleCellSelection {
        match (self, other) {
            (SingleCellSelection::Samples(left), SingleCellSelection::Samples(right)) => {
                SingleCellSelection::Samples(left.union(right).cloned().collect())
            }
            _ => SingleCellSelection::Merged,
        }
    }

    /// Concrete sample ids, expanding `MERGED` over `eligible`.
    pub fn expand(&self, eligible: impl IntoIterator<Item = SampleId>) -> BTreeSet<SampleId> {
        match self {
            SingleCellSelection::Merged => eligible.into_iter().collect(),
            SingleCellSelection::Samples(ids) => ids.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSelection {
    #[serde(rename = "SINGLE_CELL", default)]
    pub single_cell: SingleCellSelection,
    #[serde(rename = "SPATIAL", default)]
    pub spatial: BTreeSet<SampleId>,
    #[serde(default)]
    pub includes_bulk: bool,
}

impl ProjectSelection {
    pub fn merged() -> Self {
        Self {
            single_cell: SingleCellSelection::Merged,
            ..Default::default()
        }
    }

    pub fn with_samples(
        modality: Modality,
        samples: impl IntoIterator<Item = SampleId>,
    ) -> Self {
        let mut selection = Self::default();
        let ids = samples.into_iter().collect::<BTreeSet<_>>();
        match modality {
            Modality::SingleCell => selection.single_cell = SingleCellSelection::Samples(ids),
            Modality::Spatial => selection.spatial = ids,
        }
        selection
    }

    pub fn is_empty(&self) -> bool {
        self.single_cell.is_empty() && self.spatial.is_empty() && !self.includes_bulk
    }

    /// Nothing in this selection depends on the packaging format.
    pub fn is_spatial_only(&self) -> bool {
        self.single_cell.is_empty()
    }

    pub fn union(&self, other: &ProjectSelection) -> ProjectSelection {
        ProjectSelection {
            single_cell: self.single_cell.union(&other.single_cell),
            spatial: self.spatial.union(&other.spatial).cloned().collect(),
            includes_bulk: self.includes_bulk || other.includes_bulk,
        }
    }

    pub fn samples(&self, modality: Modality, project_samples: &[SampleRecord]) -> BTreeSet<SampleId> {
        match modality {
            Modality::SingleCell => self
                .single_cell
                .expand(eligible_single_cell(project_samples)),
            Modality::Spatial => self.spatial.clone(),
        }
    }
}

/// Samples a merged single-cell object would contain.
pub fn eligible_single_cell(samples: &[SampleRecord]) -> impl Iterator<Item = SampleId> + '_ {
    samples
        .iter()
        .filter(|sample| sample.has_single_cell_data)
        .map(|sample| sample.id.clone())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub id: Option<DatasetId>,
    pub format: Format,
    #[serde(default)]
    pub data: BTreeMap<ProjectId, ProjectSelection>,
    #[serde(flatten)]
    pub status: DatasetStatus,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub regenerated_from: Option<DatasetId>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub succeeded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Dataset {
    /// An unsaved, local dataset.
    pub fn new(format: Format) -> Self {
        Self {
            id: None,
            format,
            data: BTreeMap::new(),
            status: DatasetStatus::default(),
            email: None,
            regenerated_from: None,
            download_url: None,
            created_at: None,
            succeeded_at: None,
            expires_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(ProjectSelection::is_empty)
    }

    pub fn is_saved(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_spatial_only(&self) -> bool {
        self.data.values().all(ProjectSelection::is_spatial_only)
    }

    pub fn project(&self, project_id: &ProjectId) -> Option<&ProjectSelection> {
        self.data.get(project_id)
    }

    /// Totals across projects. `samples` supplies per-project sample rows so
    /// merged selections can be counted; projects missing from it are counted
    /// under `merged_projects` only.
    pub fn summary(&self, samples: &BTreeMap<ProjectId, Vec<SampleRecord>>) -> DatasetSummary {
        let mut summary = DatasetSummary {
            projects: self.data.len(),
            ..Default::default()
        };
        for (project_id, selection) in &self.data {
            match &selection.single_cell {
                SingleCellSelection::Merged => {
                    summary.merged_projects += 1;
                    if let Some(rows) = samples.get(project_id) {
                        summary.single_cell_samples += eligible_single_cell(rows).count();
                    }
                }
                SingleCellSelection::Samples(ids) => summary.single_cell_samples += ids.len(),
            }
            summary.spatial_samples += selection.spatial.len();
            if selection.includes_bulk {
                summary.bulk_projects += 1;
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub projects: usize,
    pub single_cell_samples: usize,
    pub merged_projects: usize,
    pub spatial_samples: usize,
    pub bulk_projects: usize,
}
