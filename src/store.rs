use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::{Dataset, ProjectSelection, SingleCellSelection};
use crate::domain::{Format, ProjectId, SampleId, SampleRecord};
use crate::error::PortalError;
use crate::lifecycle::classify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Replace,
    Append,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Replace => write!(f, "replace"),
            MergeStrategy::Append => write!(f, "append"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = PortalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "replace" => Ok(MergeStrategy::Replace),
            "append" | "add" => Ok(MergeStrategy::Append),
            _ => Err(PortalError::InvalidStrategy(value.to_string())),
        }
    }
}

/// Single-cell samples that would be dropped by a format change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatConflict {
    pub project_id: ProjectId,
    pub samples: Vec<SampleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingFormatChange {
    pub format: Format,
    pub conflicts: Vec<FormatConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FormatChange {
    Applied,
    NeedsConfirmation(PendingFormatChange),
}

/// Aggregate operations over a dataset's project map.
pub struct DatasetStore;

impl DatasetStore {
    /// Upserts one project's selection; an empty selection removes the key.
    pub fn set_project_selection(
        dataset: &mut Dataset,
        project_id: ProjectId,
        selection: ProjectSelection,
    ) -> Result<(), PortalError> {
        Self::ensure_mutable(dataset)?;
        Self::detach_finished(dataset);
        if selection.is_empty() {
            dataset.data.remove(&project_id);
        } else {
            dataset.data.insert(project_id, selection);
        }
        Ok(())
    }

    /// Unions `selection` into whatever the project already holds.
    pub fn add_project_selection(
        dataset: &mut Dataset,
        project_id: ProjectId,
        selection: &ProjectSelection,
    ) -> Result<(), PortalError> {
        let merged = match dataset.data.get(&project_id) {
            Some(existing) => existing.union(selection),
            None => selection.clone(),
        };
        Self::set_project_selection(dataset, project_id, merged)
    }

    pub fn remove_project(dataset: &mut Dataset, project_id: &ProjectId) -> Result<(), PortalError> {
        Self::ensure_mutable(dataset)?;
        Self::detach_finished(dataset);
        dataset.data.remove(project_id);
        Ok(())
    }

    pub fn clear(dataset: &mut Dataset) -> Result<(), PortalError> {
        Self::ensure_mutable(dataset)?;
        Self::detach_finished(dataset);
        dataset.data.clear();
        Ok(())
    }

    /// Append is offered only when both datasets were authored under the same
    /// format or the incoming one has nothing format-dependent.
    pub fn can_append(target: &Dataset, incoming: &Dataset) -> bool {
        target.format == incoming.format || incoming.is_spatial_only()
    }

    pub fn merge_into(
        target: &mut Dataset,
        incoming: &Dataset,
        strategy: MergeStrategy,
    ) -> Result<(), PortalError> {
        Self::ensure_mutable(target)?;
        match strategy {
            MergeStrategy::Replace => {
                Self::detach_finished(target);
                target.data = non_empty(incoming.data.clone());
                target.format = incoming.format;
            }
            MergeStrategy::Append => {
                if !Self::can_append(target, incoming) {
                    return Err(PortalError::MergeConflict {
                        target: target.format.to_string(),
                        incoming: incoming.format.to_string(),
                    });
                }
                Self::detach_finished(target);
                let mut data = target.data.clone();
                for (project_id, selection) in &incoming.data {
                    let next = match data.get(project_id) {
                        Some(existing) => existing.union(selection),
                        None => selection.clone(),
                    };
                    data.insert(project_id.clone(), next);
                }
                target.data = non_empty(data);
            }
        }
        info!(
            strategy = %strategy,
            projects = target.data.len(),
            format = %target.format,
            "merged dataset"
        );
        Ok(())
    }

    /// Switches the format when nothing is lost; otherwise returns the
    /// samples that would be dropped and leaves the dataset untouched.
    pub fn request_format_change(
        dataset: &mut Dataset,
        format: Format,
        samples: &BTreeMap<ProjectId, Vec<SampleRecord>>,
    ) -> Result<FormatChange, PortalError> {
        Self::ensure_mutable(dataset)?;
        let conflicts = format_conflicts(dataset, format, samples);
        if conflicts.is_empty() {
            if format != dataset.format {
                Self::detach_finished(dataset);
            }
            dataset.format = format;
            return Ok(FormatChange::Applied);
        }
        Ok(FormatChange::NeedsConfirmation(PendingFormatChange {
            format,
            conflicts,
        }))
    }

    /// Applies a confirmed format change, dropping the listed samples.
    pub fn confirm_format_change(
        dataset: &mut Dataset,
        pending: &PendingFormatChange,
    ) -> Result<(), PortalError> {
        Self::ensure_mutable(dataset)?;
        Self::detach_finished(dataset);
        let mut data = dataset.data.clone();
        for conflict in &pending.conflicts {
            if let Some(selection) = data.get_mut(&conflict.project_id)
                && let SingleCellSelection::Samples(ids) = &mut selection.single_cell
            {
                ids.retain(|id| !conflict.samples.contains(id));
            }
        }
        dataset.data = non_empty(data);
        dataset.format = pending.format;
        info!(format = %pending.format, "dataset format changed after confirmation");
        Ok(())
    }

    /// Turns a dataset whose packaging job already ran into an unsaved local
    /// copy with the same format and selection. Returns whether it did.
    pub fn detach_finished(dataset: &mut Dataset) -> bool {
        if classify(&dataset.status).is_unprocessed {
            return false;
        }
        info!(
            dataset = dataset.id.as_ref().map(|id| id.as_str()).unwrap_or("(unsaved)"),
            "editing a packaged dataset; starting a new unsaved copy"
        );
        let mut fresh = Dataset::new(dataset.format);
        fresh.data = std::mem::take(&mut dataset.data);
        fresh.regenerated_from = dataset.regenerated_from.take();
        *dataset = fresh;
        true
    }

    fn ensure_mutable(dataset: &Dataset) -> Result<(), PortalError> {
        if classify(&dataset.status).is_processing {
            let id = dataset
                .id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "(unsaved)".to_string());
            return Err(PortalError::DatasetLocked(id));
        }
        Ok(())
    }
}

fn non_empty(
    data: BTreeMap<ProjectId, ProjectSelection>,
) -> BTreeMap<ProjectId, ProjectSelection> {
    data.into_iter()
        .filter(|(_, selection)| !selection.is_empty())
        .collect()
}

fn format_conflicts(
    dataset: &Dataset,
    format: Format,
    samples: &BTreeMap<ProjectId, Vec<SampleRecord>>,
) -> Vec<FormatConflict> {
    if format.supports_multiplexed() || format == dataset.format {
        return Vec::new();
    }
    let mut conflicts = Vec::new();
    for (project_id, selection) in &dataset.data {
        let SingleCellSelection::Samples(ids) = &selection.single_cell else {
            continue;
        };
        let Some(rows) = samples.get(project_id) else {
            continue;
        };
        let blocked = rows
            .iter()
            .filter(|row| row.has_multiplexed_data && ids.contains(&row.id))
            .map(|row| row.id.clone())
            .collect::<Vec<_>>();
        if !blocked.is_empty() {
            conflicts.push(FormatConflict {
                project_id: project_id.clone(),
                samples: blocked,
            });
        }
    }
    conflicts
}
