//! Per-modality sample selection for one project's sample table.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::dataset::{ProjectSelection, SingleCellSelection, eligible_single_cell};
use crate::domain::{Format, Modality, ProjectId, SampleId, SampleRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    None,
    Some,
    All,
}

#[derive(Debug, Clone)]
pub struct SelectionModel {
    project_id: ProjectId,
    samples: Vec<SampleRecord>,
    visible: Vec<SampleId>,
    single_cell: BTreeSet<SampleId>,
    spatial: BTreeSet<SampleId>,
    committed_single_cell: BTreeSet<SampleId>,
    committed_spatial: BTreeSet<SampleId>,
    format: Option<Format>,
}

impl SelectionModel {
    pub fn new(project_id: ProjectId, samples: Vec<SampleRecord>) -> Self {
        let visible = samples.iter().map(|sample| sample.id.clone()).collect();
        Self {
            project_id,
            samples,
            visible,
            single_cell: BTreeSet::new(),
            spatial: BTreeSet::new(),
            committed_single_cell: BTreeSet::new(),
            committed_spatial: BTreeSet::new(),
            format: None,
        }
    }

    /// Marks what the persisted dataset already holds for this project.
    /// Committed samples are shown selected and cannot be toggled.
    pub fn with_committed(mut self, committed: Option<&ProjectSelection>) -> Self {
        self.set_committed(committed);
        self
    }

    pub fn set_committed(&mut self, committed: Option<&ProjectSelection>) {
        let (single_cell, spatial) = match committed {
            Some(selection) => (
                selection
                    .single_cell
                    .expand(eligible_single_cell(&self.samples)),
                selection.spatial.clone(),
            ),
            None => (BTreeSet::new(), BTreeSet::new()),
        };
        self.single_cell.retain(|id| !single_cell.contains(id));
        self.spatial.retain(|id| !spatial.contains(id));
        self.committed_single_cell = single_cell;
        self.committed_spatial = spatial;
    }

    /// Restricts single-cell selection to samples the format can package.
    pub fn set_format(&mut self, format: Format) {
        self.format = Some(format);
        let blocked = self
            .samples
            .iter()
            .filter(|sample| !self.format_allows(sample))
            .map(|sample| sample.id.clone())
            .collect::<BTreeSet<_>>();
        self.single_cell.retain(|id| !blocked.contains(id));
    }

    /// Replaces the filtered/paginated id list bulk toggles operate on.
    pub fn set_visible(&mut self, ids: impl IntoIterator<Item = SampleId>) {
        self.visible = ids
            .into_iter()
            .filter(|id| self.sample(id).is_some())
            .collect();
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn visible(&self) -> &[SampleId] {
        &self.visible
    }

    pub fn selected(&self, modality: Modality) -> &BTreeSet<SampleId> {
        match modality {
            Modality::SingleCell => &self.single_cell,
            Modality::Spatial => &self.spatial,
        }
    }

    pub fn is_selected(&self, modality: Modality, id: &SampleId) -> bool {
        self.selected(modality).contains(id)
    }

    pub fn is_already_committed(&self, modality: Modality, id: &SampleId) -> bool {
        match modality {
            Modality::SingleCell => self.committed_single_cell.contains(id),
            Modality::Spatial => self.committed_spatial.contains(id),
        }
    }

    /// Whether the row's checkbox for `modality` is inert.
    pub fn is_disabled(&self, modality: Modality, id: &SampleId) -> bool {
        !self.is_selectable(modality, id)
    }

    pub fn toggle_one(&mut self, modality: Modality, id: &SampleId) -> bool {
        if !self.is_selectable(modality, id) {
            return false;
        }
        let set = self.selected_mut(modality);
        if !set.remove(id) {
            set.insert(id.clone());
        }
        true
    }

    /// Header checkbox: selects every selectable visible row when none are
    /// selected, otherwise clears the visible rows.
    pub fn toggle_all_visible(&mut self, modality: Modality) -> TriState {
        let scope = self.selectable_visible(modality);
        let before = tri_state(self.selected(modality), &scope);
        let mut next = self.selected(modality).clone();
        match before {
            TriState::None => next.extend(scope.iter().cloned()),
            TriState::Some | TriState::All => next.retain(|id| !scope.contains(id)),
        }
        *self.selected_mut(modality) = next;
        before
    }

    pub fn tri_state(&self, modality: Modality) -> TriState {
        tri_state(self.selected(modality), &self.selectable_visible(modality))
    }

    /// The table's current choice as a dataset entry. `merge_single_cell`
    /// replaces the explicit single-cell ids with the merged object.
    pub fn to_project_selection(&self, merge_single_cell: bool, includes_bulk: bool) -> ProjectSelection {
        let has_single_cell = self.samples.iter().any(|sample| sample.has_single_cell_data);
        let single_cell = if merge_single_cell && has_single_cell {
            SingleCellSelection::Merged
        } else {
            SingleCellSelection::Samples(self.single_cell.clone())
        };
        ProjectSelection {
            single_cell,
            spatial: self.spatial.clone(),
            includes_bulk: includes_bulk && self.samples.iter().any(|sample| sample.has_bulk_rna_seq),
        }
    }

    pub fn clear(&mut self) {
        self.single_cell.clear();
        self.spatial.clear();
    }

    fn sample(&self, id: &SampleId) -> Option<&SampleRecord> {
        self.samples.iter().find(|sample| &sample.id == id)
    }

    fn format_allows(&self, sample: &SampleRecord) -> bool {
        !sample.has_multiplexed_data || self.format.is_none_or(Format::supports_multiplexed)
    }

    fn is_selectable(&self, modality: Modality, id: &SampleId) -> bool {
        let Some(sample) = self.sample(id) else {
            return false;
        };
        if !sample.has_modality(modality) || self.is_already_committed(modality, id) {
            return false;
        }
        modality == Modality::Spatial || self.format_allows(sample)
    }

    fn selectable_visible(&self, modality: Modality) -> BTreeSet<SampleId> {
        self.visible
            .iter()
            .filter(|id| self.is_selectable(modality, id))
            .cloned()
            .collect()
    }

    fn selected_mut(&mut self, modality: Modality) -> &mut BTreeSet<SampleId> {
        match modality {
            Modality::SingleCell => &mut self.single_cell,
            Modality::Spatial => &mut self.spatial,
        }
    }
}

fn tri_state(selected: &BTreeSet<SampleId>, scope: &BTreeSet<SampleId>) -> TriState {
    let count = scope.iter().filter(|id| selected.contains(*id)).count();
    if count == 0 {
        TriState::None
    } else if count == scope.len() {
        TriState::All
    } else {
        TriState::Some
    }
}
