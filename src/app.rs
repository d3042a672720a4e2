use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::api::{DatasetBody, PortalClient};
use crate::catalog::CatalogIndex;
use crate::dataset::{Dataset, DatasetSummary, ProjectSelection, SingleCellSelection};
use crate::domain::{DatasetId, FileLocator, FileScope, Format, ProjectId, SampleRecord};
use crate::error::PortalError;
use crate::lifecycle::{CancelToken, Classification, PollPolicy, Poller, classify_at};
use crate::local_state::{KeyValueStore, LocalState};
use crate::resolver::{OptionsResolver, SelectionSnapshot};
use crate::selection::SelectionModel;
use crate::store::{DatasetStore, FormatChange, MergeStrategy, PendingFormatChange};

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub locator: FileLocator,
    pub size_in_bytes: u64,
    pub download_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub dataset: Dataset,
    pub classification: Classification,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: PortalClient, K: KeyValueStore> {
    client: C,
    state: LocalState<K>,
    policy: PollPolicy,
    token: Option<String>,
}

impl<C: PortalClient, K: KeyValueStore> App<C, K> {
    pub fn new(client: C, state: LocalState<K>, policy: PollPolicy, token: Option<String>) -> Self {
        Self {
            client,
            state,
            policy,
            token,
        }
    }

    pub fn state(&self) -> &LocalState<K> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut LocalState<K> {
        &mut self.state
    }

    /// The stored "My Dataset", or an empty local one in the user's format.
    pub fn my_dataset(&self) -> Dataset {
        let snapshot = self.state.snapshot();
        snapshot.my_dataset.clone().unwrap_or_else(|| {
            Dataset::new(snapshot.user_format.unwrap_or(Format::SingleCellExperiment))
        })
    }

    pub fn classify(&self, dataset: &Dataset) -> Classification {
        classify_at(dataset, Utc::now(), self.policy.retention)
    }

    /// Download choices for a project's own files, seeded with the user's
    /// last modality and format.
    pub fn download_options(&self, project_id: &ProjectId) -> Result<OptionsResolver, PortalError> {
        let files = self.client.project_computed_files(project_id)?;
        let scope = FileScope {
            project_id: Some(project_id.clone()),
            sample_id: None,
        };
        let snapshot = self.state.snapshot();
        Ok(OptionsResolver::with_preference(
            CatalogIndex::for_scope(&files, &scope),
            snapshot.user_modality,
            snapshot.user_format,
        ))
    }

    pub fn remember_choice(&mut self, resolver: &OptionsResolver) -> Result<(), PortalError> {
        let choice = resolver.choice();
        if let Some(modality) = choice.modality {
            self.state.set_user_modality(modality)?;
        }
        if let Some(format) = choice.format {
            self.state.set_user_format(format)?;
        }
        Ok(())
    }

    /// Resolves the current choice and fetches its signed link. The result is
    /// tagged with the choice it was issued for; pass both to
    /// [`OptionsResolver::accept`] before using the link.
    pub fn request_download(
        &self,
        resolver: &OptionsResolver,
    ) -> Result<(SelectionSnapshot, DownloadResult), PortalError> {
        let snapshot = resolver.snapshot();
        let file = resolver.resolve()?;
        let download_url = self
            .client
            .computed_file_download_url(&file.locator, self.token.as_deref())?;
        Ok((
            snapshot,
            DownloadResult {
                locator: file.locator.clone(),
                size_in_bytes: file.size_in_bytes,
                download_url,
            },
        ))
    }

    /// Sample table for a project with what My Dataset already holds marked.
    pub fn selection_model(&self, project_id: &ProjectId) -> Result<SelectionModel, PortalError> {
        let samples = self.client.project_samples(project_id)?;
        let dataset = self.my_dataset();
        let mut model = SelectionModel::new(project_id.clone(), samples)
            .with_committed(dataset.project(project_id));
        model.set_format(dataset.format);
        Ok(model)
    }

    pub fn add_to_my_dataset(
        &mut self,
        project_id: ProjectId,
        selection: &ProjectSelection,
    ) -> Result<Dataset, PortalError> {
        let mut dataset = self.my_dataset();
        DatasetStore::add_project_selection(&mut dataset, project_id, selection)?;
        self.state.set_my_dataset(Some(dataset.clone()))?;
        Ok(dataset)
    }

    pub fn remove_from_my_dataset(&mut self, project_id: &ProjectId) -> Result<Dataset, PortalError> {
        let mut dataset = self.my_dataset();
        DatasetStore::remove_project(&mut dataset, project_id)?;
        self.state.set_my_dataset(Some(dataset.clone()))?;
        Ok(dataset)
    }

    pub fn clear_my_dataset(&mut self) -> Result<Dataset, PortalError> {
        let mut dataset = self.my_dataset();
        DatasetStore::clear(&mut dataset)?;
        self.state.set_my_dataset(Some(dataset.clone()))?;
        Ok(dataset)
    }

    /// Pulls a shared dataset into My Dataset with the chosen strategy.
    pub fn merge_shared_dataset(
        &mut self,
        shared_id: &DatasetId,
        strategy: MergeStrategy,
        sink: &dyn ProgressSink,
    ) -> Result<Dataset, PortalError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; fetching shared dataset {shared_id}"),
            elapsed: None,
        });
        let shared = self.client.get_dataset(shared_id, self.token.as_deref())?;
        let mut dataset = self.my_dataset();
        DatasetStore::merge_into(&mut dataset, &shared, strategy)?;
        sink.event(ProgressEvent {
            message: format!("phase=Store; {strategy} merged {} projects", shared.data.len()),
            elapsed: None,
        });
        self.state.set_my_dataset(Some(dataset.clone()))?;
        Ok(dataset)
    }

    pub fn request_format_change(&mut self, format: Format) -> Result<FormatChange, PortalError> {
        let mut dataset = self.my_dataset();
        let samples = self.explicit_project_samples(&dataset)?;
        let change = DatasetStore::request_format_change(&mut dataset, format, &samples)?;
        if change == FormatChange::Applied {
            self.state.set_my_dataset(Some(dataset))?;
            self.state.set_user_format(format)?;
        }
        Ok(change)
    }

    pub fn confirm_format_change(&mut self, pending: &PendingFormatChange) -> Result<Dataset, PortalError> {
        let mut dataset = self.my_dataset();
        DatasetStore::confirm_format_change(&mut dataset, pending)?;
        self.state.set_my_dataset(Some(dataset.clone()))?;
        self.state.set_user_format(pending.format)?;
        Ok(dataset)
    }

    pub fn summary(&self) -> Result<DatasetSummary, PortalError> {
        let dataset = self.my_dataset();
        let mut samples = BTreeMap::new();
        for (project_id, selection) in &dataset.data {
            if selection.single_cell.is_merged() {
                samples.insert(project_id.clone(), self.client.project_samples(project_id)?);
            }
        }
        Ok(dataset.summary(&samples))
    }

    /// Saves My Dataset with `start = true` and polls until the packaging job
    /// reaches a terminal state or `cancel` fires.
    pub fn process_dataset(
        &mut self,
        sink: &dyn ProgressSink,
        cancel: CancelToken,
    ) -> Result<Dataset, PortalError> {
        let snapshot = self.state.snapshot();
        let email = snapshot.email.clone().ok_or(PortalError::MissingEmail)?;
        if !snapshot.terms_accepted {
            return Err(PortalError::TermsNotAccepted);
        }
        let mut dataset = self.my_dataset();
        if dataset.is_empty() {
            return Err(PortalError::EmptyDataset);
        }
        let classification = self.classify(&dataset);
        if classification.is_processing {
            let id = dataset.id.as_ref().map(ToString::to_string).unwrap_or_default();
            return Err(PortalError::DatasetLocked(id));
        }
        if classification.is_ready {
            info!(dataset = ?dataset.id, "dataset already packaged");
            return Ok(dataset);
        }
        DatasetStore::detach_finished(&mut dataset);

        sink.event(ProgressEvent {
            message: "phase=Prepare; submitting dataset".to_string(),
            elapsed: None,
        });
        let body = DatasetBody::from_dataset(&dataset, Some(email), true);
        let token = self.token.as_deref();
        let saved = match &dataset.id {
            Some(id) => self.client.update_dataset(id, &body, token)?,
            None => self.client.create_dataset(&body, token)?,
        };
        let id = saved.id.clone().ok_or(PortalError::UnsavedDataset)?;
        info!(dataset = %id, projects = saved.data.len(), "dataset submitted for processing");
        self.state.set_my_dataset(Some(saved))?;

        let poller = Poller::new(self.policy.clone(), cancel);
        let client = &self.client;
        let finished = poller.poll(&id, || client.get_dataset(&id, token), sink)?;
        info!(dataset = %id, state = ?self.classify(&finished).state(), "dataset processing finished");
        self.state.set_my_dataset(Some(finished.clone()))?;
        Ok(finished)
    }

    pub fn status(&self, id: &DatasetId) -> Result<StatusResult, PortalError> {
        let dataset = self.client.get_dataset(id, self.token.as_deref())?;
        let classification = self.classify(&dataset);
        Ok(StatusResult {
            dataset,
            classification,
        })
    }

    /// Link to a finished dataset's package.
    pub fn dataset_download_url(&self, id: &DatasetId) -> Result<String, PortalError> {
        let status = self.status(id)?;
        if !status.classification.is_ready {
            return Err(PortalError::DatasetNotReady(id.to_string()));
        }
        status
            .dataset
            .download_url
            .ok_or_else(|| PortalError::DatasetNotReady(id.to_string()))
    }

    /// Starts a new local My Dataset from an expired one's selection.
    pub fn regenerate(&mut self, id: &DatasetId) -> Result<Dataset, PortalError> {
        let status = self.status(id)?;
        if !status.classification.is_expired {
            return Err(PortalError::NotExpired(id.to_string()));
        }
        let mut dataset = Dataset::new(status.dataset.format);
        dataset.data = status.dataset.data;
        dataset.regenerated_from = Some(id.clone());
        self.state.set_my_dataset(Some(dataset.clone()))?;
        Ok(dataset)
    }

    fn explicit_project_samples(
        &self,
        dataset: &Dataset,
    ) -> Result<BTreeMap<ProjectId, Vec<SampleRecord>>, PortalError> {
        let mut samples = BTreeMap::new();
        for (project_id, selection) in &dataset.data {
            if let SingleCellSelection::Samples(ids) = &selection.single_cell {
                if !ids.is_empty() {
                    samples.insert(project_id.clone(), self.client.project_samples(project_id)?);
                }
            }
        }
        Ok(samples)
    }
}
