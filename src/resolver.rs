//! Turns a partial download choice into the options to present next and,
//! once complete, the single computed file it names.
//!
//! Fields are derived top-down: modality, format, merge toggle, multiplexed
//! toggle, metadata-only. A change at one level re-derives every level below
//! it before anything is resolved.

use serde::Serialize;
use tracing::debug;

use crate::catalog::{CatalogField, CatalogIndex, Constraints};
use crate::domain::{ComputedFileDescriptor, DescriptorKey, Format, Modality};
use crate::error::PortalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadChoice {
    pub modality: Option<Modality>,
    pub format: Option<Format>,
    pub includes_merged: bool,
    pub excludes_multiplexed: bool,
    pub metadata_only: bool,
}

impl DownloadChoice {
    pub fn key(&self) -> DescriptorKey {
        DescriptorKey {
            modality: self.modality,
            format: self.format,
            includes_merged: self.includes_merged,
            includes_multiplexed: !self.excludes_multiplexed,
            metadata_only: self.metadata_only,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadOptions {
    pub modalities: Vec<Modality>,
    pub formats: Vec<Format>,
    pub merge_available: bool,
    pub multiplexed_available: bool,
}

/// Identifies the choice a remote request was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionSnapshot {
    revision: u64,
    pub key: DescriptorKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Modality,
    Format,
    Toggles,
}

#[derive(Debug, Clone)]
pub struct OptionsResolver {
    catalog: CatalogIndex,
    choice: DownloadChoice,
    options: DownloadOptions,
    revision: u64,
}

impl OptionsResolver {
    pub fn new(catalog: CatalogIndex) -> Self {
        Self::with_preference(catalog, None, None)
    }

    /// Start from a remembered modality/format, falling back to the first
    /// offered value when the preference is not available in this catalog.
    pub fn with_preference(
        catalog: CatalogIndex,
        modality: Option<Modality>,
        format: Option<Format>,
    ) -> Self {
        let mut resolver = Self {
            catalog,
            choice: DownloadChoice {
                modality,
                format,
                includes_merged: false,
                excludes_multiplexed: false,
                metadata_only: false,
            },
            options: DownloadOptions::default(),
            revision: 0,
        };
        resolver.derive_modality(true);
        resolver
    }

    pub fn choice(&self) -> DownloadChoice {
        self.choice
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn catalog(&self) -> &CatalogIndex {
        &self.catalog
    }

    /// Swap in a freshly fetched catalog, keeping choices that are still offered.
    pub fn replace_catalog(&mut self, catalog: CatalogIndex) {
        self.catalog = catalog;
        self.derive_modality(true);
    }

    pub fn set_modality(&mut self, modality: Modality) -> Result<(), PortalError> {
        if !self.options.modalities.contains(&modality) {
            return Err(PortalError::InvalidModality(modality.to_string()));
        }
        self.choice.modality = Some(modality);
        self.derive_modality(false);
        Ok(())
    }

    pub fn set_format(&mut self, format: Format) -> Result<(), PortalError> {
        if !self.options.formats.contains(&format) {
            return Err(PortalError::InvalidFormat(format.to_string()));
        }
        self.choice.format = Some(format);
        self.derive(Level::Format);
        Ok(())
    }

    /// Returns false when the toggle is unavailable and the forced value was kept.
    pub fn set_includes_merged(&mut self, value: bool) -> bool {
        if !self.options.merge_available {
            return self.choice.includes_merged == value;
        }
        self.choice.includes_merged = value;
        self.derive(Level::Toggles);
        true
    }

    pub fn set_excludes_multiplexed(&mut self, value: bool) -> bool {
        if !self.options.multiplexed_available {
            return self.choice.excludes_multiplexed == value;
        }
        self.choice.excludes_multiplexed = value;
        self.derive(Level::Toggles);
        true
    }

    pub fn snapshot(&self) -> SelectionSnapshot {
        SelectionSnapshot {
            revision: self.revision,
            key: self.choice.key(),
        }
    }

    pub fn is_current(&self, snapshot: &SelectionSnapshot) -> bool {
        snapshot.revision == self.revision
    }

    /// Gate for results of requests issued under `snapshot`: they are handed
    /// back only if the choice has not moved on since.
    pub fn accept<T>(&self, snapshot: &SelectionSnapshot, value: T) -> Result<T, PortalError> {
        if self.is_current(snapshot) {
            Ok(value)
        } else {
            debug!(tuple = %snapshot.key, "dropping result for stale download choice");
            Err(PortalError::StaleSelection)
        }
    }

    pub fn resolve(&self) -> Result<&ComputedFileDescriptor, PortalError> {
        let key = self.choice.key();
        match self.catalog.find(&key)? {
            Some(file) => Ok(file),
            None => {
                debug!(tuple = %key, "no computed file matches download choice");
                Err(PortalError::NoMatchingFile(key.to_string()))
            }
        }
    }

    fn derive_modality(&mut self, keep_format: bool) {
        self.options.modalities = self.catalog.modalities(&Constraints::any());
        let offered = &self.options.modalities;
        self.choice.modality = match self.choice.modality {
            Some(current) if offered.contains(&current) => Some(current),
            _ => offered.first().copied(),
        };
        if !keep_format {
            self.choice.format = None;
        }
        self.derive(Level::Format);
    }

    fn derive(&mut self, from: Level) {
        self.revision += 1;
        let modality = self.choice.modality;
        let scoped = Constraints::any().modality(modality);

        if from <= Level::Format {
            self.options.formats = self
                .catalog
                .formats(&scoped)
                .into_iter()
                .filter(|format| modality.is_none_or(|m| format.supports_modality(m)))
                .collect();
            let offered = &self.options.formats;
            self.choice.format = match self.choice.format {
                Some(current) if offered.contains(&current) => Some(current),
                _ => offered.first().copied(),
            };
        }

        let format = self.choice.format;
        let scoped = scoped.format(format);

        let merged = self.catalog.flags(CatalogField::IncludesMerged, &scoped);
        if modality == Some(Modality::Spatial) {
            self.options.merge_available = false;
            self.choice.includes_merged = false;
        } else {
            self.options.merge_available = merged.len() > 1;
            if !self.options.merge_available {
                self.choice.includes_merged = merged.first().copied().unwrap_or(false);
            }
        }

        let multiplexed = self.catalog.flags(CatalogField::IncludesMultiplexed, &scoped);
        let format_allows = format.is_none_or(Format::supports_multiplexed);
        self.options.multiplexed_available = format_allows && multiplexed.len() > 1;
        if !format_allows {
            self.choice.excludes_multiplexed = true;
        } else if let [only] = multiplexed.as_slice() {
            self.choice.excludes_multiplexed = !only;
        } else if from <= Level::Format {
            self.choice.excludes_multiplexed = false;
        }

        let metadata_only = self.catalog.flags(
            CatalogField::MetadataOnly,
            &scoped.includes_merged(self.choice.includes_merged),
        );
        self.choice.metadata_only = match metadata_only.as_slice() {
            [] => self.choice.format == Some(Format::Metadata),
            values => values[0],
        };

        debug!(
            revision = self.revision,
            modality = ?self.choice.modality,
            format = ?self.choice.format,
            merged = self.choice.includes_merged,
            excludes_multiplexed = self.choice.excludes_multiplexed,
            "download choice derived"
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{FileLocator, FileScope};

    fn file(id: u64, modality: Modality, format: Format, merged: bool, multiplexed: bool) -> ComputedFileDescriptor {
        ComputedFileDescriptor {
            modality: Some(modality),
            format: Some(format),
            includes_merged: merged,
            includes_multiplexed: multiplexed,
            metadata_only: false,
            scope: FileScope::default(),
            size_in_bytes: 1,
            locator: FileLocator::Numeric(id),
        }
    }

    #[test]
    fn anndata_forces_multiplexed_exclusion() {
        let catalog = CatalogIndex::new(vec![
            file(1, Modality::SingleCell, Format::SingleCellExperiment, false, true),
            file(2, Modality::SingleCell, Format::AnnData, false, false),
        ]);
        let mut resolver = OptionsResolver::new(catalog);
        resolver.set_modality(Modality::SingleCell).unwrap();
        resolver.set_format(Format::AnnData).unwrap();
        assert!(resolver.choice().excludes_multiplexed);
        assert!(!resolver.choice().key().includes_multiplexed);
        assert_eq!(resolver.resolve().unwrap().locator, FileLocator::Numeric(2));

        resolver.set_format(Format::SingleCellExperiment).unwrap();
        assert!(!resolver.choice().excludes_multiplexed);
        assert_eq!(resolver.resolve().unwrap().locator, FileLocator::Numeric(1));
    }

    #[test]
    fn unavailable_toggle_keeps_forced_value() {
        let catalog = CatalogIndex::new(vec![file(
            1,
            Modality::SingleCell,
            Format::SingleCellExperiment,
            true,
            false,
        )]);
        let mut resolver = OptionsResolver::new(catalog);
        assert!(!resolver.options().merge_available);
        assert!(resolver.choice().includes_merged);
        assert!(!resolver.set_includes_merged(false));
        assert!(resolver.choice().includes_merged);
    }

    #[test]
    fn spatial_never_merges() {
        let catalog = CatalogIndex::new(vec![
            file(1, Modality::Spatial, Format::SingleCellExperiment, true, false),
            file(2, Modality::Spatial, Format::SingleCellExperiment, false, false),
        ]);
        let resolver = OptionsResolver::new(catalog);
        assert_eq!(resolver.choice().modality, Some(Modality::Spatial));
        assert!(!resolver.options().merge_available);
        assert!(!resolver.choice().includes_merged);
        assert_eq!(resolver.resolve().unwrap().locator, FileLocator::Numeric(2));
    }

    #[test]
    fn unmatched_choice_is_no_matching_file() {
        let catalog = CatalogIndex::new(vec![
            file(1, Modality::SingleCell, Format::SingleCellExperiment, false, false),
            file(2, Modality::SingleCell, Format::SingleCellExperiment, true, true),
        ]);
        let mut resolver = OptionsResolver::new(catalog);
        assert!(resolver.options().merge_available);
        assert!(resolver.options().multiplexed_available);
        resolver.set_includes_merged(true);
        resolver.set_excludes_multiplexed(true);
        assert_matches!(resolver.resolve(), Err(PortalError::NoMatchingFile(_)));
    }

    #[test]
    fn unknown_modality_rejected() {
        let catalog = CatalogIndex::new(vec![file(
            1,
            Modality::SingleCell,
            Format::SingleCellExperiment,
            false,
            false,
        )]);
        let mut resolver = OptionsResolver::new(catalog);
        assert_matches!(
            resolver.set_modality(Modality::Spatial),
            Err(PortalError::InvalidModality(_))
        );
    }

    #[test]
    fn snapshot_goes_stale_after_change() {
        let catalog = CatalogIndex::new(vec![
            file(1, Modality::SingleCell, Format::SingleCellExperiment, false, false),
            file(2, Modality::SingleCell, Format::AnnData, false, false),
        ]);
        let mut resolver = OptionsResolver::new(catalog);
        let snapshot = resolver.snapshot();
        assert!(resolver.is_current(&snapshot));
        resolver.set_format(Format::AnnData).unwrap();
        assert!(!resolver.is_current(&snapshot));
        assert_matches!(
            resolver.accept(&snapshot, "late"),
            Err(PortalError::StaleSelection)
        );
        let fresh = resolver.snapshot();
        assert_eq!(resolver.accept(&fresh, "on time").unwrap(), "on time");
    }
}
