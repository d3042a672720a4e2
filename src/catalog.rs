use std::collections::{BTreeSet, HashMap};

use tracing::error;

use crate::domain::{ComputedFileDescriptor, DescriptorKey, FileScope, Format, Modality};
use crate::error::PortalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogField {
    Modality,
    Format,
    IncludesMerged,
    IncludesMultiplexed,
    MetadataOnly,
}

/// A single value of a discriminating field. Ordering is the canonical
/// presentation order; `None` modality/format sorts after every concrete value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
    Modality(NullLast<Modality>),
    Format(NullLast<Format>),
    Flag(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NullLast<T> {
    Value(T),
    Null,
}

impl<T: Copy> NullLast<T> {
    pub fn get(self) -> Option<T> {
        match self {
            NullLast::Value(value) => Some(value),
            NullLast::Null => None,
        }
    }
}

impl<T> From<Option<T>> for NullLast<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => NullLast::Value(value),
            None => NullLast::Null,
        }
    }
}

/// Partial-tuple filter; `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub modality: Option<Option<Modality>>,
    pub format: Option<Option<Format>>,
    pub includes_merged: Option<bool>,
    pub includes_multiplexed: Option<bool>,
    pub metadata_only: Option<bool>,
}

impl Constraints {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn modality(mut self, modality: Option<Modality>) -> Self {
        self.modality = Some(modality);
        self
    }

    pub fn format(mut self, format: Option<Format>) -> Self {
        self.format = Some(format);
        self
    }

    pub fn includes_merged(mut self, value: bool) -> Self {
        self.includes_merged = Some(value);
        self
    }

    pub fn includes_multiplexed(mut self, value: bool) -> Self {
        self.includes_multiplexed = Some(value);
        self
    }

    fn matches(&self, key: &DescriptorKey) -> bool {
        self.modality.is_none_or(|m| m == key.modality)
            && self.format.is_none_or(|f| f == key.format)
            && self.includes_merged.is_none_or(|v| v == key.includes_merged)
            && self
                .includes_multiplexed
                .is_none_or(|v| v == key.includes_multiplexed)
            && self.metadata_only.is_none_or(|v| v == key.metadata_only)
    }
}

/// Lookup structure over one catalog of computed files.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    files: Vec<ComputedFileDescriptor>,
    keys: Vec<DescriptorKey>,
    by_key: HashMap<DescriptorKey, Vec<usize>>,
}

impl CatalogIndex {
    pub fn new(files: Vec<ComputedFileDescriptor>) -> Self {
        let keys = files.iter().map(ComputedFileDescriptor::key).collect::<Vec<_>>();
        let mut by_key = HashMap::<DescriptorKey, Vec<usize>>::new();
        for (index, key) in keys.iter().enumerate() {
            by_key.entry(*key).or_default().push(index);
        }
        Self {
            files,
            keys,
            by_key,
        }
    }

    /// Index only the files belonging to `scope`.
    pub fn for_scope(files: &[ComputedFileDescriptor], scope: &FileScope) -> Self {
        Self::new(
            files
                .iter()
                .filter(|file| &file.scope == scope)
                .cloned()
                .collect(),
        )
    }

    pub fn files(&self) -> &[ComputedFileDescriptor] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn options_for(&self, field: CatalogField, constraints: &Constraints) -> Vec<FieldValue> {
        self.keys
            .iter()
            .filter(|key| constraints.matches(key))
            .map(|key| match field {
                CatalogField::Modality => FieldValue::Modality(key.modality.into()),
                CatalogField::Format => FieldValue::Format(key.format.into()),
                CatalogField::IncludesMerged => FieldValue::Flag(key.includes_merged),
                CatalogField::IncludesMultiplexed => FieldValue::Flag(key.includes_multiplexed),
                CatalogField::MetadataOnly => FieldValue::Flag(key.metadata_only),
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Concrete modalities offered under `constraints`.
    pub fn modalities(&self, constraints: &Constraints) -> Vec<Modality> {
        self.options_for(CatalogField::Modality, constraints)
            .into_iter()
            .filter_map(|value| match value {
                FieldValue::Modality(value) => value.get(),
                _ => None,
            })
            .collect()
    }

    pub fn formats(&self, constraints: &Constraints) -> Vec<Format> {
        self.options_for(CatalogField::Format, constraints)
            .into_iter()
            .filter_map(|value| match value {
                FieldValue::Format(value) => value.get(),
                _ => None,
            })
            .collect()
    }

    pub fn flags(&self, field: CatalogField, constraints: &Constraints) -> Vec<bool> {
        self.options_for(field, constraints)
            .into_iter()
            .filter_map(|value| match value {
                FieldValue::Flag(flag) => Some(flag),
                _ => None,
            })
            .collect()
    }

    pub fn find(&self, key: &DescriptorKey) -> Result<Option<&ComputedFileDescriptor>, PortalError> {
        match self.by_key.get(key).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([index]) => Ok(Some(&self.files[*index])),
            Some(matches) => {
                error!(tuple = %key, count = matches.len(), "catalog has duplicate computed files");
                Err(PortalError::AmbiguousCatalogEntry {
                    tuple: key.to_string(),
                    count: matches.len(),
                })
            }
        }
    }

    /// Every discriminating tuple that appears more than once.
    pub fn duplicate_keys(&self) -> Vec<DescriptorKey> {
        self.by_key
            .iter()
            .filter(|(_, indices)| indices.len() > 1)
            .map(|(key, _)| *key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::FileLocator;

    fn file(
        id: u64,
        modality: Modality,
        format: Format,
        merged: bool,
        multiplexed: bool,
    ) -> ComputedFileDescriptor {
        ComputedFileDescriptor {
            modality: Some(modality),
            format: Some(format),
            includes_merged: merged,
            includes_multiplexed: multiplexed,
            metadata_only: false,
            scope: FileScope::default(),
            size_in_bytes: 10,
            locator: FileLocator::Numeric(id),
        }
    }

    #[test]
    fn options_follow_canonical_order() {
        let index = CatalogIndex::new(vec![
            file(1, Modality::Spatial, Format::SingleCellExperiment, false, false),
            file(2, Modality::SingleCell, Format::AnnData, false, false),
            file(3, Modality::SingleCell, Format::SingleCellExperiment, false, true),
        ]);
        assert_eq!(
            index.modalities(&Constraints::any()),
            vec![Modality::SingleCell, Modality::Spatial]
        );
        assert_eq!(
            index.formats(&Constraints::any().modality(Some(Modality::SingleCell))),
            vec![Format::SingleCellExperiment, Format::AnnData]
        );
    }

    #[test]
    fn empty_result_is_empty_sequence() {
        let index = CatalogIndex::new(Vec::new());
        assert!(index
            .options_for(CatalogField::Format, &Constraints::any().modality(Some(Modality::Spatial)))
            .is_empty());
    }

    #[test]
    fn null_modality_sorts_last() {
        let mut metadata = file(9, Modality::SingleCell, Format::Metadata, false, false);
        metadata.modality = None;
        let index = CatalogIndex::new(vec![
            metadata,
            file(1, Modality::Spatial, Format::SingleCellExperiment, false, false),
        ]);
        assert_eq!(
            index.options_for(CatalogField::Modality, &Constraints::any()),
            vec![
                FieldValue::Modality(NullLast::Value(Modality::Spatial)),
                FieldValue::Modality(NullLast::Null),
            ]
        );
    }

    #[test]
    fn find_reports_duplicates() {
        let index = CatalogIndex::new(vec![
            file(1, Modality::SingleCell, Format::AnnData, false, false),
            file(2, Modality::SingleCell, Format::AnnData, false, false),
        ]);
        let key = index.files()[0].key();
        assert_matches!(
            index.find(&key),
            Err(PortalError::AmbiguousCatalogEntry { count: 2, .. })
        );
        assert_eq!(index.duplicate_keys(), vec![key]);
    }

    #[test]
    fn for_scope_filters_other_projects() {
        let mut other = file(2, Modality::SingleCell, Format::AnnData, false, false);
        other.scope.project_id = Some("SCPCP000002".into());
        let files = vec![
            file(1, Modality::SingleCell, Format::AnnData, false, false),
            other,
        ];
        let index = CatalogIndex::for_scope(&files, &FileScope::default());
        let key = files[0].key();
        assert_eq!(index.find(&key).unwrap().map(|f| f.locator.clone()), Some(FileLocator::Numeric(1)));
    }
}
