use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::tempdir;

use portal_dataset::config::ConfigLoader;
use portal_dataset::dataset::{Dataset, ProjectSelection};
use portal_dataset::domain::{Format, Modality, ProjectId};
use portal_dataset::error::PortalError;
use portal_dataset::local_state::{FileKvStore, KeyValueStore, LocalState};

#[test]
fn loads_config_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("portal-dataset.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "api_base_url": "http://localhost:8000/v1/",
            "poll_interval_secs": 2,
            "max_poll_attempts": 5,
            "retention_days": 3,
            "state_dir": "/tmp/portal-state"
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.api_base_url, "http://localhost:8000/v1");
    assert_eq!(resolved.poll_interval, Duration::from_secs(2));
    assert_eq!(resolved.state_dir, Some(Utf8PathBuf::from("/tmp/portal-state")));

    let policy = resolved.poll_policy();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.retention, chrono::Duration::days(3));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PortalError::ConfigRead(_))
    );
}

#[test]
fn unknown_schema_version_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("portal-dataset.json");
    fs::write(&path, r#"{"schema_version": 2}"#).unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(PortalError::ConfigParse(_))
    );
}

#[test]
fn local_state_survives_reload() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

    let mut dataset = Dataset::new(Format::AnnData);
    dataset.data.insert("P1".into(), ProjectSelection::merged());
    {
        let mut state = LocalState::hydrate(FileKvStore::new_with_root(root.clone())).unwrap();
        state.set_my_dataset(Some(dataset.clone())).unwrap();
        state.set_user_modality(Modality::Spatial).unwrap();
        state.set_terms_accepted(true).unwrap();
    }

    let reloaded = LocalState::hydrate(FileKvStore::new_with_root(root)).unwrap();
    let snapshot = reloaded.snapshot();
    assert_eq!(snapshot.my_dataset.as_ref(), Some(&dataset));
    assert!(snapshot.my_dataset.as_ref().unwrap().data[&ProjectId::from("P1")].single_cell.is_merged());
    assert_eq!(snapshot.user_modality, Some(Modality::Spatial));
    assert!(snapshot.terms_accepted);
    assert_eq!(snapshot.user_format, None);
}

#[test]
fn corrupt_entry_reads_as_missing() {
    let dir = tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let kv = FileKvStore::new_with_root(root);
    kv.set("user_format", &serde_json::json!("NOT_A_FORMAT")).unwrap();

    let state = LocalState::hydrate(kv).unwrap();
    assert_eq!(state.snapshot().user_format, None);
}
