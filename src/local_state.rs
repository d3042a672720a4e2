use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::Builder;
use tracing::warn;

use crate::dataset::Dataset;
use crate::domain::{Format, Modality};
use crate::error::PortalError;

/// Flat key/value persistence for JSON blobs.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PortalError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), PortalError>;
    fn remove(&self, key: &str) -> Result<(), PortalError>;
}

/// One `<key>.json` file per entry under a state directory.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: Utf8PathBuf,
}

impl FileKvStore {
    pub fn new() -> Result<Self, PortalError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("portal-dataset")).ok()
            })
            .ok_or_else(|| PortalError::Storage("unable to resolve state directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, key: &str) -> Utf8PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PortalError> {
        let path = self.path(key);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        let value =
            serde_json::from_str(&content).map_err(|err| PortalError::Storage(err.to_string()))?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), PortalError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        let content =
            serde_json::to_vec_pretty(value).map_err(|err| PortalError::Storage(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("portal-state")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        temp.persist(self.path(key).as_std_path())
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        let path = self.path(key);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| PortalError::Storage(err.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PortalError> {
        let entries = self
            .entries
            .lock()
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), PortalError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PortalError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|err| PortalError::Storage(err.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    MyDataset,
    UserFormat,
    UserModality,
    Email,
    TermsAccepted,
}

impl StateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StateKey::MyDataset => "my_dataset",
            StateKey::UserFormat => "user_format",
            StateKey::UserModality => "user_modality",
            StateKey::Email => "email",
            StateKey::TermsAccepted => "terms_accepted",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSnapshot {
    pub my_dataset: Option<Dataset>,
    pub user_format: Option<Format>,
    pub user_modality: Option<Modality>,
    pub email: Option<String>,
    pub terms_accepted: bool,
}

type Subscriber = Box<dyn Fn(StateKey, &LocalSnapshot)>;

/// Typed view over the key/value store. Everything is read once at
/// construction; later writes go through here so subscribers see them.
pub struct LocalState<K: KeyValueStore> {
    kv: K,
    snapshot: LocalSnapshot,
    subscribers: Vec<Subscriber>,
}

impl<K: KeyValueStore> LocalState<K> {
    pub fn hydrate(kv: K) -> Result<Self, PortalError> {
        let snapshot = LocalSnapshot {
            my_dataset: read(&kv, StateKey::MyDataset)?,
            user_format: read(&kv, StateKey::UserFormat)?,
            user_modality: read(&kv, StateKey::UserModality)?,
            email: read(&kv, StateKey::Email)?,
            terms_accepted: read(&kv, StateKey::TermsAccepted)?.unwrap_or(false),
        };
        Ok(Self {
            kv,
            snapshot,
            subscribers: Vec::new(),
        })
    }

    pub fn snapshot(&self) -> &LocalSnapshot {
        &self.snapshot
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(StateKey, &LocalSnapshot) + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn set_my_dataset(&mut self, dataset: Option<Dataset>) -> Result<(), PortalError> {
        write(&self.kv, StateKey::MyDataset, dataset.as_ref())?;
        self.snapshot.my_dataset = dataset;
        self.notify(StateKey::MyDataset);
        Ok(())
    }

    pub fn set_user_format(&mut self, format: Format) -> Result<(), PortalError> {
        write(&self.kv, StateKey::UserFormat, Some(&format))?;
        self.snapshot.user_format = Some(format);
        self.notify(StateKey::UserFormat);
        Ok(())
    }

    pub fn set_user_modality(&mut self, modality: Modality) -> Result<(), PortalError> {
        write(&self.kv, StateKey::UserModality, Some(&modality))?;
        self.snapshot.user_modality = Some(modality);
        self.notify(StateKey::UserModality);
        Ok(())
    }

    pub fn set_email(&mut self, email: Option<String>) -> Result<(), PortalError> {
        write(&self.kv, StateKey::Email, email.as_ref())?;
        self.snapshot.email = email;
        self.notify(StateKey::Email);
        Ok(())
    }

    pub fn set_terms_accepted(&mut self, accepted: bool) -> Result<(), PortalError> {
        write(&self.kv, StateKey::TermsAccepted, Some(&accepted))?;
        self.snapshot.terms_accepted = accepted;
        self.notify(StateKey::TermsAccepted);
        Ok(())
    }

    fn notify(&self, key: StateKey) {
        for subscriber in &self.subscribers {
            subscriber(key, &self.snapshot);
        }
    }
}

fn read<K: KeyValueStore, T: DeserializeOwned>(kv: &K, key: StateKey) -> Result<Option<T>, PortalError> {
    let Some(value) = kv.get(key.as_str())? else {
        return Ok(None);
    };
    match serde_json::from_value(value) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(err) => {
            warn!(key = key.as_str(), error = %err, "discarding unreadable local state");
            Ok(None)
        }
    }
}

fn write<K: KeyValueStore, T: Serialize>(
    kv: &K,
    key: StateKey,
    value: Option<&T>,
) -> Result<(), PortalError> {
    match value {
        Some(value) => {
            let json =
                serde_json::to_value(value).map_err(|err| PortalError::Storage(err.to_string()))?;
            kv.set(key.as_str(), &json)
        }
        None => kv.remove(key.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn hydrate_reads_existing_values() {
        let kv = MemoryKvStore::default();
        kv.set("user_format", &Value::from("ANN_DATA")).unwrap();
        kv.set("terms_accepted", &Value::from(true)).unwrap();
        let state = LocalState::hydrate(kv).unwrap();
        assert_eq!(state.snapshot().user_format, Some(Format::AnnData));
        assert!(state.snapshot().terms_accepted);
        assert!(state.snapshot().my_dataset.is_none());
    }

    #[test]
    fn corrupt_value_is_treated_as_missing() {
        let kv = MemoryKvStore::default();
        kv.set("user_modality", &Value::from("BULK")).unwrap();
        let state = LocalState::hydrate(kv).unwrap();
        assert_eq!(state.snapshot().user_modality, None);
    }

    #[test]
    fn subscribers_see_writes() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut state = LocalState::hydrate(MemoryKvStore::default()).unwrap();
        let sink = Rc::clone(&seen);
        state.subscribe(move |key, snapshot| {
            sink.borrow_mut().push((key, snapshot.email.clone()));
        });
        state.set_email(Some("a@b.org".to_string())).unwrap();
        assert_eq!(
            seen.borrow().as_slice(),
            &[(StateKey::Email, Some("a@b.org".to_string()))]
        );
    }

    #[test]
    fn file_store_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("state")).unwrap();
        let kv = FileKvStore::new_with_root(root.clone());
        kv.set("email", &Value::from("x@y.org")).unwrap();
        assert_eq!(kv.get("email").unwrap(), Some(Value::from("x@y.org")));
        kv.remove("email").unwrap();
        assert_eq!(kv.get("email").unwrap(), None);
        assert!(root.as_std_path().exists());
    }
}
