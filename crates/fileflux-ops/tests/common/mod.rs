#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fileflux_backend::MemoryBackend;
use fileflux_core::{
    AccessObserver, ChangeObserver, EngineConfig, LogicalPath, ObserverSet, UpdateObserver,
};
use fileflux_ops::{BackendRegistry, MemoryQuota, OperationRunner};

/// One observed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StartUpdate(String),
    EndUpdate(String),
    Access(String),
    CreateFile(String),
    CreateFileFrom(String, String),
    RemoveFile(String),
    ModifyFile(String),
    CreateDirectory(String),
    RemoveDirectory(String),
}

impl Event {
    pub fn is_change(&self) -> bool {
        !matches!(
            self,
            Event::StartUpdate(_) | Event::EndUpdate(_) | Event::Access(_)
        )
    }
}

/// Records every notification it receives.
#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn changes(&self) -> Vec<Event> {
        self.events().into_iter().filter(Event::is_change).collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl UpdateObserver for Recorder {
    fn on_start_update(&self, path: &LogicalPath) {
        self.push(Event::StartUpdate(path.to_string()));
    }

    fn on_end_update(&self, path: &LogicalPath) {
        self.push(Event::EndUpdate(path.to_string()));
    }
}

impl AccessObserver for Recorder {
    fn on_access(&self, path: &LogicalPath) {
        self.push(Event::Access(path.to_string()));
    }
}

impl ChangeObserver for Recorder {
    fn on_create_file(&self, path: &LogicalPath) {
        self.push(Event::CreateFile(path.to_string()));
    }

    fn on_create_file_from(&self, path: &LogicalPath, src: &LogicalPath) {
        self.push(Event::CreateFileFrom(path.to_string(), src.to_string()));
    }

    fn on_remove_file(&self, path: &LogicalPath) {
        self.push(Event::RemoveFile(path.to_string()));
    }

    fn on_modify_file(&self, path: &LogicalPath) {
        self.push(Event::ModifyFile(path.to_string()));
    }

    fn on_create_directory(&self, path: &LogicalPath) {
        self.push(Event::CreateDirectory(path.to_string()));
    }

    fn on_remove_directory(&self, path: &LogicalPath) {
        self.push(Event::RemoveDirectory(path.to_string()));
    }
}

/// A runner over two memory scopes, `temp` and `persistent`.
pub struct Harness {
    pub runner: OperationRunner,
    pub temp: Arc<MemoryBackend>,
    pub persistent: Arc<MemoryBackend>,
    pub quota: Arc<MemoryQuota>,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_backends(MemoryBackend::new(), MemoryBackend::new())
    }

    pub fn with_backends(temp: MemoryBackend, persistent: MemoryBackend) -> Self {
        Self::with_config(temp, persistent, EngineConfig::default())
    }

    pub fn with_config(temp: MemoryBackend, persistent: MemoryBackend, config: EngineConfig) -> Self {
        let temp = Arc::new(temp);
        let persistent = Arc::new(persistent);
        let quota = Arc::new(MemoryQuota::unlimited());
        let recorder = Arc::new(Recorder::default());

        let registry = BackendRegistry::new()
            .with_backend("temp", temp.clone())
            .with_backend("persistent", persistent.clone());
        let observers = ObserverSet::new()
            .with_update_observer(recorder.clone())
            .with_access_observer(recorder.clone())
            .with_change_observer(recorder.clone());
        let runner = OperationRunner::new(registry, quota.clone(), observers, config);

        Self {
            runner,
            temp,
            persistent,
            quota,
            recorder,
        }
    }
}

pub fn temp(path: &str) -> LogicalPath {
    LogicalPath::new("temp", path)
}

pub fn persistent(path: &str) -> LogicalPath {
    LogicalPath::new("persistent", path)
}

/// Assert every start-update has a matching end-update.
pub fn assert_balanced_updates(events: &[Event]) {
    let mut open: Vec<String> = Vec::new();
    for event in events {
        match event {
            Event::StartUpdate(path) => open.push(path.clone()),
            Event::EndUpdate(path) => {
                let idx = open
                    .iter()
                    .position(|p| p == path)
                    .unwrap_or_else(|| panic!("end-update without start for {path}"));
                open.remove(idx);
            }
            _ => {}
        }
    }
    assert!(open.is_empty(), "unbalanced updates: {open:?}");
}
