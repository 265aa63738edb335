//! Shared fakes for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use lifesync_core::{
    open_db_in_memory, share, AppData, BackendKind, BackendRegistry, Clock, GitHubConfig,
    LocalStore, RemoteBackend, SettingsStore, SharedClock, SharedStateRepository,
    SqliteStateRepository, SyncError, SyncOptions, SyncOrchestrator, SyncResult, Timestamp,
    WriteOutcome,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// Whole-snapshot remote with optimistic writes, counters and a gate that
/// can hold a sync round inside the backend.
pub struct MemoryBackend {
    kind: BackendKind,
    stored: Mutex<Option<AppData>>,
    timestamp_reads: AtomicUsize,
    snapshot_reads: AtomicUsize,
    write_attempts: AtomicUsize,
    writes: AtomicUsize,
    fail_with: Mutex<Option<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    pub entered: Notify,
}

impl MemoryBackend {
    pub fn new(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            stored: Mutex::new(None),
            timestamp_reads: AtomicUsize::new(0),
            snapshot_reads: AtomicUsize::new(0),
            write_attempts: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
            gate: Mutex::new(None),
            entered: Notify::new(),
        })
    }

    pub fn github() -> Arc<Self> {
        Self::new(BackendKind::GitHub)
    }

    pub fn stored(&self) -> Option<AppData> {
        self.stored.lock().clone()
    }

    /// Overwrites the remote as if another client had written it.
    pub fn seed(&self, data: AppData) {
        *self.stored.lock() = Some(data);
    }

    pub fn timestamp_reads(&self) -> usize {
        self.timestamp_reads.load(Ordering::SeqCst)
    }

    pub fn snapshot_reads(&self) -> usize {
        self.snapshot_reads.load(Ordering::SeqCst)
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every call fails with a network error until cleared.
    pub fn fail_with(&self, message: Option<&str>) {
        *self.fail_with.lock() = message.map(str::to_string);
    }

    /// Holds the next timestamp read until the returned handle is notified.
    /// `entered` fires once the round reached the gate.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    fn check_failure(&self) -> SyncResult<()> {
        match self.fail_with.lock().clone() {
            Some(message) => Err(SyncError::Network(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn read_remote_timestamp(
        &self,
        _local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<Timestamp>> {
        self.timestamp_reads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        self.check_failure()?;
        Ok(self.stored.lock().as_ref().and_then(|data| data.last_synced))
    }

    async fn read_remote_snapshot(
        &self,
        _local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<AppData>> {
        self.snapshot_reads.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(self.stored())
    }

    async fn write_remote_snapshot(
        &self,
        snapshot: &AppData,
        expected: Option<Timestamp>,
    ) -> SyncResult<WriteOutcome> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let mut stored = self.stored.lock();
        if let Some(current) = stored.as_ref() {
            if current.last_synced != expected {
                return Ok(WriteOutcome::Conflict);
            }
        }
        let remote_timestamp = snapshot
            .last_synced
            .ok_or_else(|| SyncError::Validation("snapshot without lastSynced".to_string()))?;
        *stored = Some(snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(WriteOutcome::Written { remote_timestamp })
    }

    async fn force_write_remote_snapshot(&self, snapshot: &AppData) -> SyncResult<Timestamp> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let remote_timestamp = snapshot
            .last_synced
            .ok_or_else(|| SyncError::Validation("snapshot without lastSynced".to_string()))?;
        *self.stored.lock() = Some(snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(remote_timestamp)
    }
}

pub fn memory_repo() -> SharedStateRepository {
    let conn = open_db_in_memory().expect("in-memory db should open");
    share(SqliteStateRepository::try_new(conn).expect("migrated connection"))
}

pub fn open_store(repo: SharedStateRepository, clock: SharedClock) -> Arc<LocalStore> {
    Arc::new(LocalStore::open(repo, clock).expect("store should open"))
}

/// One simulated device: its own database, store and orchestrator.
pub struct Device {
    pub store: Arc<LocalStore>,
    pub settings: SettingsStore,
    pub orchestrator: SyncOrchestrator,
}

/// Device with `backend` registered and GitHub configured, so detection
/// selects the fake.
pub fn device(backend: Arc<MemoryBackend>, clock: SharedClock) -> Device {
    let device = unconfigured_device(vec![backend], clock);
    device
        .orchestrator
        .save_github_config(&GitHubConfig::new("token", "me", "life-data"))
        .expect("config should save");
    device
}

pub fn unconfigured_device(backends: Vec<Arc<MemoryBackend>>, clock: SharedClock) -> Device {
    let repo = memory_repo();
    let store = open_store(repo.clone(), clock.clone());
    let settings = SettingsStore::new(repo);
    let mut registry = BackendRegistry::new();
    for backend in backends {
        registry.register(backend).expect("backend should register");
    }
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        settings.clone(),
        registry,
        clock,
        SyncOptions::default(),
    );
    orchestrator.detect_backend().expect("detection should succeed");
    Device {
        store,
        settings,
        orchestrator,
    }
}
