//! Sync orchestration: backend selection, debounce and single-flight runs.
//!
//! # Responsibility
//! - Pick the active backend from persisted configuration.
//! - Turn bursts of local changes into one debounced sync.
//! - Run at most one sync round at a time and report every outcome.
//! - Hand version conflicts to the resolver and keep them open until a
//!   human decides.
//!
//! # Invariants
//! - `sync_now()` never returns an error and never panics.
//! - Resetting the debounce timer never cancels a sync already running.
//! - Nothing syncs while a conflict is open.

use crate::clock::SharedClock;
use crate::model::record::Timestamp;
use crate::repo::state_repo::SyncRunRecord;
use crate::service::local_store::{LocalStore, StoreEvent};
use crate::service::settings_store::SettingsStore;
use crate::sync::algorithm::{run_sync, SyncAction};
use crate::sync::backend::RemoteBackend;
use crate::sync::backend_registry::BackendRegistry;
use crate::sync::cloudflare::CloudflareBackend;
use crate::sync::config::{
    BackendKind, BackendSettings, CloudflareConfig, GitHubConfig, SyncOptions,
};
use crate::sync::conflict::{ConflictChoice, ConflictInfo, ConflictResolver, Resolution};
use crate::sync::error::{SyncError, SyncResult};
use crate::sync::github::GitHubBackend;
use crate::sync::outcome::{SyncEvent, SyncOutcome, SyncReport};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// App lifecycle moments that should flush pending changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    PageHidden,
    BeforeUnload,
}

/// Point-in-time copy of the orchestrator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub backend: BackendKind,
    pub syncing: bool,
    pub last_synced_at: Option<Timestamp>,
    pub pending_changes: bool,
    pub error: Option<String>,
    pub conflict_open: bool,
    pub last_report: Option<SyncReport>,
}

#[derive(Debug, Default)]
struct State {
    backend: BackendKind,
    last_synced_at: Option<Timestamp>,
    pending_changes: bool,
    error: Option<String>,
    last_report: Option<SyncReport>,
}

struct Inner {
    store: Arc<LocalStore>,
    settings: SettingsStore,
    registry: RwLock<BackendRegistry>,
    /// Kinds whose registered backend was built here from configuration.
    auto_built: Mutex<HashSet<BackendKind>>,
    clock: SharedClock,
    options: SyncOptions,
    resolver: ConflictResolver,
    events: broadcast::Sender<SyncEvent>,
    state: Mutex<State>,
    in_flight: AtomicBool,
    change_seq: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Releases the single-flight flag when dropped.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Shared sync context. Clones share all state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Builds the context. No backend is active until `detect_backend()`.
    pub fn new(
        store: Arc<LocalStore>,
        settings: SettingsStore,
        registry: BackendRegistry,
        clock: SharedClock,
        options: SyncOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                settings,
                registry: RwLock::new(registry),
                auto_built: Mutex::new(HashSet::new()),
                clock,
                options,
                resolver: ConflictResolver::new(events.clone()),
                events,
                state: Mutex::new(State::default()),
                in_flight: AtomicBool::new(false),
                change_seq: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.state.lock().backend
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.inner.state.lock();
        SyncStatus {
            backend: state.backend,
            syncing: self.inner.in_flight.load(Ordering::Acquire),
            last_synced_at: state.last_synced_at,
            pending_changes: state.pending_changes,
            error: state.error.clone(),
            conflict_open: self.inner.resolver.is_open(),
            last_report: state.last_report.clone(),
        }
    }

    /// Loads backend configuration and selects the matching backend.
    ///
    /// Backends already registered for the detected kind are reused; a
    /// missing one is built from configuration over HTTP.
    pub fn detect_backend(&self) -> SyncResult<BackendKind> {
        let settings = self.inner.settings.load()?;
        let kind = settings.detect();

        {
            let mut registry = self.inner.registry.write();
            if kind == BackendKind::None {
                registry.clear_active();
            } else {
                if registry.get(kind).is_none() {
                    let backend = self.build_backend(kind, &settings)?;
                    registry
                        .replace(backend)
                        .map_err(|err| SyncError::Configuration(err.to_string()))?;
                    self.inner.auto_built.lock().insert(kind);
                }
                registry
                    .select_active(kind)
                    .map_err(|err| SyncError::Configuration(err.to_string()))?;
            }
        }

        self.inner.state.lock().backend = kind;
        info!("event=backend_detect module=sync status=ok backend={kind}");
        Ok(kind)
    }

    pub fn save_github_config(&self, config: &GitHubConfig) -> SyncResult<BackendKind> {
        self.inner.settings.save_github(config)?;
        self.drop_auto_built();
        self.detect_backend()
    }

    pub fn save_cloudflare_config(&self, config: &CloudflareConfig) -> SyncResult<BackendKind> {
        self.inner.settings.save_cloudflare(config)?;
        self.drop_auto_built();
        self.detect_backend()
    }

    pub fn clear_config(&self) -> SyncResult<BackendKind> {
        self.inner.settings.clear()?;
        self.drop_auto_built();
        self.detect_backend()
    }

    /// Records a local change and (re)starts the debounce timer.
    pub fn mark_changed(&self) {
        if self.backend_kind() == BackendKind::None {
            return;
        }
        self.inner.change_seq.fetch_add(1, Ordering::AcqRel);
        self.inner.state.lock().pending_changes = true;
        self.schedule();
    }

    /// Runs one sync round now and reports what happened.
    pub async fn sync_now(&self) -> SyncReport {
        let inner = &self.inner;
        let backend = inner.registry.read().active_backend();
        let Some(backend) = backend else {
            return SyncReport::new(SyncOutcome::Skipped, "no backend configured");
        };
        let Some(guard) = InFlightGuard::acquire(&inner.in_flight) else {
            return SyncReport::new(SyncOutcome::Skipped, "a sync is already in progress");
        };
        if inner.resolver.is_open() {
            return SyncReport::new(
                SyncOutcome::Conflict,
                "a conflict is awaiting resolution",
            );
        }

        let seq_at_start = inner.change_seq.load(Ordering::Acquire);
        let started = Instant::now();
        let _ = inner.events.send(SyncEvent::Started);

        let result = run_sync(&inner.store, backend.as_ref(), inner.clock.as_ref()).await;
        let (report, retry) = self.apply_result(result, seq_at_start);

        self.record_run(backend.kind(), &report);
        let status = if report.outcome == SyncOutcome::Error {
            "error"
        } else {
            "ok"
        };
        info!(
            "event=sync_run module=sync status={status} backend={} outcome={} duration_ms={}",
            backend.kind(),
            report.outcome,
            started.elapsed().as_millis()
        );
        drop(guard);

        let _ = inner.events.send(SyncEvent::Finished(report.clone()));
        if retry {
            self.schedule();
        }
        report
    }

    /// Flushes pending changes in the background when the app goes away.
    ///
    /// Returns whether a sync was started.
    pub fn on_lifecycle(&self, event: LifecycleEvent) -> bool {
        let pending = self.inner.state.lock().pending_changes;
        if !pending
            || self.inner.in_flight.load(Ordering::Acquire)
            || self.backend_kind() == BackendKind::None
        {
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!("event=sync_flush module=sync status=skipped reason=no_runtime");
            return false;
        };

        self.cancel_timer();
        let orchestrator = self.clone();
        handle.spawn(async move {
            orchestrator.sync_now().await;
        });
        info!("event=sync_flush module=sync status=started trigger={event:?}");
        true
    }

    /// Awaits a final sync of pending changes, for orderly shutdown.
    ///
    /// Returns `None` when there was nothing to flush.
    pub async fn flush(&self) -> Option<SyncReport> {
        if !self.inner.state.lock().pending_changes {
            return None;
        }
        self.cancel_timer();
        Some(self.sync_now().await)
    }

    /// Forwards user edits from the store into `mark_changed()`.
    ///
    /// Returns `None` outside a Tokio runtime.
    pub fn attach_store(
        &self,
        mut events: broadcast::Receiver<StoreEvent>,
    ) -> Option<JoinHandle<()>> {
        let handle = Handle::try_current().ok()?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Some(handle.spawn(async move {
            loop {
                let signal = match events.recv().await {
                    Ok(StoreEvent::Changed { .. }) => true,
                    Ok(StoreEvent::Replaced) => false,
                    // Missed signals still mean something changed.
                    Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !signal {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncOrchestrator { inner }.mark_changed();
            }
        }))
    }

    pub fn pending_conflict(&self) -> Option<ConflictInfo> {
        self.inner.resolver.pending()
    }

    /// Applies the user's choice to the open conflict.
    ///
    /// # Errors
    /// - `SyncInFlight` while a sync round is running.
    /// - `NoOpenConflict` when nothing awaits resolution.
    /// - Backend and store failures; the conflict stays open.
    pub async fn resolve_conflict(&self, choice: ConflictChoice) -> SyncResult<Resolution> {
        let inner = &self.inner;
        let _guard = InFlightGuard::acquire(&inner.in_flight).ok_or(SyncError::SyncInFlight)?;
        let backend = inner.registry.read().active_backend();
        let resolution = inner
            .resolver
            .resolve(
                choice,
                &inner.store,
                backend.as_deref(),
                inner.clock.as_ref(),
            )
            .await?;

        if resolution != Resolution::Cancelled {
            let mut state = inner.state.lock();
            state.last_synced_at = Some(inner.clock.now());
            state.pending_changes = false;
            state.error = None;
        }
        Ok(resolution)
    }

    pub fn recent_runs(&self, limit: u32) -> SyncResult<Vec<SyncRunRecord>> {
        Ok(self.inner.settings.recent_sync_runs(limit)?)
    }

    /// Maps one algorithm result onto state and a report. The flag tells
    /// whether another debounced round should be armed.
    fn apply_result(
        &self,
        result: SyncResult<SyncAction>,
        seq_at_start: u64,
    ) -> (SyncReport, bool) {
        let inner = &self.inner;
        let edited_during_flight = inner.change_seq.load(Ordering::Acquire) != seq_at_start;
        let mut state = inner.state.lock();

        let (report, retry) = match result {
            Ok(SyncAction::Conflict(conflict)) => {
                inner.resolver.open(*conflict);
                state.error = None;
                state.pending_changes = edited_during_flight;
                (
                    SyncReport::new(
                        SyncOutcome::Conflict,
                        "remote changed since last sync; choose local or remote",
                    ),
                    false,
                )
            }
            Ok(SyncAction::Deferred(message)) => {
                state.pending_changes = true;
                (SyncReport::new(SyncOutcome::Skipped, message), true)
            }
            Ok(SyncAction::Pulled) => settle(
                &mut state,
                inner.clock.now(),
                edited_during_flight,
                SyncReport::new(SyncOutcome::Pulled, "pulled remote changes"),
            ),
            Ok(SyncAction::Pushed) => settle(
                &mut state,
                inner.clock.now(),
                edited_during_flight,
                SyncReport::new(SyncOutcome::Pushed, "pushed local changes"),
            ),
            Ok(SyncAction::UpToDate) => settle(
                &mut state,
                inner.clock.now(),
                edited_during_flight,
                SyncReport::new(SyncOutcome::UpToDate, "already up to date"),
            ),
            Err(SyncError::Configuration(message)) => {
                state.error = Some(message.clone());
                (SyncReport::new(SyncOutcome::Skipped, message), false)
            }
            Err(err) => {
                let message = err.to_string();
                warn!("event=sync_run module=sync status=error error={message}");
                state.error = Some(message.clone());
                state.pending_changes = true;
                (SyncReport::new(SyncOutcome::Error, message), false)
            }
        };

        state.last_report = Some(report.clone());
        (report, retry)
    }

    fn record_run(&self, backend: BackendKind, report: &SyncReport) {
        let run = SyncRunRecord {
            backend: backend.as_str().to_string(),
            outcome: report.outcome.as_str().to_string(),
            message: report.message.clone(),
            finished_at: self.inner.clock.now(),
        };
        if let Err(err) = self.inner.settings.record_sync_run(&run) {
            warn!("event=sync_history module=sync status=error error={err}");
        }
    }

    /// (Re)arms the debounce timer. The timer only spawns the sync; it
    /// never runs it, so a later reset cannot abort a round in progress.
    fn schedule(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!("event=sync_schedule module=sync status=skipped reason=no_runtime");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let debounce = self.inner.options.debounce;
        let timer = handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let orchestrator = SyncOrchestrator { inner };
            tokio::spawn(async move {
                orchestrator.sync_now().await;
            });
        });
        if let Some(previous) = self.inner.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
    }

    fn drop_auto_built(&self) {
        let kinds: Vec<BackendKind> = self.inner.auto_built.lock().drain().collect();
        let mut registry = self.inner.registry.write();
        for kind in kinds {
            registry.remove(kind);
        }
    }

    fn build_backend(
        &self,
        kind: BackendKind,
        settings: &BackendSettings,
    ) -> SyncResult<Arc<dyn RemoteBackend>> {
        let inner = &self.inner;
        match kind {
            BackendKind::GitHub => {
                let config = settings.github.clone().ok_or_else(|| {
                    SyncError::Configuration("GitHub is not configured".to_string())
                })?;
                let backend = GitHubBackend::from_config(config, &inner.options, inner.clock.clone())?
                    .with_settings(inner.settings.clone());
                Ok(Arc::new(backend))
            }
            BackendKind::Cloudflare => {
                let config = settings.cloudflare.as_ref().ok_or_else(|| {
                    SyncError::Configuration("Cloudflare is not configured".to_string())
                })?;
                Ok(Arc::new(CloudflareBackend::from_config(
                    config,
                    &inner.options,
                )?))
            }
            BackendKind::None => Err(SyncError::Configuration(
                "no backend configured".to_string(),
            )),
        }
    }
}

/// Successful round: the watermark moved or was confirmed. Edits that
/// landed mid-flight keep `pending_changes` set and re-arm the timer.
fn settle(
    state: &mut State,
    now: Timestamp,
    edited_during_flight: bool,
    report: SyncReport,
) -> (SyncReport, bool) {
    state.last_synced_at = Some(now);
    state.error = None;
    state.pending_changes = edited_during_flight;
    (report, edited_during_flight)
}
