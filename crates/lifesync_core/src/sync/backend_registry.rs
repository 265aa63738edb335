//! In-process backend registry and active-backend selection.

use crate::sync::backend::RemoteBackend;
use crate::sync::config::BackendKind;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Backend registration/selection errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRegistryError {
    /// `BackendKind::None` names the absence of a backend.
    InvalidBackendKind,
    DuplicateBackend(BackendKind),
    BackendNotFound(BackendKind),
}

impl Display for BackendRegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBackendKind => write!(f, "backend kind `none` cannot be registered"),
            Self::DuplicateBackend(kind) => write!(f, "backend already registered: {kind}"),
            Self::BackendNotFound(kind) => write!(f, "backend not registered: {kind}"),
        }
    }
}

impl Error for BackendRegistryError {}

/// Runtime registry of remote backends keyed by kind.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendKind, Arc<dyn RemoteBackend>>,
    active: Option<BackendKind>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one backend adapter.
    pub fn register(&mut self, backend: Arc<dyn RemoteBackend>) -> Result<(), BackendRegistryError> {
        let kind = backend.kind();
        if kind == BackendKind::None {
            return Err(BackendRegistryError::InvalidBackendKind);
        }
        if self.backends.contains_key(&kind) {
            return Err(BackendRegistryError::DuplicateBackend(kind));
        }
        self.backends.insert(kind, backend);
        Ok(())
    }

    /// Registers `backend`, dropping any adapter of the same kind.
    pub fn replace(&mut self, backend: Arc<dyn RemoteBackend>) -> Result<(), BackendRegistryError> {
        let kind = backend.kind();
        if kind == BackendKind::None {
            return Err(BackendRegistryError::InvalidBackendKind);
        }
        self.backends.insert(kind, backend);
        Ok(())
    }

    /// Unregisters one kind, clearing the selection if it was active.
    pub fn remove(&mut self, kind: BackendKind) -> Option<Arc<dyn RemoteBackend>> {
        if self.active == Some(kind) {
            self.active = None;
        }
        self.backends.remove(&kind)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Returns registered kinds in stable order.
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }

    /// Selects one active backend.
    pub fn select_active(&mut self, kind: BackendKind) -> Result<(), BackendRegistryError> {
        if !self.backends.contains_key(&kind) {
            return Err(BackendRegistryError::BackendNotFound(kind));
        }
        self.active = Some(kind);
        Ok(())
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// Active kind, `BackendKind::None` when nothing is selected.
    pub fn active_kind(&self) -> BackendKind {
        self.active.unwrap_or(BackendKind::None)
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn RemoteBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Returns the active backend handle.
    pub fn active_backend(&self) -> Option<Arc<dyn RemoteBackend>> {
        self.get(self.active?)
    }
}
