use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;
use tracing::{debug, error, info, warn};

use super::capability::Capability;
use super::facade::SslRuntime;
use super::locator::{CandidateSet, ModuleLoader, SystemLoader, locate};
use super::resolver::resolve;
use crate::config::GatewayConfig;
use crate::errors::{GatewayError, LoadFailure};

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static GATEWAY: OnceCell<SslGateway> = OnceCell::new();

// -----------------------------------------------------------------------------
// ----- InitState -------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitState {
    NotStarted,
    InProgress,
    /// Success or failure; the outcome is cached either way.
    Completed,
}

// -----------------------------------------------------------------------------
// ----- SslGateway ------------------------------------------------------------

/// Owns the loaded modules and the capability table. Initializes at most
/// once; every later caller observes the cached outcome.
///
/// Dropping a gateway releases its modules once no [`SslRuntime`] handed out
/// by [`SslGateway::runtime`] is alive any more.
pub struct SslGateway {
    loader: Box<dyn ModuleLoader>,
    candidates: CandidateSet,
    guard: ReentrantMutex<Cell<InitState>>,
    outcome: OnceCell<Result<Arc<SslRuntime>, LoadFailure>>,
    load_passes: AtomicUsize,
}

// -----------------------------------------------------------------------------
// ----- SslGateway: Static ----------------------------------------------------

impl SslGateway {
    /// Process-wide instance backed by the system loader. Candidates come from
    /// [`GatewayConfig::from_env`], read on first access.
    pub fn global() -> &'static SslGateway {
        GATEWAY.get_or_init(|| Self::system(&GatewayConfig::from_env()))
    }

    /// Like [`SslGateway::global`], but the first caller chooses the
    /// configuration. Later calls get the existing instance unchanged.
    pub fn global_with(config: &GatewayConfig) -> &'static SslGateway {
        GATEWAY.get_or_init(|| Self::system(config))
    }

    pub fn system(config: &GatewayConfig) -> Self {
        Self::new(Box::new(SystemLoader), CandidateSet::from_config(config))
    }

    pub fn new(loader: Box<dyn ModuleLoader>, candidates: CandidateSet) -> Self {
        Self {
            loader,
            candidates,
            guard: ReentrantMutex::new(Cell::new(InitState::NotStarted)),
            outcome: OnceCell::new(),
            load_passes: AtomicUsize::new(0),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SslGateway: Public ----------------------------------------------------

impl SslGateway {
    /// Idempotent. `true` when every mandatory capability resolved and the
    /// runtime initialized.
    pub fn ensure_loaded(&self) -> bool {
        if let Some(outcome) = self.outcome.get() {
            return outcome.is_ok();
        }

        let state = self.guard.lock();
        match state.get() {
            InitState::Completed => return self.is_loaded(),
            InitState::InProgress => {
                warn!("re-entrant ssl gateway initialization refused");
                return false;
            }
            InitState::NotStarted => {}
        }

        state.set(InitState::InProgress);
        let _complete = CompleteOnDrop {
            state: &*state,
            outcome: &self.outcome,
        };

        let outcome = self.initialize();
        let loaded = outcome.is_ok();

        if self.outcome.set(outcome).is_err() {
            error!("ssl gateway outcome set twice");
        }

        loaded
    }

    /// Non-blocking peek at the cached outcome.
    pub fn is_loaded(&self) -> bool {
        matches!(self.outcome.get(), Some(Ok(_)))
    }

    pub fn state(&self) -> InitState {
        if self.outcome.get().is_some() {
            return InitState::Completed;
        }
        self.guard.lock().get()
    }

    /// Loads on first use. Every call after a failed load returns the same
    /// `LoadFailure`.
    pub fn runtime(&self) -> Result<Arc<SslRuntime>, GatewayError> {
        self.ensure_loaded();

        match self.outcome.get() {
            Some(Ok(runtime)) => Ok(runtime.clone()),
            Some(Err(failure)) => Err(GatewayError::LoadFailure(failure.clone())),
            None => Err(GatewayError::LoadFailure(
                LoadFailure::InitializationInProgress,
            )),
        }
    }

    /// For optional capabilities; `false` whenever the runtime is not loaded.
    pub fn is_supported(&self, capability: Capability) -> bool {
        self.runtime()
            .map(|runtime| runtime.is_supported(capability))
            .unwrap_or(false)
    }

    pub fn load_failure(&self) -> Option<LoadFailure> {
        match self.outcome.get() {
            Some(Err(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    /// How many module loading / resolution passes have run. Stays at 1.
    pub fn load_passes(&self) -> usize {
        self.load_passes.load(Ordering::Acquire)
    }
}

// -----------------------------------------------------------------------------
// ----- SslGateway: Private ---------------------------------------------------

impl SslGateway {
    fn initialize(&self) -> Result<Arc<SslRuntime>, LoadFailure> {
        self.load_passes.fetch_add(1, Ordering::AcqRel);
        debug!("loading ssl runtime");

        let located = locate(self.loader.as_ref(), &self.candidates);
        let table = resolve(&located)?;
        let runtime = SslRuntime::new(located.modules, table);

        runtime.init_ssl().map_err(|err| {
            error!("ssl runtime initialization failed: {err}");
            LoadFailure::RuntimeInitFailed { code: err.code() }
        })?;

        match runtime.version() {
            Ok(version) => info!("ssl runtime ready: {version}"),
            Err(err) => warn!("ssl runtime ready; version unavailable: {err}"),
        }

        let degraded: Vec<_> = runtime.table().unresolved().collect();
        if !degraded.is_empty() {
            debug!("optional ssl capabilities unavailable: {degraded:?}");
        }

        Ok(Arc::new(runtime))
    }
}

/// Moves the guard to `Completed` when initialization returns or unwinds.
/// An unwind leaves no outcome behind, so one is cached here.
struct CompleteOnDrop<'a> {
    state: &'a Cell<InitState>,
    outcome: &'a OnceCell<Result<Arc<SslRuntime>, LoadFailure>>,
}

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        if self.outcome.get().is_none() {
            error!("ssl runtime initialization panicked");
            let _ = self.outcome.set(Err(LoadFailure::InitializationAborted));
        }
        self.state.set(InitState::Completed);
    }
}

impl Drop for SslGateway {
    fn drop(&mut self) {
        if self.is_loaded() {
            debug!("releasing ssl gateway");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
