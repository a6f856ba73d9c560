use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use sunbid::config::{EngineConfig, StorageConfig};
use sunbid::error::AppError;
use sunbid::workflows::procurement::{
    EngineHealth, EngineRuntime, EventBus, HookChain, LoggingHook, MemoryStore,
    NotificationInbox, ProcurementService, Stores, SystemClock,
    TokioDeadlineTimer,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
    pub(crate) service: Arc<ProcurementService>,
    pub(crate) inbox: Arc<NotificationInbox>,
}

/// Running engine plus the background tasks that keep its deadlines honest.
pub(crate) struct Engine {
    pub(crate) service: Arc<ProcurementService>,
    pub(crate) inbox: Arc<NotificationInbox>,
    pub(crate) shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Stop the sweeper and detach the remaining workers.
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            task.abort();
            let _ = task.await;
        }
        info!("procurement engine stopped");
    }
}

/// Wire the service to wall-clock time, the tokio timer, and the configured store.
///
/// Must run inside a tokio runtime: the deadline worker, event dispatcher, and sweeper are spawned
/// here, and deadlines of auctions left open by a previous run are rescheduled before returning.
pub(crate) async fn start_engine(
    engine: &EngineConfig,
    storage: &StorageConfig,
) -> Result<Engine, AppError> {
    let stores = open_stores(storage)?;
    let clock = Arc::new(SystemClock);
    let health = Arc::new(EngineHealth::default());
    let (timer, fired) = TokioDeadlineTimer::new(clock.clone(), health.clone());
    let (events, outbox) = EventBus::channel();

    let service = Arc::new(ProcurementService::new(
        engine,
        stores,
        EngineRuntime {
            clock,
            timer: Arc::new(timer),
            events,
            health,
        },
    ));

    let inbox = Arc::new(NotificationInbox::default());
    let hooks = HookChain::default()
        .with(Arc::new(LoggingHook))
        .with(inbox.clone());
    let shutdown = CancellationToken::new();

    let tasks = vec![
        tokio::spawn(service.clone().run_deadline_worker(fired)),
        tokio::spawn(outbox.dispatch(Arc::new(hooks))),
        tokio::spawn(
            service
                .clone()
                .run_sweeper(engine.sweep_interval, shutdown.clone()),
        ),
    ];

    let recovery = service.recover().await?;
    info!(
        rescheduled = recovery.rescheduled,
        expired = recovery.sweep.expired.len(),
        "procurement engine started"
    );

    Ok(Engine {
        service,
        inbox,
        shutdown,
        tasks,
    })
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(storage: &StorageConfig) -> Result<Stores, AppError> {
    use sunbid::workflows::procurement::{ProcurementError, RocksDbStore};

    match &storage.db_path {
        Some(path) => {
            let store = RocksDbStore::open(path).map_err(ProcurementError::from)?;
            info!(path = %path.display(), "using rocksdb store");
            Ok(Stores::shared(Arc::new(store)))
        }
        None => Ok(memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(storage: &StorageConfig) -> Result<Stores, AppError> {
    if let Some(path) = &storage.db_path {
        warn!(
            path = %path.display(),
            "SUNBID_DB_PATH ignored; build with the storage-rocksdb feature for durable state"
        );
    }
    Ok(memory_stores())
}

fn memory_stores() -> Stores {
    warn!("using in-memory store; state is lost on restart");
    Stores::shared(Arc::new(MemoryStore::default()))
}
