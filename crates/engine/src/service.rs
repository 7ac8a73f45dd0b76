//! Wiring facade: builds every engine component once from stores, adapters,
//! and configuration, so the server and CLI hold a single handle.

use std::sync::Arc;

use fleetrun_core::audit::AuditSink;
use fleetrun_core::config::EngineConfig;
use fleetrun_core::masking::Masker;

use crate::adapters::EngineAdapters;
use crate::approvals::ApprovalService;
use crate::cancel::CancellationService;
use crate::events::EventRecorder;
use crate::executor::ExecutorCore;
use crate::handlers::HandlerRegistry;
use crate::observe::{EventStream, MetricsService, ProgressService};
use crate::reaper::Reaper;
use crate::router::Router;
use crate::stores::EngineStores;
use crate::worker::WorkerDeps;

pub struct Engine {
    pub stores: EngineStores,
    pub router: Router,
    pub cancellations: CancellationService,
    pub approvals: ApprovalService,
    pub progress: ProgressService,
    pub metrics: MetricsService,
    pub stream: EventStream,
    pub recorder: EventRecorder,
    pub masker: Arc<Masker>,
    config: Arc<EngineConfig>,
    adapters: EngineAdapters,
    executor: Arc<ExecutorCore>,
}

impl Engine {
    pub fn new(
        stores: EngineStores,
        adapters: EngineAdapters,
        config: Arc<EngineConfig>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let masker = Arc::new(Masker::new(&config.log_mask_patterns));
        let stream = EventStream::default();
        let recorder =
            EventRecorder::new(stores.events.clone(), stream.clone(), masker.clone());

        let executor = Arc::new(ExecutorCore::new(
            stores.clone(),
            Arc::new(HandlerRegistry::standard(&adapters)),
            adapters.secrets.clone(),
            recorder.clone(),
        ));

        let router = Router::new(
            stores.clone(),
            executor.clone(),
            adapters.rbac.clone(),
            recorder.clone(),
            audit,
            config.clone(),
        );
        let cancellations = CancellationService::new(
            stores.clone(),
            recorder.clone(),
            config.cancellation_token_ttl_secs,
        );
        let approvals = ApprovalService::new(
            stores.clone(),
            adapters.rbac.clone(),
            recorder.clone(),
            config.clone(),
        );
        let progress = ProgressService::new(stores.clone());
        let metrics = MetricsService::new(stores.clone());

        Self {
            stores,
            router,
            cancellations,
            approvals,
            progress,
            metrics,
            stream,
            recorder,
            masker,
            config,
            adapters,
            executor,
        }
    }

    pub fn worker_deps(&self) -> WorkerDeps {
        WorkerDeps {
            stores: self.stores.clone(),
            executor: self.executor.clone(),
            rbac: self.adapters.rbac.clone(),
            recorder: self.recorder.clone(),
            config: self.config.clone(),
        }
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.stores.clone(), self.config.reaper_interval_ms)
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }
}
