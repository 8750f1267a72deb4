//! Controller manager.
//!
//! Owns one queue and one reconciliation loop per controller, watches every
//! kind the controllers read, and maps each watch event to the keys that must
//! be reconciled again.

use std::sync::Arc;
use std::time::Duration;

use choreo_core::api::{
    ClusterDelivery, ClusterRunTemplate, ClusterSupplyChain, Deliverable, Runnable, Secret,
    ServiceAccount, TemplateKind, Workload,
};
use choreo_core::{DynamicObject, ObjectKey, Resource, TypeMeta};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::SubmitCache;
use crate::config::ReconcilerConfig;
use crate::controller::{BlueprintReconciler, Context, Intent, OwnerReconciler, Pipeline};
use crate::error::{Error, Result};
use crate::queue::WorkQueue;
use crate::r#loop::{LoopConfig, LoopStopper, Reconcile, ReconciliationLoop};
use crate::realizer::StepTemplate;
use crate::repository::Repository;
use crate::selector::{best_matches, Selectable};
use crate::substrate::{ClientBuilder, Substrate, WatchStream};
use crate::tracker::{DependencyTracker, Reference, StampedTracker};

/// One queue per controller.
#[derive(Clone)]
struct Queues {
    workloads: WorkQueue<ObjectKey>,
    deliverables: WorkQueue<ObjectKey>,
    runnables: WorkQueue<ObjectKey>,
    supply_chains: WorkQueue<ObjectKey>,
    deliveries: WorkQueue<ObjectKey>,
}

impl Queues {
    fn new(config: &ReconcilerConfig) -> Self {
        let queue = || WorkQueue::new(config.backoff_base(), config.backoff_max());
        Self {
            workloads: queue(),
            deliverables: queue(),
            runnables: queue(),
            supply_chains: queue(),
            deliveries: queue(),
        }
    }

    fn all(&self) -> [&WorkQueue<ObjectKey>; 5] {
        [
            &self.workloads,
            &self.deliverables,
            &self.runnables,
            &self.supply_chains,
            &self.deliveries,
        ]
    }

    fn is_idle(&self) -> bool {
        self.all().iter().all(|q| q.is_idle())
    }

    fn for_kind(&self, kind: &str) -> Option<&WorkQueue<ObjectKey>> {
        match kind {
            Workload::KIND => Some(&self.workloads),
            Deliverable::KIND => Some(&self.deliverables),
            Runnable::KIND => Some(&self.runnables),
            ClusterSupplyChain::KIND => Some(&self.supply_chains),
            ClusterDelivery::KIND => Some(&self.deliveries),
            _ => None,
        }
    }
}

/// Maps watch events to queue keys.
struct Router {
    ctx: Context,
    queues: Queues,
}

impl Router {
    async fn follow(&self, mut stream: WatchStream) {
        debug!(kind = %stream.type_meta(), "Following watch");
        while let Some(event) = stream.next().await {
            self.route(&event.object).await;
        }
    }

    async fn route(&self, obj: &DynamicObject) {
        let kind = obj.kind.as_str();
        if let Some(queue) = self.queues.for_kind(kind) {
            queue.add(obj.key());
        }

        match kind {
            ClusterSupplyChain::KIND => {
                self.enqueue_selected::<Workload>(obj, &self.queues.workloads).await;
            }
            ClusterDelivery::KIND => {
                self.enqueue_selected::<Deliverable>(obj, &self.queues.deliverables).await;
            }
            ClusterRunTemplate::KIND => self.enqueue_runnables(obj).await,
            k if TemplateKind::from_kind(k).is_some() => self.enqueue_referencing_pipelines(obj).await,
            _ => {}
        }

        for owner in self.ctx.tracker.lookup(&Reference::of_dynamic(obj)) {
            self.enqueue_owner(&owner);
        }
        if let Some(controller) = obj.metadata.controller() {
            let key = match &obj.metadata.namespace {
                Some(namespace) => ObjectKey::namespaced(namespace, &controller.name),
                None => ObjectKey::cluster(&controller.name),
            };
            if let Some(queue) = self.queues.for_kind(&controller.kind) {
                debug!(child = %obj.key(), owner = %key, "Child changed, requeueing owner");
                queue.add(key);
            }
        }
    }

    fn enqueue_owner(&self, owner: &Reference) {
        if let Some(queue) = self.queues.for_kind(&owner.type_meta.kind) {
            queue.add(owner.key.clone());
        }
    }

    /// Requeue intents the pipeline selects or was bound to.
    async fn enqueue_selected<I: Intent>(&self, obj: &DynamicObject, queue: &WorkQueue<ObjectKey>) {
        let pipeline = match I::Pipeline::from_dynamic(obj) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(pipeline = %obj.key(), error = %e, "Cannot decode pipeline");
                return;
            }
        };
        let intents = match self.ctx.repo.list::<I>(None).await {
            Ok(intents) => intents,
            Err(e) => {
                warn!(kind = I::KIND, error = %e, "Cannot list intents");
                return;
            }
        };
        for intent in intents {
            let bound = intent
                .pipeline_ref()
                .is_some_and(|r| r.name == pipeline.name());
            if bound || selects(&pipeline, &intent) {
                queue.add(intent.key());
            }
        }
    }

    async fn enqueue_runnables(&self, obj: &DynamicObject) {
        match self.ctx.repo.list::<Runnable>(None).await {
            Ok(runnables) => runnables
                .iter()
                .filter(|r| r.pipeline_name() == Some(obj.metadata.name.as_str()))
                .for_each(|r| self.queues.runnables.add(r.key())),
            Err(e) => warn!(error = %e, "Cannot list runnables"),
        }
    }

    /// Requeue pipelines whose steps reference the template.
    async fn enqueue_referencing_pipelines(&self, template: &DynamicObject) {
        match self.ctx.repo.list::<ClusterSupplyChain>(None).await {
            Ok(chains) => chains
                .iter()
                .filter(|c| references_template(*c, template))
                .for_each(|c| self.queues.supply_chains.add(c.key())),
            Err(e) => warn!(error = %e, "Cannot list supply chains"),
        }
        match self.ctx.repo.list::<ClusterDelivery>(None).await {
            Ok(deliveries) => deliveries
                .iter()
                .filter(|d| references_template(*d, template))
                .for_each(|d| self.queues.deliveries.add(d.key())),
            Err(e) => warn!(error = %e, "Cannot list deliveries"),
        }
    }

    /// Queue every existing intent and pipeline.
    async fn enqueue_existing(&self) -> Result<()> {
        let repo = &self.ctx.repo;
        futures::try_join!(
            enqueue_all::<Workload>(repo, &self.queues.workloads),
            enqueue_all::<Deliverable>(repo, &self.queues.deliverables),
            enqueue_all::<Runnable>(repo, &self.queues.runnables),
            enqueue_all::<ClusterSupplyChain>(repo, &self.queues.supply_chains),
            enqueue_all::<ClusterDelivery>(repo, &self.queues.deliveries),
        )?;
        Ok(())
    }
}

fn selects<P: Pipeline>(pipeline: &P, intent: &impl Resource) -> bool {
    let Ok(fields) = intent.to_dynamic().and_then(|obj| obj.to_value()) else {
        return false;
    };
    let target = Selectable::new(&intent.metadata().labels, &fields);
    best_matches(&target, std::slice::from_ref(pipeline)).is_ok_and(|m| !m.is_empty())
}

fn references_template<P: Pipeline>(pipeline: &P, template: &DynamicObject) -> bool {
    pipeline.steps().iter().any(|step| match &step.template {
        StepTemplate::Reference(reference) => {
            reference.kind == template.kind
                && reference.candidate_names().any(|name| name == template.metadata.name)
        }
        StepTemplate::Inline(_) => false,
    })
}

async fn enqueue_all<T: Resource>(repo: &Repository, queue: &WorkQueue<ObjectKey>) -> Result<()> {
    let objects = repo.list::<T>(None).await?;
    debug!(kind = T::KIND, count = objects.len(), "Queueing existing objects");
    for obj in &objects {
        queue.add(obj.key());
    }
    Ok(())
}

/// Every kind watched from startup. Stamped kinds are added as they appear.
fn watched_kinds() -> Vec<TypeMeta> {
    let mut kinds = vec![
        Workload::type_meta(),
        Deliverable::type_meta(),
        Runnable::type_meta(),
        ClusterSupplyChain::type_meta(),
        ClusterDelivery::type_meta(),
        ClusterRunTemplate::type_meta(),
        ServiceAccount::type_meta(),
        Secret::type_meta(),
    ];
    kinds.extend(TemplateKind::ALL.into_iter().map(TemplateKind::type_meta));
    kinds
}

/// Runs every controller against one substrate.
pub struct Manager {
    router: Arc<Router>,
    substrate: Arc<dyn Substrate>,
    stamped_rx: mpsc::UnboundedReceiver<TypeMeta>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Manager {
    /// Create a manager. `substrate` is the engine's own client;
    /// `client_builder` builds the clients that stamp as service accounts.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration fails validation.
    pub fn new(
        substrate: Arc<dyn Substrate>,
        client_builder: Arc<dyn ClientBuilder>,
        config: ReconcilerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(SubmitCache::with_config(&config.cache_config()));
        let (stamped_tx, stamped_rx) = mpsc::unbounded_channel();
        let queues = Queues::new(&config);
        let ctx = Context {
            repo: Repository::new(Arc::clone(&substrate), cache),
            client_builder,
            tracker: Arc::new(DependencyTracker::new(config.dependency_lease())),
            stamped: Arc::new(StampedTracker::new(stamped_tx)),
            config,
        };
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            router: Arc::new(Router { ctx, queues }),
            substrate,
            stamped_rx,
            stop_tx,
            stop_rx,
        })
    }

    /// State shared by the controllers.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.router.ctx
    }

    /// Handle that stops [`run`](Self::run).
    #[must_use]
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper::from_sender(self.stop_tx.clone())
    }

    /// Run every controller until stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial listing fails or a loop ends abnormally.
    pub async fn run(self) -> Result<()> {
        let Self {
            router,
            substrate,
            mut stamped_rx,
            stop_tx: _stop_tx,
            mut stop_rx,
        } = self;

        let mut watchers = JoinSet::new();
        for type_meta in watched_kinds() {
            let stream = substrate.watch(&type_meta);
            let router = Arc::clone(&router);
            watchers.spawn(async move { router.follow(stream).await });
        }
        {
            let router = Arc::clone(&router);
            let substrate = Arc::clone(&substrate);
            watchers.spawn(async move {
                let mut stamped = JoinSet::new();
                while let Some(type_meta) = stamped_rx.recv().await {
                    info!(kind = %type_meta, "Watching stamped kind");
                    let stream = substrate.watch(&type_meta);
                    let router = Arc::clone(&router);
                    stamped.spawn(async move { router.follow(stream).await });
                }
            });
        }

        router.enqueue_existing().await?;

        let ctx = &router.ctx;
        let loop_config = LoopConfig {
            workers: ctx.config.workers,
        };
        let controllers: [(Arc<dyn Reconcile>, &WorkQueue<ObjectKey>); 5] = [
            (Arc::new(OwnerReconciler::<Workload>::new(ctx.clone())), &router.queues.workloads),
            (Arc::new(OwnerReconciler::<Deliverable>::new(ctx.clone())), &router.queues.deliverables),
            (Arc::new(OwnerReconciler::<Runnable>::new(ctx.clone())), &router.queues.runnables),
            (Arc::new(BlueprintReconciler::<ClusterSupplyChain>::new(ctx.clone())), &router.queues.supply_chains),
            (Arc::new(BlueprintReconciler::<ClusterDelivery>::new(ctx.clone())), &router.queues.deliveries),
        ];

        let mut stoppers = Vec::new();
        let mut loops = JoinSet::new();
        for (reconciler, queue) in controllers {
            let mut runner = ReconciliationLoop::new(reconciler, queue.clone(), loop_config.clone());
            stoppers.push(runner.stopper());
            loops.spawn(async move { runner.run().await });
        }
        info!(controllers = stoppers.len(), "Manager started");

        while !*stop_rx.borrow() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }

        info!("Stopping manager");
        stoppers.iter().for_each(LoopStopper::stop);
        watchers.abort_all();

        let mut outcome = Ok(());
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => outcome = Err(e),
                Err(_) => outcome = Err(Error::LoopStopped),
            }
        }
        info!("Manager stopped");
        outcome
    }

    /// Run until no controller has had work for `settle`, then stop.
    /// Periodic requeues waiting on a timer do not count as work.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_until_idle(self, settle: Duration) -> Result<()> {
        let queues = self.router.queues.clone();
        let stopper = self.stopper();
        let poll = settle.clamp(Duration::from_millis(1), Duration::from_millis(50));
        let monitor = tokio::spawn(async move {
            let mut idle_since = Instant::now();
            loop {
                tokio::time::sleep(poll).await;
                if !queues.is_idle() {
                    idle_since = Instant::now();
                } else if idle_since.elapsed() >= settle {
                    debug!("Controllers settled");
                    stopper.stop();
                    return;
                }
            }
        });
        let outcome = self.run().await;
        monitor.abort();
        outcome
    }
}
