use crate::storage::StorageBackend;
use crate::upstream::UpstreamNetwork;
use arc_swap::ArcSwapOption;
use fieldcache::{Activation, Clients, LifecycleError, OfflineProxy, ProxySettings};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Worker = OfflineProxy<StorageBackend, UpstreamNetwork>;

/// Owns the proxy generation that currently controls traffic.
///
/// Deploying a generation runs install and activate; the activate hook's
/// claim swaps the new generation in. Requests that arrive while nothing is
/// in control go straight to the network.
///
/// Deploys run one at a time. Each is stamped with a generation number when
/// it is requested, and a deploy that was superseded by a later request
/// before it got its turn is skipped, so the last requested settings win.
pub struct Registration {
    controller: ArcSwapOption<Worker>,
    storage: Arc<StorageBackend>,
    network: Arc<UpstreamNetwork>,
    requested: AtomicU64,
    deploying: tokio::sync::Mutex<()>,
}

/// Client control handed to a generation during activation.
struct Takeover<'a> {
    registration: &'a Registration,
    worker: &'a Arc<Worker>,
}

impl Clients for Takeover<'_> {
    fn claim(&self) {
        let previous = self
            .registration
            .controller
            .swap(Some(Arc::clone(self.worker)));
        tracing::info!(
            version = %self.worker.version(),
            previous = ?previous.as_ref().map(|w| w.version()),
            "clients claimed"
        );
    }
}

impl Registration {
    pub fn new(storage: Arc<StorageBackend>, network: Arc<UpstreamNetwork>) -> Self {
        Self {
            controller: ArcSwapOption::empty(),
            storage,
            network,
            requested: AtomicU64::new(0),
            deploying: tokio::sync::Mutex::new(()),
        }
    }

    /// The generation currently in control, if any.
    pub fn controller(&self) -> Option<Arc<Worker>> {
        self.controller.load_full()
    }

    pub fn storage(&self) -> &Arc<StorageBackend> {
        &self.storage
    }

    pub fn network(&self) -> &Arc<UpstreamNetwork> {
        &self.network
    }

    /// Claim the next generation number. Any deploy stamped with an earlier
    /// number that has not started yet will be skipped.
    pub fn reserve_generation(&self) -> u64 {
        self.requested.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Install and activate a new generation, then let it take control.
    ///
    /// The generation is stamped before the returned future is first polled.
    /// Resolves to `None` when a later deploy was requested in the meantime.
    pub fn deploy(
        &self,
        settings: ProxySettings,
    ) -> impl Future<Output = Result<Option<Activation>, LifecycleError>> + Send + '_ {
        let generation = self.reserve_generation();
        self.deploy_generation(generation, settings)
    }

    /// Deploy `settings` as the generation reserved earlier with
    /// [`Registration::reserve_generation`].
    pub async fn deploy_generation(
        &self,
        generation: u64,
        settings: ProxySettings,
    ) -> Result<Option<Activation>, LifecycleError> {
        let _turn = self.deploying.lock().await;
        let latest = self.requested.load(Ordering::SeqCst);
        if generation != latest {
            tracing::info!(
                version = %settings.version,
                generation,
                latest,
                "skipping superseded deployment"
            );
            return Ok(None);
        }

        let worker = Arc::new(Worker::new(
            settings,
            Arc::clone(&self.storage),
            Arc::clone(&self.network),
        ));

        let outcome = worker.install()?;
        tracing::debug!(version = %worker.version(), generation, ?outcome, "install complete");

        let activation = worker
            .activate(&Takeover {
                registration: self,
                worker: &worker,
            })
            .await?;
        metrics::counter!("fieldcache_activations_total").increment(1);
        Ok(Some(activation))
    }
}
