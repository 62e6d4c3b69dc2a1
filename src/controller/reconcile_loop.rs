//! One reconcile loop per pipeline component
//!
//! A pass fetches the FlowCollector, builds the component's descriptors,
//! stamps config digests, applies everything in kind order and reports the
//! outcome to the shared [`StatusAggregator`](crate::status::StatusAggregator).
//! Loops of different components run concurrently on the same FlowCollector
//! and only share the status table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::builder::{AssetSource, EmbeddedAssets, ResourceBuilder};
use crate::client::{CollectorClient, ResourceStore};
use crate::crd::FlowCollector;
use crate::events::{actions, EventPublisher, NoopEventPublisher};
use crate::fingerprint::{fingerprint_value, stamp_pod_template};
use crate::reconciler::ResourceReconciler;
use crate::resource::{sort_for_apply, Desired};
use crate::retry::RetryConfig;
use crate::status::{Component, ComponentStatus, StatusRegistry};
use crate::{Error, Result};

/// First requeue delay after a failed pass
pub const REQUEUE_BASE: Duration = Duration::from_secs(5);
/// Longest requeue delay after repeated failures
pub const REQUEUE_MAX: Duration = Duration::from_secs(300);

/// How a pass ended without error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// The FlowCollector is gone; owned resources are left to garbage collection
    Deleted,
    /// Every descriptor converged
    Ready {
        /// Descriptors that needed a write
        applied: usize,
        /// Descriptors already matching live
        unchanged: usize,
    },
    /// Cancelled or past its deadline; status was not committed
    Cancelled,
}

/// State shared by every reconcile loop
pub struct Context {
    /// FlowCollector reads and status writes
    pub collectors: Arc<dyn CollectorClient>,
    /// Applies descriptors
    pub reconciler: ResourceReconciler,
    /// One status aggregator per FlowCollector
    pub registry: Arc<StatusRegistry>,
    /// Kubernetes Events on failures
    pub events: Arc<dyn EventPublisher>,
    /// Static files for builders
    pub assets: Arc<dyn AssetSource>,
    /// Requeue delay after a successful pass
    pub resync: Duration,
    /// Deadline of one pass
    pub pass_timeout: Duration,
    /// Cancelled on process shutdown; pass tokens are its children
    pub shutdown: CancellationToken,
}

impl Context {
    /// Start building a context over the two cluster seams
    pub fn builder(
        collectors: Arc<dyn CollectorClient>,
        store: Arc<dyn ResourceStore>,
    ) -> ContextBuilder {
        ContextBuilder::new(collectors, store)
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    collectors: Arc<dyn CollectorClient>,
    store: Arc<dyn ResourceStore>,
    components: Vec<Component>,
    retry: RetryConfig,
    events: Arc<dyn EventPublisher>,
    assets: Arc<dyn AssetSource>,
    resync: Duration,
    pass_timeout: Duration,
    shutdown: CancellationToken,
}

impl ContextBuilder {
    fn new(collectors: Arc<dyn CollectorClient>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            collectors,
            store,
            components: Component::ALL.to_vec(),
            retry: RetryConfig::conflict(),
            events: Arc::new(NoopEventPublisher),
            assets: Arc::new(EmbeddedAssets),
            resync: Duration::from_secs(300),
            pass_timeout: Duration::from_secs(60),
            shutdown: CancellationToken::new(),
        }
    }

    /// Components registered on every status aggregator, in order
    pub fn components(mut self, components: &[Component]) -> Self {
        self.components = components.to_vec();
        self
    }

    /// Retry policy of the resource reconciler
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Asset source handed to builders
    pub fn assets(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.assets = assets;
        self
    }

    /// Requeue delay after success
    pub fn resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Per-pass deadline
    pub fn pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    /// Process shutdown token
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            registry: Arc::new(StatusRegistry::new(
                self.collectors.clone(),
                &self.components,
            )),
            collectors: self.collectors,
            reconciler: ResourceReconciler::new(self.store, self.retry),
            events: self.events,
            assets: self.assets,
            resync: self.resync,
            pass_timeout: self.pass_timeout,
            shutdown: self.shutdown,
        }
    }
}

/// Reconcile loop of one component
pub struct ReconcileLoop {
    component: Component,
    builder: Box<dyn ResourceBuilder>,
    ctx: Arc<Context>,
    failures: DashMap<String, u32>,
}

impl ReconcileLoop {
    /// Loop running `builder` against the shared context
    pub fn new(builder: Box<dyn ResourceBuilder>, ctx: Arc<Context>) -> Self {
        Self {
            component: builder.component(),
            builder,
            ctx,
            failures: DashMap::new(),
        }
    }

    /// Component this loop reports for
    pub fn component(&self) -> Component {
        self.component
    }

    /// Builder of this loop
    pub fn builder(&self) -> &dyn ResourceBuilder {
        self.builder.as_ref()
    }

    /// Shared context
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Run one pass for the named FlowCollector.
    ///
    /// Failures are recorded on the component condition and committed before
    /// the error is returned. A cancelled pass commits nothing.
    #[instrument(skip(self, cancel), fields(component = %self.component))]
    pub async fn run_pass(&self, collector: &str, cancel: &CancellationToken) -> Result<PassOutcome> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PassOutcome::Cancelled),
            fetched = self.ctx.collectors.get(collector) => fetched?,
        };
        let Some(fc) = fetched else {
            debug!("collector deleted, owned resources are left to garbage collection");
            self.ctx.registry.forget(collector);
            return Ok(PassOutcome::Deleted);
        };

        let status = self
            .ctx
            .registry
            .for_collector(collector)
            .for_component(self.component);
        // other loops commit the shared table, so a cancelled pass puts this back
        let previous = status.condition();
        status.set_unknown();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.apply(&fc, &status) => Some(result),
        };
        let result = match result {
            Some(result) if !cancel.is_cancelled() => result,
            _ => {
                status.restore(previous);
                warn!("pass cancelled, status not committed");
                return Ok(PassOutcome::Cancelled);
            }
        };
        status.aggregator().set_namespace(fc.spec.namespace.clone());

        match result {
            Ok((applied, unchanged)) => {
                status.set_ready();
                status.commit().await?;
                info!(applied, unchanged, "component ready");
                Ok(PassOutcome::Ready { applied, unchanged })
            }
            Err(e) => {
                // a failure set while applying names the resource
                if !status.has_failure() {
                    status.set_failure(e.reason(), &e.to_string());
                }
                self.ctx
                    .events
                    .publish(
                        &fc.object_ref(&()),
                        EventType::Warning,
                        e.reason(),
                        actions::RECONCILE,
                        Some(format!("{}: {}", self.component, e)),
                    )
                    .await;
                if let Err(commit_err) = status.commit().await {
                    warn!(error = %commit_err, "failed to commit failure status");
                }
                Err(e)
            }
        }
    }

    /// Build, stamp and apply; returns (applied, unchanged)
    async fn apply(&self, fc: &FlowCollector, status: &ComponentStatus) -> Result<(usize, usize)> {
        let name = fc.name_any();
        fc.spec.validate(&name)?;

        let mut desired = self.builder.build(&fc.spec, self.ctx.assets.as_ref())?;
        stamp_config_digests(&mut desired)?;

        let owner = fc.controller_owner_ref(&()).ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.uid", "FlowCollector has no uid")
        })?;
        for d in desired.iter_mut() {
            d.set_owner(owner.clone());
        }
        sort_for_apply(&mut desired);
        debug!(count = desired.len(), "descriptors built");

        let (mut applied, mut unchanged) = (0, 0);
        for d in &desired {
            match self.ctx.reconciler.reconcile(d).await {
                Ok(true) => applied += 1,
                Ok(false) => unchanged += 1,
                Err(e) => {
                    status.set_failure(e.reason(), &format!("{} {}: {}", d.kind, d.key(), e));
                    return Err(e);
                }
            }
        }
        Ok((applied, unchanged))
    }

    fn record_failure(&self, collector: &str) -> u32 {
        let mut count = self.failures.entry(collector.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_failures(&self, collector: &str) {
        self.failures.remove(collector);
    }
}

/// Stamp the fingerprint of each consumed ConfigMap on its consumer's pod
/// template.
///
/// The ConfigMap must be among `desired`, in the consumer's namespace.
pub fn stamp_config_digests(desired: &mut [Desired]) -> Result<()> {
    let digests: HashMap<(Option<String>, String), String> = desired
        .iter()
        .filter_map(|d| {
            let data = d.config_data()?;
            Some((
                (d.namespace().map(str::to_string), d.name()),
                fingerprint_value(data),
            ))
        })
        .collect();

    for d in desired.iter_mut() {
        let Some(source) = d.config_source.clone() else {
            continue;
        };
        let key = (d.namespace().map(str::to_string), source);
        let digest = digests.get(&key).ok_or_else(|| {
            Error::build(
                d.kind.as_str(),
                format!("{} consumes ConfigMap {} which was not built", d.key(), key.1),
            )
        })?;
        stamp_pod_template(&mut d.object.data, digest)?;
    }
    Ok(())
}

/// Requeue delay after `failures` consecutive failed passes
pub fn requeue_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    REQUEUE_BASE
        .saturating_mul(1u32 << exp)
        .min(REQUEUE_MAX)
}

/// Controller entry point: one pass under a deadline
#[instrument(skip(fc, lp), fields(collector = %fc.name_any(), component = %lp.component))]
pub async fn reconcile(fc: Arc<FlowCollector>, lp: Arc<ReconcileLoop>) -> Result<Action> {
    let name = fc.name_any();
    let cancel = lp.ctx.shutdown.child_token();

    let deadline = {
        let cancel = cancel.clone();
        let timeout = lp.ctx.pass_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel();
        })
    };
    let outcome = lp.run_pass(&name, &cancel).await;
    deadline.abort();

    match outcome? {
        PassOutcome::Deleted => {
            lp.clear_failures(&name);
            Ok(Action::await_change())
        }
        PassOutcome::Cancelled => Err(Error::cancelled(format!(
            "{} pass on {}",
            lp.component, name
        ))),
        PassOutcome::Ready { .. } => {
            lp.clear_failures(&name);
            Ok(Action::requeue(lp.ctx.resync))
        }
    }
}

/// Controller error policy.
///
/// Permanent errors wait for the next change; transient ones back off
/// exponentially per FlowCollector.
pub fn error_policy(fc: Arc<FlowCollector>, error: &Error, lp: Arc<ReconcileLoop>) -> Action {
    let name = fc.name_any();
    if !error.is_retryable() {
        warn!(
            collector = %name,
            component = %lp.component,
            reason = error.reason(),
            error = %error,
            "permanent failure, waiting for a change"
        );
        lp.clear_failures(&name);
        return Action::await_change();
    }

    let failures = lp.record_failure(&name);
    let delay = requeue_delay(failures);
    error!(
        collector = %name,
        component = %lp.component,
        failures,
        retry_in = ?delay,
        error = %error,
        "reconciliation failed"
    );
    Action::requeue(delay)
}
