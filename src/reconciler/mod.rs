//! Converges one live resource toward its descriptor
//!
//! A reconcile is fetch, then create or merge-and-maybe-update. The whole
//! cycle is retried on conflicts and transient API errors so a lost
//! resourceVersion race re-reads the object instead of resending a stale
//! write. At most one write happens per successful cycle, and none when the
//! merged object matches live under the kind's [`policy::MergePolicy`].

pub mod policy;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::client::ResourceStore;
use crate::resource::Desired;
use crate::retry::{retry_with_backoff_if, RetryConfig};
use crate::{Error, Result};

pub use policy::{policy_for, Compare, MergePolicy};

/// Applies descriptors against a [`ResourceStore`]
#[derive(Clone)]
pub struct ResourceReconciler {
    store: Arc<dyn ResourceStore>,
    retry: RetryConfig,
}

impl ResourceReconciler {
    /// Create a reconciler retrying with `retry`
    pub fn new(store: Arc<dyn ResourceStore>, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Converge the live object toward `desired`.
    ///
    /// Returns whether a write was made. Exhausting the conflict retries
    /// yields [`Error::Conflict`]; other errors are returned as the last
    /// attempt saw them.
    #[instrument(skip(self, desired), fields(kind = %desired.kind, name = %desired.key()))]
    pub async fn reconcile(&self, desired: &Desired) -> Result<bool> {
        let attempts = AtomicU32::new(0);
        let operation = format!("apply {} {}", desired.kind, desired.key());

        let result = retry_with_backoff_if(
            &self.retry,
            &operation,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.apply_once(desired)
            },
            Error::is_retryable,
        )
        .await;

        match result {
            Err(e) if e.is_conflict() => Err(Error::conflict(
                desired.kind.as_str(),
                desired.key(),
                attempts.load(Ordering::Relaxed),
            )),
            other => other,
        }
    }

    async fn apply_once(&self, desired: &Desired) -> Result<bool> {
        let kind = desired.kind;
        let name = desired.name();
        let live = self.store.get(kind, desired.namespace(), &name).await?;

        let policy = policy_for(kind);
        let Some(live) = live else {
            let mut object = desired.object.clone();
            policy::stamp_applied(policy, &mut object);
            self.store.create(kind, &object).await?;
            info!("created");
            return Ok(true);
        };

        let merged = policy::merge(policy, &desired.object, &live);
        if !merged.changed {
            debug!(additive = policy.is_additive(), "unchanged");
            return Ok(false);
        }

        self.store.update(kind, &merged.object).await?;
        info!("updated");
        Ok(true)
    }
}
