//! Reconcile loops for the FlowCollector
//!
//! Every pipeline component runs its own loop over the same FlowCollector.
//! A loop builds the component's resources, converges them through the
//! [`ResourceReconciler`](crate::reconciler::ResourceReconciler) and reports
//! to the collector's shared status.

mod reconcile_loop;
mod runner;

pub use reconcile_loop::{
    error_policy, reconcile, requeue_delay, stamp_config_digests, Context, ContextBuilder,
    PassOutcome, ReconcileLoop, REQUEUE_BASE, REQUEUE_MAX,
};
pub use runner::{kube_context, run};
