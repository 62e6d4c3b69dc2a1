//! Shared status of a FlowCollector
//!
//! Every component loop reports into the same [`StatusAggregator`] for a
//! given FlowCollector. Conditions sit behind one mutex so a commit always
//! reads a consistent set, and commits are serialized so two loops finishing
//! together cannot interleave their read-compare-write of the status
//! sub-resource.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::client::CollectorClient;
use crate::crd::{Condition, ConditionStatus, FlowCollectorStatus};
use crate::Result;

/// Type of the rolled-up condition
pub const READY_CONDITION: &str = "Ready";

/// Pipeline component owning one condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    /// Metrics RBAC and health dashboard
    Monitoring,
    /// Node agents
    Agent,
    /// Flow processor
    Processor,
    /// Console plugin
    ConsolePlugin,
    /// Namespace isolation
    NetworkPolicy,
}

impl Component {
    /// All components, in registration order
    pub const ALL: [Component; 5] = [
        Component::Monitoring,
        Component::Agent,
        Component::Processor,
        Component::ConsolePlugin,
        Component::NetworkPolicy,
    ];

    /// Condition type of this component
    pub fn name(&self) -> &'static str {
        match self {
            Self::Monitoring => "Monitoring",
            Self::Agent => "Agent",
            Self::Processor => "Processor",
            Self::ConsolePlugin => "ConsolePlugin",
            Self::NetworkPolicy => "NetworkPolicy",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown component '{}'", s))
    }
}

#[derive(Default)]
struct Table {
    // registration order
    entries: Vec<(Component, Condition)>,
    namespace: Option<String>,
}

impl Table {
    fn entry(&mut self, component: Component) -> &mut Condition {
        let idx = match self.entries.iter().position(|(c, _)| *c == component) {
            Some(idx) => idx,
            None => {
                self.entries.push((component, pending(component)));
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx].1
    }
}

fn pending(component: Component) -> Condition {
    Condition::new(
        component.name(),
        ConditionStatus::Unknown,
        "Pending",
        "not reconciled yet",
    )
}

/// Accumulates component conditions of one FlowCollector and writes the
/// rolled-up status.
pub struct StatusAggregator {
    collector: String,
    client: Arc<dyn CollectorClient>,
    table: Mutex<Table>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl StatusAggregator {
    /// Create an aggregator with no registered components
    pub fn new(collector: impl Into<String>, client: Arc<dyn CollectorClient>) -> Self {
        Self {
            collector: collector.into(),
            client,
            table: Mutex::new(Table::default()),
            commit_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Name of the FlowCollector
    pub fn collector(&self) -> &str {
        &self.collector
    }

    /// Register a component; the first registration fixes its position
    pub fn register(&self, component: Component) {
        self.table.lock().entry(component);
    }

    /// Handle scoped to one component
    pub fn for_component(self: &Arc<Self>, component: Component) -> ComponentStatus {
        self.register(component);
        ComponentStatus {
            aggregator: Arc::clone(self),
            component,
        }
    }

    fn set(&self, component: Component, status: ConditionStatus, reason: &str, message: &str) {
        let mut table = self.table.lock();
        let condition = table.entry(component);
        if condition.status != status {
            condition.last_transition_time = Utc::now();
        }
        condition.status = status;
        condition.reason = reason.to_string();
        condition.message = message.to_string();
    }

    /// Mark a component as being reconciled
    pub fn set_unknown(&self, component: Component) {
        self.set(component, ConditionStatus::Unknown, "Reconciling", "");
    }

    /// Mark a component as ready
    pub fn set_ready(&self, component: Component) {
        self.set(component, ConditionStatus::True, "Ready", "");
    }

    /// Mark a component as failed
    pub fn set_failure(&self, component: Component, reason: &str, message: &str) {
        self.set(component, ConditionStatus::False, reason, message);
    }

    /// Current condition of a component, registering it if needed
    pub fn condition(&self, component: Component) -> Condition {
        self.table.lock().entry(component).clone()
    }

    /// Put back a condition taken with [`condition`](Self::condition),
    /// timestamp included
    pub fn restore(&self, component: Component, condition: Condition) {
        *self.table.lock().entry(component) = condition;
    }

    /// True if any component's condition is False
    pub fn has_failure(&self) -> bool {
        self.table
            .lock()
            .entries
            .iter()
            .any(|(_, c)| c.status == ConditionStatus::False)
    }

    /// True if this component's condition is False
    pub fn component_has_failure(&self, component: Component) -> bool {
        self.table
            .lock()
            .entries
            .iter()
            .any(|(c, cond)| *c == component && cond.status == ConditionStatus::False)
    }

    /// Namespace reported in the status
    pub fn set_namespace(&self, namespace: impl Into<String>) {
        self.table.lock().namespace = Some(namespace.into());
    }

    /// Component conditions in registration order, plus the namespace
    pub fn snapshot(&self) -> (Vec<Condition>, Option<String>) {
        let table = self.table.lock();
        (
            table.entries.iter().map(|(_, c)| c.clone()).collect(),
            table.namespace.clone(),
        )
    }

    /// Status that a commit would write right now
    pub fn compute(&self) -> FlowCollectorStatus {
        let (components, namespace) = self.snapshot();
        let mut conditions = Vec::with_capacity(components.len() + 1);
        conditions.push(rollup(&components));
        conditions.extend(components);
        FlowCollectorStatus {
            conditions,
            namespace,
        }
    }

    /// Persist the rolled-up status if it differs from what is stored.
    ///
    /// Returns whether a write was made. A deleted FlowCollector is not an
    /// error: there is nothing left to report on.
    #[instrument(skip(self), fields(collector = %self.collector))]
    pub async fn commit(&self) -> Result<bool> {
        let _guard = self.commit_lock.lock().await;

        let mut desired = self.compute();
        let Some(current) = self.client.get(&self.collector).await? else {
            debug!("collector gone, skipping status commit");
            return Ok(false);
        };
        let persisted = current.status.unwrap_or_default();

        for condition in desired.conditions.iter_mut() {
            if let Some(old) = persisted.condition(&condition.type_) {
                if old.status == condition.status {
                    condition.last_transition_time = old.last_transition_time;
                }
            }
        }

        if same_status(&desired, &persisted) {
            debug!("status unchanged");
            return Ok(false);
        }

        self.client.patch_status(&self.collector, &desired).await?;
        debug!(
            ready = %desired.conditions[0].status,
            reason = %desired.conditions[0].reason,
            "status committed"
        );
        Ok(true)
    }
}

fn same_status(a: &FlowCollectorStatus, b: &FlowCollectorStatus) -> bool {
    a.namespace == b.namespace
        && a.conditions.len() == b.conditions.len()
        && a
            .conditions
            .iter()
            .zip(&b.conditions)
            .all(|(x, y)| x.same_state(y))
}

/// Roll component conditions up into the Ready condition.
///
/// Ready is True iff every component is True. Otherwise the first False
/// component in order gives reason and message; with no failure the result
/// is Unknown and lists what is still pending.
pub fn rollup(components: &[Condition]) -> Condition {
    if let Some(failed) = components
        .iter()
        .find(|c| c.status == ConditionStatus::False)
    {
        return Condition::new(
            READY_CONDITION,
            ConditionStatus::False,
            failed.reason.clone(),
            failed.message.clone(),
        );
    }

    let pending: Vec<&str> = components
        .iter()
        .filter(|c| c.status != ConditionStatus::True)
        .map(|c| c.type_.as_str())
        .collect();

    if components.is_empty() {
        Condition::new(
            READY_CONDITION,
            ConditionStatus::Unknown,
            "Pending",
            "no components registered",
        )
    } else if pending.is_empty() {
        Condition::new(
            READY_CONDITION,
            ConditionStatus::True,
            "Ready",
            "all components ready",
        )
    } else {
        Condition::new(
            READY_CONDITION,
            ConditionStatus::Unknown,
            "Pending",
            format!("waiting for {}", pending.join(", ")),
        )
    }
}

/// [`StatusAggregator`] methods bound to one component
#[derive(Clone)]
pub struct ComponentStatus {
    aggregator: Arc<StatusAggregator>,
    component: Component,
}

impl ComponentStatus {
    /// Component this handle reports for
    pub fn component(&self) -> Component {
        self.component
    }

    /// Shared aggregator
    pub fn aggregator(&self) -> &Arc<StatusAggregator> {
        &self.aggregator
    }

    /// Mark the component as being reconciled
    pub fn set_unknown(&self) {
        self.aggregator.set_unknown(self.component);
    }

    /// Mark the component as ready
    pub fn set_ready(&self) {
        self.aggregator.set_ready(self.component);
    }

    /// Mark the component as failed
    pub fn set_failure(&self, reason: &str, message: &str) {
        self.aggregator.set_failure(self.component, reason, message);
    }

    /// True if this component's own condition is False
    pub fn has_failure(&self) -> bool {
        self.aggregator.component_has_failure(self.component)
    }

    /// Current condition of the component
    pub fn condition(&self) -> Condition {
        self.aggregator.condition(self.component)
    }

    /// Put back a condition taken before the pass
    pub fn restore(&self, condition: Condition) {
        self.aggregator.restore(self.component, condition);
    }

    /// Persist the shared status
    pub async fn commit(&self) -> Result<bool> {
        self.aggregator.commit().await
    }
}

/// Process-wide map from FlowCollector name to its aggregator
pub struct StatusRegistry {
    client: Arc<dyn CollectorClient>,
    components: Vec<Component>,
    aggregators: DashMap<String, Arc<StatusAggregator>>,
}

impl StatusRegistry {
    /// New aggregators register `components` in the given order
    pub fn new(client: Arc<dyn CollectorClient>, components: &[Component]) -> Self {
        Self {
            client,
            components: components.to_vec(),
            aggregators: DashMap::new(),
        }
    }

    /// Aggregator of a FlowCollector, created on first use
    pub fn for_collector(&self, name: &str) -> Arc<StatusAggregator> {
        self.aggregators
            .entry(name.to_string())
            .or_insert_with(|| {
                let aggregator = StatusAggregator::new(name, self.client.clone());
                for component in &self.components {
                    aggregator.register(*component);
                }
                Arc::new(aggregator)
            })
            .clone()
    }

    /// Drop the aggregator of a deleted FlowCollector
    pub fn forget(&self, name: &str) {
        self.aggregators.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockCollectorClient;
    use crate::crd::FlowCollectorSpec;
    use crate::testing::{collector, InMemoryCollectors};
    use proptest::prelude::*;

    fn aggregator_with(
        client: Arc<dyn CollectorClient>,
        components: &[Component],
    ) -> Arc<StatusAggregator> {
        let registry = StatusRegistry::new(client, components);
        registry.for_collector("cluster")
    }

    fn in_memory() -> Arc<InMemoryCollectors> {
        let store = Arc::new(InMemoryCollectors::new());
        store.put(collector("cluster", FlowCollectorSpec::default()));
        store
    }

    #[test]
    fn test_ready_only_when_all_components_ready() {
        let agg = aggregator_with(in_memory(), &Component::ALL);
        for c in Component::ALL {
            agg.set_ready(c);
        }
        let status = agg.compute();
        assert_eq!(status.conditions[0].type_, READY_CONDITION);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
        assert_eq!(status.conditions.len(), Component::ALL.len() + 1);

        agg.set_unknown(Component::Agent);
        let ready = &agg.compute().conditions[0];
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert!(ready.message.contains("Agent"));
    }

    #[test]
    fn test_first_failure_in_registration_order_wins() {
        let agg = aggregator_with(in_memory(), &Component::ALL);
        for c in Component::ALL {
            agg.set_ready(c);
        }
        // reported later but registered earlier
        agg.set_failure(Component::ConsolePlugin, "ConsolePluginError", "plugin down");
        agg.set_failure(Component::Agent, "AgentError", "agent down");

        let ready = &agg.compute().conditions[0];
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "AgentError");
        assert_eq!(ready.message, "agent down");

        // the other failure is still visible on its own condition
        let status = agg.compute();
        let plugin = status.condition("ConsolePlugin").unwrap();
        assert_eq!(plugin.reason, "ConsolePluginError");
    }

    #[test]
    fn test_has_failure_is_global_component_handle_is_local() {
        let agg = aggregator_with(in_memory(), &Component::ALL);
        let agent = agg.for_component(Component::Agent);
        let processor = agg.for_component(Component::Processor);

        assert!(!agg.has_failure());
        processor.set_failure("ProcessorError", "boom");
        assert!(agg.has_failure());
        assert!(processor.has_failure());
        assert!(!agent.has_failure());
    }

    #[test]
    fn test_transition_time_moves_only_on_status_change() {
        let agg = aggregator_with(in_memory(), &[Component::Agent]);
        agg.set_ready(Component::Agent);
        let first = agg.snapshot().0[0].last_transition_time;

        agg.set_ready(Component::Agent);
        assert_eq!(agg.snapshot().0[0].last_transition_time, first);
    }

    #[test]
    fn test_unregistered_component_is_appended() {
        let agg = aggregator_with(in_memory(), &[Component::Agent]);
        agg.set_ready(Component::NetworkPolicy);
        let names: Vec<_> = agg.snapshot().0.into_iter().map(|c| c.type_).collect();
        assert_eq!(names, vec!["Agent", "NetworkPolicy"]);
    }

    #[test]
    fn test_component_parses_from_name() {
        assert_eq!(
            "consoleplugin".parse::<Component>().unwrap(),
            Component::ConsolePlugin
        );
        assert!("nope".parse::<Component>().is_err());
    }

    #[tokio::test]
    async fn test_commit_persists_namespace_and_conditions() {
        let store = in_memory();
        let agg = aggregator_with(store.clone(), &[Component::Agent]);
        agg.set_namespace("flowmesh");
        agg.set_ready(Component::Agent);

        assert!(agg.commit().await.unwrap());
        let status = store.status("cluster").unwrap();
        assert_eq!(status.namespace.as_deref(), Some("flowmesh"));
        assert_eq!(
            status.condition(READY_CONDITION).unwrap().status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn test_commit_without_change_does_not_write() {
        let stored: Arc<Mutex<Option<FlowCollectorStatus>>> = Arc::new(Mutex::new(None));
        let mut client = MockCollectorClient::new();

        let read = stored.clone();
        client.expect_get().returning(move |name| {
            let mut fc = collector(name, FlowCollectorSpec::default());
            fc.status = read.lock().clone();
            Ok(Some(fc))
        });
        let write = stored.clone();
        client
            .expect_patch_status()
            .times(1)
            .returning(move |_, status| {
                *write.lock() = Some(status.clone());
                Ok(())
            });

        let agg = aggregator_with(Arc::new(client), &[Component::Agent, Component::Processor]);
        agg.set_ready(Component::Agent);
        agg.set_failure(Component::Processor, "ProcessorError", "boom");

        assert!(agg.commit().await.unwrap());
        assert!(!agg.commit().await.unwrap());

        // re-reporting the same outcome is still not a change
        agg.set_failure(Component::Processor, "ProcessorError", "boom");
        assert!(!agg.commit().await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_keeps_persisted_transition_time() {
        let store = in_memory();
        let agg = aggregator_with(store.clone(), &[Component::Agent]);
        agg.set_ready(Component::Agent);
        agg.commit().await.unwrap();
        let first = store.status("cluster").unwrap().conditions[1].last_transition_time;

        // a new pass goes through Unknown in memory but ends Ready again
        agg.set_unknown(Component::Agent);
        agg.set_ready(Component::Agent);
        assert!(!agg.commit().await.unwrap());
        assert_eq!(
            store.status("cluster").unwrap().conditions[1].last_transition_time,
            first
        );
        assert_eq!(store.status_writes(), 1);
    }

    #[tokio::test]
    async fn test_commit_on_deleted_collector_is_noop() {
        let store = in_memory();
        store.remove("cluster");
        let agg = aggregator_with(store.clone(), &[Component::Agent]);
        agg.set_ready(Component::Agent);
        assert!(!agg.commit().await.unwrap());
        assert_eq!(store.status_writes(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_converge() {
        let store = in_memory();
        let registry = Arc::new(StatusRegistry::new(store.clone(), &Component::ALL));

        let mut handles = Vec::new();
        for component in Component::ALL {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let status = registry.for_collector("cluster").for_component(component);
                for _ in 0..20 {
                    status.set_unknown();
                    tokio::task::yield_now().await;
                    status.set_ready();
                    status.commit().await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let agg = registry.for_collector("cluster");
        agg.commit().await.unwrap();
        let status = store.status("cluster").unwrap();
        assert_eq!(
            status.condition(READY_CONDITION).unwrap().status,
            ConditionStatus::True
        );
        let names: Vec<_> = status.conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(
            names,
            vec!["Ready", "Monitoring", "Agent", "Processor", "ConsolePlugin", "NetworkPolicy"]
        );
    }

    #[test]
    fn test_registry_shares_aggregator_per_collector() {
        let registry = StatusRegistry::new(in_memory(), &Component::ALL);
        let a = registry.for_collector("cluster");
        let b = registry.for_collector("cluster");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &registry.for_collector("other")));

        registry.forget("cluster");
        assert!(!Arc::ptr_eq(&a, &registry.for_collector("cluster")));
    }

    fn status_strategy() -> impl Strategy<Value = ConditionStatus> {
        prop_oneof![
            Just(ConditionStatus::True),
            Just(ConditionStatus::False),
            Just(ConditionStatus::Unknown),
        ]
    }

    proptest! {
        #[test]
        fn prop_rollup_matches_definition(
            statuses in prop::collection::vec(status_strategy(), 1..8)
        ) {
            let components: Vec<Condition> = statuses
                .iter()
                .enumerate()
                .map(|(i, s)| Condition::new(format!("C{i}"), *s, format!("Reason{i}"), format!("msg {i}")))
                .collect();
            let ready = rollup(&components);

            let all_true = statuses.iter().all(|s| *s == ConditionStatus::True);
            prop_assert_eq!(ready.status == ConditionStatus::True, all_true);

            if let Some(i) = statuses.iter().position(|s| *s == ConditionStatus::False) {
                prop_assert_eq!(ready.status, ConditionStatus::False);
                prop_assert_eq!(ready.reason, format!("Reason{i}"));
            }
        }
    }
}
