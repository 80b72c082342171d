//! Cost gauges published for nodes and pods
//!
//! Controllers talk to a [`MetricsSink`] handle injected at construction.
//! [`PrometheusSink`] owns its gauge vectors inside a caller supplied
//! registry and remembers every label set it published, because the
//! prometheus crate can only remove fully specified series.

use prometheus::{GaugeVec, Opts, Registry};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

const NAMESPACE: &str = "costwatch";

pub const NODE_LABELS: &[&str] = &["name", "type", "capacity", "id", "availability_zone"];
pub const POD_LABELS: &[&str] = &["name", "namespace", "owner_kind", "owner_name", "node"];

/// Every gauge family the controllers publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GaugeFamily {
    NodeHourlyCost,
    NodeTotalCost,
    PodCpuHourlyCost,
    PodMemoryHourlyCost,
    PodRequestsHourlyCost,
    PodRequestsTotalCost,
}

impl GaugeFamily {
    pub const NODE: [GaugeFamily; 2] = [GaugeFamily::NodeHourlyCost, GaugeFamily::NodeTotalCost];
    pub const POD: [GaugeFamily; 4] = [
        GaugeFamily::PodCpuHourlyCost,
        GaugeFamily::PodMemoryHourlyCost,
        GaugeFamily::PodRequestsHourlyCost,
        GaugeFamily::PodRequestsTotalCost,
    ];

    fn subsystem(&self) -> &'static str {
        match self {
            GaugeFamily::NodeHourlyCost | GaugeFamily::NodeTotalCost => "node",
            _ => "pod",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            GaugeFamily::NodeHourlyCost => "hourly_cost",
            GaugeFamily::NodeTotalCost => "total_cost",
            GaugeFamily::PodCpuHourlyCost => "cpu_hourly_cost",
            GaugeFamily::PodMemoryHourlyCost => "memory_hourly_cost",
            GaugeFamily::PodRequestsHourlyCost => "requests_hourly_cost",
            GaugeFamily::PodRequestsTotalCost => "requests_total_cost",
        }
    }

    fn help(&self) -> &'static str {
        match self {
            GaugeFamily::NodeHourlyCost => "Node hourly cost.",
            GaugeFamily::NodeTotalCost => "Node cost accumulated over billed hours since creation.",
            GaugeFamily::PodCpuHourlyCost => "Hourly cost of one CPU core on the pod's node.",
            GaugeFamily::PodMemoryHourlyCost => "Hourly cost of one MiB of memory on the pod's node.",
            GaugeFamily::PodRequestsHourlyCost => "Hourly cost of the pod's allocated resources.",
            GaugeFamily::PodRequestsTotalCost => {
                "Pod allocation cost accumulated over billed hours since creation."
            }
        }
    }

    pub fn labels(&self) -> &'static [&'static str] {
        match self.subsystem() {
            "node" => NODE_LABELS,
            _ => POD_LABELS,
        }
    }

    /// Fully qualified metric name
    pub fn metric_name(&self) -> String {
        format!("{}_{}_{}", NAMESPACE, self.subsystem(), self.name())
    }
}

/// Destination for cost gauges
///
/// Implementations must tolerate concurrent calls for disjoint label sets.
pub trait MetricsSink: Send + Sync {
    /// Set one series; `label_values` follow [`GaugeFamily::labels`] order
    fn set_gauge(&self, family: GaugeFamily, label_values: &[&str], value: f64);

    /// Remove every series of `family` whose labels contain all of `partial`
    fn delete_matching(&self, family: GaugeFamily, partial: &[(&str, &str)]) -> usize;
}

/// Prometheus backed sink
pub struct PrometheusSink {
    gauges: HashMap<GaugeFamily, GaugeVec>,
    published: Mutex<HashMap<GaugeFamily, HashSet<Vec<String>>>>,
}

impl PrometheusSink {
    /// Create the gauge families and register them in `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let mut gauges = HashMap::new();
        for family in GaugeFamily::NODE.iter().chain(GaugeFamily::POD.iter()) {
            let opts = Opts::new(family.name(), family.help())
                .namespace(NAMESPACE)
                .subsystem(family.subsystem());
            let vec = GaugeVec::new(opts, family.labels())?;
            registry.register(Box::new(vec.clone()))?;
            gauges.insert(*family, vec);
        }

        Ok(Self {
            gauges,
            published: Mutex::new(HashMap::new()),
        })
    }

    /// Currently published series of one family with their values
    pub fn series(&self, family: GaugeFamily) -> Vec<(Vec<String>, f64)> {
        let Some(vec) = self.gauges.get(&family) else {
            return Vec::new();
        };
        let published = match self.published.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        published
            .get(&family)
            .map(|set| {
                set.iter()
                    .map(|values| {
                        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                        (values.clone(), vec.with_label_values(&refs).get())
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MetricsSink for PrometheusSink {
    fn set_gauge(&self, family: GaugeFamily, label_values: &[&str], value: f64) {
        let Some(vec) = self.gauges.get(&family) else {
            return;
        };
        if label_values.len() != family.labels().len() {
            tracing::warn!(
                metric = %family.metric_name(),
                expected = family.labels().len(),
                got = label_values.len(),
                "Dropping gauge update with wrong label count"
            );
            return;
        }

        let mut published = match self.published.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        vec.with_label_values(label_values).set(value);
        published
            .entry(family)
            .or_default()
            .insert(label_values.iter().map(|v| v.to_string()).collect());
    }

    fn delete_matching(&self, family: GaugeFamily, partial: &[(&str, &str)]) -> usize {
        let Some(vec) = self.gauges.get(&family) else {
            return 0;
        };
        let names = family.labels();
        let positions: Vec<(usize, &str)> = partial
            .iter()
            .filter_map(|(label, value)| {
                names.iter().position(|n| n == label).map(|idx| (idx, *value))
            })
            .collect();
        if positions.len() != partial.len() {
            // A label the family does not have can never match
            return 0;
        }

        let mut published = match self.published.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(series) = published.get_mut(&family) else {
            return 0;
        };

        let doomed: Vec<Vec<String>> = series
            .iter()
            .filter(|values| positions.iter().all(|(idx, v)| values[*idx] == *v))
            .cloned()
            .collect();
        for values in &doomed {
            let refs: Vec<&str> = values.iter().map(String::as_str).collect();
            let _ = vec.remove_label_values(&refs);
            series.remove(values);
        }
        doomed.len()
    }
}
