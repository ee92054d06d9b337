use prometheus::{opts, IntCounterVec, IntGaugeVec, Registry};
use svcalloc_ipam::Allocator;
use svcalloc_trace::error::TraceableError;

use crate::{alloc::Allocators, error::Error, service::IpFamily};

pub const POOL_IPV4: &str = "ipv4";
pub const POOL_IPV6: &str = "ipv6";
pub const POOL_NODE_PORT: &str = "nodeport";

const RESULT_SUCCESS: &str = "success";

#[derive(Debug, Clone)]
pub struct Metrics {
    pub operations: IntCounterVec,
    pub allocated: IntGaugeVec,
    pub available: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let operations = IntCounterVec::new(
            opts!(
                "svcalloc_registry_operations_total",
                "Total count of Service operations handled by the registry",
            ),
            &["operation", "result"],
        )?;
        let allocated = IntGaugeVec::new(
            opts!(
                "svcalloc_allocator_allocated",
                "The number of allocated values in a pool"
            ),
            &["pool"],
        )?;
        let available = IntGaugeVec::new(
            opts!(
                "svcalloc_allocator_available",
                "The number of values left in a pool"
            ),
            &["pool"],
        )?;

        Ok(Metrics {
            operations,
            allocated,
            available,
        })
    }

    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.operations.clone()))?;
        registry.register(Box::new(self.allocated.clone()))?;
        registry.register(Box::new(self.available.clone()))?;
        Ok(self)
    }

    /// Counts one operation, labelled with the error kind on failure.
    pub fn operation<T>(&self, operation: &str, result: &Result<T, Error>) {
        let label = match result {
            Ok(_) => RESULT_SUCCESS.to_string(),
            Err(e) => e.metric_label(),
        };
        self.operations
            .with_label_values(&[operation, &label])
            .inc()
    }

    pub fn observe_allocators(&self, allocators: &Allocators) {
        for family in allocators.families() {
            let Some(allocator) = allocators.ip_allocator(*family) else {
                continue;
            };
            let pool = match family {
                IpFamily::IPv4 => POOL_IPV4,
                IpFamily::IPv6 => POOL_IPV6,
            };
            self.set_pool(pool, allocator.used(), allocator.free());
        }
        let node_ports = allocators.node_port_allocator();
        self.set_pool(POOL_NODE_PORT, node_ports.used(), node_ports.free());
    }

    fn set_pool(&self, pool: &str, used: usize, free: usize) {
        self.allocated
            .with_label_values(&[pool])
            .set(used as i64);
        self.available
            .with_label_values(&[pool])
            .set(free as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::*;

    #[test]
    fn works_metrics_register() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap().register(&registry).unwrap();

        metrics.operation::<()>("create", &Ok(()));
        metrics.operation::<()>(
            "create",
            &Err(Error::RangeFull {
                field: "spec.clusterIPs[0]".to_string(),
            }),
        );
        assert_eq!(
            metrics
                .operations
                .with_label_values(&["create", "success"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .operations
                .with_label_values(&["create", "range_full"])
                .get(),
            1
        );

        // registering twice is rejected
        assert!(Metrics::new().unwrap().register(&registry).is_err());
    }

    #[test]
    fn works_observe_allocators() {
        let allocators = test_allocators(&["10.0.0.0/29", "fd00::/125"]);
        allocators.node_port_allocator().allocate(30000).unwrap();
        let metrics = Metrics::new().unwrap();
        metrics.observe_allocators(&allocators);

        assert_eq!(metrics.available.with_label_values(&[POOL_IPV4]).get(), 6);
        assert_eq!(metrics.available.with_label_values(&[POOL_IPV6]).get(), 7);
        assert_eq!(metrics.allocated.with_label_values(&[POOL_NODE_PORT]).get(), 1);
        assert_eq!(metrics.available.with_label_values(&[POOL_NODE_PORT]).get(), 2767);
    }
}
