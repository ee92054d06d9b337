use std::{
    fs,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use svcalloc_ipam::port::{PortRange, DEFAULT_NODE_PORT_RANGE};

use crate::{
    error::{ConfigError, Error},
    service::IpFamily,
};

pub const DEFAULT_SERVICE_CLUSTER_IP_RANGE: &str = "10.96.0.0/12";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Primary range first. A second range of the other family makes the cluster dual-stack.
    pub service_cluster_ip_ranges: Vec<String>,
    pub service_node_port_range: String,
    pub dual_stack: bool,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(ConfigError::FailedToLoad(e.to_string())))
    }

    pub fn cluster_cidrs(&self) -> Result<Vec<IpNet>, ConfigError> {
        match self.service_cluster_ip_ranges.len() {
            0 => return Err(ConfigError::NoServiceRange),
            1 | 2 => {}
            n => return Err(ConfigError::TooManyServiceRanges(n)),
        }
        let cidrs = self
            .service_cluster_ip_ranges
            .iter()
            .map(|r| {
                IpNet::from_str(r.trim())
                    .map_err(|_| ConfigError::InvalidServiceRange(r.to_string()))
            })
            .collect::<Result<Vec<IpNet>, ConfigError>>()?;
        if let [first, second] = cidrs.as_slice() {
            if IpFamily::of_net(first) == IpFamily::of_net(second) {
                return Err(ConfigError::SameFamilyServiceRanges);
            }
        }
        Ok(cidrs)
    }

    pub fn node_port_range(&self) -> Result<PortRange, ConfigError> {
        PortRange::from_str(&self.service_node_port_range)
            .map_err(|_| ConfigError::InvalidNodePortRange(self.service_node_port_range.clone()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_cluster_ip_ranges: vec![DEFAULT_SERVICE_CLUSTER_IP_RANGE.to_string()],
            service_node_port_range: DEFAULT_NODE_PORT_RANGE.to_string(),
            dual_stack: true,
        }
    }
}

/// Runtime feature switches. Read once at the start of every operation.
#[derive(Debug, Default)]
pub struct FeatureGate {
    dual_stack: AtomicBool,
}

impl FeatureGate {
    pub fn new(dual_stack: bool) -> FeatureGate {
        FeatureGate {
            dual_stack: AtomicBool::new(dual_stack),
        }
    }

    pub fn dual_stack(&self) -> bool {
        self.dual_stack.load(Ordering::SeqCst)
    }

    pub fn set_dual_stack(&self, enabled: bool) {
        self.dual_stack.store(enabled, Ordering::SeqCst);
    }
}

impl From<&Config> for FeatureGate {
    fn from(config: &Config) -> Self {
        FeatureGate::new(config.dual_stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(ranges: &[&str], node_ports: &str) -> Config {
        Config {
            service_cluster_ip_ranges: ranges.iter().map(|r| r.to_string()).collect(),
            service_node_port_range: node_ports.to_string(),
            dual_stack: true,
        }
    }

    #[test]
    fn works_config_from_yaml() {
        let conf: Config = serde_yaml::from_str(
            "service_cluster_ip_ranges:\n  - 10.0.0.0/16\n  - fd00::/108\ndual_stack: false\n",
        )
        .unwrap();
        assert_eq!(conf.service_cluster_ip_ranges, vec!["10.0.0.0/16", "fd00::/108"]);
        assert_eq!(conf.service_node_port_range, DEFAULT_NODE_PORT_RANGE);
        assert!(!conf.dual_stack);
        assert_eq!(conf.cluster_cidrs().unwrap().len(), 2);
        assert_eq!(conf.node_port_range().unwrap(), PortRange::default());
    }

    #[rstest(
        conf,
        expected,
        case(config(&[], "30000-32767"), ConfigError::NoServiceRange),
        case(config(&["10.0.0.0/16", "fd00::/108", "10.1.0.0/16"], "30000-32767"), ConfigError::TooManyServiceRanges(3)),
        case(config(&["10.0.0.0/16", "10.1.0.0/16"], "30000-32767"), ConfigError::SameFamilyServiceRanges),
        case(config(&["10.0.0.0/33"], "30000-32767"), ConfigError::InvalidServiceRange("10.0.0.0/33".to_string()))
    )]
    fn fails_config_cluster_cidrs(conf: Config, expected: ConfigError) {
        match conf.cluster_cidrs() {
            Ok(_) => panic!("this test should be failed"),
            Err(e) => assert_eq!(e, expected),
        }
    }

    #[test]
    fn fails_config_node_port_range() {
        let conf = config(&["10.0.0.0/16"], "32767-30000");
        assert_eq!(
            conf.node_port_range(),
            Err(ConfigError::InvalidNodePortRange("32767-30000".to_string()))
        );
    }

    #[test]
    fn works_feature_gate() {
        let gate = FeatureGate::from(&Config::default());
        assert!(gate.dual_stack());
        gate.set_dual_stack(false);
        assert!(!gate.dual_stack());
    }
}
