//! Target descriptors built from the configuration file.
use std::net::IpAddr;
use std::time::Duration;

use crate::input::{parse_period, parse_ports_spec, Config, ConfigError, TargetConfig};

/// A host to watch. Built once at startup and immutable afterwards; tasks
/// share it behind an `Arc`.
///
/// A zero period disables the corresponding protocol, and TCP additionally
/// requires a non-empty port range. `qps` of 0 means the probe launch rate
/// is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub ip: IpAddr,
    pub tcp_period: Duration,
    pub icmp_period: Duration,
    pub tcp_ports: Vec<u16>,
    pub expected_ports: Vec<u16>,
    pub qps: u32,
}

impl Target {
    /// Builds a target from its configuration entry, falling back to the
    /// process-wide defaults for periods and rate where the entry is silent.
    pub fn from_config(spec: &TargetConfig, defaults: &Config) -> Result<Self, ConfigError> {
        let ip: IpAddr = spec
            .ip
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(spec.ip.clone()))?;

        let tcp_period = effective_period(spec.tcp.period.as_deref(), defaults.tcp_period.as_deref())?;
        let icmp_period =
            effective_period(spec.icmp.period.as_deref(), defaults.icmp_period.as_deref())?;

        let tcp_ports = spec
            .tcp
            .range
            .as_deref()
            .map(parse_ports_spec)
            .transpose()?
            .unwrap_or_default();
        let expected_ports = spec
            .tcp
            .expected
            .as_deref()
            .map(parse_ports_spec)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            name: spec.name.clone(),
            ip,
            tcp_period,
            icmp_period,
            tcp_ports,
            expected_ports,
            qps: spec.queries_per_sec.or(defaults.queries_per_sec).unwrap_or(0),
        })
    }

    pub fn tcp_enabled(&self) -> bool {
        !self.tcp_period.is_zero() && !self.tcp_ports.is_empty()
    }

    pub fn icmp_enabled(&self) -> bool {
        !self.icmp_period.is_zero()
    }

    /// Key under which this target's last open-port set is stored.
    pub fn store_key(&self, protocol: &str) -> String {
        format!("{}:{}", self.ip, protocol)
    }
}

fn effective_period(own: Option<&str>, default: Option<&str>) -> Result<Duration, ConfigError> {
    match own.or(default) {
        Some(period) => parse_period(period),
        None => Ok(Duration::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ProtocolConfig;

    fn defaults() -> Config {
        Config {
            timeout: Some(2),
            limit: Some(100),
            queries_per_sec: Some(100),
            tcp_period: Some("1h".to_owned()),
            icmp_period: None,
            ..Config::default()
        }
    }

    fn spec() -> TargetConfig {
        TargetConfig {
            name: "app1".to_owned(),
            ip: "198.51.100.7".to_owned(),
            queries_per_sec: None,
            tcp: ProtocolConfig {
                period: None,
                range: Some("22,80,443".to_owned()),
                expected: Some("22,80".to_owned()),
            },
            icmp: ProtocolConfig::default(),
        }
    }

    #[test]
    fn builds_from_config_with_global_defaults() {
        let target = Target::from_config(&spec(), &defaults()).unwrap();

        assert_eq!(target.ip, "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(target.tcp_period, Duration::from_secs(3_600));
        assert_eq!(target.tcp_ports, vec![22, 80, 443]);
        assert_eq!(target.expected_ports, vec![22, 80]);
        assert_eq!(target.qps, 100);
        assert!(target.tcp_enabled());
        assert!(!target.icmp_enabled());
    }

    #[test]
    fn target_settings_override_globals() {
        let mut spec = spec();
        spec.queries_per_sec = Some(10);
        spec.tcp.period = Some("30s".to_owned());
        spec.icmp.period = Some("1m".to_owned());

        let target = Target::from_config(&spec, &defaults()).unwrap();

        assert_eq!(target.qps, 10);
        assert_eq!(target.tcp_period, Duration::from_secs(30));
        assert_eq!(target.icmp_period, Duration::from_secs(60));
        assert!(target.icmp_enabled());
    }

    #[test]
    fn zero_period_disables_tcp() {
        let mut spec = spec();
        spec.tcp.period = Some("0".to_owned());

        let target = Target::from_config(&spec, &defaults()).unwrap();
        assert!(!target.tcp_enabled());
    }

    #[test]
    fn empty_range_disables_tcp() {
        let mut spec = spec();
        spec.tcp.range = None;

        let target = Target::from_config(&spec, &defaults()).unwrap();
        assert!(!target.tcp_enabled());
    }

    #[test]
    fn rejects_bad_addresses() {
        let mut spec = spec();
        spec.ip = "not-an-ip".to_owned();

        assert!(matches!(
            Target::from_config(&spec, &defaults()),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn store_key_is_ip_and_protocol() {
        let target = Target::from_config(&spec(), &defaults()).unwrap();
        assert_eq!(target.store_key("tcp"), "198.51.100.7:tcp");
    }
}
