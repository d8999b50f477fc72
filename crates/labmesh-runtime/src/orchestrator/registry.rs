//! Host and device records owned by one orchestrator.
//!
//! The registry is a plain value owned by the orchestrator's event loop;
//! nothing in it is shared across threads, so nothing in it is locked.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use labmesh_kernel::{HostTable, PortPool, SourceId};
use labmesh_types::{DeviceInfo, Endpoint, HostInfo};

use crate::interface::DeviceInterface;
use crate::orchestrator::launcher::WorkerProcess;

/// A worker started by this orchestrator.
pub struct DeviceRecord {
    pub name: String,
    pub device_type: String,
    pub req_port: u16,
    pub pub_port: u16,
    pub process: Box<dyn WorkerProcess>,
    pub interface: DeviceInterface,
}

impl DeviceRecord {
    pub fn info(&self, hostname: &str) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            device_type: self.device_type.clone(),
            host: hostname.to_string(),
            req_port: self.req_port,
            pub_port: self.pub_port,
        }
    }
}

/// Per-peer state: a proxy to the peer's orchestrator, the device list it
/// last advertised and the subscription that keeps that list fresh.
pub struct PeerHost {
    pub interface: DeviceInterface,
    pub devices: Vec<DeviceInfo>,
    pub subscription: Option<SourceId>,
}

impl PeerHost {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self {
            interface: DeviceInterface::with_timeout(endpoint, timeout),
            devices: Vec::new(),
            subscription: None,
        }
    }
}

pub struct Registry {
    hostname: String,
    pub hosts: HostTable<PeerHost>,
    devices: BTreeMap<String, DeviceRecord>,
    ports: PortPool,
}

impl Registry {
    pub fn new(hostname: impl Into<String>, host_timeout: Duration, ports: PortPool) -> Self {
        Self {
            hostname: hostname.into(),
            hosts: HostTable::new(host_timeout),
            devices: BTreeMap::new(),
            ports,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut PortPool {
        &mut self.ports
    }

    /// `requested` if no local device uses it yet, otherwise the same base
    /// with the first free numeric suffix: `rover`, `rover1`, `rover2`, ….
    /// A name that already ends in digits counts up from that number;
    /// empty and all-digit names use the base `dev`.
    pub fn unique_name(&self, requested: &str) -> String {
        if !requested.is_empty() && !self.devices.contains_key(requested) {
            return requested.to_string();
        }
        let digits = requested.len() - requested.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let (base, mut number) = if digits == 0 {
            let base = if requested.is_empty() { "dev" } else { requested };
            (base.to_string(), 1u64)
        } else {
            let (base, suffix) = requested.split_at(requested.len() - digits);
            let base = if base.is_empty() { "dev" } else { base };
            (base.to_string(), suffix.parse().unwrap_or(1))
        };
        loop {
            let candidate = format!("{base}{number}");
            if !self.devices.contains_key(&candidate) {
                return candidate;
            }
            number += 1;
        }
    }

    pub fn insert(&mut self, record: DeviceRecord) {
        self.devices.insert(record.name.clone(), record);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Destroy the record for `name`, returning its ports to the pool.
    pub fn remove(&mut self, name: &str) -> Option<DeviceRecord> {
        let record = self.devices.remove(name)?;
        self.ports.release(record.req_port);
        self.ports.release(record.pub_port);
        Some(record)
    }

    /// Destroy the records of workers whose process has exited.
    pub fn reap_exited(&mut self) -> Vec<DeviceRecord> {
        let dead: Vec<String> = self
            .devices
            .iter_mut()
            .filter_map(|(name, record)| (!record.process.is_alive()).then(|| name.clone()))
            .collect();
        dead.iter().filter_map(|name| self.remove(name)).collect()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn local_devices(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(|r| r.info(&self.hostname)).collect()
    }

    /// Local devices followed by the last advertised devices of every
    /// connected peer.
    pub fn all_devices(&self, now: Instant) -> Vec<DeviceInfo> {
        let mut all = self.local_devices();
        for peer in self.hosts.connected(now) {
            all.extend(peer.handle.devices.iter().cloned());
        }
        all
    }

    /// This host (as `localhost`) plus every peer ever seen.
    pub fn host_report(&self, now: Instant) -> BTreeMap<String, HostInfo> {
        let mut report = BTreeMap::new();
        report.insert(
            self.hostname.clone(),
            HostInfo {
                address: "localhost".to_string(),
                connected: true,
                last_seen: Utc::now(),
            },
        );
        for record in self.hosts.iter() {
            report.insert(
                record.hostname.clone(),
                HostInfo {
                    address: record.address.clone(),
                    connected: record.is_connected(self.hosts.timeout(), now),
                    last_seen: record.last_seen_at(),
                },
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::launcher::WorkerProcess;

    struct FakeProcess {
        alive: bool,
    }

    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn is_alive(&mut self) -> bool {
            self.alive
        }

        fn kill(&mut self) {
            self.alive = false;
        }
    }

    fn registry() -> Registry {
        Registry::new("bench", Duration::from_secs(3), PortPool::seeded(30000, 30010, 7))
    }

    fn add(registry: &mut Registry, name: &str, alive: bool) -> (u16, u16) {
        let (req_port, pub_port) = registry.ports_mut().allocate_pair().unwrap();
        registry.insert(DeviceRecord {
            name: name.to_string(),
            device_type: "demo".to_string(),
            req_port,
            pub_port,
            process: Box::new(FakeProcess { alive }),
            interface: DeviceInterface::new(Endpoint::local(req_port, pub_port)),
        });
        (req_port, pub_port)
    }

    #[test]
    fn unique_names_follow_the_suffix_rules() {
        let mut reg = registry();
        assert_eq!(reg.unique_name("rover"), "rover");
        add(&mut reg, "rover", true);
        assert_eq!(reg.unique_name("rover"), "rover1");
        add(&mut reg, "rover1", true);
        assert_eq!(reg.unique_name("rover"), "rover2");

        add(&mut reg, "cam7", true);
        assert_eq!(reg.unique_name("cam7"), "cam8");
        assert_eq!(reg.unique_name(""), "dev1");
        add(&mut reg, "42", true);
        assert_eq!(reg.unique_name("42"), "dev42");
    }

    #[test]
    fn removing_a_record_releases_its_ports() {
        let mut reg = registry();
        let (a, b) = add(&mut reg, "demo_1", true);
        assert!(reg.ports().contains(a) && reg.ports().contains(b));
        assert!(reg.remove("demo_1").is_some());
        assert!(reg.ports().is_empty());
        assert!(reg.remove("demo_1").is_none());
    }

    #[test]
    fn reaping_only_takes_exited_workers() {
        let mut reg = registry();
        add(&mut reg, "alive", true);
        let (a, _) = add(&mut reg, "dead", false);
        let reaped = reg.reap_exited();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].name, "dead");
        assert_eq!(reg.device_names(), vec!["alive"]);
        assert!(!reg.ports().contains(a));
        assert_eq!(reg.ports().len(), 2);
    }

    #[test]
    fn host_report_includes_self_and_stale_peers() -> Result<(), labmesh_types::LabError> {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.hosts.observe("peer", "10.1.1.1", t0, |_, addr| {
            Ok(PeerHost::new(Endpoint::new(addr, 23413, 23412), Duration::from_millis(100)))
        })?;
        if let Some(peer) = reg.hosts.get_mut("peer") {
            peer.handle.devices.push(DeviceInfo {
                name: "laser".into(),
                device_type: "laser".into(),
                host: "peer".into(),
                req_port: 30500,
                pub_port: 30501,
            });
        }
        add(&mut reg, "demo_1", true);

        let report = reg.host_report(t0);
        assert_eq!(report["bench"].address, "localhost");
        assert!(report["peer"].connected);
        assert_eq!(reg.all_devices(t0).len(), 2);

        let later = t0 + Duration::from_secs(5);
        assert!(!reg.host_report(later)["peer"].connected);
        assert_eq!(reg.all_devices(later).len(), 1);
        Ok(())
    }
}
