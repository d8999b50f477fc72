//! Typed client of an orchestrator.

use std::collections::BTreeMap;

use labmesh_types::{DeviceInfo, Endpoint, HostInfo, LabError, Value};

use super::{SERVER_PUB_PORT, SERVER_REQ_PORT};
use crate::interface::DeviceInterface;

crate::remote_interface! {
    /// Blocking proxy of the orchestrator running on one host.
    pub struct OrchestratorClient {
        /// Every host ever seen, this one included as `localhost`.
        fn get_hosts() -> BTreeMap<String, HostInfo>;
        fn get_local_devices() -> Vec<DeviceInfo>;
        /// Local devices plus those advertised by connected peers.
        fn get_devices() -> Vec<DeviceInfo>;
        fn get_device_types() -> Vec<String>;
        /// `host = None` starts the device on the orchestrator's own host.
        fn start_device(device_type: &str, host: Option<&str>, args: Value, name: Option<&str>) -> DeviceInfo;
        fn stop_device(name: &str, host: Option<&str>) -> Value;
    }
}

impl OrchestratorClient {
    /// Client of the orchestrator on `host`, at the well-known ports.
    pub fn connect(host: &str) -> Self {
        Self::new(Endpoint::new(host, SERVER_REQ_PORT, SERVER_PUB_PORT))
    }

    /// Proxy of `device`, wherever it runs.
    ///
    /// The device's host name is resolved through [`get_hosts`]; devices on
    /// the orchestrator's own host are reached at the address this client
    /// already uses.
    ///
    /// [`get_hosts`]: Self::get_hosts
    pub fn proxy_for(&mut self, device: &DeviceInfo) -> Result<DeviceInterface, LabError> {
        let hosts = self.get_hosts()?;
        let host = hosts
            .get(&device.host)
            .ok_or_else(|| LabError::UnknownHost(device.host.clone()))?;
        let address = if host.address == "localhost" {
            self.endpoint().host.clone()
        } else {
            host.address.clone()
        };
        Ok(DeviceInterface::with_timeout(
            Endpoint::new(address, device.req_port, device.pub_port),
            self.timeout(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_targets_the_well_known_ports() {
        let client = OrchestratorClient::connect("lab-pc");
        assert_eq!(client.endpoint(), &Endpoint::new("lab-pc", 23413, 23412));
        assert!(OrchestratorClient::METHODS.contains(&"start_device"));
    }
}
