//! [`HostTable`] – peer hosts seen on the discovery channel.
//!
//! Records are created on the first announcement from a hostname, refreshed
//! on every later one and never removed.  Whether a host is connected is not
//! stored anywhere: it is derived on read from the time since its last
//! announcement, so a host that goes quiet degrades to disconnected without
//! any explicit event.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use labmesh_types::LabError;

/// One peer host.  `handle` is whatever the owner keeps per peer (an
/// interface and a subscription in the orchestrator).
#[derive(Debug)]
pub struct HostRecord<H> {
    pub hostname: String,
    pub address: String,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    pub handle: H,
}

impl<H> HostRecord<H> {
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Wall-clock time of the last announcement, for reporting.
    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_seen_at
    }

    /// `last_seen + timeout > now`.
    pub fn is_connected(&self, timeout: Duration, now: Instant) -> bool {
        self.last_seen + timeout > now
    }
}

/// What one announcement changed in the table.
#[derive(Debug)]
pub enum Observed<H> {
    /// First announcement from this hostname.
    New,
    /// Known host at its known address.
    Seen,
    /// Known host at a new address.  `previous` is the handle built for the
    /// old address.
    Moved { from: String, previous: H },
}

/// Host records keyed by hostname.
#[derive(Debug)]
pub struct HostTable<H> {
    timeout: Duration,
    hosts: BTreeMap<String, HostRecord<H>>,
}

impl<H> HostTable<H> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            hosts: BTreeMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record an announcement from `hostname` at `address`.
    ///
    /// Unknown hosts get a new record whose handle is built by `connect`.
    /// A known host announcing from a new address gets a fresh handle too,
    /// and the old one is returned in [`Observed::Moved`] for the owner to
    /// tear down.  If `connect` fails the table is left as it was and the
    /// next announcement tries again.
    pub fn observe<F>(
        &mut self,
        hostname: &str,
        address: &str,
        now: Instant,
        connect: F,
    ) -> Result<Observed<H>, LabError>
    where
        F: FnOnce(&str, &str) -> Result<H, LabError>,
    {
        if let Some(record) = self.hosts.get_mut(hostname) {
            let outcome = if record.address == address {
                Observed::Seen
            } else {
                let handle = connect(hostname, address)?;
                Observed::Moved {
                    from: std::mem::replace(&mut record.address, address.to_string()),
                    previous: std::mem::replace(&mut record.handle, handle),
                }
            };
            record.last_seen = now;
            record.last_seen_at = Utc::now();
            return Ok(outcome);
        }
        let handle = connect(hostname, address)?;
        self.hosts.insert(
            hostname.to_string(),
            HostRecord {
                hostname: hostname.to_string(),
                address: address.to_string(),
                last_seen: now,
                last_seen_at: Utc::now(),
                handle,
            },
        );
        Ok(Observed::New)
    }

    pub fn get(&self, hostname: &str) -> Option<&HostRecord<H>> {
        self.hosts.get(hostname)
    }

    pub fn get_mut(&mut self, hostname: &str) -> Option<&mut HostRecord<H>> {
        self.hosts.get_mut(hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.hosts.contains_key(hostname)
    }

    /// `false` for unknown hosts.
    pub fn is_connected(&self, hostname: &str, now: Instant) -> bool {
        self.hosts
            .get(hostname)
            .is_some_and(|r| r.is_connected(self.timeout, now))
    }

    /// All records, sorted by hostname.
    pub fn iter(&self) -> impl Iterator<Item = &HostRecord<H>> {
        self.hosts.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HostRecord<H>> {
        self.hosts.values_mut()
    }

    /// Records whose host is currently considered connected.
    pub fn connected(&self, now: Instant) -> impl Iterator<Item = &HostRecord<H>> {
        let timeout = self.timeout;
        self.hosts.values().filter(move |r| r.is_connected(timeout, now))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(3);

    #[test]
    fn first_announcement_creates_and_connects() -> Result<(), LabError> {
        let mut table = HostTable::new(TIMEOUT);
        let t0 = Instant::now();
        let mut connects = 0;
        let observed = table.observe("rover-pi", "10.0.0.7", t0, |_, _| {
            connects += 1;
            Ok(())
        })?;
        assert!(matches!(observed, Observed::New));
        assert!(table.is_connected("rover-pi", t0));
        assert_eq!(connects, 1);
        Ok(())
    }

    #[test]
    fn repeated_announcements_only_refresh() -> Result<(), LabError> {
        let mut table = HostTable::new(TIMEOUT);
        let t0 = Instant::now();
        table.observe("lab", "10.0.0.2", t0, |_, addr| Ok(addr.to_string()))?;
        let later = t0 + Duration::from_secs(2);
        let observed = table.observe("lab", "10.0.0.2", later, |_, _| {
            Err(LabError::UnknownHost("should not reconnect".into()))
        })?;
        assert!(matches!(observed, Observed::Seen));
        let record = table.get("lab").ok_or(LabError::UnknownHost("lab".into()))?;
        assert_eq!(record.last_seen(), later);
        assert_eq!(record.handle, "10.0.0.2");
        assert_eq!(table.len(), 1);
        Ok(())
    }

    #[test]
    fn new_address_rebuilds_the_handle() -> Result<(), LabError> {
        let mut table = HostTable::new(TIMEOUT);
        let t0 = Instant::now();
        table.observe("lab", "10.0.0.2", t0, |_, addr| Ok(addr.to_string()))?;

        let observed = table.observe("lab", "10.0.0.9", t0 + Duration::from_secs(1), |_, addr| {
            Ok(addr.to_string())
        })?;
        match observed {
            Observed::Moved { from, previous } => {
                assert_eq!(from, "10.0.0.2");
                assert_eq!(previous, "10.0.0.2");
            }
            other => panic!("expected a move, got {other:?}"),
        }
        let record = table.get("lab").ok_or(LabError::UnknownHost("lab".into()))?;
        assert_eq!(record.address, "10.0.0.9");
        assert_eq!(record.handle, "10.0.0.9");
        assert_eq!(table.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_reconnect_keeps_the_old_record() -> Result<(), LabError> {
        let mut table = HostTable::new(TIMEOUT);
        let t0 = Instant::now();
        table.observe("lab", "10.0.0.2", t0, |_, addr| Ok(addr.to_string()))?;
        let moved = table.observe("lab", "10.0.0.9", t0 + Duration::from_secs(1), |h, _| {
            Err(LabError::UnknownHost(h.to_string()))
        });
        assert!(moved.is_err());
        let record = table.get("lab").ok_or(LabError::UnknownHost("lab".into()))?;
        assert_eq!((record.address.as_str(), record.handle.as_str()), ("10.0.0.2", "10.0.0.2"));
        assert_eq!(record.last_seen(), t0);
        Ok(())
    }

    #[test]
    fn silent_host_becomes_disconnected_and_recovers() -> Result<(), LabError> {
        let mut table = HostTable::new(TIMEOUT);
        let t0 = Instant::now();
        table.observe("cam", "10.0.0.3", t0, |_, _| Ok(()))?;

        assert!(table.is_connected("cam", t0 + Duration::from_millis(2900)));
        assert!(!table.is_connected("cam", t0 + TIMEOUT));
        assert_eq!(table.connected(t0 + Duration::from_secs(5)).count(), 0);
        // Still listed; records are never dropped.
        assert!(table.contains("cam"));

        table.observe("cam", "10.0.0.3", t0 + Duration::from_secs(10), |_, _| Ok(()))?;
        assert!(table.is_connected("cam", t0 + Duration::from_secs(10)));
        Ok(())
    }

    #[test]
    fn failed_connect_leaves_no_record() {
        let mut table: HostTable<()> = HostTable::new(TIMEOUT);
        let result = table.observe("ghost", "10.0.0.4", Instant::now(), |h, _| {
            Err(LabError::UnknownHost(h.to_string()))
        });
        assert!(result.is_err());
        assert!(table.is_empty());
        assert!(!table.is_connected("ghost", Instant::now()));
    }
}
