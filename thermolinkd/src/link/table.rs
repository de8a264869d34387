use std::time::Duration;
use serde::Serialize;
use tokio::time::Instant;
use shared::types::SecurityMode;
use crate::link::radio::ScannedNetwork;

pub const NETWORK_TABLE_SLOTS: usize = 16;

/// A discovered access point, keyed by SSID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub ssid: String,
    pub bssid: [u8; 6],
    pub rssi: i16,
    pub security_mode: SecurityMode,
    pub last_seen: Instant,
}

impl NetworkRecord {
    pub fn from_scan(network: ScannedNetwork, now: Instant) -> Self {
        Self {
            ssid: network.ssid,
            bssid: network.bssid,
            rssi: network.rssi,
            security_mode: network.security_mode,
            last_seen: now,
        }
    }

    pub fn view(&self, now: Instant) -> NetworkView {
        NetworkView {
            ssid: self.ssid.clone(),
            bssid: self
                .bssid
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":"),
            rssi: self.rssi,
            security_mode: self.security_mode,
            seen_secs_ago: now.saturating_duration_since(self.last_seen).as_secs(),
        }
    }
}

/// Serializable copy of a record for the diagnostics API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkView {
    pub ssid: String,
    pub bssid: String,
    pub rssi: i16,
    pub security_mode: SecurityMode,
    pub seen_secs_ago: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted(NetworkRecord),
    Updated(NetworkRecord),
    /// No free slot; nothing was stored
    Full,
}

/// Fixed-capacity arena of discovered networks. A full table refuses new
/// SSIDs instead of evicting.
#[derive(Debug)]
pub struct NetworkTable {
    slots: [Option<NetworkRecord>; NETWORK_TABLE_SLOTS],
}

impl Default for NetworkTable {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    #[cfg(test)]
    pub fn find(&self, ssid: &str) -> Option<&NetworkRecord> {
        self.slots.iter().flatten().find(|r| r.ssid == ssid)
    }

    /// Overwrite the record with the same SSID, or take the first free slot
    pub fn upsert(&mut self, record: NetworkRecord) -> Upsert {
        if let Some(existing) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|r| r.ssid == record.ssid)
        {
            *existing = record.clone();
            return Upsert::Updated(record);
        }

        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(record.clone());
                Upsert::Inserted(record)
            }
            None => Upsert::Full,
        }
    }

    /// Remove every record unseen for longer than `timeout`, returning them
    pub fn prune(&mut self, now: Instant, timeout: Duration) -> Vec<NetworkRecord> {
        let mut pruned = Vec::new();
        for slot in self.slots.iter_mut() {
            let expired = slot
                .as_ref()
                .is_some_and(|r| now.saturating_duration_since(r.last_seen) > timeout);
            if expired {
                pruned.extend(slot.take());
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ssid: &str, rssi: i16, now: Instant) -> NetworkRecord {
        NetworkRecord {
            ssid: ssid.to_string(),
            bssid: [0x02, 0, 0, 0, 0, 1],
            rssi,
            security_mode: SecurityMode::Wpa2,
            last_seen: now,
        }
    }

    #[test]
    fn test_insert_then_update_in_place() {
        let now = Instant::now();
        let mut table = NetworkTable::new();

        assert!(matches!(table.upsert(record("cellar", -70, now)), Upsert::Inserted(_)));
        assert!(matches!(table.upsert(record("cellar", -40, now)), Upsert::Updated(_)));

        assert_eq!(table.len(), 1);
        assert_eq!(table.find("cellar").unwrap().rssi, -40);
    }

    #[test]
    fn test_full_table_refuses_new_ssid() {
        let now = Instant::now();
        let mut table = NetworkTable::new();
        for i in 0..NETWORK_TABLE_SLOTS {
            assert!(matches!(
                table.upsert(record(&format!("net-{i}"), -50, now)),
                Upsert::Inserted(_)
            ));
        }

        assert_eq!(table.upsert(record("one-too-many", -10, now)), Upsert::Full);
        assert_eq!(table.len(), NETWORK_TABLE_SLOTS);
        assert!(table.find("one-too-many").is_none());
        for i in 0..NETWORK_TABLE_SLOTS {
            assert!(table.find(&format!("net-{i}")).is_some());
        }

        // Known SSIDs still update while full
        assert!(matches!(table.upsert(record("net-3", -20, now)), Upsert::Updated(_)));
    }

    #[test]
    fn test_prune_removes_expired_once() {
        let start = Instant::now();
        let timeout = Duration::from_secs(60);
        let mut table = NetworkTable::new();
        table.upsert(record("old", -60, start));
        table.upsert(record("fresh", -60, start + Duration::from_secs(30)));

        assert!(table.prune(start + Duration::from_secs(60), timeout).is_empty());

        let later = start + Duration::from_secs(61);
        let pruned = table.prune(later, timeout);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].ssid, "old");
        assert!(table.prune(later, timeout).is_empty());

        // Rediscovery after pruning counts as new
        assert!(matches!(table.upsert(record("old", -60, later)), Upsert::Inserted(_)));
    }

    #[test]
    fn test_pruned_slot_is_reusable() {
        let start = Instant::now();
        let mut table = NetworkTable::new();
        for i in 0..NETWORK_TABLE_SLOTS {
            table.upsert(record(&format!("net-{i}"), -50, start));
        }
        table.prune(start + Duration::from_secs(120), Duration::from_secs(60));
        assert!(table.is_empty());
        assert!(matches!(
            table.upsert(record("newcomer", -50, start)),
            Upsert::Inserted(_)
        ));
    }
}
