use std::collections::HashMap;
use std::sync::Arc;

use chat_core::LoadReport;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no chat servers have registered")]
    NoServersAvailable,
}

/// What a report did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Inserted,
    Updated { previous: u32 },
}

/// Last-reported load per relay address.
///
/// Reports are applied in arrival order with no sequencing, so a delayed
/// report can overwrite a newer one. Entries are never expired.
#[derive(Clone, Default)]
pub struct RoutingRegistry {
    servers: Arc<RwLock<HashMap<String, u32>>>,
}

impl RoutingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_load(&self, report: LoadReport) -> ReportOutcome {
        let previous = self.servers.write().insert(report.address, report.load);
        match previous {
            Some(previous) => ReportOutcome::Updated { previous },
            None => ReportOutcome::Inserted,
        }
    }

    /// Linear scan for the minimum load; ties fall to map iteration order.
    pub fn select_best(&self) -> Result<LoadReport, RoutingError> {
        let guard = self.servers.read();
        guard
            .iter()
            .min_by_key(|(_, load)| **load)
            .map(|(address, load)| LoadReport::new(address.clone(), *load))
            .ok_or(RoutingError::NoServersAvailable)
    }

    pub fn snapshot(&self) -> Vec<LoadReport> {
        let mut entries: Vec<LoadReport> = self
            .servers
            .read()
            .iter()
            .map(|(address, load)| LoadReport::new(address.clone(), *load))
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(entries: &[(&str, u32)]) -> RoutingRegistry {
        let registry = RoutingRegistry::new();
        for (address, load) in entries {
            registry.report_load(LoadReport::new(*address, *load));
        }
        registry
    }

    #[test_timeout::timeout]
    fn selects_least_loaded() {
        let registry = registry_with(&[("a", 3), ("b", 1), ("c", 5)]);
        assert_eq!(registry.select_best().unwrap(), LoadReport::new("b", 1));
    }

    #[test_timeout::timeout]
    fn empty_registry_is_unavailable() {
        let registry = RoutingRegistry::new();
        assert_eq!(
            registry.select_best(),
            Err(RoutingError::NoServersAvailable)
        );
    }

    #[test_timeout::timeout]
    fn ties_pick_one_of_the_tied_entries() {
        let registry = registry_with(&[("a", 2), ("b", 2)]);
        for _ in 0..32 {
            let best = registry.select_best().expect("tie must not fail");
            assert!(best.address == "a" || best.address == "b");
            assert_eq!(best.load, 2);
        }
    }

    #[test_timeout::timeout]
    fn last_report_wins_even_when_stale() {
        let registry = RoutingRegistry::new();
        assert_eq!(
            registry.report_load(LoadReport::new("a", 0)),
            ReportOutcome::Inserted
        );
        registry.report_load(LoadReport::new("a", 7));
        // A delayed report carrying an older value still overwrites.
        assert_eq!(
            registry.report_load(LoadReport::new("a", 2)),
            ReportOutcome::Updated { previous: 7 }
        );
        assert_eq!(registry.snapshot(), vec![LoadReport::new("a", 2)]);
    }

    #[test_timeout::timeout]
    fn selection_follows_load_changes() {
        let registry = registry_with(&[("a", 0), ("b", 0)]);
        registry.report_load(LoadReport::new("a", 4));
        assert_eq!(registry.select_best().unwrap().address, "b");
        registry.report_load(LoadReport::new("b", 9));
        assert_eq!(registry.select_best().unwrap().address, "a");
        assert_eq!(registry.len(), 2);
    }

    #[test_timeout::timeout]
    fn concurrent_reports_keep_one_entry_per_address() {
        let registry = RoutingRegistry::new();
        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for load in 0..100u32 {
                        registry.report_load(LoadReport::new(format!("s{}", worker % 4), load));
                        let _ = registry.select_best();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
        assert!(registry.snapshot().iter().all(|entry| entry.load == 99));
    }
}
