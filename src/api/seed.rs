//! Initial anomaly roster served by a fresh reference server.

use crate::model::{Anomaly, AnomalyStatus, ThreatLevel};

pub fn seed_anomalies() -> Vec<Anomaly> {
    let entry = |id: &str, name: &str, threat_level: ThreatLevel, location: &str| Anomaly {
        id: id.to_string(),
        name: name.to_string(),
        threat_level,
        location: location.to_string(),
        status: AnomalyStatus::Active,
    };

    vec![
        entry("1", "Kuchisake-onna", ThreatLevel::High, "Shibuya Crossing"),
        entry("2", "Rokurokubi", ThreatLevel::Medium, "Shinjuku Gyoen"),
        entry("3", "Kappa", ThreatLevel::Low, "Sumida River"),
        entry("4", "Nurarihyon", ThreatLevel::Critical, "Roppongi Hills"),
        entry("5", "Tsukumogami", ThreatLevel::Low, "Akihabara Electric Town"),
        entry("6", "Jorogumo", ThreatLevel::High, "Ueno Park"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_seed_ids_unique_and_active() {
        let seed = seed_anomalies();
        let ids: HashSet<_> = seed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids.len(), seed.len());
        assert!(seed.iter().all(|a| a.status == AnomalyStatus::Active));
    }
}
