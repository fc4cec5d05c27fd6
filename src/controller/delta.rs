//! Replica set differencing
//!
//! Pure comparison of the declared PVC list against the replicas observed
//! in the cluster. Recomputed from live state on every pass; nothing here
//! is ever cached.

use std::collections::{BTreeMap, BTreeSet};

/// The work a single reconciliation pass has to perform.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaDelta {
    /// Observed replicas whose PVC no longer appears in the document.
    pub to_remove: Vec<String>,
    /// Declared PVCs with no observed replica.
    pub to_add: Vec<String>,
}

impl ReplicaDelta {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Compare desired PVCs against observed replicas (PVC name to pod name).
pub fn replica_delta(desired: &[String], observed: &BTreeMap<String, String>) -> ReplicaDelta {
    let wanted: BTreeSet<&str> = desired.iter().map(String::as_str).collect();

    let to_remove = observed
        .keys()
        .filter(|pvc| !wanted.contains(pvc.as_str()))
        .cloned()
        .collect();

    let to_add = desired
        .iter()
        .filter(|pvc| !observed.contains_key(*pvc))
        .cloned()
        .collect();

    ReplicaDelta { to_remove, to_add }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(pvcs: &[&str]) -> Vec<String> {
        pvcs.iter().map(|p| p.to_string()).collect()
    }

    fn observed(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(pvc, pod)| (pvc.to_string(), pod.to_string()))
            .collect()
    }

    #[test]
    fn test_fresh_deployment_adds_everything() {
        let delta = replica_delta(&desired(&["pvc-a", "pvc-b"]), &BTreeMap::new());
        assert!(delta.to_remove.is_empty());
        assert_eq!(delta.to_add, desired(&["pvc-a", "pvc-b"]));
    }

    #[test]
    fn test_grow_by_one() {
        let delta = replica_delta(
            &desired(&["pvc-a", "pvc-b"]),
            &observed(&[("pvc-a", "inst-a")]),
        );
        assert!(delta.to_remove.is_empty());
        assert_eq!(delta.to_add, desired(&["pvc-b"]));
    }

    #[test]
    fn test_shrink_by_one() {
        let delta = replica_delta(
            &desired(&["pvc-a"]),
            &observed(&[("pvc-a", "inst-a"), ("pvc-b", "inst-b")]),
        );
        assert_eq!(delta.to_remove, desired(&["pvc-b"]));
        assert!(delta.to_add.is_empty());
    }

    #[test]
    fn test_converged_deployment_is_a_no_op() {
        let delta = replica_delta(
            &desired(&["pvc-a", "pvc-b"]),
            &observed(&[("pvc-a", "inst-a"), ("pvc-b", "inst-b")]),
        );
        assert!(delta.is_empty());
    }

    #[test]
    fn test_add_and_remove_are_disjoint_and_cover_symmetric_difference() {
        let want = desired(&["pvc-a", "pvc-c", "pvc-d"]);
        let have = observed(&[("pvc-a", "inst-a"), ("pvc-b", "inst-b")]);

        let delta = replica_delta(&want, &have);

        let adds: BTreeSet<&String> = delta.to_add.iter().collect();
        let removes: BTreeSet<&String> = delta.to_remove.iter().collect();
        assert!(adds.is_disjoint(&removes));

        let wanted: BTreeSet<&String> = want.iter().collect();
        let observed_keys: BTreeSet<&String> = have.keys().collect();
        let symmetric: BTreeSet<&String> = wanted
            .symmetric_difference(&observed_keys)
            .cloned()
            .collect();
        let union: BTreeSet<&String> = adds.union(&removes).cloned().collect();
        assert_eq!(union, symmetric);
    }

    #[test]
    fn test_applying_the_delta_converges_to_empty() {
        let want = desired(&["pvc-a", "pvc-c"]);
        let mut have = observed(&[("pvc-a", "inst-a"), ("pvc-b", "inst-b")]);

        let delta = replica_delta(&want, &have);
        for pvc in &delta.to_remove {
            have.remove(pvc);
        }
        for pvc in &delta.to_add {
            have.insert(pvc.clone(), format!("inst-{pvc}"));
        }

        assert!(replica_delta(&want, &have).is_empty());
    }
}
