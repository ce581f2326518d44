//! Pluggable veto over pod evictions
//!
//! Admission is consulted in priority order, after the eviction budget,
//! so an implementation enforcing a global disruption cap serves the most
//! important pods first.

use crate::models::{PodSnapshot, RecommendedPodResources, VpaId};
use std::collections::BTreeMap;

/// Decides whether a prioritized pod may actually be evicted
pub trait PodEvictionAdmission: Send + Sync {
    /// Called once per updater run with every live pod, grouped by controlling Vpa
    fn loop_init(&mut self, live_pods: &[PodSnapshot], controlled: &BTreeMap<VpaId, Vec<PodSnapshot>>);

    fn admit(&self, pod: &PodSnapshot, recommendation: &RecommendedPodResources) -> bool;

    /// Called at the end of every updater run
    fn clean_up(&mut self);
}

/// Admits every pod
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmitAll;

impl PodEvictionAdmission for AdmitAll {
    fn loop_init(&mut self, _live_pods: &[PodSnapshot], _controlled: &BTreeMap<VpaId, Vec<PodSnapshot>>) {}

    fn admit(&self, _pod: &PodSnapshot, _recommendation: &RecommendedPodResources) -> bool {
        true
    }

    fn clean_up(&mut self) {}
}

/// Admits a pod only if every inner admission does
#[derive(Default)]
pub struct SequentialAdmission {
    admissions: Vec<Box<dyn PodEvictionAdmission>>,
}

impl SequentialAdmission {
    pub fn new(admissions: Vec<Box<dyn PodEvictionAdmission>>) -> Self {
        Self { admissions }
    }

    pub fn push(&mut self, admission: Box<dyn PodEvictionAdmission>) {
        self.admissions.push(admission);
    }
}

impl PodEvictionAdmission for SequentialAdmission {
    fn loop_init(&mut self, live_pods: &[PodSnapshot], controlled: &BTreeMap<VpaId, Vec<PodSnapshot>>) {
        for admission in &mut self.admissions {
            admission.loop_init(live_pods, controlled);
        }
    }

    fn admit(&self, pod: &PodSnapshot, recommendation: &RecommendedPodResources) -> bool {
        self.admissions
            .iter()
            .all(|admission| admission.admit(pod, recommendation))
    }

    fn clean_up(&mut self) {
        for admission in &mut self.admissions {
            admission.clean_up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PodPhase;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DenyNamed {
        name: &'static str,
        inits: Arc<AtomicUsize>,
    }

    impl PodEvictionAdmission for DenyNamed {
        fn loop_init(&mut self, _: &[PodSnapshot], _: &BTreeMap<VpaId, Vec<PodSnapshot>>) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn admit(&self, pod: &PodSnapshot, _: &RecommendedPodResources) -> bool {
            pod.name != self.name
        }

        fn clean_up(&mut self) {}
    }

    fn pod(name: &str) -> PodSnapshot {
        PodSnapshot {
            namespace: "ns".to_string(),
            name: name.to_string(),
            labels: Default::default(),
            phase: PodPhase::Running,
            owner: None,
            start_time: None,
            deletion_timestamp: None,
            containers: Vec::new(),
            container_statuses: Vec::new(),
        }
    }

    #[test]
    fn test_sequential_admission_requires_all() {
        let inits = Arc::new(AtomicUsize::new(0));
        let mut admission = SequentialAdmission::new(vec![
            Box::new(AdmitAll),
            Box::new(DenyNamed {
                name: "a",
                inits: inits.clone(),
            }),
            Box::new(DenyNamed {
                name: "b",
                inits: inits.clone(),
            }),
        ]);
        admission.loop_init(&[], &BTreeMap::new());
        assert_eq!(inits.load(Ordering::SeqCst), 2);

        let recommendation = RecommendedPodResources::default();
        assert!(!admission.admit(&pod("a"), &recommendation));
        assert!(!admission.admit(&pod("b"), &recommendation));
        assert!(admission.admit(&pod("c"), &recommendation));
    }

    #[test]
    fn test_empty_sequence_admits() {
        let admission = SequentialAdmission::default();
        assert!(admission.admit(&pod("a"), &RecommendedPodResources::default()));
    }
}
