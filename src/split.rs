use std::collections::BTreeSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

use crate::enums::Subset;

/// Train/test membership of every case in the dataset.
///
/// Cases converted by an earlier run keep their subset; only pending
/// cases are drawn, enough to bring the test set up to its quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub train: BTreeSet<String>,
    pub test: BTreeSet<String>,
}

impl SplitPlan {
    pub fn new(
        pending: &[String],
        converted_train: &BTreeSet<String>,
        converted_test: &BTreeSet<String>,
        test_fraction: f64,
        seed: Option<u64>,
    ) -> Self {
        let total = pending.len() + converted_train.len() + converted_test.len();
        // halves go to the even count
        let n_test = (total as f64 * test_fraction).round_ties_even() as usize;
        let missing = n_test
            .saturating_sub(converted_test.len())
            .min(pending.len());

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let drawn: BTreeSet<String> = pending
            .choose_multiple(&mut rng, missing)
            .cloned()
            .collect();

        let mut test = converted_test.clone();
        test.extend(drawn.iter().cloned());
        let mut train = converted_train.clone();
        train.extend(pending.iter().filter(|id| !drawn.contains(*id)).cloned());

        Self { train, test }
    }

    pub fn subset_of(&self, case_id: &str) -> Option<Subset> {
        if self.test.contains(case_id) {
            Some(Subset::Test)
        } else if self.train.contains(case_id) {
            Some(Subset::Train)
        } else {
            None
        }
    }

    /// Training images for the dataset manifest.
    pub fn num_training(&self, phases_per_case: usize) -> usize {
        self.train.len() * phases_per_case
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn test_fresh_split_sizes() {
        let pending = ids("P", 10);
        let plan = SplitPlan::new(&pending, &BTreeSet::new(), &BTreeSet::new(), 0.4, Some(1));
        assert_eq!(plan.test.len(), 4);
        assert_eq!(plan.train.len(), 6);
        assert!(plan.train.is_disjoint(&plan.test));
        for id in &pending {
            assert!(plan.subset_of(id).is_some());
        }
        assert_eq!(plan.num_training(2), 12);
    }

    #[test]
    fn test_seeded_split_is_reproducible() {
        let pending = ids("P", 20);
        let a = SplitPlan::new(&pending, &BTreeSet::new(), &BTreeSet::new(), 0.3, Some(9));
        let b = SplitPlan::new(&pending, &BTreeSet::new(), &BTreeSet::new(), 0.3, Some(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_converted_cases_keep_their_subset() {
        let pending = ids("P", 6);
        let train: BTreeSet<String> = ids("T", 3).into_iter().collect();
        let test: BTreeSet<String> = ids("S", 1).into_iter().collect();
        // total 10, quota 4, one already held out
        let plan = SplitPlan::new(&pending, &train, &test, 0.4, Some(3));
        assert_eq!(plan.test.len(), 4);
        assert!(plan.test.contains("S0"));
        assert!(train.iter().all(|id| plan.subset_of(id) == Some(Subset::Train)));
        assert_eq!(plan.train.len(), 6);
    }

    #[test]
    fn test_half_quota_rounds_to_even() {
        let pending = ids("P", 5);
        let plan = SplitPlan::new(&pending, &BTreeSet::new(), &BTreeSet::new(), 0.5, Some(4));
        assert_eq!(plan.test.len(), 2);
        assert_eq!(plan.train.len(), 3);

        let pending = ids("P", 7);
        let plan = SplitPlan::new(&pending, &BTreeSet::new(), &BTreeSet::new(), 0.5, Some(4));
        assert_eq!(plan.test.len(), 4);
    }

    #[test]
    fn test_quota_already_met() {
        let pending = ids("P", 2);
        let test: BTreeSet<String> = ids("S", 5).into_iter().collect();
        let plan = SplitPlan::new(&pending, &BTreeSet::new(), &test, 0.5, Some(0));
        assert_eq!(plan.test.len(), 5);
        assert!(pending.iter().all(|id| plan.subset_of(id) == Some(Subset::Train)));
    }
}
