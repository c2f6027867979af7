//! Property test for invariant 3 (spec.md §8 "CAS safety"): a `cas` call
//! only applies when the caller's `expected` matches the value actually
//! stored, and a losing caller always sees the real current value back,
//! never a silently-applied write.

use conductor_core::kv::{CasOutcome, SledKvStore};
use conductor_core::KvStore;
use proptest::prelude::*;

fn store() -> SledKvStore {
    SledKvStore::open_temporary("proptest").unwrap()
}

proptest! {
    #[test]
    fn cas_applies_only_on_matching_expected(
        initial in prop::collection::vec(any::<u8>(), 0..32),
        wrong_guess in prop::collection::vec(any::<u8>(), 0..32),
        new_value in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        prop_assume!(wrong_guess != initial);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let kv = store();
            kv.set("k", initial.clone(), None).await.unwrap();

            // A caller guessing the wrong current value never applies,
            // and is told the real current value.
            let miss = kv.cas("k", Some(wrong_guess), new_value.clone(), None).await.unwrap();
            match miss {
                CasOutcome::NotApplied { current } => {
                    prop_assert_eq!(current, Some(initial.clone()));
                }
                CasOutcome::Applied => prop_assert!(false, "cas applied against a mismatched expected value"),
            }
            let unchanged = kv.get("k").await.unwrap();
            prop_assert_eq!(unchanged, Some(initial.clone()));

            // The correct guess applies exactly once.
            let hit = kv.cas("k", Some(initial.clone()), new_value.clone(), None).await.unwrap();
            prop_assert_eq!(hit, CasOutcome::Applied);
            let after = kv.get("k").await.unwrap();
            prop_assert_eq!(after, Some(new_value.clone()));

            // Replaying the same (now stale) expected value no longer applies.
            let replay = kv.cas("k", Some(initial), new_value, None).await.unwrap();
            prop_assert!(matches!(replay, CasOutcome::NotApplied { .. }));
            Ok(())
        })?;
    }

    #[test]
    fn cas_with_absent_expectation_only_applies_to_a_missing_key(
        value_a in prop::collection::vec(any::<u8>(), 0..32),
        value_b in prop::collection::vec(any::<u8>(), 0..32),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let kv = store();

            let first = kv.cas("fresh", None, value_a.clone(), None).await.unwrap();
            prop_assert_eq!(first, CasOutcome::Applied);

            let second = kv.cas("fresh", None, value_b, None).await.unwrap();
            prop_assert!(matches!(second, CasOutcome::NotApplied { .. }));
            let unchanged = kv.get("fresh").await.unwrap();
            prop_assert_eq!(unchanged, Some(value_a));
            Ok(())
        })?;
    }
}
