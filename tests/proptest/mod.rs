// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for kube-failover-webhook.
//!
//! Uses proptest to generate random pods and grace periods and verify the
//! mutation invariants.

#[path = "../common/mod.rs"]
mod common;

use json_patch::PatchOperation;
use k8s_openapi::api::core::v1::{Pod, Toleration};
use proptest::prelude::*;

use kube_failover_webhook::webhooks::tolerations::{has_toleration, mutation_required};
use kube_failover_webhook::webhooks::{
    AdmissionResponse, KubeReviewCodec, Mutation, NOT_READY_TAINT_KEY, Outcome, ReviewCodec,
    UNREACHABLE_TAINT_KEY,
};
use kube_failover_webhook::{TolerationConfig, TolerationMutator};

use common::fixtures::{PodBuilder, ReviewBuilder};

/// Strategy for generating grace periods (0 to one day).
fn grace_seconds() -> impl Strategy<Value = i64> {
    0..=86_400i64
}

/// Strategy for generating toleration keys, biased toward the failure keys.
fn toleration_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(NOT_READY_TAINT_KEY.to_string()),
        Just(UNREACHABLE_TAINT_KEY.to_string()),
        Just("node.kubernetes.io/memory-pressure".to_string()),
        "[a-z]{1,12}(/[a-z]{1,8})?",
    ]
}

/// Strategy for generating a single toleration.
fn any_toleration() -> impl Strategy<Value = Toleration> {
    (
        toleration_key(),
        prop_oneof![Just("Equal"), Just("Exists")],
        prop_oneof![Just("NoSchedule"), Just("NoExecute"), Just("PreferNoSchedule")],
        proptest::option::of(0..=3_600i64),
    )
        .prop_map(|(key, operator, effect, seconds)| Toleration {
            value: (operator == "Equal").then(|| "true".to_string()),
            key: Some(key),
            operator: Some(operator.to_string()),
            effect: Some(effect.to_string()),
            toleration_seconds: seconds,
        })
}

/// Strategy for generating a pod's tolerations (absent, empty or populated).
fn any_tolerations() -> impl Strategy<Value = Option<Vec<Toleration>>> {
    proptest::option::of(proptest::collection::vec(any_toleration(), 0..6))
}

fn pod_with(tolerations: Option<Vec<Toleration>>) -> Pod {
    PodBuilder::default().tolerations(tolerations).build()
}

fn tolerations_of(pod: &Pod) -> Vec<Toleration> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.tolerations.clone())
        .unwrap_or_default()
}

fn apply(pod: &Pod, ops: &[PatchOperation]) -> Pod {
    let mut doc = serde_json::to_value(pod).unwrap();
    json_patch::patch(&mut doc, ops).unwrap();
    serde_json::from_value(doc).unwrap()
}

proptest! {
    /// Property: A patch is emitted exactly when a failure key is missing.
    #[test]
    fn patch_emitted_iff_required(
        tolerations in any_tolerations(),
        not_ready in grace_seconds(),
        unreachable in grace_seconds(),
    ) {
        let mutator = TolerationMutator::new(TolerationConfig {
            not_ready_seconds: not_ready,
            unreachable_seconds: unreachable,
        });
        let pod = pod_with(tolerations.clone());
        let required = mutation_required(tolerations.as_deref().unwrap_or_default());

        match mutator.mutate(&pod).unwrap() {
            Mutation::Patch(patch) => {
                prop_assert!(required);
                prop_assert_eq!(patch.0.len(), 1);
            }
            Mutation::Unchanged => prop_assert!(!required),
            Mutation::Skipped => prop_assert!(false, "no selector configured"),
        }
    }

    /// Property: Applying the patch keeps existing tolerations in order and
    /// appends only the missing defaults.
    #[test]
    fn patch_preserves_existing_order(
        tolerations in any_tolerations(),
        not_ready in grace_seconds(),
        unreachable in grace_seconds(),
    ) {
        let mutator = TolerationMutator::new(TolerationConfig {
            not_ready_seconds: not_ready,
            unreachable_seconds: unreachable,
        });
        let pod = pod_with(tolerations.clone());
        let existing = tolerations.unwrap_or_default();

        if let Mutation::Patch(patch) = mutator.mutate(&pod).unwrap() {
            let patched = tolerations_of(&apply(&pod, &patch.0));
            prop_assert_eq!(&patched[..existing.len()], existing.as_slice());

            let appended = &patched[existing.len()..];
            let missing = usize::from(!has_toleration(&existing, NOT_READY_TAINT_KEY))
                + usize::from(!has_toleration(&existing, UNREACHABLE_TAINT_KEY));
            prop_assert_eq!(appended.len(), missing);
            for toleration in appended {
                let expected = match toleration.key.as_deref() {
                    Some(NOT_READY_TAINT_KEY) => not_ready,
                    Some(UNREACHABLE_TAINT_KEY) => unreachable,
                    other => panic!("unexpected appended key {:?}", other),
                };
                prop_assert_eq!(toleration.toleration_seconds, Some(expected));
                prop_assert_eq!(toleration.operator.as_deref(), Some("Exists"));
                prop_assert_eq!(toleration.effect.as_deref(), Some("NoExecute"));
            }
        }
    }

    /// Property: A patched pod needs no further mutation.
    #[test]
    fn mutation_is_idempotent(
        tolerations in any_tolerations(),
        not_ready in grace_seconds(),
        unreachable in grace_seconds(),
    ) {
        let mutator = TolerationMutator::new(TolerationConfig {
            not_ready_seconds: not_ready,
            unreachable_seconds: unreachable,
        });
        let pod = pod_with(tolerations);
        let pod = match mutator.mutate(&pod).unwrap() {
            Mutation::Patch(patch) => apply(&pod, &patch.0),
            _ => pod,
        };

        prop_assert!(matches!(mutator.mutate(&pod).unwrap(), Mutation::Unchanged));
    }

    /// Property: Every well-formed pod review is allowed and echoes its uid.
    #[test]
    fn review_always_allowed_with_uid(
        tolerations in any_tolerations(),
        uid in "[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}",
    ) {
        let mutator = TolerationMutator::default();
        let pod = pod_with(tolerations);
        let body = ReviewBuilder::for_pod(&pod).uid(&uid).to_bytes();

        let decoded = KubeReviewCodec.decode(&body).unwrap();
        let pod = decoded.pod.unwrap();
        let outcome = match mutator.mutate(&pod).unwrap() {
            Mutation::Patch(patch) => Outcome::Patched(patch),
            Mutation::Unchanged | Mutation::Skipped => Outcome::Allowed,
        };

        let bytes = KubeReviewCodec.encode(outcome, Some(&decoded.id)).unwrap();
        let answer: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let response: AdmissionResponse =
            serde_json::from_value(answer["response"].clone()).unwrap();
        prop_assert_eq!(response.uid, uid);
        prop_assert!(response.allowed);
    }
}
