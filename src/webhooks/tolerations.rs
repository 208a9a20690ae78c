//! Default toleration injection.
//!
//! Pods that do not tolerate the `node.kubernetes.io/not-ready` and
//! `node.kubernetes.io/unreachable` NoExecute taints get the missing
//! defaults appended. Existing entries with a matching key are never
//! touched, whatever their operator, effect or seconds.
//!
//! The patch is always a single operation on the whole
//! `/spec/tolerations` list, so it never depends on element indices.

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation, ReplaceOperation};
use k8s_openapi::api::core::v1::{Pod, Toleration};

use crate::config::{TolerationConfig, WorkloadSelector};
use crate::error::{Error, Result};

/// Taint added by the node lifecycle controller when a node is not ready
pub const NOT_READY_TAINT_KEY: &str = "node.kubernetes.io/not-ready";
/// Taint added by the node lifecycle controller when a node is unreachable
pub const UNREACHABLE_TAINT_KEY: &str = "node.kubernetes.io/unreachable";

/// JSON pointer of the pod tolerations list
pub const TOLERATIONS_PATH: &str = "/spec/tolerations";

const OPERATOR_EXISTS: &str = "Exists";
const EFFECT_NO_EXECUTE: &str = "NoExecute";

/// Check whether any toleration has exactly this key
pub fn has_toleration(tolerations: &[Toleration], key: &str) -> bool {
    tolerations.iter().any(|t| t.key.as_deref() == Some(key))
}

/// Build an `Exists`/`NoExecute` toleration for a taint key
pub fn default_toleration(key: &str, seconds: i64) -> Toleration {
    Toleration {
        key: Some(key.to_string()),
        operator: Some(OPERATOR_EXISTS.to_string()),
        effect: Some(EFFECT_NO_EXECUTE.to_string()),
        toleration_seconds: Some(seconds),
        value: None,
    }
}

/// Mutation is required unless both taint keys are already tolerated
pub fn mutation_required(tolerations: &[Toleration]) -> bool {
    !has_toleration(tolerations, NOT_READY_TAINT_KEY)
        || !has_toleration(tolerations, UNREACHABLE_TAINT_KEY)
}

/// Tolerations currently set on the pod, empty when the field is absent
pub fn pod_tolerations(pod: &Pod) -> &[Toleration] {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.tolerations.as_deref())
        .unwrap_or_default()
}

/// Result of evaluating a pod
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Both taints are already tolerated
    Unchanged,
    /// Pod is outside the selected workload class
    Skipped,
    /// Tolerations must be added or replaced
    Patch(Patch),
}

impl Mutation {
    /// Label used for metrics
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Mutation::Patch(patch) => Some(patch_op(patch)),
            Mutation::Unchanged | Mutation::Skipped => None,
        }
    }
}

/// Name of the operation a toleration patch performs
pub fn patch_op(patch: &Patch) -> &'static str {
    match patch.0.first() {
        Some(PatchOperation::Add(_)) => "add",
        Some(PatchOperation::Replace(_)) => "replace",
        _ => "other",
    }
}

/// Decides and builds the toleration patch for a pod.
///
/// Holds only the startup configuration, so one instance is shared by
/// all requests.
#[derive(Clone, Debug, Default)]
pub struct TolerationMutator {
    config: TolerationConfig,
    selector: Option<WorkloadSelector>,
}

impl TolerationMutator {
    pub fn new(config: TolerationConfig) -> Self {
        Self {
            config,
            selector: None,
        }
    }

    /// Restrict mutation to pods matching the selector
    #[must_use]
    pub fn with_selector(mut self, selector: Option<WorkloadSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &TolerationConfig {
        &self.config
    }

    pub fn not_ready_toleration(&self) -> Toleration {
        default_toleration(NOT_READY_TAINT_KEY, self.config.not_ready_seconds)
    }

    pub fn unreachable_toleration(&self) -> Toleration {
        default_toleration(UNREACHABLE_TAINT_KEY, self.config.unreachable_seconds)
    }

    /// Both defaults, not-ready first
    pub fn default_tolerations(&self) -> Vec<Toleration> {
        vec![self.not_ready_toleration(), self.unreachable_toleration()]
    }

    /// Existing tolerations followed by whichever defaults are missing
    pub fn merged_tolerations(&self, existing: &[Toleration]) -> Vec<Toleration> {
        let mut merged = existing.to_vec();
        if !has_toleration(existing, NOT_READY_TAINT_KEY) {
            merged.push(self.not_ready_toleration());
        }
        if !has_toleration(existing, UNREACHABLE_TAINT_KEY) {
            merged.push(self.unreachable_toleration());
        }
        merged
    }

    /// Evaluate a pod and build the patch if it needs one
    pub fn mutate(&self, pod: &Pod) -> Result<Mutation> {
        if let Some(selector) = &self.selector {
            if !selector.matches(pod) {
                return Ok(Mutation::Skipped);
            }
        }

        // `/spec/tolerations` can only be added under an existing spec
        if pod.spec.is_none() {
            return Err(Error::InvalidPodPayload("pod has no spec".to_string()));
        }

        let existing = pod_tolerations(pod);
        if !mutation_required(existing) {
            return Ok(Mutation::Unchanged);
        }

        let path = PointerBuf::parse(TOLERATIONS_PATH)
            .map_err(|e| Error::PatchEncode(e.to_string()))?;

        let operation = if existing.is_empty() {
            PatchOperation::Add(AddOperation {
                path,
                value: to_value(&self.default_tolerations())?,
            })
        } else {
            PatchOperation::Replace(ReplaceOperation {
                path,
                value: to_value(&self.merged_tolerations(existing))?,
            })
        };

        Ok(Mutation::Patch(Patch(vec![operation])))
    }
}

fn to_value(tolerations: &[Toleration]) -> Result<serde_json::Value> {
    serde_json::to_value(tolerations).map_err(|e| Error::PatchEncode(e.to_string()))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn toleration(key: &str) -> Toleration {
        Toleration {
            key: Some(key.to_string()),
            operator: Some("Equal".to_string()),
            value: Some("true".to_string()),
            effect: Some("NoSchedule".to_string()),
            toleration_seconds: None,
        }
    }

    fn pod_with(tolerations: Option<Vec<Toleration>>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("virt-launcher-vm-abcde".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                tolerations,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn mutator(not_ready: i64, unreachable: i64) -> TolerationMutator {
        TolerationMutator::new(TolerationConfig {
            not_ready_seconds: not_ready,
            unreachable_seconds: unreachable,
        })
    }

    fn single_op(mutation: Mutation) -> PatchOperation {
        match mutation {
            Mutation::Patch(patch) => {
                assert_eq!(patch.0.len(), 1, "patch must hold a single operation");
                patch.0.into_iter().next().unwrap()
            }
            other => panic!("expected a patch, got {:?}", other),
        }
    }

    #[test]
    fn test_has_toleration_exact_key() {
        let tolerations = vec![toleration(NOT_READY_TAINT_KEY)];
        assert!(has_toleration(&tolerations, NOT_READY_TAINT_KEY));
        assert!(!has_toleration(&tolerations, UNREACHABLE_TAINT_KEY));
        assert!(!has_toleration(&tolerations, "node.kubernetes.io"));
        assert!(!has_toleration(&[], NOT_READY_TAINT_KEY));
    }

    #[test]
    fn test_default_toleration_fields() {
        let t = default_toleration(UNREACHABLE_TAINT_KEY, 42);
        assert_eq!(t.key.as_deref(), Some(UNREACHABLE_TAINT_KEY));
        assert_eq!(t.operator.as_deref(), Some("Exists"));
        assert_eq!(t.effect.as_deref(), Some("NoExecute"));
        assert_eq!(t.toleration_seconds, Some(42));
        assert!(t.value.is_none());
    }

    #[test]
    fn test_each_default_uses_its_own_key() {
        let defaults = mutator(1, 2).default_tolerations();
        assert_eq!(defaults[0].key.as_deref(), Some(NOT_READY_TAINT_KEY));
        assert_eq!(defaults[1].key.as_deref(), Some(UNREACHABLE_TAINT_KEY));
    }

    #[test]
    fn test_mutation_required() {
        assert!(mutation_required(&[]));
        assert!(mutation_required(&[toleration(NOT_READY_TAINT_KEY)]));
        assert!(mutation_required(&[toleration(UNREACHABLE_TAINT_KEY)]));
        assert!(!mutation_required(&[
            toleration(UNREACHABLE_TAINT_KEY),
            toleration(NOT_READY_TAINT_KEY),
        ]));
    }

    #[test]
    fn test_no_tolerations_adds_both_defaults() {
        let op = single_op(mutator(100, 200).mutate(&pod_with(None)).unwrap());
        let PatchOperation::Add(add) = op else {
            panic!("expected add, got {:?}", op);
        };
        assert_eq!(add.path.as_str(), TOLERATIONS_PATH);
        assert_eq!(
            add.value,
            json!([
                {
                    "key": NOT_READY_TAINT_KEY,
                    "operator": "Exists",
                    "effect": "NoExecute",
                    "tolerationSeconds": 100
                },
                {
                    "key": UNREACHABLE_TAINT_KEY,
                    "operator": "Exists",
                    "effect": "NoExecute",
                    "tolerationSeconds": 200
                }
            ])
        );
    }

    #[test]
    fn test_empty_tolerations_list_uses_add() {
        let op = single_op(mutator(300, 300).mutate(&pod_with(Some(vec![]))).unwrap());
        assert!(matches!(op, PatchOperation::Add(_)));
    }

    #[test]
    fn test_pod_without_spec_is_invalid() {
        let pod = Pod {
            spec: None,
            ..Default::default()
        };
        let err = mutator(300, 300).mutate(&pod).unwrap_err();
        assert!(matches!(err, Error::InvalidPodPayload(_)));
    }

    #[test]
    fn test_add_applies_to_pod_with_empty_spec() {
        let pod = Pod {
            spec: Some(PodSpec::default()),
            ..Default::default()
        };
        let Mutation::Patch(patch) = mutator(300, 300).mutate(&pod).unwrap() else {
            panic!("expected a patch");
        };
        let mut doc = serde_json::to_value(&pod).unwrap();
        json_patch::patch(&mut doc, &patch.0).unwrap();
        let patched: Pod = serde_json::from_value(doc).unwrap();
        assert_eq!(pod_tolerations(&patched).len(), 2);
    }

    #[test]
    fn test_missing_unreachable_appends_and_replaces() {
        let existing = vec![toleration("dedicated"), toleration(NOT_READY_TAINT_KEY)];
        let op = single_op(
            mutator(300, 60)
                .mutate(&pod_with(Some(existing.clone())))
                .unwrap(),
        );
        let PatchOperation::Replace(replace) = op else {
            panic!("expected replace, got {:?}", op);
        };
        assert_eq!(replace.path.as_str(), TOLERATIONS_PATH);

        let value: Vec<Toleration> = serde_json::from_value(replace.value).unwrap();
        assert_eq!(value.len(), 3);
        assert_eq!(&value[..2], existing.as_slice());
        assert_eq!(value[2], default_toleration(UNREACHABLE_TAINT_KEY, 60));
    }

    #[test]
    fn test_missing_both_with_existing_appends_in_order() {
        let existing = vec![toleration("gpu")];
        let merged = mutator(10, 20).merged_tolerations(&existing);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], existing[0]);
        assert_eq!(merged[1].key.as_deref(), Some(NOT_READY_TAINT_KEY));
        assert_eq!(merged[2].key.as_deref(), Some(UNREACHABLE_TAINT_KEY));
    }

    #[test]
    fn test_existing_entries_not_revalidated() {
        // NoSchedule with no seconds still counts as present
        let pod = pod_with(Some(vec![
            toleration(NOT_READY_TAINT_KEY),
            toleration(UNREACHABLE_TAINT_KEY),
        ]));
        assert!(matches!(
            mutator(300, 300).mutate(&pod).unwrap(),
            Mutation::Unchanged
        ));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let m = mutator(100, 200);
        for tolerations in [
            None,
            Some(vec![]),
            Some(vec![toleration("dedicated")]),
            Some(vec![toleration(UNREACHABLE_TAINT_KEY)]),
        ] {
            let pod = pod_with(tolerations);
            let Mutation::Patch(patch) = m.mutate(&pod).unwrap() else {
                panic!("expected a patch");
            };

            let mut doc = serde_json::to_value(&pod).unwrap();
            json_patch::patch(&mut doc, &patch.0).unwrap();
            let patched: Pod = serde_json::from_value(doc).unwrap();

            assert!(!mutation_required(pod_tolerations(&patched)));
            assert!(matches!(m.mutate(&patched).unwrap(), Mutation::Unchanged));
        }
    }

    #[test]
    fn test_selector_skips_other_workloads() {
        let m = mutator(300, 300).with_selector(Some(WorkloadSelector::new(
            "kubevirt.io",
            "virt-launcher",
        )));

        let mut pod = pod_with(None);
        assert!(matches!(m.mutate(&pod).unwrap(), Mutation::Skipped));

        pod.metadata.labels = Some(BTreeMap::from([(
            "kubevirt.io".to_string(),
            "virt-launcher".to_string(),
        )]));
        assert!(matches!(m.mutate(&pod).unwrap(), Mutation::Patch(_)));
    }

    #[test]
    fn test_mutation_op_label() {
        let m = mutator(300, 300);
        assert_eq!(m.mutate(&pod_with(None)).unwrap().op(), Some("add"));
        assert_eq!(
            m.mutate(&pod_with(Some(vec![toleration("x")])))
                .unwrap()
                .op(),
            Some("replace")
        );
        assert_eq!(Mutation::Unchanged.op(), None);
    }
}
