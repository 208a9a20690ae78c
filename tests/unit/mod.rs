// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for kube-failover-webhook.
//!
//! These tests run without a cluster or a listener and exercise the
//! public building blocks in isolation.

#[path = "../common/mod.rs"]
mod common;

mod config_tests {
    use std::time::Duration;

    use clap::Parser;
    use kube_failover_webhook::config::{DEFAULT_HEALTH_PORT, DEFAULT_WEBHOOK_PORT};
    use kube_failover_webhook::{Args, TolerationConfig, WorkloadSelector};

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["kube-failover-webhook"]).unwrap();
        assert_eq!(args.webhook_addr().port(), DEFAULT_WEBHOOK_PORT);
        assert_eq!(args.health_addr().port(), DEFAULT_HEALTH_PORT);
        assert_eq!(args.toleration_config(), TolerationConfig::default());
        assert_eq!(args.shutdown_grace_period(), Duration::from_secs(5));
        assert!(args.workload_selector.is_none());
    }

    #[test]
    fn test_args_full_command_line() {
        let args = Args::try_parse_from([
            "kube-failover-webhook",
            "--port",
            "9443",
            "--not-ready-toleration-seconds",
            "45",
            "--unreachable-toleration-seconds",
            "90",
            "--workload-selector",
            "kubevirt.io=virt-launcher",
        ])
        .unwrap();

        assert_eq!(args.webhook_addr().port(), 9443);
        assert_eq!(
            args.toleration_config(),
            TolerationConfig {
                not_ready_seconds: 45,
                unreachable_seconds: 90,
            }
        );
        assert_eq!(
            args.workload_selector,
            Some(WorkloadSelector::new("kubevirt.io", "virt-launcher"))
        );
    }

    #[test]
    fn test_args_rejects_bad_selector() {
        assert!(
            Args::try_parse_from(["kube-failover-webhook", "--workload-selector", "novalue"])
                .is_err()
        );
    }

    #[test]
    fn test_selector_display_round_trips_flag() {
        let selector: WorkloadSelector = "app=db".parse().unwrap();
        assert_eq!(selector.to_string(), "app=db");
    }
}

mod error_tests {
    use axum::http::StatusCode;
    use kube_failover_webhook::Error;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::EmptyBody.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::UnsupportedMediaType("text/plain".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            Error::Decode("eof".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::InvalidPodPayload("bad".into()).status_code(),
            StatusCode::OK
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::EmptyBody.kind(), "EmptyBody");
        assert_eq!(Error::Decode(String::new()).kind(), "DecodeError");
    }
}

mod tolerations_tests {
    use kube_failover_webhook::webhooks::tolerations::{
        default_toleration, has_toleration, mutation_required, pod_tolerations,
    };
    use kube_failover_webhook::webhooks::{
        Mutation, NOT_READY_TAINT_KEY, TOLERATIONS_PATH, UNREACHABLE_TAINT_KEY,
    };
    use kube_failover_webhook::{TolerationConfig, TolerationMutator, WorkloadSelector};

    use crate::common::fixtures::{PodBuilder, custom_failure_toleration, toleration};

    #[test]
    fn test_default_toleration_shape() {
        let t = default_toleration(UNREACHABLE_TAINT_KEY, 42);
        assert_eq!(t.key.as_deref(), Some(UNREACHABLE_TAINT_KEY));
        assert_eq!(t.operator.as_deref(), Some("Exists"));
        assert_eq!(t.effect.as_deref(), Some("NoExecute"));
        assert_eq!(t.toleration_seconds, Some(42));
        assert!(t.value.is_none());
    }

    #[test]
    fn test_has_toleration_matches_key_only() {
        let existing = vec![
            toleration("dedicated"),
            custom_failure_toleration(NOT_READY_TAINT_KEY, 10),
        ];
        assert!(has_toleration(&existing, NOT_READY_TAINT_KEY));
        assert!(!has_toleration(&existing, UNREACHABLE_TAINT_KEY));
    }

    #[test]
    fn test_mutation_required() {
        assert!(mutation_required(&[]));
        assert!(mutation_required(&[toleration("dedicated")]));
        assert!(!mutation_required(&[
            custom_failure_toleration(NOT_READY_TAINT_KEY, 1),
            custom_failure_toleration(UNREACHABLE_TAINT_KEY, 1),
        ]));
    }

    #[test]
    fn test_pod_tolerations_absent_is_empty() {
        let pod = PodBuilder::default().build();
        assert!(pod_tolerations(&pod).is_empty());
    }

    #[test]
    fn test_mutator_uses_distinct_keys() {
        let mutator = TolerationMutator::new(TolerationConfig {
            not_ready_seconds: 1,
            unreachable_seconds: 2,
        });
        let defaults = mutator.default_tolerations();
        assert_eq!(defaults[0].key.as_deref(), Some(NOT_READY_TAINT_KEY));
        assert_eq!(defaults[0].toleration_seconds, Some(1));
        assert_eq!(defaults[1].key.as_deref(), Some(UNREACHABLE_TAINT_KEY));
        assert_eq!(defaults[1].toleration_seconds, Some(2));
    }

    #[test]
    fn test_mutate_add_then_replace() {
        let mutator = TolerationMutator::default();

        let bare = PodBuilder::default().build();
        let mutation = mutator.mutate(&bare).unwrap();
        assert_eq!(mutation.op(), Some("add"));

        let tolerated = PodBuilder::default().toleration(toleration("gpu")).build();
        let Mutation::Patch(patch) = mutator.mutate(&tolerated).unwrap() else {
            panic!("expected a patch");
        };
        assert_eq!(patch.0.len(), 1);
        let value = serde_json::to_value(&patch).unwrap();
        assert_eq!(value[0]["op"], "replace");
        assert_eq!(value[0]["path"], TOLERATIONS_PATH);
    }

    #[test]
    fn test_mutate_selector_skips() {
        let mutator = TolerationMutator::default()
            .with_selector(Some(WorkloadSelector::new("kubevirt.io", "virt-launcher")));
        let pod = PodBuilder::default().label("kubevirt.io", "handler").build();
        assert!(matches!(mutator.mutate(&pod).unwrap(), Mutation::Skipped));
        assert_eq!(Mutation::Skipped.op(), None);
    }
}

mod review_tests {
    use kube_failover_webhook::webhooks::{KubeReviewCodec, Outcome, ReviewCodec};
    use serde_json::Value;

    use crate::common::fixtures::{PodBuilder, ReviewBuilder};

    #[test]
    fn test_codec_allowed_answer_echoes_uid() {
        let body = ReviewBuilder::for_pod(&PodBuilder::default().build())
            .uid("unit-uid")
            .to_bytes();
        let decoded = KubeReviewCodec.decode(&body).unwrap();
        assert!(decoded.pod.is_ok());

        let bytes = KubeReviewCodec
            .encode(Outcome::Allowed, Some(&decoded.id))
            .unwrap();
        let answer: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(answer["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(answer["response"]["uid"], "unit-uid");
        assert_eq!(answer["response"]["allowed"], true);
        assert!(answer["response"].get("patch").is_none());
    }

    #[test]
    fn test_codec_rejection_without_request() {
        let bytes = KubeReviewCodec
            .encode(Outcome::Rejected("broken envelope".into()), None)
            .unwrap();
        let answer: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(answer["response"]["allowed"], false);
        assert_eq!(answer["response"]["status"]["message"], "broken envelope");
    }
}

mod health_tests {
    use kube_failover_webhook::HealthState;

    #[tokio::test]
    async fn test_readiness_toggles() {
        let state = HealthState::new();
        assert!(!state.is_ready().await);
        state.set_ready(true).await;
        assert!(state.is_ready().await);
        state.set_ready(false).await;
        assert!(!state.is_ready().await);
    }

    #[test]
    fn test_metrics_registered() {
        let state = HealthState::new();
        state.metrics.record_admission("unchanged");
        let encoded = state.metrics.encode();
        assert!(encoded.contains("failover_webhook_admission_requests_total"));
        assert!(encoded.contains("failover_webhook_admission_duration_seconds"));
    }
}
