//! AdmissionReview envelope decoding and encoding.
//!
//! The mutation logic only sees a typed [`Pod`] and answers with an
//! [`Outcome`]; everything about the wire format of the review lives
//! behind [`ReviewCodec`].

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, META_API_VERSION_V1,
    META_API_VERSION_V1BETA1, META_KIND,
};
use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde_json::Value;
use tracing::error;

use crate::error::{Error, Result};

/// Correlation data copied from the request into the response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId {
    /// Request UID the API server matches the answer against
    pub uid: String,
    /// Envelope `apiVersion`/`kind`, echoed in the answer
    pub types: TypeMeta,
    /// Allowing response correlated with the request
    base: AdmissionResponse,
}

impl RequestId {
    fn from_request(request: &AdmissionRequest<DynamicObject>) -> Self {
        Self {
            uid: request.uid.clone(),
            types: request.types.clone(),
            base: AdmissionResponse::from(request),
        }
    }
}

/// A review whose envelope decoded successfully
#[derive(Debug)]
pub struct Decoded {
    pub id: RequestId,
    /// Operation, namespace and name for logging
    pub summary: RequestSummary,
    /// The admitted pod, or why it could not be read
    pub pod: Result<Pod>,
}

/// Request attributes that only matter for logs
#[derive(Clone, Debug, Default)]
pub struct RequestSummary {
    pub operation: String,
    pub namespace: Option<String>,
    pub name: String,
}

/// What to answer the API server with
#[derive(Debug)]
pub enum Outcome {
    /// Admit unchanged
    Allowed,
    /// Admit with a JSON patch
    Patched(Patch),
    /// Not admitted; the message is reported back
    Rejected(String),
}

/// Wire format of the admission review.
///
/// Implementations must be usable from concurrent requests.
pub trait ReviewCodec: Send + Sync {
    /// Decode a request body
    fn decode(&self, body: &[u8]) -> Result<Decoded>;

    /// Encode the answer. `id` is `None` when the request never decoded.
    fn encode(&self, outcome: Outcome, id: Option<&RequestId>) -> Result<Vec<u8>>;
}

/// `admission.k8s.io` v1 and v1beta1 reviews via kube's admission types.
///
/// The answer uses the same `apiVersion` as the request.
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeReviewCodec;

impl KubeReviewCodec {
    fn response_for(outcome: Outcome, id: Option<&RequestId>) -> AdmissionResponse {
        let Some(id) = id else {
            let message = match outcome {
                Outcome::Rejected(message) => message,
                Outcome::Allowed | Outcome::Patched(_) => "missing admission request".to_string(),
            };
            return AdmissionResponse::invalid(message);
        };

        let base = id.base.clone();
        match outcome {
            Outcome::Allowed => base,
            Outcome::Rejected(message) => base.deny(message),
            Outcome::Patched(patch) => match base.clone().with_patch(patch) {
                Ok(res) => res,
                Err(e) => {
                    let err = Error::from(e);
                    error!(uid = %id.uid, error = %err, "Failed to encode patch");
                    base.deny(err.to_string())
                }
            },
        }
    }
}

impl ReviewCodec for KubeReviewCodec {
    fn decode(&self, body: &[u8]) -> Result<Decoded> {
        let mut envelope: Value =
            serde_json::from_slice(body).map_err(|e| Error::Decode(e.to_string()))?;

        // Objects are parsed on their own so a bad pod keeps the request uid
        let object = envelope.pointer_mut("/request/object").map(Value::take);
        if let Some(old_object) = envelope.pointer_mut("/request/oldObject") {
            old_object.take();
        }

        let review: AdmissionReview<DynamicObject> =
            serde_json::from_value(envelope).map_err(|e| Error::Decode(e.to_string()))?;
        check_types(&review.types)?;

        let request: AdmissionRequest<DynamicObject> = review
            .try_into()
            .map_err(|e: kube::core::admission::ConvertAdmissionReviewError| {
                Error::Decode(e.to_string())
            })?;

        let id = RequestId::from_request(&request);
        let summary = RequestSummary {
            operation: format!("{:?}", request.operation),
            namespace: request.namespace.clone(),
            name: request.name.clone(),
        };
        let pod = extract_pod(&request.kind, object);

        Ok(Decoded { id, summary, pod })
    }

    fn encode(&self, outcome: Outcome, id: Option<&RequestId>) -> Result<Vec<u8>> {
        let review = Self::response_for(outcome, id).into_review();
        Ok(serde_json::to_vec(&review)?)
    }
}

/// Reject envelopes that are not an AdmissionReview of a known version.
/// Absent type fields are tolerated.
fn check_types(types: &TypeMeta) -> Result<()> {
    if !types.kind.is_empty() && types.kind != META_KIND {
        return Err(Error::Decode(format!(
            "expected kind {}, got {}",
            META_KIND, types.kind
        )));
    }
    match types.api_version.as_str() {
        "" | META_API_VERSION_V1 | META_API_VERSION_V1BETA1 => Ok(()),
        other => Err(Error::Decode(format!("unsupported apiVersion {}", other))),
    }
}

/// Parse the request's raw object as a Pod
fn extract_pod(kind: &GroupVersionKind, object: Option<Value>) -> Result<Pod> {
    if !is_pod(kind) {
        return Err(Error::InvalidPodPayload(format!(
            "expected core/v1 Pod, got {}/{} {}",
            kind.group, kind.version, kind.kind
        )));
    }

    let object = object
        .filter(|o| !o.is_null())
        .ok_or_else(|| Error::InvalidPodPayload("request carries no object".to_string()))?;

    serde_json::from_value(object).map_err(|e| Error::InvalidPodPayload(e.to_string()))
}

fn is_pod(kind: &GroupVersionKind) -> bool {
    use k8s_openapi::Resource;
    kind.group == Pod::GROUP && kind.version == Pod::VERSION && kind.kind == Pod::KIND
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
    use json_patch::jsonptr::PointerBuf;
    use json_patch::{AddOperation, PatchOperation};
    use serde_json::{Value, json};

    fn review(api_version: &str, kind: Value, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": api_version,
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": kind,
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "virt-launcher-testvm-x7k2p",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "system:serviceaccount:kubevirt:kubevirt-controller"},
                "object": object,
                "oldObject": null,
                "dryRun": false
            }
        }))
        .unwrap()
    }

    fn pod_kind() -> Value {
        json!({"group": "", "version": "v1", "kind": "Pod"})
    }

    fn pod_object() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "virt-launcher-testvm-x7k2p", "namespace": "default"},
            "spec": {
                "containers": [{"name": "compute", "image": "quay.io/kubevirt/virt-launcher"}],
                "tolerations": [
                    {"key": "dedicated", "operator": "Equal", "value": "vm", "effect": "NoSchedule"}
                ]
            }
        })
    }

    fn decode_response(bytes: &[u8]) -> (TypeMeta, AdmissionResponse) {
        let review: AdmissionReview<DynamicObject> = serde_json::from_slice(bytes).unwrap();
        (review.types, review.response.expect("response section"))
    }

    #[test]
    fn test_decode_v1_pod() {
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", pod_kind(), pod_object()))
            .unwrap();

        assert_eq!(decoded.id.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(decoded.id.types.api_version, META_API_VERSION_V1);
        assert_eq!(decoded.summary.operation, "Create");
        assert_eq!(decoded.summary.namespace.as_deref(), Some("default"));

        let pod = decoded.pod.unwrap();
        let tolerations = pod.spec.unwrap().tolerations.unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(tolerations[0].key.as_deref(), Some("dedicated"));
    }

    #[test]
    fn test_decode_malformed_json() {
        let err = KubeReviewCodec.decode(b"{\"apiVersion\": ").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn test_decode_review_without_request() {
        let body = serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        }))
        .unwrap();
        assert!(matches!(
            KubeReviewCodec.decode(&body).unwrap_err(),
            Error::Decode(_)
        ));
    }

    #[test]
    fn test_decode_unknown_api_version() {
        let body = review("admission.k8s.io/v2", pod_kind(), pod_object());
        assert!(matches!(
            KubeReviewCodec.decode(&body).unwrap_err(),
            Error::Decode(_)
        ));
    }

    #[test]
    fn test_non_pod_object_keeps_uid() {
        let kind = json!({"group": "apps", "version": "v1", "kind": "Deployment"});
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", kind, pod_object()))
            .unwrap();
        assert_eq!(decoded.id.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(matches!(decoded.pod, Err(Error::InvalidPodPayload(_))));
    }

    #[test]
    fn test_invalid_pod_payload_keeps_uid() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "broken"},
            "spec": {"containers": [], "tolerations": "not-a-list"}
        });
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", pod_kind(), object))
            .unwrap();
        assert!(matches!(decoded.pod, Err(Error::InvalidPodPayload(_))));
        assert!(!decoded.id.uid.is_empty());
    }

    #[test]
    fn test_encode_allowed_echoes_version_and_uid() {
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1beta1", pod_kind(), pod_object()))
            .unwrap();
        let bytes = KubeReviewCodec
            .encode(Outcome::Allowed, Some(&decoded.id))
            .unwrap();

        let (types, response) = decode_response(&bytes);
        assert_eq!(types.api_version, META_API_VERSION_V1BETA1);
        assert_eq!(types.kind, META_KIND);
        assert_eq!(response.uid, decoded.id.uid);
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[test]
    fn test_encode_patch() {
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", pod_kind(), pod_object()))
            .unwrap();
        let patch = Patch(vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::parse("/spec/tolerations").unwrap(),
            value: json!([]),
        })]);
        let bytes = KubeReviewCodec
            .encode(Outcome::Patched(patch), Some(&decoded.id))
            .unwrap();

        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["response"]["patchType"], "JSONPatch");

        let (_, response) = decode_response(&bytes);
        assert!(response.allowed);
        let ops: Value = serde_json::from_slice(&response.patch.unwrap()).unwrap();
        assert_eq!(
            ops,
            json!([{"op": "add", "path": "/spec/tolerations", "value": []}])
        );
    }

    #[test]
    fn test_encode_rejection_with_uid() {
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", pod_kind(), pod_object()))
            .unwrap();
        let bytes = KubeReviewCodec
            .encode(
                Outcome::Rejected("invalid pod payload: boom".to_string()),
                Some(&decoded.id),
            )
            .unwrap();

        let (_, response) = decode_response(&bytes);
        assert_eq!(response.uid, decoded.id.uid);
        assert!(!response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.result.message, "invalid pod payload: boom");
    }

    #[test]
    fn test_encode_without_request() {
        let bytes = KubeReviewCodec
            .encode(Outcome::Rejected("couldn't decode".to_string()), None)
            .unwrap();

        let (_, response) = decode_response(&bytes);
        assert!(response.uid.is_empty());
        assert!(!response.allowed);
        assert!(response.patch.is_none());
        assert_eq!(response.result.message, "couldn't decode");
    }

    #[test]
    fn test_malformed_pod_metadata_keeps_uid() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "broken", "labels": "x"},
            "spec": {"containers": []}
        });
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", pod_kind(), object))
            .unwrap();
        assert_eq!(decoded.id.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(matches!(decoded.pod, Err(Error::InvalidPodPayload(_))));
    }

    #[test]
    fn test_non_object_payload_keeps_uid() {
        let decoded = KubeReviewCodec
            .decode(&review("admission.k8s.io/v1", pod_kind(), json!("not-an-object")))
            .unwrap();
        assert_eq!(decoded.id.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(matches!(decoded.pod, Err(Error::InvalidPodPayload(_))));
    }

    #[test]
    fn test_malformed_old_object_is_ignored() {
        let mut body: Value =
            serde_json::from_slice(&review("admission.k8s.io/v1", pod_kind(), pod_object()))
                .unwrap();
        body["request"]["operation"] = json!("UPDATE");
        body["request"]["oldObject"] = json!({"metadata": {"labels": 7}});
        let decoded = KubeReviewCodec
            .decode(&serde_json::to_vec(&body).unwrap())
            .unwrap();
        assert!(decoded.pod.is_ok());
    }
}
