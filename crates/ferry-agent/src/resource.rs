//! Untyped declarative resources.
//!
//! A deployment request carries an ordered array of raw JSON documents,
//! each one orchestrator object. The agent never models their schemas; it
//! reads the handful of addressing fields it needs and writes exactly one
//! annotation, the correlation ID, before application.

use serde_json::value::RawValue;
use serde_json::{Map, Value};
use thiserror::Error;

/// Annotation key carrying the originating delivery ID, written on every
/// resource before application so orchestrator events can be correlated
/// back to the request.
pub const CORRELATION_ID_ANNOTATION: &str = "ferry.dispatch/correlation-id";

/// Errors from decoding the resource array.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// One of the documents is not a JSON object.
    #[error("resource {index}: decoding payload: {source}")]
    Decode {
        /// 1-based position in the resource array.
        index: usize,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// One of the documents is valid JSON but not an object.
    #[error("resource {index}: not a JSON object")]
    NotAnObject {
        /// 1-based position in the resource array.
        index: usize,
    },
}

/// One declarative orchestrator object as an untyped document.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    value: Value,
}

impl Resource {
    /// Wraps a JSON object.
    ///
    /// # Errors
    ///
    /// Returns the value back when it is not a JSON object.
    pub fn new(value: Value) -> Result<Self, Value> {
        if value.is_object() {
            Ok(Self { value })
        } else {
            Err(value)
        }
    }

    /// Decodes a raw JSON array into resources, reporting failures with
    /// their 1-based array position.
    ///
    /// # Errors
    ///
    /// Returns a [`ResourceError`] naming the first undecodable document.
    pub fn from_raw(raw: &[Box<RawValue>]) -> Result<Vec<Self>, ResourceError> {
        raw.iter()
            .enumerate()
            .map(|(i, doc)| {
                let value: Value = serde_json::from_str(doc.get())
                    .map_err(|source| ResourceError::Decode {
                        index: i + 1,
                        source,
                    })?;
                Self::new(value).map_err(|_| ResourceError::NotAnObject { index: i + 1 })
            })
            .collect()
    }

    /// The underlying JSON document.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// The `apiVersion` field, or an empty string.
    #[must_use]
    pub fn api_version(&self) -> &str {
        self.value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The API group half of `apiVersion`; empty for the core group.
    #[must_use]
    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// The version half of `apiVersion`.
    #[must_use]
    pub fn version(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((_, version)) => version,
            None => self.api_version(),
        }
    }

    /// The `kind` field, or an empty string.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The `metadata.name` field, or an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.metadata_str("name")
    }

    /// The `metadata.namespace` field, or an empty string.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace")
    }

    fn metadata_str(&self, key: &str) -> &str {
        self.value
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Reads an annotation value.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.value
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    /// Writes the correlation-ID annotation, creating the metadata and
    /// annotations maps when missing.
    pub fn set_correlation_id(&mut self, delivery_id: &str) {
        let object = self
            .value
            .as_object_mut()
            .expect("resource is always a JSON object");
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        let annotations = metadata
            .as_object_mut()
            .expect("metadata replaced with an object above")
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        annotations
            .as_object_mut()
            .expect("annotations replaced with an object above")
            .insert(
                CORRELATION_ID_ANNOTATION.to_owned(),
                Value::String(delivery_id.to_owned()),
            );
    }

    /// Whether this resource's rollout has observable convergence
    /// semantics worth monitoring.
    #[must_use]
    pub fn monitorable(&self) -> bool {
        matches!(
            (self.group(), self.kind()),
            ("nais.io", "Application") | ("apps" | "extensions", "Deployment")
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn resource(value: Value) -> Resource {
        Resource::new(value).unwrap()
    }

    #[test]
    fn gvk_accessors() {
        let r = resource(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "team-a"}
        }));
        assert_eq!(r.group(), "apps");
        assert_eq!(r.version(), "v1");
        assert_eq!(r.kind(), "Deployment");
        assert_eq!(r.name(), "web");
        assert_eq!(r.namespace(), "team-a");
    }

    #[test]
    fn core_group_is_empty() {
        let r = resource(json!({"apiVersion": "v1", "kind": "ConfigMap"}));
        assert_eq!(r.group(), "");
        assert_eq!(r.version(), "v1");
    }

    #[test]
    fn monitorable_classification() {
        let cases = [
            ("nais.io/v1alpha1", "Application", true),
            ("apps/v1", "Deployment", true),
            ("extensions/v1beta1", "Deployment", true),
            ("v1", "ConfigMap", false),
            ("apps/v1", "StatefulSet", false),
            ("nais.io/v1alpha1", "Deployment", false),
            ("batch/v1", "Job", false),
        ];
        for (api_version, kind, expected) in cases {
            let r = resource(json!({"apiVersion": api_version, "kind": kind}));
            assert_eq!(
                r.monitorable(),
                expected,
                "({api_version}, {kind}) misclassified"
            );
        }
    }

    #[test]
    fn correlation_id_is_written() {
        let mut r = resource(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg"}
        }));
        r.set_correlation_id("d-42");
        assert_eq!(r.annotation(CORRELATION_ID_ANNOTATION), Some("d-42"));
        // Existing metadata is preserved.
        assert_eq!(r.name(), "cfg");
    }

    #[test]
    fn correlation_id_creates_missing_maps() {
        let mut r = resource(json!({"apiVersion": "v1", "kind": "ConfigMap"}));
        r.set_correlation_id("d-43");
        assert_eq!(r.annotation(CORRELATION_ID_ANNOTATION), Some("d-43"));
    }

    #[test]
    fn correlation_id_preserves_existing_annotations() {
        let mut r = resource(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"annotations": {"owner": "platform"}}
        }));
        r.set_correlation_id("d-44");
        assert_eq!(r.annotation("owner"), Some("platform"));
        assert_eq!(r.annotation(CORRELATION_ID_ANNOTATION), Some("d-44"));
    }

    #[test]
    fn from_raw_reports_one_based_index() {
        let raw: Vec<Box<RawValue>> = vec![
            RawValue::from_string(r#"{"kind":"ConfigMap"}"#.to_owned()).unwrap(),
            RawValue::from_string("[1,2,3]".to_owned()).unwrap(),
        ];
        let err = Resource::from_raw(&raw).unwrap_err();
        assert!(err.to_string().starts_with("resource 2:"), "{err}");
    }

    #[test]
    fn from_raw_decodes_in_order() {
        let raw: Vec<Box<RawValue>> = vec![
            RawValue::from_string(r#"{"kind":"A"}"#.to_owned()).unwrap(),
            RawValue::from_string(r#"{"kind":"B"}"#.to_owned()).unwrap(),
        ];
        let resources = Resource::from_raw(&raw).unwrap();
        assert_eq!(resources[0].kind(), "A");
        assert_eq!(resources[1].kind(), "B");
    }
}
