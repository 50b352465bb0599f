use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A geometry derived by an analysis job, e.g. a building footprint or a
/// land-cover polygon. Never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorFeature {
    pub id: String,
    pub job_id: String,
    /// Feature class, e.g. `building` or `land_cover`.
    pub kind: String,
    /// GeoJSON geometry.
    pub geometry: Value,
    /// Free-form property bag (JSON object).
    pub properties: Value,
    pub created_at: DateTime<Utc>,
}

impl VectorFeature {
    pub fn new(job_id: &str, kind: &str, geometry: Value, properties: Value) -> Self {
        let properties = match properties {
            Value::Object(_) => properties,
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            geometry,
            properties,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_properties_become_empty_object() {
        let feature = VectorFeature::new("job", "building", Value::Null, Value::Null);
        assert_eq!(feature.properties, serde_json::json!({}));
    }

    #[test]
    fn test_scalar_properties_are_wrapped() {
        let feature = VectorFeature::new("job", "building", Value::Null, serde_json::json!(3));
        assert_eq!(feature.properties, serde_json::json!({"value": 3}));
    }
}
