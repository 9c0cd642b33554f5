//! Cross-resource references
//!
//! A prop value may point at another resource instead of carrying a raw
//! identifier. In JSON props an instance reference is the object
//! `{"$ref": "<id>", "attr": "<output field>"}`; `attr` defaults to `"id"`.
//! References are collected to build the dependency graph and replaced by the
//! referenced output value right before the lifecycle function runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key marking an instance reference inside props
pub const REF_KEY: &str = "$ref";

/// Key naming the referenced output attribute
pub const ATTR_KEY: &str = "attr";

const DEFAULT_ATTR: &str = "id";

/// A raw identifier or a live instance of a related resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    /// An external identifier, passed through untouched
    Literal(String),
    /// An instance declared in the same graph
    Instance {
        #[serde(rename = "$ref")]
        resource: String,
        #[serde(default = "default_attr")]
        attr: String,
    },
}

fn default_attr() -> String {
    DEFAULT_ATTR.to_string()
}

impl Reference {
    /// Reference the `id` output of another resource
    pub fn to(resource: impl Into<String>) -> Self {
        Self::Instance {
            resource: resource.into(),
            attr: default_attr(),
        }
    }

    /// Reference a named output attribute of another resource
    pub fn attr(resource: impl Into<String>, attr: impl Into<String>) -> Self {
        Self::Instance {
            resource: resource.into(),
            attr: attr.into(),
        }
    }

    /// Raw external identifier
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// The referenced resource id, if this is an instance reference
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Literal(_) => None,
            Self::Instance { resource, .. } => Some(resource),
        }
    }

    /// Resolve to a concrete value
    ///
    /// `lookup` receives the referenced id and attribute and returns the
    /// recorded output value, if any.
    pub fn resolve<F>(&self, lookup: F) -> Result<Value, Unresolved>
    where
        F: FnOnce(&str, &str) -> Option<Value>,
    {
        match self {
            Self::Literal(raw) => Ok(Value::String(raw.clone())),
            Self::Instance { resource, attr } => lookup(resource, attr).ok_or_else(|| Unresolved {
                target: resource.clone(),
                attr: attr.clone(),
            }),
        }
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        match reference {
            Reference::Literal(raw) => Value::String(raw),
            Reference::Instance { resource, attr } => {
                let mut map = Map::new();
                map.insert(REF_KEY.to_string(), Value::String(resource));
                map.insert(ATTR_KEY.to_string(), Value::String(attr));
                Value::Object(map)
            }
        }
    }
}

/// Interpret a JSON object as an instance reference
fn as_reference(map: &Map<String, Value>) -> Option<Reference> {
    let resource = map.get(REF_KEY)?.as_str()?;
    let attr = match map.get(ATTR_KEY) {
        Some(v) => v.as_str()?,
        None => DEFAULT_ATTR,
    };
    Some(Reference::attr(resource, attr))
}

/// Collect every referenced resource id in `props`, in first-seen order
pub fn collect_targets(props: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk(props, &mut out);
    out
}

fn walk(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(reference) = as_reference(map) {
                if let Some(target) = reference.target()
                    && !out.iter().any(|t| t == target)
                {
                    out.push(target.to_string());
                }
                return;
            }
            for v in map.values() {
                walk(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                walk(v, out);
            }
        }
        _ => {}
    }
}

/// An instance reference that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    pub target: String,
    pub attr: String,
}

/// Replace every instance reference in `props` with the looked-up value
pub fn resolve_props<F>(props: &Value, lookup: &F) -> Result<Value, Unresolved>
where
    F: Fn(&str, &str) -> Option<Value>,
{
    match props {
        Value::Object(map) => {
            if let Some(reference) = as_reference(map) {
                return reference.resolve(lookup);
            }
            let mut resolved = Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_props(v, lookup)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_props(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_into_value() {
        let value: Value = Reference::attr("bucket", "arn").into();
        assert_eq!(value, json!({"$ref": "bucket", "attr": "arn"}));

        let value: Value = Reference::literal("arn:aws:s3:::logs").into();
        assert_eq!(value, json!("arn:aws:s3:::logs"));
    }

    #[test]
    fn test_reference_deserialize() {
        let r: Reference = serde_json::from_value(json!({"$ref": "queue"})).unwrap();
        assert_eq!(r, Reference::to("queue"));
        assert_eq!(r.target(), Some("queue"));

        let r: Reference = serde_json::from_value(json!("raw-id")).unwrap();
        assert_eq!(r, Reference::literal("raw-id"));
        assert_eq!(r.target(), None);
    }

    #[test]
    fn test_collect_targets_nested() {
        let props = json!({
            "name": "policy",
            "bucket": {"$ref": "bucket", "attr": "arn"},
            "subscribers": [{"$ref": "queue"}, {"$ref": "bucket", "attr": "name"}],
            "tags": {"env": "dev"}
        });
        assert_eq!(collect_targets(&props), vec!["bucket", "queue"]);
    }

    #[test]
    fn test_resolve_props() {
        let props = json!({
            "bucket": {"$ref": "bucket", "attr": "arn"},
            "queues": [{"$ref": "queue"}]
        });
        let lookup = |id: &str, attr: &str| match (id, attr) {
            ("bucket", "arn") => Some(json!("arn:bucket")),
            ("queue", "id") => Some(json!("q-1")),
            _ => None,
        };
        let resolved = resolve_props(&props, &lookup).unwrap();
        assert_eq!(resolved, json!({"bucket": "arn:bucket", "queues": ["q-1"]}));
    }

    #[test]
    fn test_resolve_props_missing_attr() {
        let props = json!({"bucket": {"$ref": "bucket", "attr": "arn"}});
        let err = resolve_props(&props, &|_: &str, _: &str| None).unwrap_err();
        assert_eq!(err.target, "bucket");
        assert_eq!(err.attr, "arn");
    }

    #[test]
    fn test_reference_resolve() {
        let r = Reference::attr("bucket", "name");
        let v = r.resolve(|id, attr| Some(json!(format!("{id}.{attr}"))));
        assert_eq!(v, Ok(json!("bucket.name")));
        assert_eq!(Reference::literal("x").resolve(|_, _| None), Ok(json!("x")));
        assert_eq!(
            r.resolve(|_, _| None),
            Err(Unresolved {
                target: "bucket".into(),
                attr: "name".into()
            })
        );
    }
}
