use std::collections::BTreeSet;

use serde_json::Value;

use crate::model::TemplateMap;

/// Result of checking timeline overrides against a preset's parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FxValidation {
    Valid,
    /// Override paths absent from the preset, e.g. `Blur.Radius` or `Keys[2]`.
    UnknownKeys(BTreeSet<String>),
    /// Overrides were given but the preset defines no parameters at all.
    NoBaseParameters,
}

impl FxValidation {
    pub fn warning(&self, fx_id: &str) -> Option<String> {
        match self {
            Self::Valid => None,
            Self::UnknownKeys(keys) => Some(format!(
                "FX '{fx_id}' overrides unknown parameter(s): {}",
                keys.iter().cloned().collect::<Vec<_>>().join(", ")
            )),
            Self::NoBaseParameters => Some(format!(
                "FX '{fx_id}' has no base parameters but overrides were provided"
            )),
        }
    }
}

/// Recursive merge: nested mappings merge, anything else is replaced wholesale.
pub fn merge_parameters(base: &TemplateMap, overrides: &TemplateMap) -> TemplateMap {
    let mut merged = base.clone();
    for (key, value) in overrides {
        let combined = match (merged.get(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                Value::Object(merge_parameters(existing, nested))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

/// Applies merged parameters onto an emitted item with the same merge rule.
pub fn apply_parameters(target: &mut TemplateMap, parameters: &TemplateMap) {
    for (key, value) in parameters {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                apply_parameters(existing, nested);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

pub fn validate_overrides(preset: &TemplateMap, overrides: &TemplateMap) -> FxValidation {
    if overrides.is_empty() {
        return FxValidation::Valid;
    }
    if preset.is_empty() {
        return FxValidation::NoBaseParameters;
    }
    let known = flatten_keys(preset);
    let unknown = flatten_keys(overrides)
        .into_iter()
        .filter(|key| !known.contains(key))
        .collect::<BTreeSet<_>>();
    if unknown.is_empty() {
        FxValidation::Valid
    } else {
        FxValidation::UnknownKeys(unknown)
    }
}

/// Every key path in `map`: `a`, `a.b`, `a.list`, `a.list[0]`, `a.list[0].c`.
pub fn flatten_keys(map: &TemplateMap) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    for (key, value) in map {
        keys.insert(key.clone());
        collect_paths(value, key, &mut keys);
    }
    keys
}

fn collect_paths(value: &Value, prefix: &str, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let path = format!("{prefix}.{key}");
                out.insert(path.clone());
                collect_paths(nested, &path, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                let path = format!("{prefix}[{index}]");
                out.insert(path.clone());
                collect_paths(nested, &path, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{apply_parameters, flatten_keys, merge_parameters, validate_overrides, FxValidation};
    use crate::model::TemplateMap;

    fn map(value: Value) -> TemplateMap {
        value.as_object().cloned().expect("fixture should be an object")
    }

    #[test]
    fn nested_mappings_merge() {
        let merged = merge_parameters(&map(json!({ "a": { "b": 1 } })), &map(json!({ "a": { "c": 2 } })));
        assert_eq!(Value::Object(merged), json!({ "a": { "b": 1, "c": 2 } }));
    }

    #[test]
    fn scalars_and_lists_are_replaced_not_concatenated() {
        let base = map(json!({ "keys": [1, 2, 3], "a": { "b": 1 } }));
        let merged = merge_parameters(&base, &map(json!({ "keys": [9], "a": 5 })));
        assert_eq!(Value::Object(merged), json!({ "keys": [9], "a": 5 }));

        let mut item = map(json!({ "Zoom": { "Values": [100, 50] }, "X": 0 }));
        apply_parameters(&mut item, &map(json!({ "Zoom": { "Values": [10] } })));
        assert_eq!(item["Zoom"], json!({ "Values": [10] }));
        assert_eq!(item["X"], json!(0));
    }

    #[test]
    fn flattened_paths_include_indexes() {
        let keys = flatten_keys(&map(json!({ "a": { "b": [ { "c": 1 } ] } })));
        let expected = ["a", "a.b", "a.b[0]", "a.b[0].c"];
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn unknown_override_key_yields_single_warning() {
        let preset = map(json!({ "Strength": 10, "Blur": { "Radius": 2 } }));
        let validation = validate_overrides(&preset, &map(json!({ "Blur": { "Sigma": 4 } })));
        assert_eq!(
            validation.warning("shake"),
            Some("FX 'shake' overrides unknown parameter(s): Blur.Sigma".to_owned())
        );

        assert_eq!(
            validate_overrides(&preset, &map(json!({ "Strength": 3 }))),
            FxValidation::Valid
        );
        assert_eq!(
            validate_overrides(&TemplateMap::new(), &map(json!({ "Strength": 3 }))),
            FxValidation::NoBaseParameters
        );
    }
}
