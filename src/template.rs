use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error_codes::CodedError;
use crate::model::{TemplateMap, TimelineRow};

/// Per-build memo of template snapshots.
///
/// Lookups go by address first and fall back to a SHA-256 of the canonical
/// JSON, so identical templates loaded from different sources share one
/// snapshot. Address keys are only sound because the cache borrows every
/// template for `'a`; the address cannot be reused while the entry lives.
#[derive(Debug, Default)]
pub struct TemplateCache<'a> {
    by_identity: HashMap<usize, (&'a TemplateMap, Rc<TemplateMap>)>,
    by_digest: HashMap<String, Rc<TemplateMap>>,
    stats: TemplateCacheStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateCacheStats {
    pub identity_hits: usize,
    pub digest_hits: usize,
    pub misses: usize,
}

impl<'a> TemplateCache<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> TemplateCacheStats {
        self.stats
    }

    /// Deep copy of `template`, served from the snapshot cache.
    pub fn clone_template(&mut self, template: &'a TemplateMap) -> TemplateMap {
        let identity = template as *const TemplateMap as usize;
        if let Some((cached, snapshot)) = self.by_identity.get(&identity) {
            if std::ptr::eq(*cached, template) {
                self.stats.identity_hits += 1;
                return TemplateMap::clone(snapshot);
            }
        }

        let digest = digest_template(template);
        let snapshot = match self.by_digest.get(&digest) {
            Some(snapshot) => {
                self.stats.digest_hits += 1;
                Rc::clone(snapshot)
            }
            None => {
                self.stats.misses += 1;
                let snapshot = Rc::new(template.clone());
                self.by_digest.insert(digest, Rc::clone(&snapshot));
                snapshot
            }
        };
        self.by_identity
            .insert(identity, (template, Rc::clone(&snapshot)));
        TemplateMap::clone(&snapshot)
    }

    /// Resolves, clones, and stamps `Frame`/`Length` from the row's timing.
    pub fn instantiate(
        &mut self,
        template: &'a Value,
        row: &TimelineRow,
        fps: f64,
    ) -> Result<TemplateMap> {
        let resolved = resolve_template(template)?;
        let mut item = self.clone_template(resolved);
        stamp_row_timing(&mut item, row, fps);
        Ok(item)
    }
}

/// Accepts a mapping, or a non-empty list whose first element is a mapping.
pub fn resolve_template(template: &Value) -> Result<&TemplateMap> {
    match template {
        Value::Object(map) => Ok(map),
        Value::Array(items) => match items.first() {
            Some(Value::Object(map)) => Ok(map),
            Some(other) => Err(anyhow!(CodedError::template(
                "TEMPLATE_SHAPE",
                "template list must start with a mapping",
            )
            .with_details(json!({ "found": value_kind(other) })))),
            None => Err(anyhow!(CodedError::template(
                "TEMPLATE_EMPTY",
                "template list is empty",
            ))),
        },
        Value::Null => Err(anyhow!(CodedError::template(
            "TEMPLATE_MISSING",
            "template data is missing",
        ))),
        other => Err(anyhow!(CodedError::template(
            "TEMPLATE_SHAPE",
            "template data must be a mapping",
        )
        .with_details(json!({ "found": value_kind(other) })))),
    }
}

/// `Frame = round(start * fps)`; `Length` only when both ends are known.
pub fn stamp_row_timing(item: &mut TemplateMap, row: &TimelineRow, fps: f64) {
    let Some(start) = row.start else {
        return;
    };
    item.insert("Frame".to_owned(), json!(start.to_frame(fps)));
    if let Some(end) = row.end {
        let seconds = (end.to_seconds() - start.to_seconds()).max(0.0);
        item.insert("Length".to_owned(), json!((seconds * fps).round() as i64));
    }
}

/// SHA-256 over the compact, key-sorted serialization.
pub fn digest_template(template: &TemplateMap) -> String {
    // serde_json's Map is ordered by key, so this serialization is canonical.
    let serialized = serde_json::to_vec(template).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{resolve_template, TemplateCache};
    use crate::error_codes::find_coded_error;
    use crate::model::TimelineRow;
    use crate::timecode::Timecode;

    #[test]
    fn clone_is_deeply_independent() {
        let template = json!({ "Text": "a", "Zoom": { "Values": [{ "Value": 100 }] } });
        let map = template.as_object().unwrap();
        let mut cache = TemplateCache::new();

        let mut first = cache.clone_template(map);
        assert_eq!(&first, map);
        first["Zoom"]["Values"][0]["Value"] = json!(50);
        first.insert("Extra".to_owned(), json!(true));

        let second = cache.clone_template(map);
        assert_eq!(&second, map);
        assert_eq!(map["Zoom"]["Values"][0]["Value"], json!(100));
    }

    #[test]
    fn identical_templates_share_a_digest_entry() {
        let a = json!({ "$type": "Text", "Size": 10 });
        let b = json!({ "Size": 10, "$type": "Text" });
        let mut cache = TemplateCache::new();

        cache.clone_template(a.as_object().unwrap());
        cache.clone_template(a.as_object().unwrap());
        cache.clone_template(b.as_object().unwrap());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.identity_hits, 1);
        assert_eq!(stats.digest_hits, 1);
    }

    #[test]
    fn resolve_accepts_mapping_or_list_headed_by_mapping() {
        let single = json!({ "A": 1 });
        let listed = json!([{ "A": 1 }]);
        assert_eq!(resolve_template(&single).unwrap(), resolve_template(&listed).unwrap());

        for bad in [json!(null), json!([]), json!("text"), json!([1])] {
            let error = resolve_template(&bad).unwrap_err();
            assert!(find_coded_error(&error).is_some(), "{bad} should be a coded error");
        }
    }

    #[test]
    fn instantiate_stamps_frame_and_length() {
        let template = json!({ "$type": "Text" });
        let mut row = TimelineRow::new(1);
        row.start = Some(Timecode::new(0, 0, 1, 500));
        let mut cache = TemplateCache::new();

        let open_ended = cache.instantiate(&template, &row, 60.0).unwrap();
        assert_eq!(open_ended["Frame"], json!(90));
        assert!(open_ended.get("Length").is_none());

        row.end = Some(Timecode::new(0, 0, 3, 0));
        let bounded = cache.instantiate(&template, &row, 60.0).unwrap();
        assert_eq!(bounded["Length"], json!(90));

        row.end = Some(Timecode::new(0, 0, 1, 0));
        let inverted = cache.instantiate(&template, &row, 60.0).unwrap();
        assert_eq!(inverted["Length"], json!(0));
    }
}
