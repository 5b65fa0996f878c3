//! Request transformer: model-map rewriting and auth header injection for
//! providers in `inject` mode (spec §4.3).

use crate::config::{Provider, ProviderMode};
use crate::matcher::{CompiledGlob, MatcherError};
use serde_json::Value;

/// A compiled `{pattern, model}` map, preserving declared order so
/// first-match-wins is well defined (spec §4.3, §9 "Model map order").
pub struct CompiledModelMap {
    entries: Vec<(CompiledGlob, String)>,
}

impl CompiledModelMap {
    pub fn compile(entries: &[crate::config::ModelMapEntry]) -> Result<Self, MatcherError> {
        let mut compiled = Vec::with_capacity(entries.len());
        for entry in entries {
            compiled.push((CompiledGlob::compile(&entry.pattern)?, entry.model.clone()));
        }
        Ok(Self { entries: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `matchModel`: first pattern in declared order that matches `model`.
    pub fn match_model(&self, model: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(glob, _)| glob.matches(model))
            .map(|(_, target)| target.as_str())
    }
}

/// Scan `body.messages[].content[]` for an image-bearing part, per spec
/// §4.3's `hasImage` rule: an item whose `type` is `"image"`/`"image_url"`,
/// or whose `image_url` field is a non-null object.
pub fn has_image(body: &Value) -> bool {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return false;
    };
    for message in messages {
        let Some(content) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in content {
            let is_image_type = matches!(
                part.get("type").and_then(Value::as_str),
                Some("image") | Some("image_url")
            );
            let has_image_url_object = part
                .get("image_url")
                .map(|v| v.is_object())
                .unwrap_or(false);
            if is_image_type || has_image_url_object {
                return true;
            }
        }
    }
    false
}

/// Apply the model-map rewrite to a decoded JSON body in place. Chooses
/// the VL map over the regular map when the body contains image content
/// and a VL map is configured, falling back to the other map on a miss in
/// the first. Leaves `body.model` untouched if neither map matches, or if
/// there's no `model` field at all.
pub fn apply_model_mapping(body: &mut Value, vl_map: &CompiledModelMap, model_map: &CompiledModelMap) {
    let Some(model) = body.get("model").and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    let use_vl_first = !vl_map.is_empty() && has_image(body);
    let (first, second) = if use_vl_first {
        (vl_map, model_map)
    } else {
        (model_map, vl_map)
    };

    let target = first
        .match_model(&model)
        .or_else(|| second.match_model(&model));

    if let Some(target) = target {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("model".to_string(), Value::String(target.to_string()));
        }
    }
}

/// Header rewriting for `inject` mode: strip inbound auth headers, inject
/// the provider's credential under its effective auth header, then merge
/// `extraHeaders` last so they win on collision (spec §4.3).
pub fn inject_headers(headers: &mut Vec<(String, String)>, provider: &Provider) {
    let strip: Vec<String> = {
        let mut names = vec!["authorization".to_string(), "x-api-key".to_string()];
        if let Some(custom) = &provider.auth_header {
            names.push(custom.to_lowercase());
        }
        names
    };
    headers.retain(|(name, _)| !strip.contains(&name.to_lowercase()));

    if let Some(value) = provider.auth_header_value() {
        headers.push((provider.effective_auth_header().to_string(), value));
    }

    for (name, value) in &provider.extra_headers {
        headers.retain(|(existing, _)| existing.to_lowercase() != name.to_lowercase());
        headers.push((name.clone(), value.clone()));
    }
}

/// Top-level entry point: transform a request body + headers for a given
/// provider. A `passthrough`-mode provider (or any provider when the body
/// fails to parse as JSON) is returned unchanged, per spec §4.3 ("if parse
/// fails, leave body unchanged and continue").
pub fn transform_request(
    provider: &Provider,
    vl_map: &CompiledModelMap,
    model_map: &CompiledModelMap,
    body: &[u8],
    headers: &mut Vec<(String, String)>,
) -> Vec<u8> {
    if provider.mode != ProviderMode::Inject {
        return body.to_vec();
    }

    inject_headers(headers, provider);

    let Ok(mut json) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };
    apply_model_mapping(&mut json, vl_map, model_map);
    serde_json::to_vec(&json).unwrap_or_else(|_| body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelMapEntry;
    use serde_json::json;

    fn maps(entries: &[(&str, &str)]) -> CompiledModelMap {
        let entries: Vec<ModelMapEntry> = entries
            .iter()
            .map(|(pattern, model)| ModelMapEntry {
                pattern: pattern.to_string(),
                model: model.to_string(),
            })
            .collect();
        CompiledModelMap::compile(&entries).unwrap()
    }

    #[test]
    fn request_without_model_field_is_unchanged() {
        let mut body = json!({"messages": []});
        let model_map = maps(&[("claude-*", "gpt-4")]);
        let vl_map = maps(&[]);
        let before = body.clone();
        apply_model_mapping(&mut body, &vl_map, &model_map);
        assert_eq!(body, before);
    }

    #[test]
    fn vl_map_wins_when_image_present() {
        let model_map = maps(&[("claude-*", "gpt-4")]);
        let vl_map = maps(&[("claude-*", "gpt-4-vision")]);

        let mut with_image = json!({
            "model": "claude-3",
            "messages": [{"role": "user", "content": [{"type": "image", "source": {}}]}]
        });
        apply_model_mapping(&mut with_image, &vl_map, &model_map);
        assert_eq!(with_image["model"], "gpt-4-vision");

        let mut without_image = json!({
            "model": "claude-3",
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
        });
        apply_model_mapping(&mut without_image, &vl_map, &model_map);
        assert_eq!(without_image["model"], "gpt-4");
    }

    #[test]
    fn match_model_is_order_sensitive() {
        let map = maps(&[("x", "A"), ("x", "B")]);
        assert_eq!(map.match_model("x"), Some("A"));
    }

    #[test]
    fn idempotent_when_patterns_dont_overlap_with_targets() {
        let model_map = maps(&[("claude-*", "gpt-4")]);
        let vl_map = maps(&[]);
        let mut body = json!({"model": "claude-3"});
        apply_model_mapping(&mut body, &vl_map, &model_map);
        assert_eq!(body["model"], "gpt-4");
        apply_model_mapping(&mut body, &vl_map, &model_map);
        assert_eq!(body["model"], "gpt-4");
    }

    #[test]
    fn falls_back_to_second_map_on_first_miss() {
        let model_map = maps(&[("gpt-*", "gpt-4")]);
        let vl_map = maps(&[("claude-*", "gpt-4-vision")]);
        let mut body = json!({
            "model": "claude-3",
            "messages": [{"role": "user", "content": [{"type": "image"}]}]
        });
        apply_model_mapping(&mut body, &vl_map, &model_map);
        assert_eq!(body["model"], "gpt-4-vision");
    }
}
