//! Best-effort recovery of JSON from model output.
//!
//! JSON mode mostly works; when it doesn't, the payload is usually a
//! valid document wrapped in prose or markdown fences. Slicing the
//! outermost braces or brackets recovers it often enough to be the
//! standard degraded path before any templated fallback.

/// Slice the outermost `{...}` from a string, if any.
pub fn slice_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Slice the outermost `[...]` from a string, if any.
pub fn slice_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Recover a JSON document from raw model output.
///
/// Returns the content unchanged when it already parses; otherwise
/// tries object then array slicing. When nothing parses, returns the
/// degraded shape `{"error": ..., "raw_content": ...}` so callers can
/// fall through to rule-based output without special-casing.
pub fn recover_json(content: &str) -> String {
    if serde_json::from_str::<serde_json::Value>(content).is_ok() {
        return content.to_string();
    }
    for candidate in [slice_object(content), slice_array(content)]
        .into_iter()
        .flatten()
    {
        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
            return candidate.to_string();
        }
    }
    serde_json::json!({
        "error": "unparseable model output",
        "raw_content": content,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_valid_json_through() {
        let content = r#"{"a": 1}"#;
        assert_eq!(recover_json(content), content);
    }

    #[test]
    fn slices_object_out_of_prose() {
        let content = "Sure! Here is the JSON:\n```json\n{\"a\": 1}\n```\nHope that helps.";
        assert_eq!(recover_json(content), "{\"a\": 1}");
    }

    #[test]
    fn slices_array_out_of_prose() {
        let content = "The alignments are: [{\"id\": \"AP_01\"}] as requested";
        assert_eq!(recover_json(content), "[{\"id\": \"AP_01\"}]");
    }

    #[test]
    fn degrades_to_error_shape() {
        let recovered = recover_json("no json here at all");
        let value: serde_json::Value = serde_json::from_str(&recovered).unwrap();
        assert_eq!(value["error"], "unparseable model output");
        assert_eq!(value["raw_content"], "no json here at all");
    }

    #[test]
    fn nested_braces_keep_outermost_pair() {
        let content = "x {\"outer\": {\"inner\": 2}} y";
        assert_eq!(slice_object(content), Some("{\"outer\": {\"inner\": 2}}"));
    }
}
