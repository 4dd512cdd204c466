use serde_json::{json, Map, Value};

/// JSON filter enabling lazy-loaded members for both timeline and state.
///
/// `timeline_options` are merged into the timeline filter, e.g.
/// `{"limit": 1}` for a gappy sync.
pub fn lazy_loading_filter(timeline_options: Option<Map<String, Value>>) -> String {
    let mut timeline = Map::new();
    timeline.insert("lazy_load_members".to_string(), Value::Bool(true));
    if let Some(options) = timeline_options {
        timeline.extend(options);
    }

    json!({
        "room": {
            "timeline": timeline,
            "state": { "lazy_load_members": true },
        }
    })
    .to_string()
}

/// Whether a parsed filter asks for lazy-loaded members in room state.
pub fn is_lazy_loading(filter: &Value) -> bool {
    filter
        .pointer("/room/state/lazy_load_members")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn timeline_limit(filter: &Value) -> Option<usize> {
    filter
        .pointer("/room/timeline/limit")
        .and_then(Value::as_u64)
        .map(|limit| limit as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_loading_filter_merges_timeline_options() {
        let mut options = Map::new();
        options.insert("limit".to_string(), json!(1));

        let filter: Value = serde_json::from_str(&lazy_loading_filter(Some(options))).unwrap();

        assert!(is_lazy_loading(&filter));
        assert_eq!(timeline_limit(&filter), Some(1));
        assert_eq!(filter["room"]["timeline"]["lazy_load_members"], json!(true));
    }

    #[test]
    fn test_plain_filter_is_not_lazy() {
        let filter = json!({ "room": { "timeline": { "limit": 5 } } });
        assert!(!is_lazy_loading(&filter));
        assert_eq!(timeline_limit(&json!({})), None);
    }
}
