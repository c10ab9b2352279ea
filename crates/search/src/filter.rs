use crate::error::QueryError;
use codesearch_vector_store::MetadataFilter;

const FILTER_KEYS: &[&str] = &["path", "path_prefix", "path_glob", "type", "name"];

/// Parse a JSON filter such as `{"type": "function", "path_prefix": "app/"}`.
///
/// Unknown keys are rejected rather than silently ignored. An empty object
/// yields `None`.
pub fn parse_filter(raw: &str) -> Result<Option<MetadataFilter>, QueryError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| QueryError::InvalidFilter(format!("not valid JSON: {e}")))?;
    filter_from_value(value)
}

pub fn filter_from_value(value: serde_json::Value) -> Result<Option<MetadataFilter>, QueryError> {
    let Some(object) = value.as_object() else {
        return Err(QueryError::InvalidFilter(
            "filter must be a JSON object".to_string(),
        ));
    };
    if let Some(unknown) = object.keys().find(|k| !FILTER_KEYS.contains(&k.as_str())) {
        return Err(QueryError::InvalidFilter(format!(
            "unknown key `{unknown}` (expected one of {})",
            FILTER_KEYS.join(", ")
        )));
    }

    let filter: MetadataFilter =
        serde_json::from_value(value).map_err(|e| QueryError::InvalidFilter(e.to_string()))?;
    validate_filter(&filter)?;
    Ok((!filter.is_empty()).then_some(filter))
}

pub fn validate_filter(filter: &MetadataFilter) -> Result<(), QueryError> {
    filter
        .compile()
        .map(|_| ())
        .map_err(|e| QueryError::InvalidFilter(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use codesearch_vector_store::ChunkKind;

    #[test]
    fn parses_known_keys() {
        let filter = parse_filter(r#"{"type": "class", "path_prefix": "app/"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(filter.kind, Some(ChunkKind::Class));
        assert_eq!(filter.path_prefix.as_deref(), Some("app/"));
    }

    #[test]
    fn empty_object_means_no_filter() {
        assert!(parse_filter("{}").unwrap().is_none());
    }

    #[test]
    fn rejects_bad_input() {
        for raw in [
            "[1, 2]",
            "{not json",
            r#"{"language": "python"}"#,
            r#"{"type": "module"}"#,
            r#"{"path_glob": "app/[*.py"}"#,
        ] {
            assert!(
                matches!(parse_filter(raw), Err(QueryError::InvalidFilter(_))),
                "{raw} should be rejected"
            );
        }
    }
}
