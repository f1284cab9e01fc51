//! Resource-name grammar.
//!
//! Names are path-like: `apps/{id}`, `apps/{id}/releases/{id}`,
//! `apps/{id}/releases/{id}/scales/{id}`, `apps/{id}/deployments/{id}`.

/// Returns the id segment following `segment/` in `name`, or the empty
/// string if the segment is absent.
#[must_use]
pub fn parse_id_from_name<'a>(name: &'a str, segment: &str) -> &'a str {
    let mut parts = name.split('/');
    while let Some(part) = parts.next() {
        if part == segment {
            return parts.next().unwrap_or("");
        }
    }
    ""
}

/// Maps `parse_id_from_name` across a filter list, dropping empties and
/// deduplicating while preserving order.
#[must_use]
pub fn parse_ids_from_name_filters(filters: &[String], segment: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for filter in filters {
        let id = parse_id_from_name(filter, segment);
        if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Extracts app filters from a name-filter list.
///
/// Structured names contribute their `apps/` segment; bare tokens are
/// treated as app-id-or-name literals and pass through unchanged.
#[must_use]
pub fn parse_app_ids_from_name_filters(filters: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for filter in filters {
        let id = if filter.contains('/') {
            parse_id_from_name(filter, "apps")
        } else {
            filter.as_str()
        };
        if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id_from_name() {
        let name = "apps/a1/releases/r1/scales/s1";
        assert_eq!(parse_id_from_name(name, "apps"), "a1");
        assert_eq!(parse_id_from_name(name, "releases"), "r1");
        assert_eq!(parse_id_from_name(name, "scales"), "s1");
        assert_eq!(parse_id_from_name(name, "deployments"), "");
        assert_eq!(parse_id_from_name("apps/a1/deployments/d1", "deployments"), "d1");
    }

    #[test]
    fn test_parse_id_trailing_segment() {
        // A segment with nothing after it yields the empty string.
        assert_eq!(parse_id_from_name("apps", "apps"), "");
        assert_eq!(parse_id_from_name("apps/a1/releases", "releases"), "");
    }

    #[test]
    fn test_parse_ids_from_name_filters() {
        let filters = vec![
            "apps/a1/releases/r1".to_string(),
            "apps/a2/releases/r2".to_string(),
            "apps/a1/releases/r1".to_string(), // duplicate
            "apps/a3".to_string(),             // no releases segment
        ];
        assert_eq!(
            parse_ids_from_name_filters(&filters, "releases"),
            vec!["r1".to_string(), "r2".to_string()]
        );
        assert_eq!(
            parse_ids_from_name_filters(&filters, "apps"),
            vec!["a1".to_string(), "a2".to_string(), "a3".to_string()]
        );
    }

    #[test]
    fn test_bare_tokens_pass_through_as_app_filters() {
        let filters = vec![
            "apps/a1".to_string(),
            "my-app".to_string(),
            "my-app".to_string(),
            String::new(),
        ];
        assert_eq!(
            parse_app_ids_from_name_filters(&filters),
            vec!["a1".to_string(), "my-app".to_string()]
        );
    }
}
