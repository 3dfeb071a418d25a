//! HTTP semantics helpers.
//!
//! Generates MCP `ToolAnnotations` for converted operations based on RFC 9110-style method
//! semantics.

use crate::converter::HttpMethod;
use rmcp::model::ToolAnnotations;

/// Generate MCP tool annotations based on HTTP method semantics.
///
/// `openWorldHint` is always `true`: every tool talks to an external API.
#[must_use]
pub fn annotations_for_method(method: HttpMethod) -> ToolAnnotations {
    let (read_only, destructive, idempotent) = match method {
        HttpMethod::Get => (true, false, Some(true)),
        HttpMethod::Post => (false, false, Some(false)),
        HttpMethod::Put | HttpMethod::Delete => (false, true, Some(true)),
        // PATCH may or may not be idempotent; do not guess.
        HttpMethod::Patch => (false, true, None),
    };

    ToolAnnotations {
        title: None,
        read_only_hint: Some(read_only),
        destructive_hint: Some(destructive),
        idempotent_hint: idempotent,
        open_world_hint: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::annotations_for_method;
    use crate::converter::HttpMethod;

    #[test]
    fn annotations_set_open_world_for_all_methods() {
        for m in [
            HttpMethod::Get,
            HttpMethod::Post,
            HttpMethod::Put,
            HttpMethod::Patch,
            HttpMethod::Delete,
        ] {
            assert_eq!(annotations_for_method(m).open_world_hint, Some(true));
        }
    }

    #[test]
    fn annotations_get_is_readonly_and_idempotent() {
        let a = annotations_for_method(HttpMethod::Get);
        assert_eq!(a.read_only_hint, Some(true));
        assert_eq!(a.destructive_hint, Some(false));
        assert_eq!(a.idempotent_hint, Some(true));
    }

    #[test]
    fn annotations_patch_leaves_idempotence_unknown() {
        let a = annotations_for_method(HttpMethod::Patch);
        assert_eq!(a.read_only_hint, Some(false));
        assert_eq!(a.destructive_hint, Some(true));
        assert_eq!(a.idempotent_hint, None);
    }
}
