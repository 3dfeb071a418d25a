//! `OpenAPI` `$ref` resolver.
//!
//! The `openapiv3` crate models `$ref`s using `ReferenceOr<T>` but does not resolve them. Tool
//! definitions must be self-contained, so every internal reference (`#/...`) is looked up in the
//! root document and deserialized into the expected type. References into other documents are
//! rejected.

use crate::error::{OpenApiToolsError, Result};
use openapiv3::{OpenAPI, ReferenceOr};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug)]
pub struct RefResolver {
    root: Value,
}

impl RefResolver {
    /// Create a resolver for a parsed root document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be converted into JSON.
    pub fn new(spec: &OpenAPI) -> Result<Self> {
        let root =
            serde_json::to_value(spec).map_err(|e| OpenApiToolsError::OpenApi(e.to_string()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Look up the raw JSON value a `$ref` points at (one hop, no chasing).
    ///
    /// # Errors
    ///
    /// Returns an error for external references, malformed fragments, or missing targets.
    pub fn lookup(&self, reference: &str) -> Result<&Value> {
        let pointer = local_pointer(reference)?;
        self.root.pointer(pointer).ok_or_else(|| {
            OpenApiToolsError::OpenApi(format!(
                "Unresolved $ref '{reference}' (missing pointer '{pointer}')"
            ))
        })
    }

    /// Resolve a `ReferenceOr<T>`, following chains of references.
    ///
    /// # Errors
    ///
    /// Returns an error if a reference cannot be resolved, is cyclic, or the target does not
    /// deserialize as `T`.
    pub fn resolve<T>(&self, r: &ReferenceOr<T>) -> Result<T>
    where
        T: Clone + DeserializeOwned,
    {
        let mut seen: HashSet<String> = HashSet::new();
        let mut cur: ReferenceOr<T> = r.clone();

        loop {
            match cur {
                ReferenceOr::Item(item) => return Ok(item),
                ReferenceOr::Reference { reference } => {
                    if !seen.insert(reference.clone()) {
                        return Err(OpenApiToolsError::OpenApi(format!(
                            "Cyclic $ref detected while resolving: {reference}",
                        )));
                    }
                    let value = self.lookup(&reference)?.clone();
                    cur = serde_json::from_value(value).map_err(|e| {
                        OpenApiToolsError::OpenApi(format!(
                            "Failed to deserialize referenced value '{reference}' as expected type: {e}"
                        ))
                    })?;
                }
            }
        }
    }
}

/// Short name of a reference target (`#/components/schemas/Page` -> `Page`).
#[must_use]
pub fn ref_name(reference: &str) -> &str {
    reference.rsplit('/').next().unwrap_or(reference)
}

fn local_pointer(reference: &str) -> Result<&str> {
    let Some(frag) = reference.strip_prefix('#') else {
        return Err(OpenApiToolsError::OpenApi(format!(
            "External $ref is not supported: {reference}"
        )));
    };
    if frag.is_empty() || frag.starts_with('/') {
        Ok(frag)
    } else {
        Err(OpenApiToolsError::OpenApi(format!(
            "Unsupported $ref fragment (expected JSON pointer starting with '/'): {reference}",
        )))
    }
}
