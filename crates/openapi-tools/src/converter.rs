//! `OpenAPI` document -> tool definitions + operation lookup.
//!
//! Every `get/post/put/delete/patch` operation becomes one [`ToolDefinition`] (what clients see)
//! and one [`OperationRecord`] (what the executor needs). Both are immutable once built and are
//! shared read-only by every session.

use crate::config::{ConverterOptions, NamePolicy, ToolGrouping};
use crate::error::{OpenApiToolsError, Result};
use crate::resolver::RefResolver;
use crate::schema::SchemaConverter;
use crate::semantics::annotations_for_method;
use openapiv3::{
    OpenAPI, Operation, Parameter, ParameterSchemaOrContent, PathItem, ReferenceOr, RequestBody,
    Response, Schema, SchemaKind, Server, StatusCode, Type,
};
use regex::Regex;
use reqwest::Client;
use rmcp::model::{JsonObject, Tool};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};
use url::Url;

/// Longest tool name most MCP clients accept.
pub const MAX_TOOL_NAME_LEN: usize = 64;

const HASH_SUFFIX_HEX_LEN: usize = 8;

static PATH_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("static regex"));
static NON_ALNUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    #[must_use]
    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an argument goes in the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub schema: Value,
}

/// How `Body` parameters are assembled into the request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    /// Object body flattened into top-level arguments; re-assembled into one JSON object.
    Fields,
    /// Non-object body carried verbatim in a single `body` argument.
    Whole,
}

/// Everything needed to execute one operation.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub operation_id: String,
    pub method: HttpMethod,
    /// Path with `{param}` placeholders, e.g. `/pages/{page_id}`.
    pub path_template: String,
    /// Declaration order: path-level then operation-level parameters, then body fields.
    pub parameters: Vec<ParameterSpec>,
    pub request_body: Option<BodyShape>,
}

/// A tool as exposed to protocol clients.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub resource: Option<String>,
    pub method_name: String,
    pub description: String,
    /// Object schema covering every parameter location.
    pub input_schema: Value,
    /// Schema of the success response body, when the document declares a JSON one.
    pub return_schema: Option<Value>,
    pub http_method: HttpMethod,
}

impl ToolDefinition {
    #[must_use]
    pub fn to_tool(&self) -> Tool {
        let schema_obj = self
            .input_schema
            .as_object()
            .cloned()
            .unwrap_or_else(JsonObject::new);
        let mut tool = Tool::new(
            self.name.clone(),
            self.description.clone(),
            Arc::new(schema_obj),
        );
        tool.annotations = Some(annotations_for_method(self.http_method));
        tool
    }
}

/// Output of [`SpecConverter::convert`].
#[derive(Debug, Clone)]
pub struct ConvertedSpec {
    title: String,
    base_url: String,
    tools: Vec<ToolDefinition>,
    lookup: HashMap<String, Arc<OperationRecord>>,
}

impl ConvertedSpec {
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Base URL declared by the document (or the configured override).
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Tool definitions in document declaration order.
    #[must_use]
    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    /// Reverse lookup from an exposed tool name to its operation.
    #[must_use]
    pub fn operation(&self, tool_name: &str) -> Option<&Arc<OperationRecord>> {
        self.lookup.get(tool_name)
    }

    /// Tools grouped by resource, in order of first appearance.
    #[must_use]
    pub fn resources(&self) -> Vec<(Option<&str>, Vec<&ToolDefinition>)> {
        let mut groups: Vec<(Option<&str>, Vec<&ToolDefinition>)> = Vec::new();
        for tool in &self.tools {
            let key = tool.resource.as_deref();
            match groups.iter_mut().find(|(name, _)| *name == key) {
                Some((_, methods)) => methods.push(tool),
                None => groups.push((key, vec![tool])),
            }
        }
        groups
    }
}

/// Load an `OpenAPI` document from a file path or an `http(s)` URL.
///
/// # Errors
///
/// Returns an error if the document cannot be read, fetched, or parsed.
pub async fn load_spec(location: &str, client: &Client) -> Result<OpenAPI> {
    let content = if location.starts_with("http://") || location.starts_with("https://") {
        tracing::info!("Fetching OpenAPI spec from {location}");
        let fetch_err = |message: String| OpenApiToolsError::OpenApiSpecFetch {
            url: location.to_string(),
            message,
        };
        let resp = client
            .get(location)
            .send()
            .await
            .map_err(|e| fetch_err(crate::safety::sanitize_reqwest_error(&e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {status}")));
        }
        resp.text()
            .await
            .map_err(|e| fetch_err(crate::safety::sanitize_reqwest_error(&e)))?
    } else {
        tracing::info!("Loading OpenAPI spec from {location}");
        std::fs::read_to_string(location).map_err(|e| OpenApiToolsError::OpenApiSpecReadFile {
            path: location.to_string(),
            source: e,
        })?
    };

    parse_spec(&content, location)
}

/// Parse an `OpenAPI` document (JSON is a valid subset of YAML, so `serde_yaml` covers both).
///
/// # Errors
///
/// Returns an error if the content is not a valid `OpenAPI` 3.x document.
pub fn parse_spec(content: &str, location: &str) -> Result<OpenAPI> {
    serde_yaml::from_str(content).map_err(|e| OpenApiToolsError::OpenApiSpecParse {
        location: location.to_string(),
        source: e,
    })
}

pub struct SpecConverter {
    options: ConverterOptions,
}

struct OperationInput<'a> {
    path: &'a str,
    method: HttpMethod,
    path_item_params: &'a [ReferenceOr<Parameter>],
    operation: &'a Operation,
}

impl SpecConverter {
    #[must_use]
    pub fn new(options: ConverterOptions) -> Self {
        Self { options }
    }

    /// Convert a parsed document.
    ///
    /// Operations that cannot be converted (parameter collisions, broken refs) are skipped with
    /// a warning; the document as a whole only fails on configuration problems.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error when no usable base URL is declared or configured.
    pub fn convert(&self, spec: &OpenAPI) -> Result<ConvertedSpec> {
        let base_url = self.base_url(spec)?;
        let resolver = RefResolver::new(spec)?;

        let mut tools = Vec::new();
        let mut lookup: HashMap<String, Arc<OperationRecord>> = HashMap::new();

        for (path, path_item) in &spec.paths.paths {
            let path_item: PathItem = match resolver.resolve(path_item) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Skipping path '{path}': {e}");
                    continue;
                }
            };

            let methods = [
                (HttpMethod::Get, &path_item.get),
                (HttpMethod::Post, &path_item.post),
                (HttpMethod::Put, &path_item.put),
                (HttpMethod::Delete, &path_item.delete),
                (HttpMethod::Patch, &path_item.patch),
            ];

            for (method, operation) in methods {
                let Some(operation) = operation else {
                    continue;
                };
                let input = OperationInput {
                    path,
                    method,
                    path_item_params: &path_item.parameters,
                    operation,
                };

                match self.convert_operation(&resolver, &input) {
                    Ok((definition, record)) => {
                        if lookup
                            .insert(definition.name.clone(), Arc::new(record))
                            .is_some()
                        {
                            tracing::warn!(
                                tool = %definition.name,
                                "tool name collides with an earlier operation; the later operation wins"
                            );
                        }
                        tools.push(definition);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping {method} {path}: {e}");
                    }
                }
            }
        }

        let title = spec.info.title.clone();
        tracing::info!(
            "Converted {} tools from OpenAPI spec '{}'",
            tools.len(),
            title
        );

        Ok(ConvertedSpec {
            title,
            base_url,
            tools,
            lookup,
        })
    }

    fn base_url(&self, spec: &OpenAPI) -> Result<String> {
        let declared = self
            .options
            .base_url
            .clone()
            .or_else(|| spec.servers.first().map(expand_server_url));

        let Some(base_url) = declared else {
            return Err(OpenApiToolsError::Config(
                "No base URL configured and none found in spec".to_string(),
            ));
        };
        resolve_base_url(&base_url, self.options.spec_location.as_deref())
    }

    fn convert_operation(
        &self,
        resolver: &RefResolver,
        input: &OperationInput<'_>,
    ) -> Result<(ToolDefinition, OperationRecord)> {
        let operation = input.operation;
        let method_name = operation
            .operation_id
            .clone()
            .unwrap_or_else(|| generate_canonical_name(input.method, input.path));

        let resource = match &self.options.grouping {
            ToolGrouping::Tag => operation.tags.first().cloned(),
            ToolGrouping::Fixed(name) => Some(name.clone()),
            ToolGrouping::None => None,
        };

        let full_name = match &resource {
            Some(r) => format!("{r}-{method_name}"),
            None => method_name.clone(),
        };
        let name = tool_name(&full_name, self.options.name_policy);

        let mut schemas = SchemaConverter::new(resolver);
        let (parameters, request_body) = collect_parameters(resolver, &mut schemas, input)?;
        let input_schema = schemas.finish(build_input_schema(&parameters));

        let return_schema = derive_return_schema(resolver, operation);
        let description = tool_description(resolver, operation, input.method, input.path);

        let definition = ToolDefinition {
            name,
            resource,
            method_name: method_name.clone(),
            description,
            input_schema,
            return_schema,
            http_method: input.method,
        };
        let record = OperationRecord {
            operation_id: method_name,
            method: input.method,
            path_template: input.path.to_string(),
            parameters,
            request_body,
        };
        Ok((definition, record))
    }
}

fn collect_parameters(
    resolver: &RefResolver,
    schemas: &mut SchemaConverter<'_>,
    input: &OperationInput<'_>,
) -> Result<(Vec<ParameterSpec>, Option<BodyShape>)> {
    let merged = merge_parameters(resolver, input.path_item_params, &input.operation.parameters)?;

    let mut parameters: Vec<ParameterSpec> = Vec::new();
    let mut names: HashSet<String> = HashSet::new();

    for param in &merged {
        let Some(spec) = extract_parameter(schemas, param) else {
            tracing::warn!(
                parameter = %param.parameter_data_ref().name,
                "cookie parameters are not supported; ignoring"
            );
            continue;
        };
        if !names.insert(spec.name.clone()) {
            return Err(OpenApiToolsError::ParamCollision(format!(
                "Parameter '{}' appears multiple times in {} {}",
                spec.name, input.method, input.path
            )));
        }
        parameters.push(spec);
    }

    let Some(body_ref) = &input.operation.request_body else {
        return Ok((parameters, None));
    };
    let body: RequestBody = resolver.resolve(body_ref)?;
    let Some(schema_ref) = json_media_schema(&body.content) else {
        return Ok((parameters, None));
    };

    let (body_params, shape) = extract_body_params(resolver, schemas, &body, schema_ref)?;
    for bp in &body_params {
        if !names.insert(bp.name.clone()) {
            return Err(OpenApiToolsError::ParamCollision(format!(
                "Body parameter '{}' collides with a path/query/header parameter in {} {}",
                bp.name, input.method, input.path
            )));
        }
    }
    parameters.extend(body_params);
    Ok((parameters, Some(shape)))
}

/// Path-item parameters first; an operation parameter with the same name and location
/// replaces the path-item one in place.
fn merge_parameters(
    resolver: &RefResolver,
    path_item_params: &[ReferenceOr<Parameter>],
    operation_params: &[ReferenceOr<Parameter>],
) -> Result<Vec<Parameter>> {
    fn key_for(p: &Parameter) -> (&'static str, String) {
        let loc = match p {
            Parameter::Path { .. } => "path",
            Parameter::Query { .. } => "query",
            Parameter::Header { .. } => "header",
            Parameter::Cookie { .. } => "cookie",
        };
        (loc, p.parameter_data_ref().name.clone())
    }

    let mut merged: Vec<Parameter> = Vec::new();
    let mut index: HashMap<(&'static str, String), usize> = HashMap::new();

    for p in path_item_params.iter().chain(operation_params) {
        let rp: Parameter = resolver.resolve(p)?;
        let k = key_for(&rp);
        if let Some(i) = index.get(&k).copied() {
            merged[i] = rp;
        } else {
            index.insert(k, merged.len());
            merged.push(rp);
        }
    }

    Ok(merged)
}

fn extract_parameter(schemas: &mut SchemaConverter<'_>, param: &Parameter) -> Option<ParameterSpec> {
    let (location, required) = match param {
        // Path params are always required.
        Parameter::Path { .. } => (ParamLocation::Path, true),
        Parameter::Query { parameter_data, .. } => {
            (ParamLocation::Query, parameter_data.required)
        }
        Parameter::Header { parameter_data, .. } => {
            (ParamLocation::Header, parameter_data.required)
        }
        Parameter::Cookie { .. } => return None,
    };
    let data = param.parameter_data_ref();

    let mut schema = match &data.format {
        ParameterSchemaOrContent::Schema(s) => schemas.convert_ref(s),
        ParameterSchemaOrContent::Content(_) => json!({"type": "string"}),
    };
    if let Some(obj) = schema.as_object_mut()
        && !obj.contains_key("description")
        && let Some(desc) = &data.description
    {
        obj.insert("description".to_string(), Value::String(desc.clone()));
    }

    Some(ParameterSpec {
        name: data.name.clone(),
        location,
        required,
        schema,
    })
}

fn extract_body_params(
    resolver: &RefResolver,
    schemas: &mut SchemaConverter<'_>,
    body: &RequestBody,
    schema_ref: &ReferenceOr<Schema>,
) -> Result<(Vec<ParameterSpec>, BodyShape)> {
    let schema: Schema = resolver.resolve(schema_ref)?;

    // A non-required body never makes its fields required: conditional requiredness
    // cannot be expressed at the argument level.
    if let SchemaKind::Type(Type::Object(obj)) = &schema.schema_kind {
        let params = obj
            .properties
            .iter()
            .map(|(prop_name, prop_schema)| ParameterSpec {
                name: prop_name.clone(),
                location: ParamLocation::Body,
                required: body.required && obj.required.contains(prop_name),
                schema: schemas.convert_ref(prop_schema),
            })
            .collect();
        return Ok((params, BodyShape::Fields));
    }

    let mut whole = schemas.convert_ref(schema_ref);
    if let Some(obj) = whole.as_object_mut()
        && !obj.contains_key("description")
        && let Some(desc) = &body.description
    {
        obj.insert("description".to_string(), Value::String(desc.clone()));
    }
    let param = ParameterSpec {
        name: "body".to_string(),
        location: ParamLocation::Body,
        required: body.required,
        schema: whole,
    };
    Ok((vec![param], BodyShape::Whole))
}

fn json_media_schema(
    content: &openapiv3::Content,
) -> Option<&ReferenceOr<Schema>> {
    let mt = content.get("application/json").or_else(|| {
        content.iter().find_map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            lower.contains("json").then_some(v)
        })
    })?;
    mt.schema.as_ref()
}

fn build_input_schema(parameters: &[ParameterSpec]) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required: Vec<String> = Vec::new();

    for param in parameters {
        properties.insert(param.name.clone(), param.schema.clone());
        if param.required {
            required.push(param.name.clone());
        }
    }

    let mut schema = json!({
        "type": "object",
        "properties": properties,
    });
    if !required.is_empty() {
        schema["required"] = json!(required);
    }
    schema
}

/// Schema of the lowest explicit 2xx response (else the `2XX` range) with a JSON media type.
fn derive_return_schema(resolver: &RefResolver, operation: &Operation) -> Option<Value> {
    let mut explicit_2xx: Vec<(u16, &ReferenceOr<Response>)> = Vec::new();
    let mut range_2xx: Option<&ReferenceOr<Response>> = None;

    for (code, resp) in &operation.responses.responses {
        match code {
            StatusCode::Code(n) if (200..300).contains(n) => explicit_2xx.push((*n, resp)),
            StatusCode::Range(2) => range_2xx = Some(resp),
            _ => {}
        }
    }
    explicit_2xx.sort_by_key(|(n, _)| *n);

    let resp_ref = explicit_2xx.first().map(|(_, r)| *r).or(range_2xx)?;
    let resp: Response = match resolver.resolve(resp_ref) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "cannot resolve success response; omitting return schema");
            return None;
        }
    };
    let schema_ref = json_media_schema(&resp.content)?;

    let mut schemas = SchemaConverter::new(resolver);
    let converted = schemas.convert_ref(schema_ref);
    Some(schemas.finish(converted))
}

fn tool_description(
    resolver: &RefResolver,
    operation: &Operation,
    method: HttpMethod,
    path: &str,
) -> String {
    let mut description = operation
        .summary
        .clone()
        .or_else(|| operation.description.clone())
        .unwrap_or_else(|| format!("Calls {method} {path}"));

    let mut errors: Vec<String> = Vec::new();
    for (code, resp) in &operation.responses.responses {
        let label = match code {
            StatusCode::Code(n) if !(200..300).contains(n) => n.to_string(),
            StatusCode::Range(n) if *n != 2 => format!("{n}XX"),
            _ => continue,
        };
        let text = resolver
            .resolve(resp)
            .map(|r| r.description)
            .unwrap_or_default();
        errors.push(format!("{label}: {text}"));
    }

    if !errors.is_empty() {
        description.push_str("\n\nError Responses:\n");
        description.push_str(&errors.join("\n"));
    }
    description
}

/// Apply the configured length policy to a full `{resource}-{method}` name.
#[must_use]
pub fn tool_name(full_name: &str, policy: NamePolicy) -> String {
    if full_name.chars().count() <= MAX_TOOL_NAME_LEN {
        return full_name.to_string();
    }
    match policy {
        NamePolicy::Truncate => full_name.chars().take(MAX_TOOL_NAME_LEN).collect(),
        NamePolicy::HashSuffix => {
            let digest = hex::encode(Sha256::digest(full_name.as_bytes()));
            let keep = MAX_TOOL_NAME_LEN - HASH_SUFFIX_HEX_LEN - 1;
            let prefix: String = full_name.chars().take(keep).collect();
            format!("{prefix}-{}", &digest[..HASH_SUFFIX_HEX_LEN])
        }
    }
}

/// Generate a method name from method and path when the operation has no `operationId`.
fn generate_canonical_name(method: HttpMethod, path: &str) -> String {
    let name = format!("{}_{}", method.as_str().to_lowercase(), path);
    let name = PATH_PARAM_RE.replace_all(&name, "_$1");
    let name = NON_ALNUM_RE.replace_all(&name, "_");
    name.trim_matches('_').to_string()
}

/// Substitute server variables with their defaults (`https://{region}.api.com`).
fn expand_server_url(server: &Server) -> String {
    let mut url = server.url.clone();
    if let Some(vars) = &server.variables {
        for (name, var) in vars {
            url = url.replace(&format!("{{{name}}}"), &var.default);
        }
    }
    url
}

fn resolve_base_url(base_url: &str, spec_location: Option<&str>) -> Result<String> {
    if base_url.starts_with("http://") || base_url.starts_with("https://") {
        return Ok(base_url.trim_end_matches('/').to_string());
    }

    // Relative server URLs ("/v1") resolve against the document URL when it was fetched.
    if let Some(location) = spec_location
        && (location.starts_with("http://") || location.starts_with("https://"))
    {
        let spec_url = Url::parse(location).map_err(|e| {
            OpenApiToolsError::Config(format!("Invalid OpenAPI spec URL '{location}': {e}"))
        })?;
        let resolved = spec_url.join(base_url).map_err(|e| {
            OpenApiToolsError::Config(format!(
                "Invalid base URL '{base_url}': {e} (set a base URL explicitly)"
            ))
        })?;
        return Ok(resolved.as_str().trim_end_matches('/').to_string());
    }

    Err(OpenApiToolsError::Config(format!(
        "Invalid base URL '{base_url}': must be an absolute http(s) URL (set a base URL explicitly)",
    )))
}
