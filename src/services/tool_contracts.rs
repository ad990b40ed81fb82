//! Tool contracts for the knowledge-store tools.
//!
//! A [`ToolContract`] declares the parameters a tool accepts, how it relates to
//! the active workspace, and an invoker that turns validated arguments into a
//! [`ToolAction`]. Contracts are plain data built once at startup; validation
//! and JSON Schema generation are both driven from the same [`ParamSpec`] list,
//! so the advertised schema and the enforced contract cannot drift apart.
//!
//! # Type Mapping
//!
//! | ParamKind   | JSON Schema                                   |
//! |-------------|-----------------------------------------------|
//! | String      | `"string"`, `maxLength`                       |
//! | Integer     | `"integer"`, `minimum`, `maximum`             |
//! | Number      | `"number"`, `minimum`, `maximum`              |
//! | StringArray | `"array"` of strings, `minItems`, `maxItems`  |
//! | Enum        | `"string"`, `enum`                            |

use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::backend_client::BackendRequest;

const ID_MAX_LEN: usize = 128;
const NAME_MAX_LEN: usize = 256;
const QUERY_MAX_LEN: usize = 2_000;
const CONTENT_MAX_LEN: usize = 50_000;
const SUMMARY_MAX_LEN: usize = 10_000;
const TAG_MAX_LEN: usize = 64;
const MAX_TAGS: usize = 32;
const MAX_GROUP_IDS: usize = 50;

const DEFAULT_SOURCE_DESCRIPTION: &str = "graphmcp";
/// The episodes endpoint has no default of its own.
const DEFAULT_LAST_N: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String {
        max_len: usize,
    },
    Integer {
        min: i64,
        max: i64,
    },
    Number {
        min: f64,
        max: f64,
    },
    StringArray {
        non_empty: bool,
        max_items: usize,
        max_len: usize,
    },
    Enum(&'static [&'static str]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    /// Values of this parameter name workspaces and are recorded as recent.
    pub workspace_ref: bool,
}

impl ParamSpec {
    fn new(name: &'static str, description: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            description,
            kind,
            required: false,
            workspace_ref: false,
        }
    }

    fn string(name: &'static str, description: &'static str, max_len: usize) -> Self {
        Self::new(name, description, ParamKind::String { max_len })
    }

    fn integer(name: &'static str, description: &'static str, min: i64, max: i64) -> Self {
        Self::new(name, description, ParamKind::Integer { min, max })
    }

    fn number(name: &'static str, description: &'static str, min: f64, max: f64) -> Self {
        Self::new(name, description, ParamKind::Number { min, max })
    }

    fn strings(name: &'static str, description: &'static str, max_items: usize) -> Self {
        Self::new(
            name,
            description,
            ParamKind::StringArray {
                non_empty: false,
                max_items,
                max_len: ID_MAX_LEN,
            },
        )
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn non_empty(mut self) -> Self {
        if let ParamKind::StringArray { non_empty, .. } = &mut self.kind {
            *non_empty = true;
        }
        self
    }

    fn workspace(mut self) -> Self {
        self.workspace_ref = true;
        self
    }

    /// Check a single (non-null) value against this parameter.
    pub fn check(&self, value: &Value) -> Result<(), FieldError> {
        match &self.kind {
            ParamKind::String { max_len } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| self.error("must be a string"))?;
                if self.required && s.trim().is_empty() {
                    return Err(self.error("must not be empty"));
                }
                if s.chars().count() > *max_len {
                    return Err(self.error(format!("must be at most {} characters", max_len)));
                }
            }
            ParamKind::Integer { min, max } => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| self.error("must be an integer"))?;
                if n < *min || n > *max {
                    return Err(self.error(format!("must be between {} and {}", min, max)));
                }
            }
            ParamKind::Number { min, max } => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| self.error("must be a number"))?;
                if n < *min || n > *max {
                    return Err(self.error(format!("must be between {} and {}", min, max)));
                }
            }
            ParamKind::StringArray {
                non_empty,
                max_items,
                max_len,
            } => {
                let items = value
                    .as_array()
                    .ok_or_else(|| self.error("must be an array of strings"))?;
                if *non_empty && items.is_empty() {
                    return Err(self.error("must not be empty"));
                }
                if items.len() > *max_items {
                    return Err(self.error(format!("must have at most {} items", max_items)));
                }
                for item in items {
                    let s = item
                        .as_str()
                        .ok_or_else(|| self.error("must be an array of strings"))?;
                    if s.trim().is_empty() || s.chars().count() > *max_len {
                        return Err(self.error(format!(
                            "items must be non-empty and at most {} characters",
                            max_len
                        )));
                    }
                }
            }
            ParamKind::Enum(allowed) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| self.error("must be a string"))?;
                if !allowed.contains(&s) {
                    return Err(self.error(format!("must be one of: {}", allowed.join(", "))));
                }
            }
        }
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> FieldError {
        FieldError::new(self.name, message)
    }

    fn schema(&self) -> Value {
        let mut schema = match &self.kind {
            ParamKind::String { max_len } => json!({
                "type": "string",
                "maxLength": max_len,
            }),
            ParamKind::Integer { min, max } => json!({
                "type": "integer",
                "minimum": min,
                "maximum": max,
            }),
            ParamKind::Number { min, max } => json!({
                "type": "number",
                "minimum": min,
                "maximum": max,
            }),
            ParamKind::StringArray {
                non_empty,
                max_items,
                max_len,
            } => json!({
                "type": "array",
                "items": { "type": "string", "minLength": 1, "maxLength": max_len },
                "minItems": if *non_empty { 1 } else { 0 },
                "maxItems": max_items,
            }),
            ParamKind::Enum(allowed) => json!({
                "type": "string",
                "enum": allowed,
            }),
        };
        schema["description"] = json!(self.description);
        schema
    }
}

/// A parameter that failed its contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// How a tool relates to the active workspace when the caller omits the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPolicy {
    /// Inherit the active workspace if one is set.
    Fill,
    /// Inherit the active workspace; fail validation if none is set.
    Require,
}

/// Validated arguments for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: &'static str,
    pub args: Map<String, Value>,
    pub credential: Option<String>,
}

impl ToolInvocation {
    pub fn str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.args.get(name).and_then(Value::as_i64)
    }

    /// A required string; validation guarantees presence.
    fn req(&self, name: &str) -> String {
        self.str(name).unwrap_or_default().to_string()
    }

    /// Copy the listed fields that are present into a JSON object.
    fn pick(&self, names: &[&str]) -> Value {
        let body: Map<String, Value> = names
            .iter()
            .filter_map(|name| self.args.get(*name).map(|v| (name.to_string(), v.clone())))
            .collect();
        Value::Object(body)
    }

    fn request(&self, request: BackendRequest) -> ToolAction {
        ToolAction::Backend(request.with_credential(self.credential.clone()))
    }
}

/// What a tool does once its arguments are valid.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolAction {
    Backend(BackendRequest),
    /// Backend call that removes `workspace`; it stops being the active one.
    DeleteWorkspace {
        request: BackendRequest,
        workspace: String,
    },
    SetContext(String),
    GetContext,
    ClearContext,
}

pub type Invoker = fn(&ToolInvocation) -> ToolAction;

#[derive(Debug, Clone)]
pub struct ToolContract {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    /// Parameter filled from the active workspace, and how.
    pub context: Option<(&'static str, ContextPolicy)>,
    pub invoker: Invoker,
}

impl ToolContract {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Check types, ranges and unknown fields of the caller-supplied arguments.
    ///
    /// Explicit `null` is treated as absent. Required-field checks run
    /// separately in [`ToolContract::check_required`] so workspace enrichment
    /// can happen in between.
    pub fn check_shape(&self, args: &mut Map<String, Value>) -> Result<(), FieldError> {
        args.retain(|_, v| !v.is_null());

        // Sorted so the reported field is stable.
        let mut names: Vec<&String> = args.keys().collect();
        names.sort();
        for name in names {
            if self.param(name).is_none() {
                return Err(FieldError::new(name.as_str(), "unknown parameter"));
            }
        }

        for spec in &self.params {
            if let Some(value) = args.get(spec.name) {
                spec.check(value)?;
            }
        }
        Ok(())
    }

    pub fn check_required(&self, args: &Map<String, Value>) -> Result<(), FieldError> {
        match self
            .params
            .iter()
            .find(|spec| spec.required && !args.contains_key(spec.name))
        {
            Some(spec) => Err(FieldError::new(spec.name, "is required")),
            None => Ok(()),
        }
    }

    /// Workspace ids named by these arguments.
    pub fn workspace_refs(&self, args: &Map<String, Value>) -> Vec<String> {
        let mut refs = Vec::new();
        for spec in self.params.iter().filter(|p| p.workspace_ref) {
            match args.get(spec.name) {
                Some(Value::String(s)) => refs.push(s.clone()),
                Some(Value::Array(items)) => {
                    refs.extend(items.iter().filter_map(Value::as_str).map(str::to_string))
                }
                _ => {}
            }
        }
        refs
    }

    /// JSON Schema for the tool's input.
    ///
    /// Context-filled parameters are never listed as required: callers may
    /// omit them and rely on the active workspace.
    pub fn input_schema(&self) -> Map<String, Value> {
        let properties: Map<String, Value> = self
            .params
            .iter()
            .map(|spec| (spec.name.to_string(), spec.schema()))
            .collect();

        let context_field = self.context.map(|(field, _)| field);
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|spec| spec.required && Some(spec.name) != context_field)
            .map(|spec| spec.name)
            .collect();

        let mut schema = Map::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert("properties".to_string(), Value::Object(properties));
        schema.insert("required".to_string(), json!(required));
        schema.insert("additionalProperties".to_string(), json!(false));
        schema
    }

    pub fn to_tool(&self) -> rmcp::model::Tool {
        rmcp::model::Tool {
            name: self.name.into(),
            description: Some(self.description.into()),
            input_schema: Arc::new(self.input_schema()),
            annotations: None,
            title: None,
            icons: None,
            output_schema: None,
        }
    }
}

fn group_id(description: &'static str) -> ParamSpec {
    ParamSpec::string("group_id", description, ID_MAX_LEN)
        .required()
        .workspace()
}

fn uuid_param(description: &'static str) -> ParamSpec {
    ParamSpec::string("uuid", description, ID_MAX_LEN).required()
}

fn tags_param() -> ParamSpec {
    ParamSpec::new(
        "tags",
        "Tags attached to the item",
        ParamKind::StringArray {
            non_empty: false,
            max_items: MAX_TAGS,
            max_len: TAG_MAX_LEN,
        },
    )
}

fn priority_param() -> ParamSpec {
    ParamSpec::integer("priority", "Priority from 0 (lowest) to 10 (highest)", 0, 10)
}

/// Every tool the gateway exposes, in catalog order.
pub fn catalog() -> Vec<ToolContract> {
    vec![
        ToolContract {
            name: "add_memory",
            description: "Store a piece of information as an episode in a workspace's knowledge graph. \
                          Uses the active workspace when group_id is omitted.",
            params: vec![
                group_id("Workspace to store the memory in"),
                ParamSpec::string("content", "Text of the memory", CONTENT_MAX_LEN).required(),
                ParamSpec::string("name", "Short name for the episode", NAME_MAX_LEN),
                ParamSpec::string("role", "Who produced the content", NAME_MAX_LEN),
                ParamSpec::new(
                    "role_type",
                    "Kind of speaker",
                    ParamKind::Enum(&["user", "assistant", "system"]),
                ),
                ParamSpec::string(
                    "source_description",
                    "Where the memory came from",
                    NAME_MAX_LEN,
                ),
                ParamSpec::string(
                    "timestamp",
                    "RFC 3339 reference time, defaults to now",
                    64,
                ),
            ],
            context: Some(("group_id", ContextPolicy::Require)),
            invoker: add_memory,
        },
        ToolContract {
            name: "search_memory",
            description: "Search facts across workspaces. Results from priority_group_id \
                          (the active workspace when omitted) are ranked first.",
            params: vec![
                ParamSpec::string("query", "Search query", QUERY_MAX_LEN).required(),
                ParamSpec::strings("group_ids", "Workspaces to search, all when omitted", MAX_GROUP_IDS)
                    .workspace(),
                ParamSpec::string(
                    "priority_group_id",
                    "Workspace whose results rank first",
                    ID_MAX_LEN,
                )
                .workspace(),
                ParamSpec::integer("max_facts", "Maximum number of facts to return", 1, 100),
                ParamSpec::integer("min_priority", "Only return facts at or above this priority", 0, 10),
                tags_param(),
            ],
            context: Some(("priority_group_id", ContextPolicy::Fill)),
            invoker: search_memory,
        },
        ToolContract {
            name: "get_episodes",
            description: "List the most recent episodes stored in a workspace.",
            params: vec![
                group_id("Workspace to read"),
                ParamSpec::integer("last_n", "Number of episodes to return (default 10)", 1, 100),
            ],
            context: Some(("group_id", ContextPolicy::Require)),
            invoker: get_episodes,
        },
        ToolContract {
            name: "list_groups",
            description: "List every workspace known to the knowledge store.",
            params: vec![],
            context: None,
            invoker: |inv| inv.request(BackendRequest::get(["groups"])),
        },
        ToolContract {
            name: "get_entities",
            description: "List entities extracted in a workspace.",
            params: vec![
                group_id("Workspace to read"),
                ParamSpec::integer("limit", "Maximum number of entities", 1, 200),
            ],
            context: Some(("group_id", ContextPolicy::Require)),
            invoker: get_entities,
        },
        ToolContract {
            name: "get_graph_stats",
            description: "Node, edge and episode counts for a workspace.",
            params: vec![group_id("Workspace to inspect")],
            context: Some(("group_id", ContextPolicy::Require)),
            invoker: |inv| inv.request(BackendRequest::get(["stats".to_string(), inv.req("group_id")])),
        },
        ToolContract {
            name: "find_relationship_path",
            description: "Find how two entities are connected in the graph. Without \
                          target_entity, returns everything reachable from the source.",
            params: vec![
                ParamSpec::string("source_entity", "Name or id of the starting entity", NAME_MAX_LEN)
                    .required(),
                ParamSpec::string("target_entity", "Name or id of the target entity", NAME_MAX_LEN),
                ParamSpec::integer("max_depth", "Maximum path length", 1, 5),
                ParamSpec::strings("group_ids", "Workspaces to search", MAX_GROUP_IDS)
                    .non_empty()
                    .workspace(),
            ],
            context: None,
            invoker: |inv| {
                inv.request(BackendRequest::post(
                    ["relationships", "find-path"],
                    inv.pick(&["source_entity", "target_entity", "max_depth", "group_ids"]),
                ))
            },
        },
        ToolContract {
            name: "list_tags",
            description: "List tags in use, optionally limited to one workspace.",
            params: vec![ParamSpec::string("group_id", "Workspace to read", ID_MAX_LEN).workspace()],
            context: Some(("group_id", ContextPolicy::Fill)),
            invoker: |inv| {
                let request = BackendRequest::get(["tags"]);
                let request = match inv.str("group_id") {
                    Some(group) => request.with_query("group_id", group),
                    None => request,
                };
                inv.request(request)
            },
        },
        ToolContract {
            name: "update_fact",
            description: "Edit a fact's text, tags or priority.",
            params: vec![
                uuid_param("Fact (entity edge) id"),
                ParamSpec::string("fact", "New fact text", SUMMARY_MAX_LEN),
                tags_param(),
                priority_param(),
            ],
            context: None,
            invoker: |inv| {
                inv.request(BackendRequest::put(
                    ["fact".to_string(), inv.req("uuid")],
                    inv.pick(&["fact", "tags", "priority"]),
                ))
            },
        },
        ToolContract {
            name: "update_entity",
            description: "Edit an entity's name, summary, tags or priority.",
            params: vec![
                uuid_param("Entity id"),
                ParamSpec::string("name", "New entity name", NAME_MAX_LEN),
                ParamSpec::string("summary", "New entity summary", SUMMARY_MAX_LEN),
                tags_param(),
                priority_param(),
            ],
            context: None,
            invoker: |inv| {
                inv.request(BackendRequest::put(
                    ["entity".to_string(), inv.req("uuid")],
                    inv.pick(&["name", "summary", "tags", "priority"]),
                ))
            },
        },
        ToolContract {
            name: "delete_episode",
            description: "Delete one episode.",
            params: vec![uuid_param("Episode id")],
            context: None,
            invoker: |inv| inv.request(BackendRequest::delete(["episode".to_string(), inv.req("uuid")])),
        },
        ToolContract {
            name: "delete_entity_edge",
            description: "Delete one fact (entity edge).",
            params: vec![uuid_param("Entity edge id")],
            context: None,
            invoker: |inv| {
                inv.request(BackendRequest::delete(["entity-edge".to_string(), inv.req("uuid")]))
            },
        },
        ToolContract {
            name: "delete_group",
            description: "Delete a workspace and everything in it. The id must be given \
                          explicitly; the active workspace is never used.",
            params: vec![ParamSpec::string("group_id", "Workspace to delete", ID_MAX_LEN).required()],
            context: None,
            invoker: |inv| {
                let workspace = inv.req("group_id");
                ToolAction::DeleteWorkspace {
                    request: BackendRequest::delete(["group".to_string(), workspace.clone()])
                        .with_credential(inv.credential.clone()),
                    workspace,
                }
            },
        },
        ToolContract {
            name: "get_entity_edge",
            description: "Fetch one fact (entity edge) by id.",
            params: vec![uuid_param("Entity edge id")],
            context: None,
            invoker: |inv| inv.request(BackendRequest::get(["entity-edge".to_string(), inv.req("uuid")])),
        },
        ToolContract {
            name: "get_entity_neighbors",
            description: "List entities within depth hops of an entity, nearest first.",
            params: vec![
                uuid_param("Entity id"),
                ParamSpec::integer("depth", "Maximum number of hops (default 1)", 1, 5),
            ],
            context: None,
            invoker: |inv| {
                let request = BackendRequest::get([
                    "relationships".to_string(),
                    "entity".to_string(),
                    inv.req("uuid"),
                    "neighbors".to_string(),
                ]);
                let request = match inv.int("depth") {
                    Some(depth) => request.with_query("depth", depth),
                    None => request,
                };
                inv.request(request)
            },
        },
        ToolContract {
            name: "find_duplicate_entities",
            description: "Find pairs of entities in a workspace whose names are semantically similar.",
            params: vec![
                group_id("Workspace to inspect"),
                ParamSpec::number(
                    "similarity_threshold",
                    "Minimum cosine similarity, 0.0 to 1.0 (default 0.85)",
                    0.0,
                    1.0,
                ),
                ParamSpec::integer("limit", "Maximum number of pairs (default 50)", 1, 200),
            ],
            context: Some(("group_id", ContextPolicy::Require)),
            invoker: find_duplicate_entities,
        },
        ToolContract {
            name: "merge_entities",
            description: "Merge one entity into another. Relationships move to the target and \
                          the source entity is deleted. This cannot be undone.",
            params: vec![
                ParamSpec::string("source_uuid", "Entity to merge from (deleted)", ID_MAX_LEN)
                    .required(),
                ParamSpec::string("target_uuid", "Entity to merge into (kept)", ID_MAX_LEN)
                    .required(),
            ],
            context: None,
            invoker: |inv| {
                inv.request(BackendRequest::post(
                    ["relationships", "merge"],
                    inv.pick(&["source_uuid", "target_uuid"]),
                ))
            },
        },
        ToolContract {
            name: "rename_tag",
            description: "Rename a tag on every entity that carries it, optionally within one workspace.",
            params: vec![
                ParamSpec::string("old_tag", "Tag to rename", TAG_MAX_LEN).required(),
                ParamSpec::string("new_tag", "New tag name", TAG_MAX_LEN).required(),
                ParamSpec::string("group_id", "Workspace to limit the rename to", ID_MAX_LEN)
                    .workspace(),
            ],
            context: Some(("group_id", ContextPolicy::Fill)),
            invoker: |inv| {
                inv.request(BackendRequest::post(
                    ["tags", "rename"],
                    inv.pick(&["old_tag", "new_tag", "group_id"]),
                ))
            },
        },
        ToolContract {
            name: "set_context",
            description: "Set the active workspace used when tools omit group_id. \
                          The active workspace is shared by every client of this gateway.",
            params: vec![group_id("Workspace to make active")],
            context: None,
            invoker: |inv| ToolAction::SetContext(inv.req("group_id")),
        },
        ToolContract {
            name: "get_context",
            description: "Show the active workspace and recently used workspaces.",
            params: vec![],
            context: None,
            invoker: |_| ToolAction::GetContext,
        },
        ToolContract {
            name: "clear_context",
            description: "Clear the active workspace.",
            params: vec![],
            context: None,
            invoker: |_| ToolAction::ClearContext,
        },
    ]
}

fn add_memory(inv: &ToolInvocation) -> ToolAction {
    let timestamp = inv
        .str("timestamp")
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    let name = inv
        .str("name")
        .map(str::to_string)
        .unwrap_or_else(|| format!("memory {}", timestamp));

    let message = json!({
        "content": inv.req("content"),
        "name": name,
        "role": inv.str("role"),
        "role_type": inv.str("role_type").unwrap_or("user"),
        "source_description": inv.str("source_description").unwrap_or(DEFAULT_SOURCE_DESCRIPTION),
        "timestamp": timestamp,
    });

    inv.request(BackendRequest::post(
        ["messages"],
        json!({
            "group_id": inv.req("group_id"),
            "messages": [message],
        }),
    ))
}

fn search_memory(inv: &ToolInvocation) -> ToolAction {
    inv.request(BackendRequest::post(
        ["search"],
        inv.pick(&[
            "query",
            "group_ids",
            "priority_group_id",
            "max_facts",
            "min_priority",
            "tags",
        ]),
    ))
}

fn get_episodes(inv: &ToolInvocation) -> ToolAction {
    inv.request(
        BackendRequest::get(["episodes".to_string(), inv.req("group_id")])
            .with_query("last_n", inv.int("last_n").unwrap_or(DEFAULT_LAST_N)),
    )
}

fn find_duplicate_entities(inv: &ToolInvocation) -> ToolAction {
    let mut request = BackendRequest::get(["duplicates".to_string(), inv.req("group_id")]);
    if let Some(threshold) = inv.args.get("similarity_threshold").and_then(Value::as_f64) {
        request = request.with_query("similarity_threshold", threshold);
    }
    if let Some(limit) = inv.int("limit") {
        request = request.with_query("limit", limit);
    }
    inv.request(request)
}

fn get_entities(inv: &ToolInvocation) -> ToolAction {
    let request = BackendRequest::get(["entities".to_string(), inv.req("group_id")]);
    let request = match inv.int("limit") {
        Some(n) => request.with_query("limit", n),
        None => request,
    };
    inv.request(request)
}
