//! Tool registry and function-tool schema generation.
//!
//! Tools are async handlers the agent can call back into during auto-run.
//! Registration is process-wide and atomic: `register` is insert-if-absent,
//! duplicates are rejected with a typed error, and deregistration is
//! explicit. Per-tool metrics (invocation count, latency, last error) live
//! in a table that outlives the registry's registrations, so clearing or
//! rebuilding the tool set never loses history.
//!
//! ## Handler type
//!
//! Handlers are stored as `Arc<dyn Fn(..) -> Pin<Box<dyn Future>>>`: the
//! `Arc` makes tools cheap to clone into agent tasks, the pinned boxed
//! future erases each handler's concrete async type so they can share one
//! registry, and the `Send + Sync` bounds let turns on different runtime
//! threads invoke them concurrently.
//!
//! # Examples
//!
//! ```rust,no_run
//! use codex_sdk::registry::{ToolRegistry, tool};
//! use serde_json::json;
//!
//! let weather = tool("get_weather", "Get current weather for a city")
//!     .param("city", "string")
//!     .build(|args, _ctx| async move {
//!         let city = args["city"].as_str().unwrap_or("Unknown");
//!         Ok(json!({"city": city, "temp_c": 21}))
//!     });
//!
//! ToolRegistry::global().register(weather).unwrap();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::telemetry::{self, events};

/// Identifiers for the invocation a tool is servicing.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub call_id: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
}

/// Type-erased async tool handler.
pub type ToolHandler = Arc<
    dyn Fn(Value, ToolContext) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// A named, schema'd, executable tool.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    parameters: Value,
    handler: ToolHandler,
}

impl Tool {
    /// Create a tool. `parameters` is either a simple
    /// `{"name": "type"}` declaration (expanded to a strict schema) or an
    /// already-complete JSON Schema (passed through).
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: strict_schema(parameters),
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Run the handler.
    pub async fn execute(&self, arguments: Value, context: ToolContext) -> Result<Value> {
        (self.handler)(arguments, context).await
    }

    /// Declaration shape advertised to the agent.
    pub fn to_declaration(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Handlers aren't debuggable; show the metadata only.
impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Expand a simple parameter declaration into a strict JSON Schema:
/// every declared parameter is required and undeclared properties are
/// rejected. A value that already looks like a full schema (has `type` and
/// `properties`) passes through untouched.
fn strict_schema(parameters: Value) -> Value {
    let Some(decl) = parameters.as_object() else {
        return json!({
            "type": "object",
            "properties": {},
            "required": [],
            "additionalProperties": false,
        });
    };

    if decl.contains_key("type") && decl.contains_key("properties") {
        return parameters;
    }

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (name, ty) in decl {
        let schema_type = match ty.as_str() {
            Some("string" | "str") => "string",
            Some("number" | "float" | "f32" | "f64") => "number",
            Some("integer" | "int" | "i32" | "i64" | "u32" | "u64") => "integer",
            Some("boolean" | "bool") => "boolean",
            Some("array" | "list" | "vec") => "array",
            Some("object" | "dict" | "map") => "object",
            _ => "string",
        };
        properties.insert(name.clone(), json!({"type": schema_type}));
        required.push(Value::String(name.clone()));
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Builder with a fluent `.param()` API.
pub struct ToolBuilder {
    name: String,
    description: String,
    parameters: Map<String, Value>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Map::new(),
        }
    }

    /// Declare one parameter with a simple type name
    /// (`string`, `number`, `integer`, `boolean`, `object`, `array`).
    pub fn param(mut self, name: &str, type_name: &str) -> Self {
        self.parameters
            .insert(name.to_string(), Value::String(type_name.to_string()));
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Tool::new(
            self.name,
            self.description,
            Value::Object(self.parameters),
            handler,
        )
    }
}

/// Convenience entry point mirroring [`ToolBuilder::new`].
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}

/// Per-tool usage counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolMetrics {
    pub invocations: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub last_latency_ms: u64,
    pub last_error: Option<String>,
}

/// Enablement gate and error conversion attached to a registration.
#[derive(Clone, Default)]
pub struct ToolOptions {
    enabled: Option<Arc<dyn Fn(&ToolContext) -> bool + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&Error) -> Value + Send + Sync>>,
}

impl ToolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate the tool on a host predicate; a disabled tool rejects with
    /// [`Error::ToolDisabled`].
    pub fn enabled_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ToolContext) -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Arc::new(predicate));
        self
    }

    /// Convert handler errors into a normal output instead of failing the
    /// invocation.
    pub fn on_error<F>(mut self, converter: F) -> Self
    where
        F: Fn(&Error) -> Value + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(converter));
        self
    }
}

struct Registration {
    tool: Tool,
    options: ToolOptions,
}

/// Process-wide ordered tool table.
pub struct ToolRegistry {
    tools: Mutex<BTreeMap<String, Registration>>,
}

static GLOBAL: OnceLock<ToolRegistry> = OnceLock::new();

// Metrics survive registry clears and re-registrations.
static METRICS: OnceLock<Mutex<HashMap<String, ToolMetrics>>> = OnceLock::new();

fn metrics_table() -> &'static Mutex<HashMap<String, ToolMetrics>> {
    METRICS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl ToolRegistry {
    /// The process-wide registry shared by every thread.
    pub fn global() -> &'static ToolRegistry {
        GLOBAL.get_or_init(|| ToolRegistry {
            tools: Mutex::new(BTreeMap::new()),
        })
    }

    /// A private registry (tests, embedded setups).
    pub fn new() -> Self {
        ToolRegistry {
            tools: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert-if-absent registration.
    pub fn register(&self, tool: Tool) -> Result<()> {
        self.register_with(tool, ToolOptions::default())
    }

    /// Insert-if-absent registration with options.
    pub fn register_with(&self, tool: Tool, options: ToolOptions) -> Result<()> {
        let mut tools = self.tools.lock().expect("tool registry poisoned");
        if tools.contains_key(tool.name()) {
            return Err(Error::AlreadyRegistered(tool.name().to_string()));
        }
        tools.insert(tool.name().to_string(), Registration { tool, options });
        Ok(())
    }

    /// Remove a registration. Returns whether it existed. Metrics are kept.
    pub fn deregister(&self, name: &str) -> bool {
        self.tools
            .lock()
            .expect("tool registry poisoned")
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .lock()
            .expect("tool registry poisoned")
            .contains_key(name)
    }

    /// Registered names, in order.
    pub fn names(&self) -> Vec<String> {
        self.tools
            .lock()
            .expect("tool registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Declarations for every registered tool, in name order.
    pub fn declarations(&self) -> Vec<Value> {
        self.tools
            .lock()
            .expect("tool registry poisoned")
            .values()
            .map(|r| r.tool.to_declaration())
            .collect()
    }

    /// Drop every registration. Metrics survive.
    pub fn clear(&self) {
        self.tools.lock().expect("tool registry poisoned").clear();
    }

    /// Invoke a tool, recording metrics and telemetry.
    pub async fn invoke(&self, name: &str, arguments: Value, context: ToolContext) -> Result<Value> {
        let (tool, options) = {
            let tools = self.tools.lock().expect("tool registry poisoned");
            match tools.get(name) {
                Some(registration) => {
                    (registration.tool.clone(), registration.options.clone())
                }
                None => {
                    return Err(Error::ToolCallFailed {
                        name: name.to_string(),
                        inner: Box::new(Error::invalid_input("tool is not registered")),
                    });
                }
            }
        };

        if let Some(enabled) = &options.enabled {
            if !enabled(&context) {
                return Err(Error::ToolDisabled(name.to_string()));
            }
        }

        telemetry::emit(
            events::TOOL_START,
            json!({"tool": name, "call_id": context.call_id}),
        );
        let started = Instant::now();
        let outcome = tool.execute(arguments, context.clone()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                record_metrics(name, latency_ms, None);
                telemetry::emit(
                    events::TOOL_SUCCESS,
                    json!({"tool": name, "call_id": context.call_id, "duration_ms": latency_ms}),
                );
                Ok(output)
            }
            Err(err) => {
                record_metrics(name, latency_ms, Some(err.to_string()));
                telemetry::emit(
                    events::TOOL_FAILURE,
                    json!({
                        "tool": name,
                        "call_id": context.call_id,
                        "duration_ms": latency_ms,
                        "error": err.to_string(),
                    }),
                );
                match &options.on_error {
                    Some(converter) => Ok(converter(&err)),
                    None => Err(Error::ToolCallFailed {
                        name: name.to_string(),
                        inner: Box::new(err),
                    }),
                }
            }
        }
    }

    /// A tool's metrics, if it was ever invoked.
    pub fn metrics(&self, name: &str) -> Option<ToolMetrics> {
        metrics_table()
            .lock()
            .expect("metrics table poisoned")
            .get(name)
            .cloned()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn record_metrics(name: &str, latency_ms: u64, error: Option<String>) {
    let mut table = metrics_table().lock().expect("metrics table poisoned");
    let entry = table.entry(name.to_string()).or_default();
    entry.invocations += 1;
    entry.total_latency_ms += latency_ms;
    entry.last_latency_ms = latency_ms;
    if let Some(error) = error {
        entry.failures += 1;
        entry.last_error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> Tool {
        tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args, _ctx| async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                Ok(json!({"result": a + b}))
            })
    }

    #[test]
    fn test_strict_schema_generation() {
        let tool = adder();
        let schema = tool.parameters();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["a"]["type"], "number");
        assert_eq!(schema["properties"]["b"]["type"], "number");
        assert_eq!(schema["additionalProperties"], false);
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 2);
    }

    #[test]
    fn test_full_schema_passes_through() {
        let schema = json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": ["q"],
        });
        let tool = Tool::new("search", "Search", schema.clone(), |_args, _ctx| async {
            Ok(json!({}))
        });
        assert_eq!(tool.parameters(), &schema);
    }

    #[test]
    fn test_simple_type_aliases() {
        let tool = tool("t", "aliases")
            .param("count", "i64")
            .param("ratio", "f32")
            .param("flag", "bool")
            .param("items", "vec")
            .build(|_args, _ctx| async { Ok(json!({})) });
        let props = &tool.parameters()["properties"];
        assert_eq!(props["count"]["type"], "integer");
        assert_eq!(props["ratio"]["type"], "number");
        assert_eq!(props["flag"]["type"], "boolean");
        assert_eq!(props["items"]["type"], "array");
    }

    #[test]
    fn test_declaration_shape() {
        let decl = adder().to_declaration();
        assert_eq!(decl["type"], "function");
        assert_eq!(decl["function"]["name"], "add");
        assert!(decl["function"]["parameters"].is_object());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        let err = registry.register(adder()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(ref name) if name == "add"));
    }

    #[test]
    fn test_deregister() {
        let registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        assert!(registry.deregister("add"));
        assert!(!registry.deregister("add"));
        // Re-registration works after deregistration.
        registry.register(adder()).unwrap();
    }

    #[tokio::test]
    async fn test_invoke_success_and_metrics() {
        let registry = ToolRegistry::new();
        registry.register(adder()).unwrap();

        let output = registry
            .invoke("add", json!({"a": 2, "b": 3}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(output["result"], 5.0);

        let metrics = registry.metrics("add").unwrap();
        assert!(metrics.invocations >= 1);
        assert_eq!(metrics.last_error, None);
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke("missing", json!({}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolCallFailed { ref name, .. } if name == "missing"));
    }

    #[tokio::test]
    async fn test_disabled_tool_rejects() {
        let registry = ToolRegistry::new();
        registry
            .register_with(adder(), ToolOptions::new().enabled_if(|_| false))
            .unwrap();
        let err = registry
            .invoke("add", json!({"a": 1, "b": 1}), ToolContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolDisabled(ref name) if name == "add"));
    }

    #[tokio::test]
    async fn test_on_error_converts_failure_to_output() {
        let registry = ToolRegistry::new();
        let failing = tool("explode", "Always fails").build(|_args, _ctx| async {
            Err::<Value, _>(Error::invalid_input("boom"))
        });
        registry
            .register_with(
                failing,
                ToolOptions::new().on_error(|err| json!({"error": err.to_string()})),
            )
            .unwrap();

        let output = registry
            .invoke("explode", json!({}), ToolContext::default())
            .await
            .unwrap();
        assert!(output["error"].as_str().unwrap().contains("boom"));

        let metrics = registry.metrics("explode").unwrap();
        assert!(metrics.failures >= 1);
        assert!(metrics.last_error.is_some());
    }

    #[tokio::test]
    async fn test_metrics_survive_registry_clear() {
        // Unique tool name: the metrics table is process-wide and tests run
        // in parallel.
        let survivor = tool("metrics_survivor", "counts").build(|_args, _ctx| async {
            Ok(json!({"ok": true}))
        });
        let registry = ToolRegistry::new();
        registry.register(survivor).unwrap();
        registry
            .invoke("metrics_survivor", json!({}), ToolContext::default())
            .await
            .unwrap();
        let before = registry.metrics("metrics_survivor").unwrap().invocations;

        registry.clear();
        assert!(!registry.contains("metrics_survivor"));
        // History is still there after the registrations are gone.
        assert_eq!(
            registry.metrics("metrics_survivor").unwrap().invocations,
            before
        );
    }
}
