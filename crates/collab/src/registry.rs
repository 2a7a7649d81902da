//! Tool registry — resolves descriptors across the configured tool servers
//! and hosts the built-in server (calculator, github read-only).

use std::sync::Arc;

use serde_json::{json, Value};

use rl_domain::tool::ToolDescriptor;

use crate::traits::{ToolServer, ToolServerFailure};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lookup table over every registered tool server.
pub struct ToolRegistry {
    servers: Vec<Arc<dyn ToolServer>>,
}

impl ToolRegistry {
    pub fn new(servers: Vec<Arc<dyn ToolServer>>) -> Self {
        Self { servers }
    }

    pub fn with_builtin() -> Self {
        Self::new(vec![Arc::new(BuiltinToolServer::new())])
    }

    /// Resolve a tool by name and hosting server.
    pub fn resolve(
        &self,
        tool_name: &str,
        server_id: &str,
    ) -> Option<(ToolDescriptor, Arc<dyn ToolServer>)> {
        self.servers
            .iter()
            .find(|s| s.server_id() == server_id)
            .and_then(|server| {
                server
                    .descriptors()
                    .into_iter()
                    .find(|d| d.name == tool_name)
                    .map(|d| (d, server.clone()))
            })
    }

    /// Find a tool by name alone (first server that advertises it).
    pub fn find(&self, tool_name: &str) -> Option<(ToolDescriptor, Arc<dyn ToolServer>)> {
        self.servers.iter().find_map(|server| {
            server
                .descriptors()
                .into_iter()
                .find(|d| d.name == tool_name)
                .map(|d| (d, server.clone()))
        })
    }

    /// All descriptors, for discovery events and introspection.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.servers.iter().flat_map(|s| s.descriptors()).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in tool server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The in-process tool server shipping with the engine.
pub struct BuiltinToolServer;

impl Default for BuiltinToolServer {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinToolServer {
    pub const SERVER_ID: &'static str = "builtin";

    pub fn new() -> Self {
        Self
    }

    fn calculate(arguments: &Value) -> Result<Value, ToolServerFailure> {
        let op = arguments.get("op").and_then(Value::as_str).unwrap_or("");
        let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        let result = match op {
            "add" => a + b,
            "sub" => a - b,
            "mul" => a * b,
            "div" => {
                if b == 0.0 {
                    return Err(ToolServerFailure::Application("division by zero".into()));
                }
                a / b
            }
            other => {
                return Err(ToolServerFailure::Application(format!(
                    "unknown operation: {other}"
                )))
            }
        };
        // Integer-looking results render without a trailing `.0`.
        let rendered = if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
            json!(result as i64)
        } else {
            json!(result)
        };
        Ok(json!({ "result": rendered }))
    }
}

#[async_trait::async_trait]
impl ToolServer for BuiltinToolServer {
    fn server_id(&self) -> &str {
        Self::SERVER_ID
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "calculator".into(),
                server_id: Self::SERVER_ID.into(),
                permission_scope: "calc.execute".into(),
                description: "Basic arithmetic over two operands.".into(),
                read_only: true,
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "op": { "type": "string", "enum": ["add", "sub", "mul", "div"] },
                        "a": { "type": "number" },
                        "b": { "type": "number" }
                    },
                    "required": ["op", "a", "b"]
                }),
            },
            ToolDescriptor {
                name: "github.list_issues".into(),
                server_id: Self::SERVER_ID.into(),
                permission_scope: "github.read".into(),
                description: "List open issues for a repository (read-only).".into(),
                read_only: true,
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "repo": { "type": "string" }
                    },
                    "required": ["repo"]
                }),
            },
        ]
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: &Value,
    ) -> Result<Value, ToolServerFailure> {
        match tool_name {
            "calculator" => Self::calculate(arguments),
            "github.list_issues" => {
                // Offline install: the gate admits the scope only when a
                // token is configured, but there is still no upstream here.
                Err(ToolServerFailure::Application(
                    "github upstream is not configured on this server".into(),
                ))
            }
            other => Err(ToolServerFailure::Application(format!(
                "unknown tool: {other}"
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calculator_adds() {
        let server = BuiltinToolServer::new();
        let output = server
            .invoke("calculator", &json!({"op": "add", "a": 17, "b": 32}))
            .await
            .unwrap();
        assert_eq!(output, json!({"result": 49}));
    }

    #[tokio::test]
    async fn calculator_division_by_zero_is_application_error() {
        let server = BuiltinToolServer::new();
        let err = server
            .invoke("calculator", &json!({"op": "div", "a": 1, "b": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolServerFailure::Application(_)));
    }

    #[tokio::test]
    async fn calculator_fractional_result() {
        let server = BuiltinToolServer::new();
        let output = server
            .invoke("calculator", &json!({"op": "div", "a": 1, "b": 2}))
            .await
            .unwrap();
        assert_eq!(output, json!({"result": 0.5}));
    }

    #[test]
    fn registry_resolves_by_name_and_server() {
        let registry = ToolRegistry::with_builtin();
        let (descriptor, _) = registry.resolve("calculator", "builtin").unwrap();
        assert_eq!(descriptor.permission_scope, "calc.execute");
        assert!(descriptor.read_only);

        assert!(registry.resolve("calculator", "elsewhere").is_none());
        assert!(registry.resolve("nope", "builtin").is_none());

        let (descriptor, _) = registry.find("github.list_issues").unwrap();
        assert_eq!(descriptor.permission_scope, "github.read");
    }

    #[test]
    fn registry_lists_all_descriptors() {
        let registry = ToolRegistry::with_builtin();
        let names: Vec<String> = registry
            .descriptors()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"calculator".to_string()));
        assert!(names.contains(&"github.list_issues".to_string()));
    }
}
