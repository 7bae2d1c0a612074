use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::client::ToolServerClient;
use super::error::ToolServerResult;
use super::observe::observed;
use super::{ToolExecutor, ToolServerDescriptor};
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::Tool;
use crate::providers::utils::sanitize_function_name;

struct Entry {
    source: String,
    executor: ToolExecutor,
}

/// The merged tool namespace for one request. Names are unique; the first registration of a
/// name wins and later ones are dropped with a warning.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    entries: HashMap<String, Entry>,
    clients: Vec<Arc<ToolServerClient>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to every server concurrently and merge their tools in the order the servers
    /// are given. A server that cannot be reached or listed is skipped.
    pub async fn discover(servers: &[ToolServerDescriptor]) -> Self {
        let mut unique: Vec<&ToolServerDescriptor> = Vec::with_capacity(servers.len());
        for descriptor in servers {
            if !unique.contains(&descriptor) {
                unique.push(descriptor);
            }
        }

        let outcomes = join_all(
            unique
                .iter()
                .map(|descriptor| discover_server((*descriptor).clone())),
        )
        .await;

        let mut registry = Self::new();
        for (descriptor, outcome) in unique.iter().zip(outcomes) {
            match outcome {
                Ok((client, tools)) => registry.add_server(client, tools),
                Err(e) => warn!(
                    endpoint = %descriptor.url,
                    error = %e,
                    "tool server discovery failed, continuing without its tools"
                ),
            }
        }

        info!(
            servers = unique.len(),
            connected = registry.clients.len(),
            tools = registry.len(),
            "tool discovery finished"
        );
        registry
    }

    /// Add a tool under its sanitized name. Returns false when the name is already taken.
    pub fn register(&mut self, tool: Tool, source: &str, executor: ToolExecutor) -> bool {
        let name = sanitize_function_name(&tool.name);

        if let Some(existing) = self.entries.get(&name) {
            warn!(
                tool = %name,
                kept = %existing.source,
                ignored = %source,
                "tool name collision, keeping the first registration"
            );
            return false;
        }

        self.entries.insert(
            name.clone(),
            Entry {
                source: source.to_string(),
                executor: observed(name.clone(), executor),
            },
        );
        self.tools.push(Tool { name, ..tool });
        true
    }

    fn add_server(&mut self, client: Arc<ToolServerClient>, tools: Vec<Tool>) {
        for tool in tools {
            let server = client.clone();
            let remote_name = tool.name.clone();
            let executor: ToolExecutor = Arc::new(move |arguments: Value| {
                let server = server.clone();
                let remote_name = remote_name.clone();
                async move { server.call_tool(&remote_name, arguments).await }.boxed()
            });
            self.register(tool, client.endpoint(), executor);
        }
        self.clients.push(client);
    }

    /// Tool definitions in registration order
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<ToolExecutor> {
        self.entries.get(name).map(|entry| entry.executor.clone())
    }

    /// Where a tool came from: the server endpoint, or the label given to `register`
    pub fn source(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|entry| entry.source.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn call(&self, name: &str, arguments: Value) -> AgentResult<Value> {
        let executor = self
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        executor(arguments).await
    }

    /// Close every server session opened during discovery
    pub async fn close(&self) {
        join_all(self.clients.iter().map(|client| client.close())).await;
    }
}

async fn discover_server(
    descriptor: ToolServerDescriptor,
) -> ToolServerResult<(Arc<ToolServerClient>, Vec<Tool>)> {
    let client = ToolServerClient::connect(descriptor).await?;
    match client.list_tools().await {
        Ok(tools) => Ok((Arc::new(client), tools)),
        Err(e) => {
            client.close().await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stub_tool_server::StubKind;

    fn stub(kind: StubKind) -> ToolServerDescriptor {
        ToolServerDescriptor::new(stub_tool_server::endpoint(stub_tool_server::spawn(kind)))
    }

    fn names(registry: &ToolRegistry) -> Vec<&str> {
        registry.tools().iter().map(|t| t.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_no_servers() {
        let registry = ToolRegistry::discover(&[]).await;
        assert!(registry.is_empty());
        registry.close().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_does_not_block_others() -> anyhow::Result<()> {
        let unreachable = ToolServerDescriptor::new("http://127.0.0.1:1/mcp");
        let calculator = stub(StubKind::Calculator);

        let registry = ToolRegistry::discover(&[unreachable, calculator]).await;
        assert_eq!(names(&registry), vec!["calculate"]);

        let output = registry
            .call("calculate", json!({"expression": "6*7"}))
            .await?;
        assert_eq!(output["content"][0]["text"], "42");
        Ok(())
    }

    #[tokio::test]
    async fn test_same_server_twice_is_idempotent() {
        let calculator = stub(StubKind::Calculator);
        let knowledge_base = stub(StubKind::KnowledgeBase);

        let once = ToolRegistry::discover(&[calculator.clone(), knowledge_base.clone()]).await;
        let twice =
            ToolRegistry::discover(&[calculator.clone(), knowledge_base, calculator]).await;

        assert_eq!(once.tools(), twice.tools());
        assert_eq!(names(&twice), vec!["calculate", "search_knowledge_base"]);
    }

    #[tokio::test]
    async fn test_collision_keeps_first_server() {
        let first = stub(StubKind::Calculator);
        let second = stub(StubKind::Calculator);

        let registry = ToolRegistry::discover(&[first.clone(), second]).await;
        assert_eq!(names(&registry), vec!["calculate"]);
        assert_eq!(registry.source("calculate"), Some(first.url.as_str()));
    }

    #[tokio::test]
    async fn test_register_sanitizes_and_rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        let echo: ToolExecutor =
            Arc::new(|arguments: Value| async move { Ok::<_, AgentError>(arguments) }.boxed());

        assert!(registry.register(
            Tool::new("local echo.v1", "Echo", json!({"type": "object"})),
            "local",
            echo.clone()
        ));
        assert!(!registry.register(
            Tool::new("local_echo_v1", "Echo again", json!({"type": "object"})),
            "other",
            echo
        ));

        assert_eq!(names(&registry), vec!["local_echo_v1"]);
        assert_eq!(
            registry.call("local_echo_v1", json!({"x": 1})).await,
            Ok(json!({"x": 1}))
        );
        assert_eq!(
            registry.call("missing", json!({})).await,
            Err(AgentError::ToolNotFound("missing".to_string()))
        );
    }
}
