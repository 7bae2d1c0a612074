//! A deterministic JSON-RPC tool server.
//!
//! Serves `POST /mcp` with the `initialize`, `tools/list` and `tools/call` methods, which is
//! enough for conduit's registry to discover and invoke tools without a real deployment.
use serde_json::{json, Value};
use std::net::SocketAddr;
use warp::http::StatusCode;
use warp::Filter;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// Which canned tool set the server exposes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubKind {
    Calculator,
    KnowledgeBase,
}

impl StubKind {
    pub fn server_name(&self) -> &'static str {
        match self {
            StubKind::Calculator => "stub-calculator",
            StubKind::KnowledgeBase => "stub-knowledge-base",
        }
    }

    fn tools(&self) -> Value {
        match self {
            StubKind::Calculator => json!([{
                "name": "calculate",
                "description": "Evaluate a simple math expression",
                "inputSchema": {
                    "type": "object",
                    "properties": { "expression": { "type": "string" } },
                    "required": ["expression"]
                }
            }]),
            StubKind::KnowledgeBase => json!([{
                "name": "search_knowledge_base",
                "description": "Return deterministic snippet for testing",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" },
                        "top_k": { "type": "number" }
                    },
                    "required": ["query"]
                }
            }]),
        }
    }

    fn call(&self, name: &str, arguments: &Value) -> Option<Value> {
        match (self, name) {
            (StubKind::Calculator, "calculate") => {
                let expression = arguments
                    .get("expression")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                Some(match evaluate(expression) {
                    Some(result) => json!({
                        "content": [{ "type": "text", "text": format_number(result) }],
                        "structuredContent": { "result": result }
                    }),
                    None => json!({
                        "content": [{
                            "type": "text",
                            "text": format!("Could not evaluate expression: {}", expression)
                        }],
                        "isError": true
                    }),
                })
            }
            (StubKind::KnowledgeBase, "search_knowledge_base") => {
                let query = arguments
                    .get("query")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let results = json!([{
                    "id": "kb-1",
                    "score": 0.99,
                    "text": format!("RAG snippet for: {}", query)
                }]);
                Some(json!({
                    "content": [{ "type": "text", "text": results.to_string() }],
                    "structuredContent": { "results": results }
                }))
            }
            _ => None,
        }
    }
}

/// Answer a single JSON-RPC message. Notifications (no id) yield `None`.
pub fn handle_rpc(kind: StubKind, request: &Value) -> Option<Value> {
    let id = request.get("id").cloned().filter(|id| !id.is_null())?;
    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or_default();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": kind.server_name(), "version": "0.1.0" }
        })),
        "tools/list" => Ok(json!({ "tools": kind.tools() })),
        "tools/call" => {
            let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            kind.call(name, &arguments)
                .ok_or_else(|| (INVALID_PARAMS, format!("Unknown tool: {}", name)))
        }
        _ => Err((METHOD_NOT_FOUND, "Method not found".to_string())),
    };

    Some(match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }),
    })
}

pub fn routes(
    kind: StubKind,
) -> impl Filter<Extract = (Box<dyn warp::Reply>,), Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::path("mcp"))
        .and(warp::path::end())
        .and(warp::body::json())
        .map(move |request: Value| -> Box<dyn warp::Reply> {
            match handle_rpc(kind, &request) {
                Some(response) => Box::new(warp::reply::json(&response)),
                None => Box::new(StatusCode::ACCEPTED),
            }
        })
}

/// Serve on an ephemeral localhost port from inside a running tokio runtime
pub fn spawn(kind: StubKind) -> SocketAddr {
    let (addr, server) = warp::serve(routes(kind)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

pub fn endpoint(addr: SocketAddr) -> String {
    format!("http://{}/mcp", addr)
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Evaluates `+ - * /` with parentheses and unary minus over decimal literals.
pub fn evaluate(expression: &str) -> Option<f64> {
    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if tokens.is_empty() {
        return None;
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() || !value.is_finite() {
        return None;
    }
    Some(value)
}

struct Parser {
    tokens: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().filter(|c| *c == '+' || *c == '-') {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek().filter(|c| *c == '*' || *c == '/') {
            self.pos += 1;
            let rhs = self.factor()?;
            value = if op == '*' { value * rhs } else { value / rhs };
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.peek()? {
            '-' => {
                self.pos += 1;
                self.factor().map(|v| -v)
            }
            '(' => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek()? != ')' {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            _ => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_digit() || c == '.')
                {
                    self.pos += 1;
                }
                self.tokens[start..self.pos]
                    .iter()
                    .collect::<String>()
                    .parse()
                    .ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate() {
        assert_eq!(evaluate("1+2"), Some(3.0));
        assert_eq!(evaluate("2 * (3 + 4)"), Some(14.0));
        assert_eq!(evaluate("-4 / 2"), Some(-2.0));
        assert_eq!(evaluate("1 +"), None);
        assert_eq!(evaluate("1/0"), None);
        assert_eq!(evaluate(""), None);
    }

    #[test]
    fn test_initialize_and_list() {
        let init = handle_rpc(
            StubKind::Calculator,
            &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .unwrap();
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);

        let list = handle_rpc(
            StubKind::KnowledgeBase,
            &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .unwrap();
        assert_eq!(list["id"], 2);
        assert_eq!(list["result"]["tools"][0]["name"], "search_knowledge_base");
    }

    #[test]
    fn test_calculate_call() {
        let response = handle_rpc(
            StubKind::Calculator,
            &json!({
                "jsonrpc": "2.0",
                "id": "abc",
                "method": "tools/call",
                "params": {"name": "calculate", "arguments": {"expression": "1+2"}}
            }),
        )
        .unwrap();
        assert_eq!(response["id"], "abc");
        assert_eq!(response["result"]["content"][0]["text"], "3");
        assert_eq!(response["result"]["structuredContent"]["result"], 3.0);
    }

    #[test]
    fn test_errors_and_notifications() {
        let unknown = handle_rpc(
            StubKind::Calculator,
            &json!({"jsonrpc": "2.0", "id": 7, "method": "prompts/list"}),
        )
        .unwrap();
        assert_eq!(unknown["error"]["code"], METHOD_NOT_FOUND);

        let wrong_tool = handle_rpc(
            StubKind::Calculator,
            &json!({"jsonrpc": "2.0", "id": 8, "method": "tools/call", "params": {"name": "nope"}}),
        )
        .unwrap();
        assert_eq!(wrong_tool["error"]["code"], INVALID_PARAMS);

        assert!(handle_rpc(
            StubKind::Calculator,
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .is_none());
    }
}
