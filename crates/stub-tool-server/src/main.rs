use stub_tool_server::{routes, StubKind};

#[tokio::main]
async fn main() {
    let kind = match std::env::var("STUB_KIND").as_deref() {
        Ok("knowledge-base") => StubKind::KnowledgeBase,
        _ => StubKind::Calculator,
    };
    let port = std::env::var("STUB_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3020);

    println!(
        "{} running at http://127.0.0.1:{}/mcp",
        kind.server_name(),
        port
    );
    warp::serve(routes(kind)).run(([127, 0, 0, 1], port)).await;
}
