//! Line-delimited stdio transport.
//!
//! Each request is a complete JSON object terminated by `\n`; each
//! response is written the same way and flushed. One reader and one
//! writer: concurrent in-flight requests are not supported on this
//! transport (the HTTP transport is the concurrent one).

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::server::ToolServer;

/// Serve requests from stdin to stdout until EOF.
pub async fn serve(server: Arc<ToolServer>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    serve_streams(server, stdin, stdout).await
}

/// Transport loop over arbitrary streams (tests drive this directly).
pub async fn serve_streams<R, W>(
    server: Arc<ToolServer>,
    reader: R,
    mut writer: W,
) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    tracing::info!("stdio transport ready");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = server.dispatch_line(line).await;
        let mut frame = serde_json::to_string(&response)?;
        frame.push('\n');
        writer.write_all(frame.as_bytes()).await?;
        writer.flush().await?;
    }

    tracing::info!("stdio transport closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolResponse;
    use crate::server::ToolSpec;

    fn ping_server() -> Arc<ToolServer> {
        let mut server = ToolServer::new();
        server.register(
            ToolSpec::nullary("ping", "pong"),
            |_| Ok(serde_json::json!({"pong": true})),
        );
        Arc::new(server)
    }

    #[tokio::test]
    async fn test_round_trip_over_streams() {
        let server = ping_server();
        let input = b"{\"id\":\"1\",\"tool\":\"ping\"}\n\n{\"tool\":\"nope\"}\nnot json\n".to_vec();
        let mut output = Vec::new();

        serve_streams(server, &input[..], &mut output).await.expect("serve");

        let lines: Vec<ToolResponse> = String::from_utf8(output)
            .expect("utf8")
            .lines()
            .map(|l| serde_json::from_str(l).expect("parse response"))
            .collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].ok);
        assert_eq!(lines[0].id.as_deref(), Some("1"));
        assert_eq!(lines[1].error_type.as_deref(), Some("unknown_tool"));
        assert_eq!(lines[2].error_type.as_deref(), Some("parse"));
        assert!(lines[2].id.is_none());
    }
}
