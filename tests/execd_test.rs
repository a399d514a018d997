//! Tests for the execd HTTP client against a canned local server

#[cfg(test)]
mod tests {
    use agenticx_sandbox::execd::ExecdClient;
    use agenticx_sandbox::types::SandboxError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve every request with one canned response, then close the
    /// connection. Returns the endpoint URL.
    async fn spawn_server(
        status: &'static str,
        content_type: &'static str,
        body: &'static str,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 65536];
                    let mut total = 0usize;
                    loop {
                        let Ok(n) = stream.read(&mut buf[total..]).await else {
                            return;
                        };
                        if n == 0 {
                            break;
                        }
                        total += n;
                        let text = String::from_utf8_lossy(&buf[..total]).to_string();
                        if let Some(header_end) = text.find("\r\n\r\n") {
                            let content_length = text
                                .lines()
                                .find_map(|line| {
                                    let lower = line.to_ascii_lowercase();
                                    lower
                                        .strip_prefix("content-length:")
                                        .and_then(|v| v.trim().parse::<usize>().ok())
                                })
                                .unwrap_or(0);
                            if total >= header_end + 4 + content_length {
                                break;
                            }
                        }
                        if total == buf.len() {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    // ==================== Health ====================

    #[tokio::test]
    async fn test_ping_ok() {
        let endpoint = spawn_server("200 OK", "application/json", r#"{"status":"ok"}"#).await;
        let client = ExecdClient::new(endpoint);
        assert!(client.ping().await);
    }

    #[tokio::test]
    async fn test_ping_unhealthy_daemon() {
        let endpoint =
            spawn_server("200 OK", "application/json", r#"{"status":"degraded"}"#).await;
        let client = ExecdClient::new(endpoint);
        assert!(!client.ping().await);
    }

    // ==================== Code execution ====================

    #[tokio::test]
    async fn test_execute_code_parses_logs() {
        let endpoint = spawn_server(
            "200 OK",
            "application/json",
            r#"{"logs":{"stdout":[{"text":"hi "},{"text":"there"}],"stderr":[{"text":"warn"}]},"result":[{"text":"42"}],"exit_code":0,"context_id":"ctx-1"}"#,
        )
        .await;
        let client = ExecdClient::new(endpoint);

        let result = client
            .execute_code("print('hi')", "python", None, None, false)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hi there");
        assert_eq!(result.stderr, "warn");
        assert_eq!(result.result, "42");
        assert_eq!(result.context_id.as_deref(), Some("ctx-1"));
        assert_eq!(result.output(), "42");
        assert!(result.duration_ms > 0.0);
    }

    #[tokio::test]
    async fn test_execute_code_non_2xx_returns_failed_result() {
        let endpoint = spawn_server("500 Internal Server Error", "text/plain", "boom").await;
        let client = ExecdClient::new(endpoint);

        let result = client
            .execute_code("print('hi')", "python", None, None, false)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("500"));
    }

    #[tokio::test]
    async fn test_connection_refused_raises_after_retries() {
        // Nothing listens on the discard port.
        let client = ExecdClient::new("http://127.0.0.1:9").with_max_retries(2);
        let result = client
            .execute_code("print('hi')", "python", None, None, false)
            .await;
        match result {
            Err(SandboxError::ExecdConnection { endpoint, .. }) => {
                assert!(endpoint.contains("127.0.0.1:9"))
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_code_streaming() {
        let endpoint = spawn_server(
            "200 OK",
            "text/event-stream",
            "data: {\"type\":\"stdout\",\"text\":\"a\"}\n\ndata: {\"type\":\"stdout\",\"text\":\"b\"}\n\ndata: not json at all\n\ndata: {\"type\":\"result\",\"text\":\"'ab'\"}\n\ndata: {\"type\":\"exit\",\"exit_code\":0}\n\n",
        )
        .await;
        let client = ExecdClient::new(endpoint);

        let result = client
            .execute_code("print('ab')", "python", None, None, true)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "ab");
        assert_eq!(result.result, "'ab'");
        assert_eq!(result.exit_code, 0);
    }

    // ==================== Contexts ====================

    #[tokio::test]
    async fn test_create_context() {
        let endpoint = spawn_server(
            "200 OK",
            "application/json",
            r#"{"context_id":"ctx-abc","created_at":"2026-01-01T00:00:00Z"}"#,
        )
        .await;
        let client = ExecdClient::new(endpoint);

        let context = client.create_context("python").await.unwrap();
        assert_eq!(context.context_id, "ctx-abc");
        assert_eq!(context.language, "python");
        assert!(context.created_at.is_some());
    }

    #[tokio::test]
    async fn test_create_context_id_fallback_key() {
        let endpoint = spawn_server("200 OK", "application/json", r#"{"id":"ctx-alt"}"#).await;
        let client = ExecdClient::new(endpoint);
        let context = client.create_context("python").await.unwrap();
        assert_eq!(context.context_id, "ctx-alt");
    }

    #[tokio::test]
    async fn test_list_contexts() {
        let endpoint = spawn_server(
            "200 OK",
            "application/json",
            r#"{"contexts":[{"id":"a","language":"python"},{"context_id":"b"}]}"#,
        )
        .await;
        let client = ExecdClient::new(endpoint);
        let contexts = client.list_contexts().await.unwrap();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].context_id, "a");
        assert_eq!(contexts[1].context_id, "b");
    }

    // ==================== Commands ====================

    #[tokio::test]
    async fn test_run_command_parses_response() {
        let endpoint = spawn_server(
            "200 OK",
            "application/json",
            r#"{"logs":{"stdout":["done"],"stderr":[]},"exit_code":0,"pid":4321}"#,
        )
        .await;
        let client = ExecdClient::new(endpoint);

        let result = client
            .run_command("ls", false, None, None, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "done");
        assert_eq!(result.pid, Some(4321));
    }

    #[tokio::test]
    async fn test_kill_command() {
        let endpoint = spawn_server("200 OK", "application/json", "{}").await;
        let client = ExecdClient::new(endpoint);
        assert!(client.kill_command(4321, 15).await);
    }

    // ==================== Files ====================

    #[tokio::test]
    async fn test_read_file() {
        let endpoint =
            spawn_server("200 OK", "application/json", r#"{"content":"Hello World"}"#).await;
        let client = ExecdClient::new(endpoint);
        let content = client.read_file("/tmp/test.txt").await.unwrap();
        assert_eq!(content, "Hello World");
    }

    #[tokio::test]
    async fn test_read_file_data_key() {
        let endpoint = spawn_server("200 OK", "application/json", r#"{"data":"alt"}"#).await;
        let client = ExecdClient::new(endpoint);
        assert_eq!(client.read_file("/tmp/x").await.unwrap(), "alt");
    }

    #[tokio::test]
    async fn test_write_file() {
        let endpoint = spawn_server("200 OK", "application/json", "{}").await;
        let client = ExecdClient::new(endpoint);
        client
            .write_file("/tmp/test.txt", "Hello World", 0o644)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_directory_tolerates_key_spellings() {
        let endpoint = spawn_server(
            "200 OK",
            "application/json",
            r#"{"entries":[{"path":"/a","name":"a","size":3,"isDir":true,"modifiedAt":"2026-01-01"}]}"#,
        )
        .await;
        let client = ExecdClient::new(endpoint);
        let entries = client.list_directory("/", false).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].modified_at.as_deref(), Some("2026-01-01"));
    }

    #[tokio::test]
    async fn test_metrics() {
        let endpoint =
            spawn_server("200 OK", "application/json", r#"{"executions":12}"#).await;
        let client = ExecdClient::new(endpoint);
        let metrics = client.get_metrics().await.unwrap();
        assert_eq!(metrics.get("executions").and_then(|v| v.as_u64()), Some(12));
    }
}
