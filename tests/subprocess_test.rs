//! Tests for the subprocess backend

#[cfg(test)]
mod tests {
    use agenticx_sandbox::backend::{SandboxBackend, SubprocessSandbox};
    use agenticx_sandbox::template::SandboxTemplate;
    use agenticx_sandbox::types::{CodeLanguage, SandboxError, SandboxStatus};

    fn python_available() -> bool {
        which::which("python3").is_ok()
    }

    async fn running_sandbox() -> SubprocessSandbox {
        let mut sandbox = SubprocessSandbox::new();
        sandbox.start().await.unwrap();
        sandbox
    }

    // ==================== Lifecycle ====================

    #[tokio::test]
    async fn test_start_stop() {
        let mut sandbox = SubprocessSandbox::new();
        assert_eq!(sandbox.status(), SandboxStatus::Pending);

        sandbox.start().await.unwrap();
        assert_eq!(sandbox.status(), SandboxStatus::Running);
        assert!(sandbox.working_dir().exists());

        sandbox.stop().await;
        assert_eq!(sandbox.status(), SandboxStatus::Stopped);
        assert!(!sandbox.working_dir().exists());
    }

    #[tokio::test]
    async fn test_start_idempotent() {
        let mut sandbox = running_sandbox().await;
        sandbox.start().await.unwrap();
        assert_eq!(sandbox.status(), SandboxStatus::Running);
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let mut sandbox = running_sandbox().await;
        sandbox.stop().await;
        sandbox.stop().await;
        assert_eq!(sandbox.status(), SandboxStatus::Stopped);
    }

    #[tokio::test]
    async fn test_execute_not_running() {
        let sandbox = SubprocessSandbox::new();
        let result = sandbox
            .execute("print('test')", CodeLanguage::Python, None)
            .await;
        assert!(matches!(result, Err(SandboxError::NotReady(_))));
    }

    // ==================== Execution ====================

    #[tokio::test]
    async fn test_execute_python_simple() {
        if !python_available() {
            return;
        }
        let mut sandbox = running_sandbox().await;
        let result = sandbox
            .execute("print('Hello, AgenticX!')", CodeLanguage::Python, None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("Hello, AgenticX!"));
        assert_eq!(result.language, "python");
        assert!(result.duration_ms > 0.0);
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_execute_python_multiline() {
        if !python_available() {
            return;
        }
        let mut sandbox = running_sandbox().await;
        let result = sandbox
            .execute(
                "x = 10\ny = 20\nprint(f'Sum: {x + y}')",
                CodeLanguage::Python,
                None,
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.stdout.contains("Sum: 30"));
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_execute_python_error() {
        if !python_available() {
            return;
        }
        let mut sandbox = running_sandbox().await;
        let result = sandbox
            .execute(
                "raise ValueError('test error')",
                CodeLanguage::Python,
                None,
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert!(result.stderr.contains("ValueError"));
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_execute_empty_code() {
        if !python_available() {
            return;
        }
        let mut sandbox = running_sandbox().await;
        let result = sandbox.execute("", CodeLanguage::Python, None).await.unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_execute_shell() {
        let mut sandbox = running_sandbox().await;
        let result = sandbox
            .execute("echo 'Hello Shell'", CodeLanguage::Shell, None)
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.stdout.contains("Hello Shell"));
        assert_eq!(result.language, "shell");
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let mut sandbox = running_sandbox().await;
        let result = sandbox
            .execute("sleep 10", CodeLanguage::Shell, Some(1))
            .await;

        match result {
            Err(SandboxError::Timeout { timeout_secs }) => assert_eq!(timeout_secs, 1),
            other => panic!("expected timeout, got {other:?}"),
        }
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let mut sandbox = running_sandbox().await;
        let result = sandbox
            .execute("console.log('hi')", CodeLanguage::Javascript, None)
            .await;

        match result {
            Err(SandboxError::Sandbox(message)) => {
                assert!(message.contains("Unsupported language"))
            }
            other => panic!("expected sandbox error, got {other:?}"),
        }
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_environment_injection() {
        if !python_available() {
            return;
        }
        let mut template = SandboxTemplate::new("env-test");
        template
            .environment
            .insert("MY_VAR".to_string(), "test_value".to_string());
        let mut sandbox = SubprocessSandbox::from_template(template);
        sandbox.start().await.unwrap();

        let result = sandbox
            .execute(
                "import os; print(os.environ.get('MY_VAR', 'not found'))",
                CodeLanguage::Python,
                None,
            )
            .await
            .unwrap();
        assert!(result.stdout.contains("test_value"));

        let sandbox_id = sandbox
            .execute(
                "import os; print(os.environ.get('AGENTICX_SANDBOX_ID', ''))",
                CodeLanguage::Python,
                None,
            )
            .await
            .unwrap();
        assert!(!sandbox_id.stdout.trim().is_empty());
        sandbox.stop().await;
    }

    // ==================== Health ====================

    #[tokio::test]
    async fn test_health_check() {
        let mut sandbox = running_sandbox().await;
        let health = sandbox.check_health().await;

        assert!(health.is_healthy());
        assert!(health.latency_ms > 0.0);
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_health_check_not_running() {
        let sandbox = SubprocessSandbox::new();
        let health = sandbox.check_health().await;
        assert!(!health.is_healthy());
    }

    // ==================== Files ====================

    #[tokio::test]
    async fn test_file_round_trip() {
        let mut sandbox = running_sandbox().await;

        sandbox.write_file("test.txt", "Hello File").await.unwrap();
        let content = sandbox.read_file("test.txt").await.unwrap();
        assert_eq!(content, "Hello File");

        let files = sandbox.list_directory("/").await.unwrap();
        assert!(files.iter().any(|f| f.path == "test.txt"));

        sandbox.delete_file("test.txt").await.unwrap();
        let files = sandbox.list_directory("/").await.unwrap();
        assert!(!files.iter().any(|f| f.path == "test.txt"));
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_read_after_delete_is_file_not_found() {
        let mut sandbox = running_sandbox().await;
        sandbox.write_file("gone.txt", "bye").await.unwrap();
        sandbox.delete_file("gone.txt").await.unwrap();

        let result = sandbox.read_file("gone.txt").await;
        match result {
            Err(SandboxError::Execution { message, .. }) => {
                assert!(message.contains("not found") || message.contains("gone.txt"))
            }
            other => panic!("expected execution error, got {other:?}"),
        }
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_path_escape_denied() {
        let mut sandbox = running_sandbox().await;

        assert!(sandbox.read_file("../outside.txt").await.is_err());
        assert!(sandbox.write_file("../outside.txt", "x").await.is_err());
        assert!(sandbox.delete_file("../../etc").await.is_err());
        sandbox.stop().await;
    }

    #[tokio::test]
    async fn test_run_command() {
        let mut sandbox = running_sandbox().await;
        let result = sandbox.run_command("pwd", None).await.unwrap();

        assert!(result.success);
        assert_eq!(result.language, "shell");
        sandbox.stop().await;
    }

    // ==================== Concurrency ====================

    #[tokio::test]
    async fn test_multiple_sandboxes() {
        let mut first = running_sandbox().await;
        let mut second = running_sandbox().await;
        assert_ne!(first.working_dir(), second.working_dir());

        first.write_file("only-here.txt", "a").await.unwrap();
        assert!(second.read_file("only-here.txt").await.is_err());

        first.stop().await;
        second.stop().await;
    }
}
