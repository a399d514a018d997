//! Tests for kernel sessions and the stateful interpreter

#[cfg(test)]
mod tests {
    use agenticx_sandbox::interpreter::StatefulCodeInterpreter;
    use agenticx_sandbox::kernel::{kernel_available, KernelManager};
    use agenticx_sandbox::types::SandboxError;

    // ==================== KernelManager ====================

    #[tokio::test]
    async fn test_kernel_state_persists() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        let result = manager.execute("x = 1 + 1", None, None).await.unwrap();
        assert!(result.success);

        let result = manager.execute("print(x)", None, None).await.unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("2"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_imports_persist() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        manager.execute("import math", None, None).await.unwrap();
        let result = manager
            .execute("print(math.floor(2.7))", None, None)
            .await
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert!(result.stdout.contains("2"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_function_definitions_persist() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        let result = manager
            .execute("def greet(n): return f'Hello, {n}!'", None, None)
            .await
            .unwrap();
        assert!(result.success);

        let result = manager
            .execute("print(greet('World'))", None, None)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("Hello, World!"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_error_reported() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        let result = manager
            .execute("raise ValueError('kaput')", None, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("ValueError"));
        assert!(result.stderr.contains("kaput"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_expression_result() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        let result = manager.execute("40 + 2", None, None).await.unwrap();
        assert!(result.success);
        assert_eq!(
            result.metadata.get("result").and_then(|v| v.as_str()),
            Some("42")
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_restart_clears_state() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        manager.execute("marker = 'alive'", None, None).await.unwrap();
        manager.restart(None).await.unwrap();

        let result = manager.execute("print(marker)", None, None).await.unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("NameError"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_sessions_are_isolated() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        let first = manager.create_session("python3").await.unwrap();
        let second = manager.create_session("python3").await.unwrap();

        manager
            .execute("secret = 41", Some(&first), None)
            .await
            .unwrap();
        let result = manager
            .execute("print(secret)", Some(&second), None)
            .await
            .unwrap();
        assert!(!result.success);

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_timeout() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();

        let result = manager
            .execute("import time\ntime.sleep(10)", None, Some(1))
            .await;
        match result {
            Err(SandboxError::Timeout { timeout_secs }) => assert_eq!(timeout_secs, 1),
            other => panic!("expected timeout, got {other:?}"),
        }

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_kernel_list_sessions() {
        if !kernel_available() {
            return;
        }
        let manager = KernelManager::new().unwrap();
        manager.start().await.unwrap();
        manager.execute("pass", None, None).await.unwrap();

        let sessions = manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].is_alive);
        assert_eq!(sessions[0].execution_count, 1);
        assert_eq!(sessions[0].kernel_name, "python3");

        manager.stop().await;
        assert!(manager.list_sessions().await.is_empty());
    }

    // ==================== StatefulCodeInterpreter ====================

    #[tokio::test]
    async fn test_interpreter_kernel_backend() {
        if !kernel_available() {
            return;
        }
        let mut interpreter = StatefulCodeInterpreter::new();
        interpreter.start().await.unwrap();
        assert_eq!(interpreter.backend(), Some("kernel"));
        assert!(interpreter.session_id().is_some());
        assert!(interpreter.context_id().is_none());

        let result = interpreter.execute("x = 1 + 1", None).await.unwrap();
        assert!(result.success);
        let result = interpreter.execute("print(x)", None).await.unwrap();
        assert!(result.stdout.contains("2"));
        assert_eq!(
            result.metadata.get("backend").and_then(|v| v.as_str()),
            Some("kernel")
        );

        interpreter.stop().await;
        assert!(interpreter.backend().is_none());
    }

    #[tokio::test]
    async fn test_interpreter_reset_clears_state() {
        if !kernel_available() {
            return;
        }
        let mut interpreter = StatefulCodeInterpreter::new();
        interpreter.start().await.unwrap();

        interpreter.execute("y = 99", None).await.unwrap();
        interpreter.reset().await.unwrap();

        let result = interpreter.execute("print(y)", None).await.unwrap();
        assert!(!result.success);
        interpreter.stop().await;
    }

    #[tokio::test]
    async fn test_interpreters_do_not_share_state() {
        if !kernel_available() {
            return;
        }
        let mut first = StatefulCodeInterpreter::new();
        let mut second = StatefulCodeInterpreter::new();
        first.start().await.unwrap();
        second.start().await.unwrap();

        first.execute("token = 'one'", None).await.unwrap();
        let result = second.execute("print(token)", None).await.unwrap();
        assert!(!result.success);

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn test_interpreter_requires_some_backend() {
        let mut interpreter = StatefulCodeInterpreter::new().with_local_kernel(false);
        let result = interpreter.start().await;
        assert!(matches!(result, Err(SandboxError::KernelNotAvailable(_))));
    }

    #[tokio::test]
    async fn test_interpreter_execute_before_start() {
        let interpreter = StatefulCodeInterpreter::new();
        let result = interpreter.execute("print('hi')", None).await;
        assert!(matches!(result, Err(SandboxError::KernelNotAvailable(_))));
    }
}
