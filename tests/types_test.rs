//! Tests for core types and the error taxonomy

#[cfg(test)]
mod tests {
    use agenticx_sandbox::types::*;
    use std::str::FromStr;

    // ==================== Enums ====================

    #[test]
    fn test_sandbox_kind_strings() {
        assert_eq!(SandboxKind::CodeInterpreter.to_string(), "code_interpreter");
        assert_eq!(SandboxKind::Browser.to_string(), "browser");
        assert_eq!(SandboxKind::Aio.to_string(), "aio");
        assert_eq!(
            SandboxKind::from_str("code_interpreter").unwrap(),
            SandboxKind::CodeInterpreter
        );
    }

    #[test]
    fn test_sandbox_status_strings() {
        assert_eq!(SandboxStatus::Pending.to_string(), "pending");
        assert_eq!(SandboxStatus::Creating.to_string(), "creating");
        assert_eq!(SandboxStatus::Running.to_string(), "running");
        assert_eq!(SandboxStatus::Stopping.to_string(), "stopping");
        assert_eq!(SandboxStatus::Stopped.to_string(), "stopped");
        assert_eq!(SandboxStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!(CodeLanguage::from_str("py").unwrap(), CodeLanguage::Python);
        assert_eq!(CodeLanguage::from_str("sh").unwrap(), CodeLanguage::Shell);
        assert_eq!(
            CodeLanguage::from_str("javascript").unwrap(),
            CodeLanguage::Javascript
        );
        assert!(CodeLanguage::from_str("cobol").is_err());
    }

    // ==================== ExecutionResult ====================

    #[test]
    fn test_execution_result_defaults() {
        let result = ExecutionResult::default();
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
        assert_eq!(result.exit_code, 0);
        assert!(result.success);
        assert_eq!(result.duration_ms, 0.0);
        assert_eq!(result.language, "python");
        assert!(!result.truncated);
        assert!(result.metadata.is_empty());
    }

    #[test]
    fn test_execution_result_success_derived_from_exit_code() {
        assert!(ExecutionResult::new("out", "", 0).success);
        assert!(!ExecutionResult::new("", "boom", 1).success);
        assert!(!ExecutionResult::new("", "", -1).success);
    }

    #[test]
    fn test_execution_result_output_prefers_stdout() {
        let result = ExecutionResult::new("hello", "noise", 0);
        assert_eq!(result.output(), "hello");
        let failed = ExecutionResult::new("", "error text", 1);
        assert_eq!(failed.output(), "error text");
    }

    // ==================== HealthStatus ====================

    #[test]
    fn test_health_status_defaults() {
        let status = HealthStatus::default();
        assert_eq!(status.status, HealthState::Unknown);
        assert!(!status.is_healthy());
    }

    #[test]
    fn test_health_status_ok() {
        let status = HealthStatus::ok("fine", 5.2);
        assert_eq!(status.status, HealthState::Ok);
        assert!(status.is_healthy());
        assert_eq!(status.latency_ms, 5.2);
    }

    #[test]
    fn test_health_status_unhealthy() {
        let status = HealthStatus::unhealthy("connection timeout", 0.0);
        assert!(!status.is_healthy());
        assert!(status.message.contains("timeout"));
    }

    // ==================== Records ====================

    #[test]
    fn test_file_info() {
        let info = FileInfo {
            path: "/data".to_string(),
            size: 4096,
            is_dir: true,
            permissions: "drwxr-xr-x".to_string(),
            modified_at: None,
        };
        assert!(info.is_dir);
        assert_eq!(info.size, 4096);
    }

    #[test]
    fn test_process_info() {
        let info = ProcessInfo::running(1234, "python script.py");
        assert_eq!(info.pid, 1234);
        assert_eq!(info.status, "running");
        assert_eq!(info.cpu_percent, 0.0);
    }

    // ==================== Error taxonomy ====================

    #[test]
    fn test_timeout_error_carries_budget() {
        let error = SandboxError::timeout(30);
        match error {
            SandboxError::Timeout { timeout_secs } => assert_eq!(timeout_secs, 30),
            other => panic!("wrong variant: {other}"),
        }
    }

    #[test]
    fn test_execution_error_carries_exit_and_stderr() {
        let error = SandboxError::execution("code error", 1, "NameError: name 'x' is not defined");
        match error {
            SandboxError::Execution {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("NameError"));
            }
            other => panic!("wrong variant: {other}"),
        }
    }

    #[test]
    fn test_backend_error_carries_name() {
        let error = SandboxError::backend("docker", "unavailable");
        match error {
            SandboxError::Backend { backend, .. } => assert_eq!(backend, "docker"),
            other => panic!("wrong variant: {other}"),
        }
    }

    #[test]
    fn test_resource_error_carries_resource() {
        let error = SandboxError::Resource {
            message: "Out of memory".to_string(),
            resource: "memory".to_string(),
        };
        match error {
            SandboxError::Resource { resource, .. } => assert_eq!(resource, "memory"),
            other => panic!("wrong variant: {other}"),
        }
    }

    #[test]
    fn test_file_not_found_is_execution_shaped() {
        let error = SandboxError::file_not_found("/tmp/missing.txt");
        assert!(matches!(error, SandboxError::Execution { .. }));
        assert!(error.to_string().contains("missing.txt"));
    }
}
