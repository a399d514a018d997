//! Tests for sandbox templates

#[cfg(test)]
mod tests {
    use agenticx_sandbox::template::*;
    use agenticx_sandbox::types::SandboxKind;

    #[test]
    fn test_default_values() {
        let template = SandboxTemplate::new("test");
        assert_eq!(template.name, "test");
        assert_eq!(template.kind, SandboxKind::CodeInterpreter);
        assert_eq!(template.cpu, 1.0);
        assert_eq!(template.memory_mb, 2048);
        assert_eq!(template.disk_mb, 10240);
        assert_eq!(template.timeout_seconds, 300);
        assert_eq!(template.idle_timeout_seconds, 600);
        assert_eq!(template.startup_timeout_seconds, 60);
        assert_eq!(template.backend, "auto");
        assert!(!template.network_enabled);
        assert!(template.environment.is_empty());
        assert!(template.tags.is_empty());
    }

    #[test]
    fn test_validation_valid() {
        let template = SandboxTemplate::new("valid");
        assert!(template.validate().is_empty());
    }

    #[test]
    fn test_validation_invalid_cpu() {
        let mut template = SandboxTemplate::new("invalid");
        template.cpu = -1.0;
        let errors = template.validate();
        assert!(errors.iter().any(|e| e.contains("cpu")));
    }

    #[test]
    fn test_validation_invalid_memory() {
        let mut template = SandboxTemplate::new("invalid");
        template.memory_mb = 0;
        let errors = template.validate();
        assert!(errors.iter().any(|e| e.contains("memory")));
    }

    #[test]
    fn test_validation_invalid_timeout() {
        let mut template = SandboxTemplate::new("invalid");
        template.timeout_seconds = 0;
        let errors = template.validate();
        assert!(errors.iter().any(|e| e.contains("timeout")));
    }

    #[test]
    fn test_validation_empty_name() {
        let template = SandboxTemplate::new("  ");
        let errors = template.validate();
        assert!(errors.iter().any(|e| e.contains("name")));
    }

    // ==================== Document round trip ====================

    #[test]
    fn test_document_round_trip() -> anyhow::Result<()> {
        let mut template = SandboxTemplate::new("round-trip");
        template.cpu = 1.5;
        template.tags = vec!["dev".to_string(), "test".to_string()];
        template
            .environment
            .insert("DEBUG".to_string(), "1".to_string());

        let doc = template.to_document();
        assert!(doc.contains("round-trip"));
        assert!(doc.contains("\"type\""));

        let loaded = SandboxTemplate::from_document(&doc)?;
        assert_eq!(loaded, template);
        Ok(())
    }

    #[test]
    fn test_from_document_applies_defaults() {
        let doc = r#"{"name": "partial", "cpu": 2.0}"#;
        let template = SandboxTemplate::from_document(doc).unwrap();
        assert_eq!(template.name, "partial");
        assert_eq!(template.cpu, 2.0);
        assert_eq!(template.memory_mb, 2048);
        assert_eq!(template.backend, "auto");
    }

    #[test]
    fn test_from_document_invalid() {
        assert!(SandboxTemplate::from_document("not json").is_err());
    }

    // ==================== Save / load / list ====================

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut template = SandboxTemplate::new("saved");
        template.cpu = 1.5;
        template.memory_mb = 4096;

        let path = template.save(dir.path())?;
        assert!(path.exists());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));

        let loaded = SandboxTemplate::load("saved", dir.path())?;
        assert_eq!(loaded, template);
        Ok(())
    }

    #[test]
    fn test_list_templates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            SandboxTemplate::new(format!("template-{i}"))
                .save(dir.path())
                .unwrap();
        }
        let names = SandboxTemplate::list_templates(dir.path());
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"template-1".to_string()));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SandboxTemplate::load("nope", dir.path()).is_err());
    }

    // ==================== Predefined profiles ====================

    #[test]
    fn test_default_profile() {
        let template = default_code_interpreter();
        assert_eq!(template.name, "default-code-interpreter");
        assert_eq!(template.kind, SandboxKind::CodeInterpreter);
        assert!(template.validate().is_empty());
    }

    #[test]
    fn test_lightweight_profile() {
        let template = lightweight();
        assert_eq!(template.name, "lightweight");
        assert_eq!(template.cpu, 0.5);
        assert!(template.memory_mb < default_code_interpreter().memory_mb);
        assert!(template.validate().is_empty());
    }

    #[test]
    fn test_high_performance_profile() {
        let template = high_performance();
        assert_eq!(template.name, "high-performance");
        assert!(template.cpu > default_code_interpreter().cpu);
        assert!(template.memory_mb > default_code_interpreter().memory_mb);
        assert!(template.validate().is_empty());
    }
}
