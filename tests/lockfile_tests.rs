//! Integration tests for dependency trees and forge.lock
//!
//! These run against filesystem tiers and file registries only; no network.

mod test_utils;

use forgepm::component::SourceTier;
use forgepm::lockfile::Lockfile;
use forgepm::{ComponentRef, ComponentType, Error};
use std::fs;
use test_utils::{assert_error_code, MockComponent, TestWorkspace};

fn agent(name: &str) -> ComponentRef {
    ComponentRef::new(name, ComponentType::Agent, "*")
}

/// app -> (left, right) -> core, plus a tool used by core
fn install_diamond(ws: &TestWorkspace) {
    ws.install_local(
        &MockComponent::agent("app", "1.0.0")
            .depends_on("left", "^1.0.0")
            .depends_on("right", "^1.0.0"),
    );
    ws.install_local(&MockComponent::agent("left", "1.0.0").depends_on("core", "^1.0.0"));
    ws.install_global(&MockComponent::agent("right", "1.2.0").depends_on("core", "~1.1"));
    ws.install_global(
        &MockComponent::agent("core", "1.1.4").depends_on_typed(ComponentType::Tool, "web-search", "^2.0.0"),
    );
    ws.install_global(&MockComponent::tool("web-search", "2.0.1"));
}

// ============================================================================
// Dependency Trees
// ============================================================================

mod trees {
    use super::*;

    #[test]
    fn test_diamond_closure() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);

        let tree = ws.offline_forge().build_dependency_tree(&agent("app")).unwrap();
        let names: Vec<&str> = tree.flatten().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["app", "left", "core", "web-search", "right"]);
        assert_eq!(tree.depth(), 3);
        // core and its tool appear under both branches
        assert_eq!(tree.node_count(), 7);
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let ws = TestWorkspace::new();
        ws.install_local(&MockComponent::agent("a", "1.0.0").depends_on("b", "*"));
        ws.install_local(&MockComponent::agent("b", "1.0.0").depends_on("c", "*"));
        ws.install_local(&MockComponent::agent("c", "1.0.0").depends_on("a", "*"));

        match ws.offline_forge().build_dependency_tree(&agent("a")) {
            Err(Error::CircularDependency { path }) => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("expected a circular dependency, got {:?}", other.map(|t| t.node_count())),
        }
    }

    #[test]
    fn test_depth_limit_from_config() {
        let ws = TestWorkspace::new();
        for i in 0..5 {
            let mut component = MockComponent::agent(&format!("level-{}", i), "1.0.0");
            if i < 4 {
                component = component.depends_on(&format!("level-{}", i + 1), "*");
            }
            ws.install_local(&component);
        }

        let mut config = ws.config(&[]);
        config.resolver.max_depth = 3;
        let forge = forgepm::Forge::new(config).unwrap();
        assert_error_code(forge.build_dependency_tree(&agent("level-0")), "DEPENDENCY_DEPTH_EXCEEDED");

        assert_eq!(ws.offline_forge().build_dependency_tree(&agent("level-0")).unwrap().depth(), 4);
    }

    #[test]
    fn test_missing_dependency_names_parent() {
        let ws = TestWorkspace::new();
        ws.install_local(&MockComponent::agent("app", "1.0.0").depends_on("ghost", "^9"));

        match ws.offline_forge().build_dependency_tree(&agent("app")) {
            Err(Error::DependencyNotFound { parent, dependency, .. }) => {
                assert!(parent.contains("app"));
                assert!(dependency.contains("ghost"));
            }
            other => panic!("expected a missing dependency, got {:?}", other.map(|t| t.node_count())),
        }
    }
}

// ============================================================================
// Lockfile Generation
// ============================================================================

mod generation {
    use super::*;

    #[test]
    fn test_lockfile_json_shape() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);
        ws.offline_forge().generate_lockfile(&[agent("app")], false).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(ws.lockfile_path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["generated"].is_string());

        let core = &raw["agents"]["core"];
        assert_eq!(core["version"], "1.1.4");
        assert_eq!(core["resolved"], "global");
        assert!(core["integrity"].as_str().unwrap().starts_with("sha256-"));
        assert_eq!(core["dependencies"]["tool:web-search"], "2.0.1");

        assert_eq!(raw["agents"]["app"]["dependencies"]["left"], "1.0.0");
        assert_eq!(raw["tools"]["web-search"]["resolved"], "global");
    }

    #[test]
    fn test_generation_is_deterministic() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);
        let forge = ws.offline_forge();

        let first = forge.generate_lockfile(&[agent("app")], true).unwrap();
        let second = forge.generate_lockfile(&[agent("app")], true).unwrap();
        assert_eq!(first.entries(), second.entries());
        assert_eq!(first.len(), 5);
    }

    #[test]
    fn test_existing_pins_survive_without_force() {
        let ws = TestWorkspace::new();
        ws.install_local(&MockComponent::agent("solo", "1.0.0"));
        let forge = ws.offline_forge();
        let root = ComponentRef::new("solo", ComponentType::Agent, "^1.0.0");
        forge.generate_lockfile(&[root.clone()], false).unwrap();

        ws.install_local(&MockComponent::agent("solo", "1.1.0"));
        let kept = forge.generate_lockfile(&[root.clone()], false).unwrap();
        assert_eq!(kept.get(ComponentType::Agent, "solo").unwrap().version, "1.0.0");

        let forced = forge.generate_lockfile(&[root], true).unwrap();
        assert_eq!(forced.get(ComponentType::Agent, "solo").unwrap().version, "1.1.0");
    }

    #[test]
    fn test_conflicting_versions_are_rejected() {
        let ws = TestWorkspace::new();
        ws.install_local(
            &MockComponent::agent("app", "1.0.0")
                .depends_on("left", "*")
                .depends_on("right", "*"),
        );
        ws.install_local(&MockComponent::agent("left", "1.0.0").depends_on("core", "^1"));
        ws.install_local(&MockComponent::agent("right", "1.0.0").depends_on("core", "^2"));
        ws.install_local(&MockComponent::agent("core", "1.0.0"));
        ws.install_local(&MockComponent::agent("core", "2.0.0"));

        assert_error_code(
            ws.offline_forge().generate_lockfile(&[agent("app")], false),
            "VALIDATION_ERROR",
        );
        assert!(!ws.lockfile_path().exists());
    }

    #[test]
    fn test_remote_entries_record_registry() {
        let ws = TestWorkspace::new();
        let mut registry = ws.registry("primary");
        registry.publish(&MockComponent::tool("web-search", "2.0.1"));
        ws.install_local(
            &MockComponent::agent("app", "1.0.0").depends_on_typed(ComponentType::Tool, "web-search", "^2"),
        );

        let forge = ws.forge(&[("primary", registry.url().as_str(), 1)]);
        let lockfile = forge.generate_lockfile(&[agent("app")], false).unwrap();

        let entry = lockfile.get(ComponentType::Tool, "web-search").unwrap();
        assert_eq!(entry.resolved, SourceTier::Remote);
        assert_eq!(entry.registry.as_deref(), Some("primary"));

        // Validation works from the materialised copy even with the registry gone
        fs::remove_dir_all(&registry.root).unwrap();
        let report = ws
            .forge(&[("primary", registry.url().as_str(), 1)])
            .validate_lockfile()
            .unwrap();
        assert!(report.valid, "{:?}", report.errors);
    }
}

// ============================================================================
// Lockfile Validation
// ============================================================================

mod validation {
    use super::*;

    #[test]
    fn test_fresh_lockfile_is_valid() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);
        let forge = ws.offline_forge();
        forge.generate_lockfile(&[agent("app")], false).unwrap();

        let report = forge.validate_lockfile().unwrap();
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_one_modified_file_gives_one_mismatch() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);
        let forge = ws.offline_forge();
        forge.generate_lockfile(&[agent("app")], false).unwrap();

        fs::write(ws.global.join("agents/core/1.1.4/agent.md"), "# core\n\nhand edited\n").unwrap();

        let report = forge.validate_lockfile().unwrap();
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        match &report.errors[0] {
            Error::IntegrityMismatch { name, version, .. } => {
                assert_eq!(name, "core");
                assert_eq!(version, "1.1.4");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_formatting_changes_do_not_break_integrity() {
        let ws = TestWorkspace::new();
        ws.install_local(&MockComponent::agent("solo", "1.0.0").with_file("config.json", "{\"b\": 1, \"a\": [1, 2]}"));
        let forge = ws.offline_forge();
        forge.generate_lockfile(&[agent("solo")], false).unwrap();

        let dir = ws.local.join("agents/solo/1.0.0");
        fs::write(dir.join("config.json"), "{\n  \"a\": [1, 2],\n  \"b\": 1\n}\n").unwrap();
        fs::create_dir_all(dir.join("node_modules/x")).unwrap();
        fs::write(dir.join("node_modules/x/index.js"), "noise").unwrap();

        assert!(forge.validate_lockfile().unwrap().valid);
    }

    #[test]
    fn test_problems_are_aggregated() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);
        let forge = ws.offline_forge();
        forge.generate_lockfile(&[agent("app")], false).unwrap();

        fs::remove_dir_all(ws.global.join("tools/web-search/2.0.1")).unwrap();
        fs::write(ws.local.join("agents/left/1.0.0/agent.md"), "changed").unwrap();

        let report = forge.validate_lockfile().unwrap();
        let codes: Vec<&str> = report.errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), 2);
        assert!(codes.contains(&"MISSING_COMPONENT"));
        assert!(codes.contains(&"INTEGRITY_MISMATCH"));
    }

    #[test]
    fn test_validation_does_not_modify_lockfile() {
        let ws = TestWorkspace::new();
        install_diamond(&ws);
        let forge = ws.offline_forge();
        forge.generate_lockfile(&[agent("app")], false).unwrap();
        let before = fs::read(ws.lockfile_path()).unwrap();

        fs::remove_dir_all(ws.local.join("agents/left")).unwrap();
        assert!(!forge.validate_lockfile().unwrap().valid);
        assert_eq!(fs::read(ws.lockfile_path()).unwrap(), before);
    }

    #[test]
    fn test_malformed_lockfile() {
        let ws = TestWorkspace::new();
        fs::write(ws.lockfile_path(), r#"{"version": 1, "agents": []}"#).unwrap();
        assert_error_code(Lockfile::load_from(ws.lockfile_path()), "LOCKFILE_INVALID");
    }
}
