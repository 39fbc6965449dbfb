//! Dependency tree construction
//!
//! The tree is built depth-first. The components currently being expanded
//! form an ordered path stack; meeting a component that is already on the
//! stack is a cycle, reported with the full path (`A → B → A`). Subtrees that
//! were already expanded elsewhere (diamond dependencies) are reused instead
//! of being resolved again.
//!
//! The declared dependencies of one node are resolved concurrently, one
//! scoped thread per dependency, before the walk descends into them in
//! declaration order. Concurrent fetches of the same remote version are
//! collapsed by the remote tier.

use crate::component::{Component, ComponentRef, ComponentType};
use crate::resolver::ResolutionCoordinator;
use crate::{Error, Result};
use semver::Version;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Default bound on dependency depth
pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyNode {
    pub component: Component,
    pub resolved_version: Version,
    /// Constraint this node was requested with
    pub constraint: String,
    pub children: Vec<DependencyNode>,
}

impl DependencyNode {
    fn depth(&self) -> usize {
        self.children.iter().map(|c| c.depth() + 1).max().unwrap_or(0)
    }

    fn count(&self) -> usize {
        1 + self.children.iter().map(DependencyNode::count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyTree {
    pub root: DependencyNode,
}

impl DependencyTree {
    /// Every distinct component version in the tree, in depth-first order
    pub fn flatten(&self) -> Vec<&Component> {
        self.nodes().into_iter().map(|node| &node.component).collect()
    }

    /// First occurrence of every distinct component version, depth-first
    pub fn nodes(&self) -> Vec<&DependencyNode> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            let identity = (node.component.component_type, node.component.name.as_str(), &node.resolved_version);
            if seen.insert(identity) {
                out.push(node);
            }
            for child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Number of nodes, counting shared subtrees once per occurrence
    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    /// Longest root-to-leaf edge count
    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

type NodeKey = (ComponentType, String, Version);

pub struct DependencyGraphBuilder<'a> {
    coordinator: &'a ResolutionCoordinator,
    max_depth: usize,
}

/// Ordered stack of components being expanded: identity key plus display name
struct PathStack {
    entries: Vec<(String, String)>,
}

impl PathStack {
    fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    fn names_with(&self, name: &str) -> Vec<String> {
        self.entries
            .iter()
            .map(|(_, n)| n.clone())
            .chain(std::iter::once(name.to_string()))
            .collect()
    }

    fn depth(&self) -> usize {
        self.entries.len()
    }
}

impl<'a> DependencyGraphBuilder<'a> {
    pub fn new(coordinator: &'a ResolutionCoordinator) -> Self {
        Self {
            coordinator,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Resolve `root` and expand its dependency closure
    pub fn build_tree(&self, root: &ComponentRef) -> Result<DependencyTree> {
        let component = self.coordinator.resolve(root)?;
        self.build_from(component, &root.constraint)
    }

    /// Expand the dependency closure of an already resolved component
    pub fn build_from(&self, component: Component, constraint: &str) -> Result<DependencyTree> {
        let mut path = PathStack { entries: Vec::new() };
        let mut memo = HashMap::new();
        let root = self.visit(component, constraint.to_string(), &mut path, &mut memo)?;

        tracing::debug!(
            "Built dependency tree for {} '{}' ({} nodes, depth {})",
            root.component.component_type,
            root.component.name,
            root.count(),
            root.depth()
        );
        Ok(DependencyTree { root })
    }

    fn visit(
        &self,
        component: Component,
        constraint: String,
        path: &mut PathStack,
        memo: &mut HashMap<NodeKey, DependencyNode>,
    ) -> Result<DependencyNode> {
        path.entries.push((component.key(), component.name.clone()));
        let result = self.expand(&component, path, memo);
        path.entries.pop();

        let node = DependencyNode {
            resolved_version: component.version.clone(),
            component,
            constraint,
            children: result?,
        };
        memo.insert(
            (
                node.component.component_type,
                node.component.name.clone(),
                node.resolved_version.clone(),
            ),
            node.clone(),
        );
        Ok(node)
    }

    fn expand(
        &self,
        parent: &Component,
        path: &mut PathStack,
        memo: &mut HashMap<NodeKey, DependencyNode>,
    ) -> Result<Vec<DependencyNode>> {
        if parent.depends_on.is_empty() {
            return Ok(Vec::new());
        }

        let resolved = self.resolve_all(parent)?;
        let mut children = Vec::with_capacity(resolved.len());

        for (reference, child) in parent.depends_on.iter().zip(resolved) {
            let key = child.key();
            if path.contains(&key) {
                return Err(Error::CircularDependency {
                    path: path.names_with(&child.name),
                });
            }

            let child_depth = path.depth();
            let memo_key = (child.component_type, child.name.clone(), child.version.clone());
            if let Some(existing) = memo.get(&memo_key) {
                if child_depth + existing.depth() > self.max_depth {
                    return Err(self.depth_exceeded(path, &child.name));
                }
                tracing::trace!("Reusing resolved subtree for {}", key);
                children.push(DependencyNode {
                    constraint: reference.constraint.clone(),
                    ..existing.clone()
                });
                continue;
            }

            if child_depth > self.max_depth {
                return Err(self.depth_exceeded(path, &child.name));
            }

            children.push(self.visit(child, reference.constraint.clone(), path, memo)?);
        }

        Ok(children)
    }

    /// Resolve every declared dependency of `parent`, concurrently when there
    /// is more than one. Results keep declaration order; the first failure in
    /// that order wins.
    fn resolve_all(&self, parent: &Component) -> Result<Vec<Component>> {
        let refs = &parent.depends_on;
        let results: Vec<Result<Component>> = if refs.len() == 1 {
            vec![self.coordinator.resolve(&refs[0])]
        } else {
            std::thread::scope(|scope| {
                let handles: Vec<_> = refs
                    .iter()
                    .map(|reference| scope.spawn(move || self.coordinator.resolve(reference)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(Error::Validation("Dependency resolution thread panicked".to_string())))
                    })
                    .collect()
            })
        };

        refs.iter()
            .zip(results)
            .map(|(reference, result)| {
                result.map_err(|e| match e {
                    e @ Error::ComponentNotFound { .. } => Error::DependencyNotFound {
                        parent: format!("{} '{}'@{}", parent.component_type, parent.name, parent.version),
                        dependency: reference.to_string(),
                        reason: e.to_string(),
                    },
                    other => other,
                })
            })
            .collect()
    }

    fn depth_exceeded(&self, path: &PathStack, name: &str) -> Error {
        Error::DependencyDepthExceeded {
            max_depth: self.max_depth,
            path: path.names_with(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentMetadata, DependencyList, DependencySpec, SourceTier};
    use crate::store::ComponentStore;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn install(root: &Path, name: &str, version: &str, deps: &[(&str, &str)]) {
        let dir = root.join("agents").join(name).join(version);
        fs::create_dir_all(&dir).unwrap();
        let mut metadata = ComponentMetadata::new(name, version);
        metadata.dependencies = DependencyList::List(
            deps.iter()
                .map(|(n, c)| DependencySpec {
                    name: n.to_string(),
                    component_type: None,
                    version: c.to_string(),
                })
                .collect(),
        );
        metadata.save(&dir).unwrap();
    }

    fn coordinator(root: &Path) -> ResolutionCoordinator {
        ResolutionCoordinator::new(
            ComponentStore::new(root, SourceTier::Local),
            ComponentStore::new(root.join("global"), SourceTier::Global),
            None,
        )
    }

    fn root_ref(name: &str) -> ComponentRef {
        ComponentRef::new(name, ComponentType::Agent, "*")
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "A", "1.0.0", &[("B", "*")]);
        install(dir.path(), "B", "1.0.0", &[("A", "*")]);

        let coordinator = coordinator(dir.path());
        let err = DependencyGraphBuilder::new(&coordinator)
            .build_tree(&root_ref("A"))
            .unwrap_err();
        match err {
            Error::CircularDependency { path } => assert_eq!(path, vec!["A", "B", "A"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "A", "1.0.0", &[("A", "*")]);
        let coordinator = coordinator(dir.path());
        assert!(matches!(
            DependencyGraphBuilder::new(&coordinator).build_tree(&root_ref("A")),
            Err(Error::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_diamond_resolves_shared_node_once() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "app", "1.0.0", &[("left", "^1"), ("right", "^1")]);
        install(dir.path(), "left", "1.0.0", &[("core", "^2")]);
        install(dir.path(), "right", "1.2.0", &[("core", ">=2.0.0")]);
        install(dir.path(), "core", "2.3.0", &[]);

        let coordinator = coordinator(dir.path());
        let tree = DependencyGraphBuilder::new(&coordinator)
            .build_tree(&root_ref("app"))
            .unwrap();

        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.depth(), 2);
        let names: Vec<&str> = tree.flatten().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["app", "left", "core", "right"]);
        assert_eq!(tree.root.children[1].children[0].constraint, ">=2.0.0");
    }

    #[test]
    fn test_depth_limit() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "n0", "1.0.0", &[("n1", "*")]);
        install(dir.path(), "n1", "1.0.0", &[("n2", "*")]);
        install(dir.path(), "n2", "1.0.0", &[("n3", "*")]);
        install(dir.path(), "n3", "1.0.0", &[]);

        let coordinator = coordinator(dir.path());
        let tree = DependencyGraphBuilder::new(&coordinator)
            .with_max_depth(3)
            .build_tree(&root_ref("n0"))
            .unwrap();
        assert_eq!(tree.depth(), 3);

        let err = DependencyGraphBuilder::new(&coordinator)
            .with_max_depth(2)
            .build_tree(&root_ref("n0"))
            .unwrap_err();
        match err {
            Error::DependencyDepthExceeded { max_depth, path } => {
                assert_eq!(max_depth, 2);
                assert_eq!(path, vec!["n0", "n1", "n2", "n3"]);
            }
            other => panic!("expected depth error, got {other}"),
        }
    }

    #[test]
    fn test_missing_dependency_names_parent() {
        let dir = TempDir::new().unwrap();
        install(dir.path(), "app", "1.0.0", &[("present", "*"), ("absent", "^1")]);
        install(dir.path(), "present", "1.0.0", &[]);

        let coordinator = coordinator(dir.path());
        let err = DependencyGraphBuilder::new(&coordinator)
            .build_tree(&root_ref("app"))
            .unwrap_err();
        match err {
            Error::DependencyNotFound { parent, dependency, .. } => {
                assert!(parent.contains("app"));
                assert!(dependency.contains("absent"));
            }
            other => panic!("expected missing dependency, got {other}"),
        }
    }
}
