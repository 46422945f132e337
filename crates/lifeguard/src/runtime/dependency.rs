//! Start ordering from `depends_on` (topological sort)

use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// Services in dependency order
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Names in start order
    order: Vec<String>,
    /// Direct dependencies per service
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the graph from `name -> depends_on` in configuration order
    pub fn build(services: &IndexMap<String, Vec<String>>) -> Result<Self, DependencyError> {
        for (name, deps) in services {
            for dep in deps {
                if !services.contains_key(dep) {
                    return Err(DependencyError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = Self::topological_sort(services)?;
        let dependencies = services
            .iter()
            .map(|(name, deps)| (name.clone(), deps.clone()))
            .collect();

        Ok(Self {
            order,
            dependencies,
        })
    }

    /// Kahn's algorithm, seeded in configuration order so ties keep file order
    fn topological_sort(
        services: &IndexMap<String, Vec<String>>,
    ) -> Result<Vec<String>, DependencyError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, deps) in services {
            in_degree.entry(name.as_str()).or_insert(0);
            for dep in deps {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = services
            .keys()
            .map(String::as_str)
            .filter(|name| in_degree.get(name).copied() == Some(0))
            .collect();

        let mut sorted: Vec<String> = Vec::with_capacity(services.len());

        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());

            if let Some(deps) = dependents.get(name) {
                for dependent in deps {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() != services.len() {
            let sorted_names: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            let cycle: Vec<String> = services
                .keys()
                .filter(|name| !sorted_names.contains(name.as_str()))
                .cloned()
                .collect();

            return Err(DependencyError::CyclicDependency(cycle));
        }

        Ok(sorted)
    }

    /// Start order (dependencies first)
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// `roots` plus everything they transitively depend on, in start order
    pub fn closure<'a>(&self, roots: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut needed: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = roots.into_iter().collect();

        while let Some(name) = stack.pop() {
            if needed.insert(name) {
                stack.extend(self.dependencies(name).iter().map(String::as_str));
            }
        }

        self.order
            .iter()
            .filter(|name| needed.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Errors that can occur when building the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Result<DependencyGraph, DependencyError> {
        let services: IndexMap<String, Vec<String>> = edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect();
        DependencyGraph::build(&services)
    }

    #[test]
    fn test_simple_dependency_order() {
        let graph = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]).unwrap();
        assert_eq!(graph.start_order(), ["a", "b", "c"]);
    }

    #[test]
    fn test_independent_services_keep_file_order() {
        let graph = graph(&[("telegram", &[]), ("pipeline", &[]), ("hedge", &[])]).unwrap();
        assert_eq!(graph.start_order(), ["telegram", "pipeline", "hedge"]);
    }

    #[test]
    fn test_diamond_dependency() {
        let graph = graph(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ])
        .unwrap();

        let order = graph.start_order();
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");
        assert!(order[1] == "b" || order[1] == "c");
        assert!(order[2] == "b" || order[2] == "c");
    }

    #[test]
    fn test_cyclic_dependency_detection() {
        let result = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);

        match result {
            Err(DependencyError::CyclicDependency(nodes)) => {
                assert_eq!(nodes, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let result = graph(&[("worker", &["queue"])]);
        assert!(matches!(
            result,
            Err(DependencyError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_closure_pulls_in_dependencies() {
        let graph = graph(&[
            ("db", &[]),
            ("memory", &["db"]),
            ("api", &["memory"]),
            ("worker", &[]),
        ])
        .unwrap();

        assert_eq!(graph.closure(["api"]), vec!["db", "memory", "api"]);
        assert_eq!(graph.closure(["worker", "db"]), vec!["db", "worker"]);
        assert!(graph.closure(std::iter::empty()).is_empty());
    }
}
