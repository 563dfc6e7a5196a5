//! Service dependency graph
//!
//! Built once from the service specs and never mutated. Construction checks
//! that every dependency resolves and that the dependency relation is
//! acyclic; a graph that exists is always valid.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::service::ServiceSpec;

/// Validated, immutable set of services
#[derive(Debug, Clone, Default)]
pub struct ServiceGraph {
    /// Ids in the order the specs were given
    order: Vec<String>,
    specs: HashMap<String, Arc<ServiceSpec>>,
    /// Reverse edges: id -> services that depend on it
    dependents: HashMap<String, Vec<String>>,
}

impl ServiceGraph {
    /// Validate `specs` and build the graph
    pub fn build(specs: impl IntoIterator<Item = ServiceSpec>) -> Result<Self, GraphError> {
        let mut graph = Self::default();

        for spec in specs {
            if graph.specs.contains_key(&spec.id) {
                return Err(GraphError::DuplicateService(spec.id));
            }
            graph.order.push(spec.id.clone());
            graph.specs.insert(spec.id.clone(), Arc::new(spec));
        }

        for id in &graph.order {
            for dep in &graph.specs[id].dependencies {
                if !graph.specs.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        service: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph
                    .dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(id.clone());
            }
        }

        graph.check_cycles()?;
        Ok(graph)
    }

    /// Depth-first walk from every node, tracking the active path
    fn check_cycles(&self) -> Result<(), GraphError> {
        let mut done: HashSet<&str> = HashSet::new();
        for id in &self.order {
            let mut path = Vec::new();
            self.visit(id, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<(), GraphError> {
        if let Some(start) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(GraphError::Cycle(cycle));
        }
        if done.contains(id) {
            return Ok(());
        }

        path.push(id);
        for dep in self.dependencies(id) {
            self.visit(dep, path, done)?;
        }
        path.pop();
        done.insert(id);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ServiceSpec>> {
        self.specs.get(id)
    }

    /// Service ids in declaration order
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    /// Specs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceSpec>> {
        self.order.iter().filter_map(|id| self.specs.get(id))
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &String> {
        self.specs
            .get(id)
            .into_iter()
            .flat_map(|spec| spec.dependencies.iter())
    }

    /// Services that directly depend on `id`
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(id).into_iter().flat_map(|d| d.iter())
    }

    /// A start order where every service follows its dependencies
    ///
    /// Kahn's algorithm; ties keep declaration order.
    pub fn start_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.specs[id].dependencies.len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        while let Some(id) = queue.pop_front() {
            result.push(id.to_string());
            for dependent in self.dependents(id) {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate service id: {0}")]
    DuplicateService(String),

    #[error("Service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_service(id: &str, deps: &[&str]) -> ServiceSpec {
        deps.iter()
            .fold(ServiceSpec::new(id, ["true"]), |spec, dep| spec.dependency(*dep))
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|s| s == id).unwrap()
    }

    #[test]
    fn test_empty_graph() {
        let graph = ServiceGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert_eq!(graph.start_order(), Vec::<String>::new());
    }

    #[test]
    fn test_single_node() {
        let graph = ServiceGraph::build([make_service("a", &[])]).unwrap();
        assert_eq!(graph.start_order(), vec!["a"]);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_linear_chain() {
        let graph = ServiceGraph::build([
            make_service("c", &["b"]),
            make_service("b", &["a"]),
            make_service("a", &[]),
        ])
        .unwrap();

        let order = graph.start_order();
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "b") < position(&order, "c"));
    }

    #[test]
    fn test_diamond() {
        let graph = ServiceGraph::build([
            make_service("db", &[]),
            make_service("cache", &[]),
            make_service("api", &["db", "cache"]),
            make_service("web", &["api"]),
        ])
        .unwrap();

        assert_eq!(graph.start_order(), vec!["db", "cache", "api", "web"]);
        let mut dependents: Vec<_> = graph.dependents("db").collect();
        dependents.sort();
        assert_eq!(dependents, vec!["api"]);
        assert_eq!(graph.dependencies("api").count(), 2);
    }

    #[test]
    fn test_ids_keep_declaration_order() {
        let graph = ServiceGraph::build([
            make_service("z", &[]),
            make_service("a", &[]),
            make_service("m", &[]),
        ])
        .unwrap();
        assert_eq!(graph.ids().collect::<Vec<_>>(), vec!["z", "a", "m"]);
        assert_eq!(graph.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["z", "a", "m"]);
    }

    #[test]
    fn test_cycle_reported_in_path_order() {
        let err = ServiceGraph::build([
            make_service("a", &["b"]),
            make_service("b", &["c"]),
            make_service("c", &["a"]),
        ])
        .unwrap_err();

        assert_eq!(err, GraphError::Cycle(vec!["a".into(), "b".into(), "c".into(), "a".into()]));
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn test_cycle_not_through_first_node() {
        let err = ServiceGraph::build([
            make_service("a", &["b"]),
            make_service("b", &["c"]),
            make_service("c", &["b"]),
        ])
        .unwrap_err();
        assert_eq!(err.to_string(), "Dependency cycle detected: b -> c -> b");
    }

    #[test]
    fn test_self_dependency() {
        let err = ServiceGraph::build([make_service("a", &["a"])]).unwrap_err();
        assert_eq!(err, GraphError::Cycle(vec!["a".into(), "a".into()]));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ServiceGraph::build([make_service("web", &["db"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                service: "web".into(),
                dependency: "db".into(),
            }
        );
    }

    #[test]
    fn test_duplicate_service() {
        let err =
            ServiceGraph::build([make_service("a", &[]), make_service("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateService("a".into()));
    }

    #[test]
    fn test_shared_dependency_visited_once() {
        let graph = ServiceGraph::build([
            make_service("base", &[]),
            make_service("left", &["base"]),
            make_service("right", &["base"]),
            make_service("top", &["left", "right"]),
        ])
        .unwrap();
        let order = graph.start_order();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "base");
        assert_eq!(order[3], "top");
    }
}
