//! Dag implements the dependency graph the compiler builds for member
//! resources.
//!
//! Vertices are resource ids; an edge `a -> b` records that `a` needs a value
//! produced by `b`. The sort is stable: vertices that do not constrain each
//! other come out in the order they were added.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Error is the set of failures graph construction can report.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// VertexMissing indicates an edge named a vertex that was never added.
    #[error("vertex {0:?} does not exist")]
    VertexMissing(String),
    /// VertexExists indicates a vertex was added twice.
    #[error("vertex {0:?} already exists")]
    VertexExists(String),
    /// SelfReference indicates a vertex depending on itself.
    #[error("vertex {0:?} references itself")]
    SelfReference(String),
    /// Cycle indicates the added edges closed a loop; the path begins and
    /// ends at the repeated vertex.
    #[error("graph contains a cycle: {}", path.join(" -> "))]
    Cycle {
        /// The offending walk, trimmed to begin at the repeated vertex.
        path: Vec<String>,
    },
}

/// Result typedef for graph operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
struct Vertex {
    order: usize,
    dependencies: BTreeSet<String>,
}

/// DirectedAcyclicGraph holds the dependency relation between resource ids.
#[derive(Debug, Clone, Default)]
pub struct DirectedAcyclicGraph {
    vertices: HashMap<String, Vertex>,
}

impl DirectedAcyclicGraph {
    /// New returns an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add_vertex adds `id` with the given insertion order, used to break
    /// ties during the sort.
    pub fn add_vertex<S: ToString>(&mut self, id: S, order: usize) -> Result<()> {
        let id = id.to_string();
        if self.vertices.contains_key(&id) {
            return Err(Error::VertexExists(id));
        }
        self.vertices.insert(
            id,
            Vertex {
                order,
                dependencies: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Contains reports whether `id` is a vertex.
    pub fn contains(&self, id: &str) -> bool {
        self.vertices.contains_key(id)
    }

    /// Len reports the number of vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    /// Is_empty reports whether the graph has no vertices.
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Dependencies_of reports the direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &str) -> Result<Vec<String>> {
        self.vertices
            .get(id)
            .map(|v| v.dependencies.iter().cloned().collect())
            .ok_or_else(|| Error::VertexMissing(id.to_string()))
    }

    /// Add_dependencies records that `from` depends on every id in `to`.
    ///
    /// The call is transactional: if the new edges close a cycle, they are
    /// removed again and the cycle is reported.
    pub fn add_dependencies<S, I>(&mut self, from: &str, to: I) -> Result<()>
    where
        S: AsRef<str>,
        I: IntoIterator<Item = S>,
    {
        if !self.vertices.contains_key(from) {
            return Err(Error::VertexMissing(from.to_string()));
        }
        let mut added = Vec::new();
        for dep in to {
            let dep = dep.as_ref();
            if dep == from {
                self.rollback(from, &added);
                return Err(Error::SelfReference(from.to_string()));
            }
            if !self.vertices.contains_key(dep) {
                self.rollback(from, &added);
                return Err(Error::VertexMissing(dep.to_string()));
            }
            let vertex = self.vertices.get_mut(from).expect("vertex checked above");
            if vertex.dependencies.insert(dep.to_string()) {
                added.push(dep.to_string());
            }
        }
        if let Some(path) = self.find_cycle() {
            self.rollback(from, &added);
            return Err(Error::Cycle { path });
        }
        Ok(())
    }

    fn rollback(&mut self, from: &str, added: &[String]) {
        if let Some(vertex) = self.vertices.get_mut(from) {
            for dep in added {
                vertex.dependencies.remove(dep);
            }
        }
    }

    /// Topological_sort returns every vertex, dependencies before dependents,
    /// insertion order preserved between unrelated vertices.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut remaining: HashMap<&str, usize> = self
            .vertices
            .iter()
            .map(|(id, v)| (id.as_str(), v.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, vertex) in &self.vertices {
            for dep in &vertex.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(id.as_str());
            }
        }

        let mut sorted = Vec::with_capacity(self.vertices.len());
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        while !ready.is_empty() {
            // Lowest insertion order first keeps declaration order between
            // unrelated vertices.
            ready.sort_by_key(|id| self.vertices[*id].order);
            let next = ready.remove(0);
            sorted.push(next.to_string());
            for dependent in dependents.get(next).into_iter().flatten() {
                let n = remaining.get_mut(dependent).expect("known vertex");
                *n -= 1;
                if *n == 0 {
                    ready.push(dependent);
                }
            }
        }

        if sorted.len() != self.vertices.len() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(Error::Cycle { path });
        }
        Ok(sorted)
    }

    /// Find_cycle walks the graph depth-first and returns the first cycle it
    /// finds, trimmed to begin (and end) at the repeated vertex.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut ids: Vec<&str> = self.vertices.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| self.vertices[*id].order);
        for id in ids {
            if visited.contains(id) {
                continue;
            }
            let mut stack = Vec::new();
            let mut on_stack = HashSet::new();
            if let Some(path) = self.visit(id, &mut visited, &mut stack, &mut on_stack) {
                return Some(path);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(id);
        stack.push(id);
        on_stack.insert(id);
        for dep in &self.vertices[id].dependencies {
            let dep = dep.as_str();
            if on_stack.contains(dep) {
                let start = stack.iter().position(|v| *v == dep).expect("on stack");
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(dep.to_string());
                return Some(path);
            }
            if !visited.contains(dep) {
                if let Some(path) = self.visit(dep, visited, stack, on_stack) {
                    return Some(path);
                }
            }
        }
        stack.pop();
        on_stack.remove(id);
        None
    }
}
