use std::collections::BTreeMap;

use crate::QueryPlan;

/// Error raised while deriving or scheduling the operation graph.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DagError {
    #[error("operation {op} depends on unknown operation {dep}")]
    UnknownDependency { op: String, dep: String },
    #[error("plan has cyclic dependencies: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// OperationDag is the derived dependency view of a plan: adjacency in both
/// directions, plus topological and layered schedules.
///
/// Nodes are indices into an arena ordered as the plan's operations;
/// adjacency is recomputed from `depends_on` rather than held by reference.
#[derive(Debug)]
pub struct OperationDag {
    ids: Vec<String>,
    index: BTreeMap<String, usize>,
    /// dependency -> dependents
    forward: Vec<Vec<usize>>,
    /// operation -> its dependencies
    reverse: Vec<Vec<usize>>,
}

impl OperationDag {
    pub fn build(plan: &QueryPlan) -> Result<Self, DagError> {
        let ids: Vec<String> = plan.operations.iter().map(|op| op.id.clone()).collect();
        let index: BTreeMap<String, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut forward = vec![Vec::new(); ids.len()];
        let mut reverse = vec![Vec::new(); ids.len()];

        for (i, op) in plan.operations.iter().enumerate() {
            for dep in &op.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(DagError::UnknownDependency {
                        op: op.id.clone(),
                        dep: dep.clone(),
                    });
                };
                forward[d].push(i);
                reverse[i].push(d);
            }
        }

        Ok(Self {
            ids,
            index,
            forward,
            reverse,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn id_of(&self, index: usize) -> &str {
        &self.ids[index]
    }

    /// Operations which depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.forward[i].iter().map(|&d| self.ids[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Operations which `id` depends on.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.reverse[i].iter().map(|&d| self.ids[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// All transitive dependents of `id`, in breadth-first order.
    pub fn transitive_dependents_of(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.ids.len()];
        let mut queue = std::collections::VecDeque::from([start]);
        let mut out = Vec::new();
        while let Some(node) = queue.pop_front() {
            for &dependent in &self.forward[node] {
                if !seen[dependent] {
                    seen[dependent] = true;
                    out.push(self.ids[dependent].as_str());
                    queue.push_back(dependent);
                }
            }
        }
        out
    }

    pub fn has_cycles(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Three-color depth-first search. On a cycle, returns the offending
    /// path closed on its first node, e.g. `["a", "b", "c", "a"]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color = vec![Color::White; self.ids.len()];

        for root in 0..self.ids.len() {
            if color[root] != Color::White {
                continue;
            }
            // Iterative DFS: each frame tracks the next out-edge to visit.
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            color[root] = Color::Gray;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if top.1 < self.forward[node].len() {
                    let next = self.forward[node][top.1];
                    top.1 += 1;
                    match color[next] {
                        Color::White => {
                            color[next] = Color::Gray;
                            stack.push((next, 0));
                        }
                        Color::Gray => {
                            // Found a back-edge; the cycle is the stack
                            // suffix from `next` through `node`.
                            let start = stack
                                .iter()
                                .position(|&(n, _)| n == next)
                                .unwrap_or(0);
                            let mut path: Vec<String> = stack[start..]
                                .iter()
                                .map(|&(n, _)| self.ids[n].clone())
                                .collect();
                            path.push(self.ids[next].clone());
                            return Some(path);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }
        None
    }

    /// A valid execution order, via Kahn's algorithm over the dependency
    /// graph.
    pub fn execution_order(&self) -> Result<Vec<String>, DagError> {
        let mut in_degree: Vec<usize> = self.reverse.iter().map(Vec::len).collect();
        let mut queue: std::collections::VecDeque<usize> = (0..self.ids.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.ids.len());

        while let Some(node) = queue.pop_front() {
            order.push(self.ids[node].clone());
            for &dependent in &self.forward[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.ids.len() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(DagError::Cycle { path });
        }
        Ok(order)
    }

    /// Groups operations into layers whose members share no dependencies.
    /// The executor treats this schedule as advisory only: it admits work
    /// as soon as dependencies complete, without waiting on layer
    /// boundaries.
    pub fn parallel_layers(&self) -> Result<Vec<Vec<String>>, DagError> {
        let mut remaining: Vec<usize> = self.reverse.iter().map(Vec::len).collect();
        let mut ready: Vec<usize> = (0..self.ids.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut scheduled = 0;
        let mut layers = Vec::new();

        while !ready.is_empty() {
            let layer: Vec<String> = ready.iter().map(|&i| self.ids[i].clone()).collect();
            scheduled += layer.len();

            let mut next = Vec::new();
            for &node in &ready {
                for &dependent in &self.forward[node] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            layers.push(layer);
            ready = next;
        }

        if scheduled != self.ids.len() {
            let path = self.find_cycle().unwrap_or_default();
            return Err(DagError::Cycle { path });
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{OpSpec, Operation, QueryPlan, SourceKind};
    use serde_json::Map;

    fn op(id: &str, deps: &[&str]) -> Operation {
        Operation::new(
            id,
            Some(SourceKind::Postgres),
            Some("postgres_main".to_string()),
            OpSpec::Sql {
                query: "SELECT 1".to_string(),
                params: vec![],
            },
        )
        .with_depends_on(deps.iter().copied())
    }

    fn plan(ops: Vec<Operation>) -> QueryPlan {
        QueryPlan::new(ops, Default::default())
    }

    #[test]
    fn diamond_orders_and_layers() {
        let plan = plan(vec![
            op("a", &[]),
            op("b", &["a"]),
            op("c", &["a"]),
            op("d", &["b", "c"]),
        ]);
        let dag = OperationDag::build(&plan).unwrap();

        assert!(!dag.has_cycles());

        let order = dag.execution_order().unwrap();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));

        let layers = dag.parallel_layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec!["a"]);
        assert_eq!(layers[2], vec!["d"]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let plan = plan(vec![op("a", &["c"]), op("b", &["a"]), op("c", &["b"])]);
        let dag = OperationDag::build(&plan).unwrap();

        let path = dag.find_cycle().expect("cycle expected");
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);

        assert!(matches!(
            dag.execution_order(),
            Err(DagError::Cycle { .. })
        ));
        assert!(matches!(
            dag.parallel_layers(),
            Err(DagError::Cycle { .. })
        ));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let plan = plan(vec![op("a", &["a"])]);
        let dag = OperationDag::build(&plan).unwrap();
        assert_eq!(
            dag.find_cycle(),
            Some(vec!["a".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let plan = plan(vec![op("a", &["ghost"])]);
        assert_eq!(
            OperationDag::build(&plan).unwrap_err(),
            DagError::UnknownDependency {
                op: "a".to_string(),
                dep: "ghost".to_string()
            }
        );
    }

    #[test]
    fn transitive_dependents_walk_the_whole_subtree() {
        let plan = plan(vec![
            op("a", &[]),
            op("b", &["a"]),
            op("c", &["b"]),
            op("d", &[]),
        ]);
        let dag = OperationDag::build(&plan).unwrap();
        assert_eq!(dag.transitive_dependents_of("a"), vec!["b", "c"]);
        assert!(dag.transitive_dependents_of("d").is_empty());
    }

    #[test]
    fn generic_compute_ops_participate() {
        let mut join = Operation::new("join", None, None, OpSpec::Generic { params: Map::new() })
            .with_depends_on(["a", "b"]);
        join.metadata.operation_type = "join".to_string();
        let plan = plan(vec![op("a", &[]), op("b", &[]), join]);
        let dag = OperationDag::build(&plan).unwrap();
        assert_eq!(dag.dependencies_of("join"), vec!["a", "b"]);
    }
}
