use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;

/// Errors raised while registering a node with the resolver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError<K: Debug> {
    #[error("duplicate key {0:?}")]
    Duplicate(K),
    #[error("{0:?} depends on itself")]
    SelfDependency(K),
    #[error("dependency cycle {0:?}")]
    Cycle(Vec<K>),
}

struct Node<K> {
    deps: Vec<K>,
    unresolved: usize,
}

/// Incremental dependency tracker.
///
/// Each registered node keeps a counter of dependencies that have not yet
/// completed, and every dependency keeps a list of its dependents. Completing
/// a key only touches its direct dependents, so finding newly eligible nodes
/// costs O(out-degree) instead of a rescan of everything pending.
///
/// Generic over the key so the task scheduler (UUIDs) and the workflow engine
/// (step ids) share the same algorithm.
pub struct DependencyResolver<K> {
    nodes: HashMap<K, Node<K>>,
    dependents: HashMap<K, Vec<K>>,
    completed: HashSet<K>,
    ready: VecDeque<K>,
}

impl<K: Clone + Eq + Hash + Debug> DependencyResolver<K> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            dependents: HashMap::new(),
            completed: HashSet::new(),
            ready: VecDeque::new(),
        }
    }

    /// Register `key` with its dependencies.
    ///
    /// Dependencies may name keys that are not registered yet; they stay
    /// unresolved until such a key is inserted and completed. Returns whether
    /// the node is immediately ready.
    pub fn insert(&mut self, key: K, deps: &[K]) -> Result<bool, ResolveError<K>> {
        if self.nodes.contains_key(&key) || self.completed.contains(&key) {
            return Err(ResolveError::Duplicate(key));
        }
        if deps.contains(&key) {
            return Err(ResolveError::SelfDependency(key));
        }
        // Only forward references can point back at a brand-new key.
        for dep in deps {
            if let Some(mut path) = self.path_between(dep, &key) {
                path.insert(0, key.clone());
                return Err(ResolveError::Cycle(path));
            }
        }

        let mut unique: Vec<K> = Vec::with_capacity(deps.len());
        for dep in deps {
            if !unique.contains(dep) {
                unique.push(dep.clone());
            }
        }

        let mut unresolved = 0;
        for dep in &unique {
            if !self.completed.contains(dep) {
                unresolved += 1;
                self.dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(key.clone());
            }
        }

        self.nodes.insert(
            key.clone(),
            Node {
                deps: unique,
                unresolved,
            },
        );
        if unresolved == 0 {
            self.ready.push_back(key);
            return Ok(true);
        }
        Ok(false)
    }

    /// Mark `key` as successfully finished and return the dependents that
    /// became ready because of it.
    pub fn complete(&mut self, key: &K) -> Vec<K> {
        if !self.completed.insert(key.clone()) {
            return Vec::new();
        }
        self.nodes.remove(key);

        let mut newly_ready = Vec::new();
        for dependent in self.dependents.remove(key).unwrap_or_default() {
            if let Some(node) = self.nodes.get_mut(&dependent) {
                node.unresolved = node.unresolved.saturating_sub(1);
                if node.unresolved == 0 {
                    newly_ready.push(dependent.clone());
                    self.ready.push_back(dependent);
                }
            }
        }
        newly_ready
    }

    /// Drop a node that will never complete (cancelled or failed). Its
    /// dependents stay blocked.
    pub fn remove(&mut self, key: &K) -> bool {
        self.ready.retain(|k| k != key);
        self.nodes.remove(key).is_some()
    }

    /// Drop the dependents list kept for `key`.
    pub fn forget(&mut self, key: &K) {
        self.dependents.remove(key);
    }

    /// Drain the keys that became ready since the last call, in the order
    /// they became ready.
    pub fn take_ready(&mut self) -> Vec<K> {
        self.ready.drain(..).collect()
    }

    /// True if `key` is registered and has no unresolved dependencies.
    pub fn is_ready(&self, key: &K) -> bool {
        self.nodes.get(key).is_some_and(|n| n.unresolved == 0)
    }

    pub fn is_completed(&self, key: &K) -> bool {
        self.completed.contains(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    /// Number of registered nodes not yet completed or removed.
    pub fn pending_count(&self) -> usize {
        self.nodes.len()
    }

    /// Registered, not yet completed keys.
    pub fn pending_keys(&self) -> Vec<K> {
        self.nodes.keys().cloned().collect()
    }

    /// Dependencies of `key` that have not completed yet.
    pub fn unresolved_dependencies(&self, key: &K) -> Vec<K> {
        self.nodes
            .get(key)
            .map(|n| {
                n.deps
                    .iter()
                    .filter(|d| !self.completed.contains(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(dependent, missing)` pairs where `missing` was never registered.
    pub fn unknown_dependencies(&self) -> Vec<(K, K)> {
        let mut unknown = Vec::new();
        for (dep, dependents) in &self.dependents {
            if self.nodes.contains_key(dep) || self.completed.contains(dep) {
                continue;
            }
            for dependent in dependents {
                if self.nodes.contains_key(dependent) {
                    unknown.push((dependent.clone(), dep.clone()));
                }
            }
        }
        unknown
    }

    /// Direct dependents of `key` that are still registered.
    pub fn dependents_of(&self, key: &K) -> Vec<K> {
        self.dependents
            .get(key)
            .map(|deps| {
                deps.iter()
                    .filter(|d| self.nodes.contains_key(*d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every registered node that (transitively) depends on `key`, in
    /// breadth-first order.
    pub fn transitive_dependents(&self, key: &K) -> Vec<K> {
        let mut seen: HashSet<K> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<K> = self.dependents_of(key).into();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            queue.extend(self.dependents_of(&next));
            order.push(next);
        }
        order
    }

    /// Depth-first walk along dependency edges from `from`, returning the
    /// path if `target` is reachable.
    fn path_between(&self, from: &K, target: &K) -> Option<Vec<K>> {
        if from == target {
            return Some(vec![from.clone()]);
        }
        let mut stack: Vec<(K, usize)> = vec![(from.clone(), 0)];
        let mut visited: HashSet<K> = HashSet::new();
        visited.insert(from.clone());

        while let Some(top) = stack.len().checked_sub(1) {
            let (node, next_child) = (stack[top].0.clone(), stack[top].1);
            let child = self
                .nodes
                .get(&node)
                .and_then(|n| n.deps.get(next_child))
                .cloned();
            match child {
                Some(child) => {
                    stack[top].1 += 1;
                    if &child == target {
                        let mut path: Vec<K> = stack.iter().map(|(k, _)| k.clone()).collect();
                        path.push(child);
                        return Some(path);
                    }
                    if visited.insert(child.clone()) {
                        stack.push((child, 0));
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }
        None
    }
}

impl<K: Clone + Eq + Hash + Debug> Default for DependencyResolver<K> {
    fn default() -> Self {
        Self::new()
    }
}
