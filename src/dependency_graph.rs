//! Caller → callee graph reconstructed from stored function bodies
//!
//! Construction runs the extractor over the body of every function revision
//! in effect and resolves each call target against the known definitions.
//! Cycle enumeration is a separate pass over the finished graph, so a graph
//! stays queryable when cycle detection is skipped.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ FunctionDefinition revisions                             │
//! │   _F_DOC->Post_Doc   body: "... Get_NDFL_Nach(a, b) ..." │
//! │   _F_NDFL->Get_NDFL_Nach                                 │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          │ build()   (latest revision per identity)
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ DependencyGraph                                          │
//! │   graph:    DiGraph<FunctionId, DependencyEdge>          │
//! │   index:    FunctionId → NodeIndex (identity order)      │
//! │   sites:    caller → every extracted call site           │
//! │   external: builtin / unknown targets → occurrences      │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          │ find_cycles(max_len, max_cycles)
//!                          ▼
//!        tarjan_scc → bounded elementary search per component
//! ```
//!
//! Nodes are inserted in identity order, so `NodeIndex` order is identity
//! order and every query result is independent of input order.
//!
//! Target resolution:
//! - `MODULE->Name(` resolves to exactly that identity.
//! - `Name(` resolves to the unique definition with that name, preferring
//!   the caller's own module when several modules define it.
//! - Anything else is an external call (interpreter builtin or a function
//!   outside the supplied set). It is counted, never turned into an edge.

use crate::extractor::{extract, CallSite};
use crate::function_def::{FunctionDefinition, FunctionId};
use crate::signature::current_definitions;
use chrono::{DateTime, Utc};
use petgraph::algo::{dijkstra, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::{Incoming, Outgoing};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Call depth used for the chains listed in [`FunctionInfo`]
pub const DEFAULT_CHAIN_DEPTH: usize = 5;

const MAX_INFO_CHAINS: usize = 50;

/// Aggregated calls from one function to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub caller: FunctionId,
    pub callee: FunctionId,
    /// Number of distinct call sites
    pub count: usize,
    pub ordinals: BTreeSet<usize>,
}

/// A call site together with the identity it resolved to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSite {
    pub site: CallSite,
    /// `None` for external targets
    pub callee: Option<FunctionId>,
}

/// Traversal direction for [`DependencyGraph::subgraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Callees
    Forward,
    /// Callers
    Backward,
    Both,
}

/// Neighbourhood of one function
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub function: FunctionId,
    pub callers: Vec<FunctionId>,
    pub callees: Vec<FunctionId>,
    pub in_degree: usize,
    pub out_degree: usize,
    pub call_sites: usize,
    pub unresolved_sites: usize,
    /// Downward call chains up to [`DEFAULT_CHAIN_DEPTH`] calls
    pub call_chains: Vec<Vec<FunctionId>>,
}

/// Whole-graph summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub functions: usize,
    pub edges: usize,
    /// Sites backing an edge
    pub call_sites: usize,
    pub unresolved_sites: usize,
    pub external_calls: usize,
    pub functions_by_module: BTreeMap<String, usize>,
}

/// Directed dependency graph between functions
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<FunctionId, DependencyEdge>,
    index: BTreeMap<FunctionId, NodeIndex>,
    sites: BTreeMap<FunctionId, Vec<ResolvedSite>>,
    external: BTreeMap<String, usize>,
}

impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes().eq(other.nodes())
            && self.edges().eq(other.edges())
            && self.sites == other.sites
            && self.external == other.external
    }
}

impl Eq for DependencyGraph {}

impl DependencyGraph {
    /// Build the graph from the revisions in effect at `now`
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::{TimeZone, Utc};
    /// use fansy_tracer::dependency_graph::DependencyGraph;
    /// use fansy_tracer::function_def::{FunctionDefinition, FunctionId};
    ///
    /// let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    /// let defs = vec![
    ///     FunctionDefinition::new(FunctionId::new("M", "A"), vec![], "B(); B();", at),
    ///     FunctionDefinition::new(FunctionId::new("M", "B"), vec![], "", at),
    /// ];
    /// let graph = DependencyGraph::build(&defs, at);
    /// assert_eq!(graph.node_count(), 2);
    /// let edge = graph.edge(&FunctionId::new("M", "A"), &FunctionId::new("M", "B")).unwrap();
    /// assert_eq!(edge.count, 2);
    /// ```
    pub fn build<'a, I>(definitions: I, now: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a FunctionDefinition>,
    {
        // Identity order, which fixes NodeIndex order
        let current = current_definitions(definitions, now);
        let mut graph = Self::default();

        // Phase 1: nodes and the name index used for unqualified targets
        let mut by_name: BTreeMap<&str, Vec<&FunctionId>> = BTreeMap::new();
        for def in &current {
            graph.add_node(def.id.clone());
            by_name.entry(def.id.name.as_str()).or_default().push(&def.id);
        }

        // Phase 2: extract and resolve every call site
        for def in &current {
            let caller = &def.id;
            let Some(&caller_ix) = graph.index.get(caller) else {
                continue;
            };
            let mut resolved_sites = Vec::new();
            for site in extract(&def.body) {
                let callee = resolve(&graph.index, &by_name, caller, &site);
                match callee.as_ref().and_then(|c| graph.index.get(c).copied()) {
                    Some(callee_ix) => graph.add_site(caller_ix, callee_ix, site.ordinal),
                    None => *graph.external.entry(site.target()).or_default() += 1,
                }
                resolved_sites.push(ResolvedSite { site, callee });
            }
            graph.sites.insert(caller.clone(), resolved_sites);
        }

        tracing::debug!(
            functions = graph.node_count(),
            edges = graph.edge_count(),
            external = graph.external.len(),
            "Dependency graph built"
        );
        graph
    }

    fn add_node(&mut self, function: FunctionId) -> NodeIndex {
        if let Some(&ix) = self.index.get(&function) {
            return ix;
        }
        let ix = self.graph.add_node(function.clone());
        self.index.insert(function, ix);
        ix
    }

    fn add_site(&mut self, caller: NodeIndex, callee: NodeIndex, ordinal: usize) {
        let edge = match self.graph.find_edge(caller, callee) {
            Some(edge) => edge,
            None => {
                let weight = DependencyEdge {
                    caller: self.graph[caller].clone(),
                    callee: self.graph[callee].clone(),
                    count: 0,
                    ordinals: BTreeSet::new(),
                };
                self.graph.add_edge(caller, callee, weight)
            }
        };
        let weight = &mut self.graph[edge];
        if weight.ordinals.insert(ordinal) {
            weight.count += 1;
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, function: &FunctionId) -> bool {
        self.index.contains_key(function)
    }

    /// Functions in identity order
    pub fn nodes(&self) -> impl Iterator<Item = &FunctionId> {
        self.index.keys()
    }

    /// Edges ordered by (caller, callee)
    pub fn edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        let mut edges: Vec<&DependencyEdge> = self.graph.edge_weights().collect();
        edges.sort_by(|a, b| (&a.caller, &a.callee).cmp(&(&b.caller, &b.callee)));
        edges.into_iter()
    }

    pub fn edge(&self, caller: &FunctionId, callee: &FunctionId) -> Option<&DependencyEdge> {
        let edge = self
            .graph
            .find_edge(*self.index.get(caller)?, *self.index.get(callee)?)?;
        self.graph.edge_weight(edge)
    }

    pub fn callees_of(&self, function: &FunctionId) -> Vec<&FunctionId> {
        self.neighbours(function, Outgoing)
    }

    pub fn callers_of(&self, function: &FunctionId) -> Vec<&FunctionId> {
        self.neighbours(function, Incoming)
    }

    fn neighbours(&self, function: &FunctionId, direction: petgraph::Direction) -> Vec<&FunctionId> {
        let Some(&ix) = self.index.get(function) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(ix, direction).collect();
        found.sort();
        found.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Every call site extracted from `caller`'s body, in ordinal order
    pub fn sites_of(&self, caller: &FunctionId) -> &[ResolvedSite] {
        self.sites.get(caller).map_or(&[], Vec::as_slice)
    }

    /// All (caller, site) pairs
    pub fn sites(&self) -> impl Iterator<Item = (&FunctionId, &ResolvedSite)> {
        self.sites
            .iter()
            .flat_map(|(caller, sites)| sites.iter().map(move |s| (caller, s)))
    }

    /// Unresolvable targets (builtins, functions outside the set) by occurrence
    pub fn external_calls(&self) -> &BTreeMap<String, usize> {
        &self.external
    }

    /// Functions containing a call site whose delimiters never balanced
    pub fn needs_review(&self) -> Vec<&FunctionId> {
        self.sites
            .iter()
            .filter(|(_, sites)| sites.iter().any(|s| !s.site.is_resolved()))
            .map(|(caller, _)| caller)
            .collect()
    }

    pub fn function_info(&self, function: &FunctionId) -> Option<FunctionInfo> {
        if !self.contains(function) {
            return None;
        }
        let callers: Vec<FunctionId> = self.callers_of(function).into_iter().cloned().collect();
        let callees: Vec<FunctionId> = self.callees_of(function).into_iter().cloned().collect();
        let sites = self.sites_of(function);
        Some(FunctionInfo {
            function: function.clone(),
            in_degree: callers.len(),
            out_degree: callees.len(),
            callers,
            callees,
            call_sites: sites.len(),
            unresolved_sites: sites.iter().filter(|s| !s.site.is_resolved()).count(),
            call_chains: self.call_chains(function, DEFAULT_CHAIN_DEPTH, MAX_INFO_CHAINS),
        })
    }

    /// Graph restricted to functions within `depth` hops of `focus`
    ///
    /// `Both` follows edges in either direction at every hop. Returns an
    /// empty graph if `focus` is unknown.
    pub fn subgraph(&self, focus: &FunctionId, depth: usize, direction: Direction) -> Self {
        let Some(&start) = self.index.get(focus) else {
            return Self::default();
        };

        let mut keep: BTreeSet<NodeIndex> = BTreeSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((node, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            let next: Vec<NodeIndex> = match direction {
                Direction::Forward => self.graph.neighbors_directed(node, Outgoing).collect(),
                Direction::Backward => self.graph.neighbors_directed(node, Incoming).collect(),
                Direction::Both => self.graph.neighbors_undirected(node).collect(),
            };
            for n in next {
                if keep.insert(n) {
                    queue.push_back((n, hops + 1));
                }
            }
        }

        let mut sub = Self::default();
        for &n in &keep {
            sub.add_node(self.graph[n].clone());
        }
        for edge in self.edges() {
            if let (Some(&caller), Some(&callee)) =
                (sub.index.get(&edge.caller), sub.index.get(&edge.callee))
            {
                sub.graph.add_edge(caller, callee, edge.clone());
            }
        }
        for &n in &keep {
            let node = &self.graph[n];
            if let Some(sites) = self.sites.get(node) {
                let inner: Vec<ResolvedSite> = sites
                    .iter()
                    .filter(|s| s.callee.as_ref().is_some_and(|c| sub.contains(c)))
                    .cloned()
                    .collect();
                sub.sites.insert(node.clone(), inner);
            }
        }
        sub
    }

    /// Shortest caller → callee chain from `from` to `to`
    ///
    /// Among equally short chains the one through the smallest identities
    /// (compared from the end) is returned.
    pub fn call_path(&self, from: &FunctionId, to: &FunctionId) -> Option<Vec<FunctionId>> {
        let (&from_ix, &to_ix) = (self.index.get(from)?, self.index.get(to)?);
        if from_ix == to_ix {
            return Some(vec![from.clone()]);
        }

        let distance = dijkstra(&self.graph, from_ix, Some(to_ix), |_| 1usize);
        let mut remaining = *distance.get(&to_ix)?;
        let mut path = vec![to_ix];
        let mut cur = to_ix;
        while remaining > 0 {
            remaining -= 1;
            let prev = self
                .graph
                .neighbors_directed(cur, Incoming)
                .filter(|p| distance.get(p) == Some(&remaining))
                .min()?;
            path.push(prev);
            cur = prev;
        }
        path.reverse();
        Some(path.into_iter().map(|n| self.graph[n].clone()).collect())
    }

    /// Downward call chains starting at `function`
    ///
    /// Callees are followed in identity order. A chain ends at a function
    /// with no callees, after `max_depth` calls, or where every callee is
    /// already on the chain (recursion). At most `max_chains` are returned.
    pub fn call_chains(
        &self,
        function: &FunctionId,
        max_depth: usize,
        max_chains: usize,
    ) -> Vec<Vec<FunctionId>> {
        let Some(&start) = self.index.get(function) else {
            return Vec::new();
        };
        let mut chains = Vec::new();
        if max_chains > 0 {
            let mut path = vec![start];
            self.extend_chain(&mut path, max_depth, max_chains, &mut chains);
        }
        if chains.len() >= max_chains && max_chains > 0 {
            tracing::debug!(function = %function, max_chains, "Call chain listing stopped at cap");
        }
        chains
            .into_iter()
            .map(|chain| chain.into_iter().map(|n| self.graph[n].clone()).collect())
            .collect()
    }

    fn extend_chain(
        &self,
        path: &mut Vec<NodeIndex>,
        max_depth: usize,
        max_chains: usize,
        chains: &mut Vec<Vec<NodeIndex>>,
    ) {
        let Some(&node) = path.last() else {
            return;
        };
        let mut next: Vec<NodeIndex> = if path.len() > max_depth {
            Vec::new()
        } else {
            self.graph
                .neighbors_directed(node, Outgoing)
                .filter(|n| !path.contains(n))
                .collect()
        };
        next.sort();

        if next.is_empty() {
            chains.push(path.clone());
            return;
        }
        for n in next {
            if chains.len() >= max_chains {
                return;
            }
            path.push(n);
            self.extend_chain(path, max_depth, max_chains, chains);
            path.pop();
        }
    }

    /// Functions with the most distinct callers
    pub fn most_called(&self, limit: usize) -> Vec<(&FunctionId, usize)> {
        self.rank(Incoming, limit)
    }

    /// Functions calling the most distinct callees
    pub fn most_calling(&self, limit: usize) -> Vec<(&FunctionId, usize)> {
        self.rank(Outgoing, limit)
    }

    fn rank(&self, direction: petgraph::Direction, limit: usize) -> Vec<(&FunctionId, usize)> {
        let mut ranked: Vec<(&FunctionId, usize)> = self
            .graph
            .node_indices()
            .map(|n| (&self.graph[n], self.graph.neighbors_directed(n, direction).count()))
            .filter(|(_, degree)| *degree > 0)
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// Functions that lie on the most shortest call paths between others
    ///
    /// Betweenness centrality (Brandes), normalized by `(n-1)(n-2)` for a
    /// directed graph of `n` functions. Highest first, ties by identity.
    pub fn central_functions(&self, limit: usize) -> Vec<(&FunctionId, f64)> {
        const UNSEEN: usize = usize::MAX;
        let n = self.graph.node_count();
        let mut score = vec![0.0f64; n];

        for source in self.graph.node_indices() {
            let s = source.index();
            let mut order = Vec::with_capacity(n);
            let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
            let mut paths = vec![0.0f64; n];
            let mut dist = vec![UNSEEN; n];
            paths[s] = 1.0;
            dist[s] = 0;

            let mut queue = VecDeque::from([source]);
            while let Some(v) = queue.pop_front() {
                let vi = v.index();
                order.push(vi);
                for w in self.graph.neighbors_directed(v, Outgoing) {
                    let wi = w.index();
                    if dist[wi] == UNSEEN {
                        dist[wi] = dist[vi] + 1;
                        queue.push_back(w);
                    }
                    if dist[wi] == dist[vi] + 1 {
                        paths[wi] += paths[vi];
                        preds[wi].push(vi);
                    }
                }
            }

            let mut dependency = vec![0.0f64; n];
            while let Some(w) = order.pop() {
                for &v in &preds[w] {
                    dependency[v] += paths[v] / paths[w] * (1.0 + dependency[w]);
                }
                if w != s {
                    score[w] += dependency[w];
                }
            }
        }

        let scale = if n > 2 {
            1.0 / ((n - 1) * (n - 2)) as f64
        } else {
            0.0
        };
        let mut ranked: Vec<(&FunctionId, f64)> = self
            .graph
            .node_indices()
            .map(|ix| (&self.graph[ix], score[ix.index()] * scale))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(limit);
        ranked
    }

    /// Functions with no incoming or outgoing edges
    pub fn isolated(&self) -> Vec<&FunctionId> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph.neighbors_undirected(n).next().is_none())
            .map(|n| &self.graph[n])
            .collect()
    }

    pub fn stats(&self) -> GraphStats {
        let mut functions_by_module: BTreeMap<String, usize> = BTreeMap::new();
        for node in self.nodes() {
            *functions_by_module.entry(node.module.clone()).or_default() += 1;
        }
        GraphStats {
            functions: self.node_count(),
            edges: self.edge_count(),
            call_sites: self.graph.edge_weights().map(|e| e.count).sum(),
            unresolved_sites: self
                .sites
                .values()
                .flatten()
                .filter(|s| !s.site.is_resolved())
                .count(),
            external_calls: self.external.values().sum(),
            functions_by_module,
        }
    }

    /// Enumerate elementary cycles of at most `max_len` functions
    ///
    /// Strongly connected components are found first; the bounded search
    /// only runs inside components with more than one function or a
    /// self-call. Each cycle is reported once, starting at its smallest
    /// identity, and the list is sorted. Enumeration stops after
    /// `max_cycles` cycles.
    pub fn find_cycles(&self, max_len: usize, max_cycles: usize) -> Vec<Vec<FunctionId>> {
        let n = self.graph.node_count();
        let mut component = vec![0usize; n];
        let mut cyclic = vec![false; n];
        let components = tarjan_scc(&self.graph);
        for (c, members) in components.iter().enumerate() {
            let nontrivial = members.len() > 1;
            for &m in members {
                component[m.index()] = c;
                cyclic[m.index()] = nontrivial || self.graph.contains_edge(m, m);
            }
        }

        let adjacency: Vec<Vec<usize>> = self
            .graph
            .node_indices()
            .map(|ix| {
                let mut next: Vec<usize> = self
                    .graph
                    .neighbors_directed(ix, Outgoing)
                    .map(|c| c.index())
                    .filter(|&c| component[c] == component[ix.index()])
                    .collect();
                next.sort_unstable();
                next
            })
            .collect();

        let mut cycles = Vec::new();
        let mut search = CycleSearch {
            adjacency: &adjacency,
            max_len,
            max_cycles,
            path: Vec::new(),
            on_path: vec![false; n],
            found: &mut cycles,
        };
        for start in (0..n).filter(|&i| cyclic[i]) {
            if search.full() {
                break;
            }
            search.path.push(start);
            search.on_path[start] = true;
            search.extend(start);
            search.on_path[start] = false;
            search.path.pop();
        }

        if cycles.len() >= max_cycles {
            tracing::warn!(max_cycles, "Cycle enumeration stopped at cap");
        }
        tracing::debug!(
            components = components.len(),
            cyclic = cyclic.iter().filter(|c| **c).count(),
            cycles = cycles.len(),
            "Cycle search finished"
        );

        let mut named: Vec<Vec<FunctionId>> = cycles
            .into_iter()
            .map(|c| {
                c.into_iter()
                    .map(|i| self.graph[NodeIndex::new(i)].clone())
                    .collect()
            })
            .collect();
        named.sort();
        named
    }
}

/// Bounded DFS state for cycle enumeration
struct CycleSearch<'g> {
    adjacency: &'g [Vec<usize>],
    max_len: usize,
    max_cycles: usize,
    path: Vec<usize>,
    on_path: Vec<bool>,
    found: &'g mut Vec<Vec<usize>>,
}

impl CycleSearch<'_> {
    fn full(&self) -> bool {
        self.found.len() >= self.max_cycles
    }

    /// Explore from the path's last node, only through nodes after `start`
    fn extend(&mut self, start: usize) {
        let Some(&node) = self.path.last() else {
            return;
        };
        let adjacency = self.adjacency;
        for &next in &adjacency[node] {
            if self.full() {
                return;
            }
            if next == start {
                self.found.push(self.path.clone());
            } else if next > start && !self.on_path[next] && self.path.len() < self.max_len {
                self.path.push(next);
                self.on_path[next] = true;
                self.extend(start);
                self.on_path[next] = false;
                self.path.pop();
            }
        }
    }
}

fn resolve(
    index: &BTreeMap<FunctionId, NodeIndex>,
    by_name: &BTreeMap<&str, Vec<&FunctionId>>,
    caller: &FunctionId,
    site: &CallSite,
) -> Option<FunctionId> {
    if let Some(module) = &site.qualifier {
        let id = FunctionId::new(module.clone(), site.callee.clone());
        return index.contains_key(&id).then_some(id);
    }
    let candidates = by_name.get(site.callee.as_str())?;
    match candidates.as_slice() {
        [only] => Some((*only).clone()),
        many => many
            .iter()
            .find(|c| c.module == caller.module)
            .map(|c| (*c).clone()),
    }
}
