//! Call Graph - In-memory call graph built from extracted chunks
//!
//! Nodes are plain symbol strings (`name` or `Type.name`). Resolution is
//! string based and approximate: it never looks at types, only
//! at the shapes of the names the extractor produced.

use crate::chunk::CodeChunk;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Immutable call graph.
///
/// Built wholesale from a chunk list; there is no way to patch it. To pick up
/// new chunks, build a new graph and swap it in.
#[derive(Debug, Default)]
pub struct CallGraph {
    /// caller -> callees
    forward: HashMap<String, BTreeSet<String>>,
    /// callee -> callers
    backward: HashMap<String, BTreeSet<String>>,
    /// Chunks indexed by canonical symbol (first one wins)
    chunks_by_symbol: BTreeMap<String, CodeChunk>,
    /// Canonical symbols plus their bare aliases
    known_symbols: BTreeSet<String>,
}

impl CallGraph {
    /// Build the graph from a fresh chunk list
    pub fn build(chunks: &[CodeChunk]) -> Self {
        let mut graph = Self::default();

        for chunk in chunks {
            let caller = chunk.symbol();

            graph.known_symbols.insert(caller.clone());
            graph.known_symbols.insert(chunk.name.clone());
            if let Some(parent) = &chunk.parent {
                graph.known_symbols.insert(format!("{}.{}", parent, chunk.name));
            }

            graph
                .chunks_by_symbol
                .entry(caller.clone())
                .or_insert_with(|| chunk.clone());

            for raw in &chunk.calls {
                let callee = normalize_call(raw);
                if callee.is_empty() {
                    continue;
                }
                graph
                    .backward
                    .entry(callee.clone())
                    .or_default()
                    .insert(caller.clone());
                graph.forward.entry(caller.clone()).or_default().insert(callee);
            }
        }

        tracing::debug!("Built call graph: {}", graph.stats());
        graph
    }

    /// Map user input onto a graph node.
    ///
    /// Order matters: a qualified symbol ending in `.input` wins over an exact
    /// match, because bare method names are the ones most often shared
    /// between types. Unknown input comes back unchanged and acts as a leaf.
    pub fn resolve_symbol(&self, input: &str) -> String {
        let name = strip_call_parens(input.trim());

        let suffix = format!(".{}", name);
        if let Some(qualified) = self.known_symbols.iter().find(|s| s.ends_with(&suffix)) {
            return qualified.clone();
        }

        if name.contains('.') && self.known_symbols.contains(name) {
            return name.to_string();
        }

        if self.known_symbols.contains(name) {
            return name.to_string();
        }

        name.to_string()
    }

    /// Everything reachable from `symbol` through calls
    pub fn trace_forward(&self, symbol: &str, max_depth: usize) -> TraceResult {
        self.trace(symbol, max_depth, Direction::Forward)
    }

    /// Everything that reaches `symbol` through calls
    pub fn trace_backward(&self, symbol: &str, max_depth: usize) -> TraceResult {
        self.trace(symbol, max_depth, Direction::Backward)
    }

    pub fn trace(&self, symbol: &str, max_depth: usize, direction: Direction) -> TraceResult {
        let resolved = self.resolve_symbol(symbol);
        let mut visited = HashSet::new();
        let tree = self.expand(&resolved, 0, max_depth, direction, &mut visited);

        TraceResult {
            root: symbol.to_string(),
            resolved,
            direction,
            max_depth,
            node_count: visited.len(),
            tree,
        }
    }

    // One visited set for the whole walk: a node shows up once, cycles stop.
    fn expand(
        &self,
        symbol: &str,
        depth: usize,
        max_depth: usize,
        direction: Direction,
        visited: &mut HashSet<String>,
    ) -> TraceNode {
        visited.insert(symbol.to_string());
        let mut node = self.node(symbol);

        if depth >= max_depth {
            return node;
        }

        if let Some(neighbors) = self.edges(direction).get(symbol) {
            for next in neighbors {
                if visited.contains(next) {
                    continue;
                }
                let child = self.expand(next, depth + 1, max_depth, direction, visited);
                node.children.push(child);
            }
        }

        node
    }

    fn edges(&self, direction: Direction) -> &HashMap<String, BTreeSet<String>> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    fn node(&self, symbol: &str) -> TraceNode {
        let chunk = self.find_chunk(symbol);
        TraceNode {
            symbol: symbol.to_string(),
            file: chunk.map(|c| c.file.clone()),
            line: chunk.map(|c| c.start_line),
            children: Vec::new(),
        }
    }

    /// Breadth-first search for call paths from `source` to `target`.
    ///
    /// Each work item carries its own visited set, so a path never loops but
    /// two paths may share nodes. Paths longer than `max_depth` edges are
    /// dropped; a path that reaches the target is recorded and not extended.
    pub fn find_paths(
        &self,
        source: &str,
        target: &str,
        max_paths: usize,
        max_depth: usize,
    ) -> PathResult {
        let from = self.resolve_symbol(source);
        let to = self.resolve_symbol(target);

        let mut paths = Vec::new();
        let mut explored = 0usize;
        let mut queue: VecDeque<(Vec<String>, HashSet<String>)> = VecDeque::new();
        queue.push_back((vec![from.clone()], HashSet::from([from.clone()])));

        while let Some((path, seen)) = queue.pop_front() {
            if paths.len() >= max_paths {
                break;
            }
            explored += 1;

            if path.len() - 1 > max_depth {
                continue;
            }
            let Some(current) = path.last() else {
                continue;
            };

            if symbols_match(current, &to) {
                paths.push(CallPath::new(path));
                continue;
            }

            if let Some(callees) = self.forward.get(current) {
                for next in callees {
                    if seen.contains(next) {
                        continue;
                    }
                    let mut next_path = path.clone();
                    next_path.push(next.clone());
                    let mut next_seen = seen.clone();
                    next_seen.insert(next.clone());
                    queue.push_back((next_path, next_seen));
                }
            }
        }

        PathResult {
            source: from,
            target: to,
            paths,
            explored,
        }
    }

    /// Chunk behind a symbol, for file and line metadata
    pub fn find_chunk(&self, symbol: &str) -> Option<&CodeChunk> {
        if let Some(chunk) = self.chunks_by_symbol.get(symbol) {
            return Some(chunk);
        }

        let suffix = format!(".{}", symbol);
        self.chunks_by_symbol
            .iter()
            .find(|(key, chunk)| key.ends_with(&suffix) || chunk.name == symbol)
            .map(|(_, chunk)| chunk)
    }

    /// Direct callees of an exact node
    pub fn callees(&self, symbol: &str) -> Vec<&str> {
        self.forward
            .get(symbol)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Direct callers of an exact node
    pub fn callers(&self, symbol: &str) -> Vec<&str> {
        self.backward
            .get(symbol)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            symbols: self.known_symbols.len(),
            chunks: self.chunks_by_symbol.len(),
            edges: self.forward.values().map(BTreeSet::len).sum(),
        }
    }
}

fn strip_call_parens(raw: &str) -> &str {
    raw.strip_suffix("()").unwrap_or(raw)
}

/// Turn a raw call expression into a graph node name.
///
/// `Type.method()` keeps its type (an uppercase owner reads as a type name);
/// `value.method()` and longer instance chains collapse to `method`.
pub fn normalize_call(raw: &str) -> String {
    let expr = strip_call_parens(raw.trim());
    let segments: Vec<&str> = expr.split('.').collect();

    if segments.len() >= 2 {
        let owner = segments[segments.len() - 2];
        let method = segments[segments.len() - 1];
        if owner.chars().next().is_some_and(char::is_uppercase) {
            return format!("{}.{}", owner, method);
        }
        return method.to_string();
    }

    expr.to_string()
}

fn last_segment(symbol: &str) -> &str {
    symbol.rsplit('.').next().unwrap_or(symbol)
}

/// Loose equality used to decide that a path reached its target
fn symbols_match(a: &str, b: &str) -> bool {
    a == b
        || a.ends_with(&format!(".{}", b))
        || b.ends_with(&format!(".{}", a))
        || last_segment(a) == last_segment(b)
}

/// Traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    pub symbol: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    /// Symbols in depth-first order
    pub fn flatten(&self) -> Vec<&str> {
        let mut out = vec![self.symbol.as_str()];
        for child in &self.children {
            out.extend(child.flatten());
        }
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceResult {
    /// Symbol as requested
    pub root: String,
    /// Node the request resolved to
    pub resolved: String,
    pub direction: Direction,
    pub max_depth: usize,
    /// Distinct nodes visited
    pub node_count: usize,
    pub tree: TraceNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallPath {
    pub symbols: Vec<String>,
    /// Number of edges
    pub length: usize,
}

impl CallPath {
    fn new(symbols: Vec<String>) -> Self {
        let length = symbols.len().saturating_sub(1);
        Self { symbols, length }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PathResult {
    pub source: String,
    pub target: String,
    pub paths: Vec<CallPath>,
    /// Work items taken off the queue
    pub explored: usize,
}

/// Statistics about a call graph
#[derive(Debug, Clone)]
pub struct GraphStats {
    pub symbols: usize,
    pub chunks: usize,
    pub edges: usize,
}

impl std::fmt::Display for GraphStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} symbols, {} chunks, {} call edges",
            self.symbols, self.chunks, self.edges
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(name: &str, calls: &[&str]) -> CodeChunk {
        CodeChunk::new(name, "src/main.rs", name, "")
            .with_lines(10, 20)
            .with_calls(calls.iter().copied())
    }

    fn member(parent: &str, name: &str, calls: &[&str]) -> CodeChunk {
        CodeChunk::new(format!("{parent}.{name}"), "src/types.rs", name, "")
            .with_parent(parent)
            .with_calls(calls.iter().copied())
    }

    fn chain() -> CallGraph {
        CallGraph::build(&[chunk("A", &["B()"]), chunk("B", &["C()"]), chunk("C", &[])])
    }

    #[test]
    fn test_normalize_call() {
        assert_eq!(normalize_call("helper()"), "helper");
        assert_eq!(normalize_call("self.load()"), "load");
        assert_eq!(normalize_call("cache.store.get()"), "get");
        assert_eq!(normalize_call("Cache.shared()"), "Cache.shared");
        assert_eq!(normalize_call("app.Router.dispatch()"), "Router.dispatch");
        assert_eq!(normalize_call("compute"), "compute");
    }

    #[test]
    fn test_trace_forward_chain() {
        let graph = chain();

        let result = graph.trace_forward("A", 2);
        assert_eq!(result.node_count, 3);
        assert_eq!(result.tree.flatten(), vec!["A", "B", "C"]);
        assert_eq!(result.tree.children[0].children[0].symbol, "C");
        assert_eq!(result.tree.file.as_deref(), Some("src/main.rs"));
        assert_eq!(result.tree.line, Some(10));
        assert_eq!(result.direction, Direction::Forward);
        assert_eq!(result.max_depth, 2);

        let shallow = graph.trace_forward("A", 0);
        assert_eq!(shallow.node_count, 1);
        assert_eq!(shallow.tree.flatten(), vec!["A"]);
    }

    #[test]
    fn test_trace_backward_chain() {
        let result = chain().trace_backward("C", 5);
        assert_eq!(result.tree.flatten(), vec!["C", "B", "A"]);
        assert_eq!(result.node_count, 3);
    }

    #[test]
    fn test_trace_terminates_on_cycle() {
        let graph = CallGraph::build(&[chunk("A", &["B()"]), chunk("B", &["A()"])]);

        let result = graph.trace_forward("A", 10);
        assert_eq!(result.node_count, 2);
        assert_eq!(result.tree.flatten(), vec!["A", "B"]);
    }

    #[test]
    fn test_children_are_sorted_and_shared_nodes_expand_once() {
        let graph = CallGraph::build(&[
            chunk("main", &["zeta()", "alpha()", "mid()"]),
            chunk("alpha", &["mid()"]),
            chunk("mid", &[]),
            chunk("zeta", &[]),
        ]);

        let result = graph.trace_forward("main", 3);
        let top: Vec<&str> = result.tree.children.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(top, vec!["alpha", "zeta"]);
        assert_eq!(result.tree.flatten(), vec!["main", "alpha", "mid", "zeta"]);
        assert_eq!(result.node_count, 4);
    }

    #[test]
    fn test_find_paths_single_route() {
        let result = chain().find_paths("A", "C", 5, 10);
        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.paths[0].symbols, vec!["A", "B", "C"]);
        assert_eq!(result.paths[0].length, 2);
        assert!(result.explored >= 3);
    }

    #[test]
    fn test_find_paths_shares_nodes_between_routes() {
        let graph = CallGraph::build(&[
            chunk("A", &["B()", "C()"]),
            chunk("B", &["D()"]),
            chunk("C", &["D()"]),
            chunk("D", &["E()"]),
            chunk("E", &[]),
        ]);

        let result = graph.find_paths("A", "E", 5, 10);
        let routes: Vec<Vec<String>> = result.paths.iter().map(|p| p.symbols.clone()).collect();
        assert_eq!(
            routes,
            vec![
                vec!["A", "B", "D", "E"].into_iter().map(String::from).collect::<Vec<_>>(),
                vec!["A", "C", "D", "E"].into_iter().map(String::from).collect::<Vec<_>>(),
            ]
        );

        let limited = graph.find_paths("A", "E", 1, 10);
        assert_eq!(limited.paths.len(), 1);

        let too_shallow = graph.find_paths("A", "E", 5, 2);
        assert!(too_shallow.paths.is_empty());
    }

    #[test]
    fn test_find_paths_cycle_without_target_terminates() {
        let graph = CallGraph::build(&[chunk("A", &["B()"]), chunk("B", &["A()"])]);

        let result = graph.find_paths("A", "C", 5, 10);
        assert!(result.paths.is_empty());
        // A, then A -> B; B -> A is cut by the path's own seen set
        assert_eq!(result.explored, 2);
    }

    #[test]
    fn test_find_paths_zero_max_paths() {
        let result = chain().find_paths("A", "C", 0, 5);
        assert!(result.paths.is_empty());
        assert_eq!(result.explored, 0);
    }

    #[test]
    fn test_find_paths_matches_qualified_target() {
        let graph = CallGraph::build(&[
            chunk("run", &["Store.save()"]),
            member("Store", "save", &[]),
        ]);

        let result = graph.find_paths("run", "save", 5, 5);
        assert_eq!(result.target, "Store.save");
        assert_eq!(result.paths.len(), 1);
        assert_eq!(result.paths[0].symbols, vec!["run", "Store.save"]);
    }

    #[test]
    fn test_resolve_prefers_qualified_suffix_match() {
        let graph = CallGraph::build(&[
            chunk("load", &[]),
            member("Cache", "load", &[]),
            member("Disk", "load", &[]),
            chunk("main", &[]),
        ]);

        // Suffix match beats the exact bare symbol, lexicographically first
        assert_eq!(graph.resolve_symbol("load"), "Cache.load");
        assert_eq!(graph.resolve_symbol("load()"), "Cache.load");
        assert_eq!(graph.resolve_symbol("Disk.load"), "Disk.load");
        assert_eq!(graph.resolve_symbol("main"), "main");
        assert_eq!(graph.resolve_symbol("unknown()"), "unknown");
    }

    #[test]
    fn test_unresolved_symbol_is_a_leaf() {
        let result = chain().trace_forward("nowhere", 3);
        assert_eq!(result.node_count, 1);
        assert_eq!(result.resolved, "nowhere");
        assert!(result.tree.children.is_empty());
        assert!(result.tree.file.is_none());

        let paths = chain().find_paths("nowhere", "C", 5, 5);
        assert!(paths.paths.is_empty());
        assert_eq!(paths.explored, 1);
    }

    #[test]
    fn test_find_chunk_falls_back_to_suffix_and_name() {
        let graph = CallGraph::build(&[member("Parser", "parse", &[]), chunk("main", &[])]);
        assert_eq!(graph.find_chunk("Parser.parse").unwrap().id, "Parser.parse");
        assert_eq!(graph.find_chunk("parse").unwrap().id, "Parser.parse");
        assert_eq!(graph.find_chunk("main").unwrap().id, "main");
        assert!(graph.find_chunk("missing").is_none());
    }

    #[test]
    fn test_edges_and_stats() {
        let graph = CallGraph::build(&[
            chunk("run", &["self.prepare()", "Store.save()"]),
            member("Store", "save", &[]),
        ]);
        assert_eq!(graph.callees("run"), vec!["Store.save", "prepare"]);
        assert_eq!(graph.callers("prepare"), vec!["run"]);

        let stats = graph.stats();
        assert_eq!(stats.edges, 2);
        assert_eq!(stats.chunks, 2);
        // run, Store.save, save
        assert_eq!(stats.symbols, 3);
    }
}
