//! Reference-graph search.
//!
//! Edges run in reverse: the neighbors of a symbol are the symbols
//! referencing it, materialized by a `relocations:<name>` index query
//! and memoized for the lifetime of one search over an index handle.
//! To produce forward paths (callers down to callees), the searchers
//! run from the goal set toward the start set and every found path is
//! reversed before emission.

pub mod dot;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use anyhow::{Context, Result};
use log::{debug, trace};

use crate::binary::Symbol;
use crate::index::SymbolIndex;
use crate::sigint;

/// Available search algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphAlgorithm {
    Bfs,
    Dfs,
    AStar,
}

/// Observer hooks for progress reporting. All methods default to
/// no-ops.
pub trait GraphObserver {
    fn on_progress(&mut self, _done: usize, _total: usize) {}
    fn on_symbol_visited(&mut self) {}
    fn on_route_found(&mut self) {}
}

/// Observer that reports nothing.
pub struct NoopObserver;

impl GraphObserver for NoopObserver {}

/// Memoized reverse-reference neighbor lookup, valid for as long as
/// the borrowed index handle.
pub struct Neighbors<'a> {
    index: &'a SymbolIndex,
    cache: HashMap<Symbol, Rc<Vec<Symbol>>>,
}

impl<'a> Neighbors<'a> {
    pub fn new(index: &'a SymbolIndex) -> Neighbors<'a> {
        Neighbors {
            index,
            cache: HashMap::new(),
        }
    }

    /// Symbols whose relocation list contains `symbol`'s name.
    pub fn of(&mut self, symbol: &Symbol) -> Result<Rc<Vec<Symbol>>> {
        if let Some(hit) = self.cache.get(symbol) {
            return Ok(Rc::clone(hit));
        }

        let field = self
            .index
            .schema()
            .field("relocations")
            .context("schema has no relocations field")?;
        let query = field.make_query(&symbol.name, false)?;
        let referencing = Rc::new(self.index.search(&query, 0, None)?);

        self.cache
            .insert(symbol.clone(), Rc::clone(&referencing));
        Ok(referencing)
    }
}

type Path = Vec<Symbol>;

/// Breadth-first search; the first path found is shortest.
pub fn bfs(
    neighbors: &mut Neighbors<'_>,
    start: &Symbol,
    goal: &HashSet<Symbol>,
    should_quit: &dyn Fn() -> bool,
    observer: &mut dyn GraphObserver,
) -> Result<Option<Path>> {
    let mut queue: VecDeque<(Symbol, Path)> = VecDeque::from([(start.clone(), Vec::new())]);
    let mut visited = HashSet::new();

    while let Some((symbol, came_from)) = queue.pop_front() {
        if should_quit() {
            break;
        }
        if !visited.insert(symbol.clone()) {
            continue;
        }
        observer.on_symbol_visited();

        trace!("visit {} (depth {})", symbol.name, came_from.len());

        if goal.contains(&symbol) && !came_from.is_empty() {
            let mut path = came_from;
            path.push(symbol);
            return Ok(Some(path));
        }

        for next in neighbors.of(&symbol)?.iter() {
            if visited.contains(next) {
                continue;
            }
            let mut path = came_from.clone();
            path.push(symbol.clone());
            queue.push_back((next.clone(), path));
        }
    }

    Ok(None)
}

/// Depth-first search.
pub fn dfs(
    neighbors: &mut Neighbors<'_>,
    start: &Symbol,
    goal: &HashSet<Symbol>,
    should_quit: &dyn Fn() -> bool,
    observer: &mut dyn GraphObserver,
) -> Result<Option<Path>> {
    let mut stack: Vec<(Symbol, Path)> = vec![(start.clone(), Vec::new())];
    let mut visited = HashSet::new();

    while let Some((symbol, came_from)) = stack.pop() {
        if should_quit() {
            break;
        }
        if !visited.insert(symbol.clone()) {
            continue;
        }
        observer.on_symbol_visited();

        trace!("visit {} (depth {})", symbol.name, came_from.len());

        if goal.contains(&symbol) && !came_from.is_empty() {
            let mut path = came_from;
            path.push(symbol);
            return Ok(Some(path));
        }

        for next in neighbors.of(&symbol)?.iter() {
            if visited.contains(next) {
                continue;
            }
            let mut path = came_from.clone();
            path.push(symbol.clone());
            stack.push((next.clone(), path));
        }
    }

    Ok(None)
}

/// A* best-first search. The heuristic and edge weight are both the
/// constant 1 until real scoring exists, which makes this behave like
/// a uniform-cost search.
pub fn astar(
    neighbors: &mut Neighbors<'_>,
    start: &Symbol,
    goal: &HashSet<Symbol>,
    should_quit: &dyn Fn() -> bool,
    observer: &mut dyn GraphObserver,
) -> Result<Option<Path>> {
    const EDGE_COST: u64 = 1;
    const HEURISTIC: u64 = 1;

    let mut open: BinaryHeap<(Reverse<u64>, usize)> = BinaryHeap::new();
    let mut nodes: Vec<Symbol> = vec![start.clone()];
    let mut node_ids: HashMap<Symbol, usize> = HashMap::from([(start.clone(), 0)]);
    let mut came_from: HashMap<usize, usize> = HashMap::new();
    let mut g_score: HashMap<usize, u64> = HashMap::from([(0, 0)]);
    let mut closed: HashSet<usize> = HashSet::new();

    open.push((Reverse(HEURISTIC), 0));

    while let Some((_, current)) = open.pop() {
        if should_quit() {
            break;
        }
        if !closed.insert(current) {
            continue;
        }
        observer.on_symbol_visited();

        if goal.contains(&nodes[current]) && current != 0 {
            return Ok(Some(reconstruct(&nodes, &came_from, current)));
        }

        let current_g = g_score[&current];
        for next in neighbors.of(&nodes[current].clone())?.iter() {
            let next_id = match node_ids.get(next) {
                Some(id) => *id,
                None => {
                    let id = nodes.len();
                    nodes.push(next.clone());
                    node_ids.insert(next.clone(), id);
                    id
                }
            };
            if closed.contains(&next_id) {
                continue;
            }

            let tentative = current_g + EDGE_COST;
            if g_score.get(&next_id).map(|g| tentative < *g).unwrap_or(true) {
                g_score.insert(next_id, tentative);
                came_from.insert(next_id, current);
                open.push((Reverse(tentative + HEURISTIC), next_id));
            }
        }
    }

    Ok(None)
}

fn reconstruct(nodes: &[Symbol], came_from: &HashMap<usize, usize>, end: usize) -> Path {
    let mut path = vec![nodes[end].clone()];
    let mut current = end;
    while let Some(prev) = came_from.get(&current) {
        path.push(nodes[*prev].clone());
        current = *prev;
    }
    path.reverse();
    path
}

fn run_search(
    algo: GraphAlgorithm,
    neighbors: &mut Neighbors<'_>,
    start: &Symbol,
    goal: &HashSet<Symbol>,
    should_quit: &dyn Fn() -> bool,
    observer: &mut dyn GraphObserver,
) -> Result<Option<Path>> {
    match algo {
        GraphAlgorithm::Bfs => bfs(neighbors, start, goal, should_quit, observer),
        GraphAlgorithm::Dfs => dfs(neighbors, start, goal, should_quit, observer),
        GraphAlgorithm::AStar => astar(neighbors, start, goal, should_quit, observer),
    }
}

/// The result of a graph search: every node and edge on the found
/// paths, with the start- and goal-set membership preserved for
/// rendering.
pub struct SymbolGraph {
    pub start_query: String,
    pub goal_query: String,
    pub nodes: Vec<Symbol>,
    /// Forward edges, by symbol name, deduplicated in insertion order.
    pub edges: Vec<(String, String)>,
    pub start_set: HashSet<Symbol>,
    pub goal_set: HashSet<Symbol>,
}

/// Search up to `num_routes` forward paths from symbols matching
/// `start_query` to symbols matching `goal_query`.
pub fn generate_graph(
    index: &SymbolIndex,
    start_query: &str,
    goal_query: &str,
    algo: GraphAlgorithm,
    num_routes: Option<usize>,
    observer: &mut dyn GraphObserver,
) -> Result<SymbolGraph> {
    sigint::install();

    let start_set: HashSet<Symbol> = index.search_str(start_query)?.into_iter().collect();
    let goal_set: HashSet<Symbol> = index.search_str(goal_query)?.into_iter().collect();

    debug!(
        "start set has {} symbols, goal set has {}",
        start_set.len(),
        goal_set.len()
    );

    let mut graph = SymbolGraph {
        start_query: start_query.to_string(),
        goal_query: goal_query.to_string(),
        nodes: Vec::new(),
        edges: Vec::new(),
        start_set: start_set.clone(),
        goal_set: goal_set.clone(),
    };

    if start_set.is_empty() || goal_set.is_empty() {
        return Ok(graph);
    }

    // The neighbor relation is "who references me", so walk from the
    // goal toward the start set and flip every path found.
    let search_from = goal_set;
    let search_to = start_set;

    let mut neighbors = Neighbors::new(index);
    let should_quit = sigint::interrupted;

    let mut nodes: HashSet<Symbol> = HashSet::new();
    let mut edges: Vec<(String, String)> = Vec::new();
    let mut routes_found = 0;

    for (done, from) in search_from.iter().enumerate() {
        if should_quit() {
            break;
        }
        observer.on_progress(done, search_from.len());

        let Some(mut path) =
            run_search(algo, &mut neighbors, from, &search_to, &should_quit, observer)?
        else {
            continue;
        };

        path.reverse();
        if path.len() < 2 {
            continue;
        }

        observer.on_route_found();
        trace!(
            "found path {} -> ... -> {} of length {}",
            path[0].name,
            path[path.len() - 1].name,
            path.len()
        );

        for pair in path.windows(2) {
            let edge = (pair[0].name.clone(), pair[1].name.clone());
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }
        nodes.extend(path);

        routes_found += 1;
        if Some(routes_found) == num_routes {
            break;
        }
    }

    let mut node_list: Vec<Symbol> = nodes.into_iter().collect();
    node_list.sort_by(|a, b| a.name.cmp(&b.name));
    graph.nodes = node_list;
    graph.edges = edges;

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::SymbolType;
    use crate::index::SymbolIndex;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn symbol(name: &str, relocations: &[&str]) -> Symbol {
        Symbol {
            path: PathBuf::from("/tree/a.o"),
            source: None,
            name: name.to_string(),
            section: ".text".to_string(),
            address: 0,
            size: 8,
            sym_type: SymbolType::Func,
            relocations: relocations.iter().map(|s| s.to_string()).collect(),
            mtime: 1,
        }
    }

    /// main -> uses_c_function -> c_function, plus an unrelated leaf.
    fn build_index(path: &std::path::Path) -> SymbolIndex {
        let mut index = SymbolIndex::open_writable(path).expect("open writable");
        index
            .transaction(|idx| {
                idx.add_symbol(&symbol("main", &["uses_c_function"]))?;
                idx.add_symbol(&symbol("uses_c_function", &["c_function"]))?;
                idx.add_symbol(&symbol("c_function", &[]))?;
                idx.add_symbol(&symbol("unrelated", &[]))
            })
            .expect("populate");
        drop(index);
        SymbolIndex::open(path).expect("open readonly")
    }

    #[test]
    fn neighbors_are_referencing_symbols_and_memoized() {
        let tmp = tempdir().expect("tempdir");
        let index = build_index(tmp.path());

        let mut neighbors = Neighbors::new(&index);
        let c_function = symbol("c_function", &[]);

        let refs = neighbors.of(&c_function).expect("neighbors");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "uses_c_function");

        let again = neighbors.of(&c_function).expect("cached");
        assert!(Rc::ptr_eq(&refs, &again));
    }

    #[test]
    fn all_algorithms_find_the_forward_path() {
        let tmp = tempdir().expect("tempdir");
        let index = build_index(tmp.path());

        for algo in [GraphAlgorithm::Bfs, GraphAlgorithm::Dfs, GraphAlgorithm::AStar] {
            let graph = generate_graph(
                &index,
                "fullname:main",
                "fullname:c_function",
                algo,
                Some(1),
                &mut NoopObserver,
            )
            .expect("graph");

            let names: Vec<&str> = graph.nodes.iter().map(|s| s.name.as_str()).collect();
            assert!(names.contains(&"main"), "{algo:?}: {names:?}");
            assert!(names.contains(&"uses_c_function"), "{algo:?}");
            assert!(names.contains(&"c_function"), "{algo:?}");
            assert!(!names.contains(&"unrelated"), "{algo:?}");

            assert!(graph
                .edges
                .contains(&("main".to_string(), "uses_c_function".to_string())));
            assert!(graph
                .edges
                .contains(&("uses_c_function".to_string(), "c_function".to_string())));
        }
    }

    #[test]
    fn disconnected_queries_produce_an_empty_graph() {
        let tmp = tempdir().expect("tempdir");
        let index = build_index(tmp.path());

        let graph = generate_graph(
            &index,
            "fullname:unrelated",
            "fullname:c_function",
            GraphAlgorithm::Bfs,
            Some(1),
            &mut NoopObserver,
        )
        .expect("graph");
        assert!(graph.nodes.is_empty());
        assert!(graph.edges.is_empty());

        let graph = generate_graph(
            &index,
            "fullname:nonexistent",
            "fullname:c_function",
            GraphAlgorithm::Bfs,
            None,
            &mut NoopObserver,
        )
        .expect("empty start set");
        assert!(graph.nodes.is_empty());
    }

    #[test]
    fn self_paths_are_suppressed() {
        let tmp = tempdir().expect("tempdir");
        let index = build_index(tmp.path());

        let graph = generate_graph(
            &index,
            "fullname:main",
            "fullname:main",
            GraphAlgorithm::Bfs,
            None,
            &mut NoopObserver,
        )
        .expect("graph");
        assert!(graph.nodes.is_empty());
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn observer_sees_visits_and_routes() {
        struct Counting {
            visited: usize,
            routes: usize,
        }
        impl GraphObserver for Counting {
            fn on_symbol_visited(&mut self) {
                self.visited += 1;
            }
            fn on_route_found(&mut self) {
                self.routes += 1;
            }
        }

        let tmp = tempdir().expect("tempdir");
        let index = build_index(tmp.path());

        let mut counting = Counting {
            visited: 0,
            routes: 0,
        };
        generate_graph(
            &index,
            "fullname:main",
            "fullname:c_function",
            GraphAlgorithm::Bfs,
            Some(1),
            &mut counting,
        )
        .expect("graph");

        assert!(counting.visited >= 3);
        assert_eq!(counting.routes, 1);
    }
}
