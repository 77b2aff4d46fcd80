//! DOT rendering of a symbol graph.
//!
//! Nodes matching the start and goal queries land in their own
//! cluster subgraphs; every node carries the symbol's path, section,
//! address, and size as attributes, and optionally a demangled label.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::binary::Symbol;
use crate::demangle::Demangler;

use super::SymbolGraph;

/// Render `graph` as a DOT digraph.
pub fn render(graph: &SymbolGraph, mut demangler: Option<&mut Demangler>) -> String {
    let mut out = String::new();

    out.push_str("digraph {\n");
    out.push_str("    rankdir=LR;\n");
    out.push_str("    overlap=false;\n");
    out.push_str("    splines=true;\n");

    let start_nodes: Vec<&Symbol> = graph
        .nodes
        .iter()
        .filter(|s| graph.start_set.contains(s) && !graph.goal_set.contains(s))
        .collect();
    let goal_nodes: Vec<&Symbol> = graph
        .nodes
        .iter()
        .filter(|s| graph.goal_set.contains(s))
        .collect();
    let clustered: HashSet<&str> = start_nodes
        .iter()
        .chain(goal_nodes.iter())
        .map(|s| s.name.as_str())
        .collect();

    write_cluster(
        &mut out,
        "cluster_start_query",
        &format!("Matching start query \"{}\"", graph.start_query),
        &start_nodes,
        &mut demangler,
    );
    write_cluster(
        &mut out,
        "cluster_goal_query",
        &format!("Matching goal query \"{}\"", graph.goal_query),
        &goal_nodes,
        &mut demangler,
    );

    for symbol in &graph.nodes {
        if !clustered.contains(symbol.name.as_str()) {
            write_node(&mut out, 1, symbol, &mut demangler);
        }
    }

    for (from, to) in &graph.edges {
        let _ = writeln!(
            out,
            "    {} -> {} [dir=forward];",
            quote(from),
            quote(to)
        );
    }

    out.push_str("}\n");
    out
}

fn write_cluster(
    out: &mut String,
    name: &str,
    label: &str,
    nodes: &[&Symbol],
    demangler: &mut Option<&mut Demangler>,
) {
    if nodes.is_empty() {
        return;
    }

    let _ = writeln!(out, "    subgraph {name} {{");
    let _ = writeln!(out, "        label={};", quote(label));
    let _ = writeln!(out, "        style=filled;");
    for symbol in nodes {
        write_node(out, 2, symbol, demangler);
    }
    let _ = writeln!(out, "    }}");
}

fn write_node(
    out: &mut String,
    depth: usize,
    symbol: &Symbol,
    demangler: &mut Option<&mut Demangler>,
) {
    let indent = "    ".repeat(depth);

    let mut attrs = Vec::new();
    if let Some(demangler) = demangler.as_deref_mut() {
        attrs.push(format!("label={}", quote(&demangler.demangle(&symbol.name))));
    }
    attrs.push(format!("path={}", quote(&symbol.path.to_string_lossy())));
    attrs.push(format!("section={}", quote(&symbol.section)));
    attrs.push(format!("address=\"{:#x}\"", symbol.address));
    attrs.push(format!("size=\"{}\"", symbol.size));

    let _ = writeln!(
        out,
        "{indent}{} [{}];",
        quote(&symbol.name),
        attrs.join(", ")
    );
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}
