//! Local call graph and strongly-connected components
//!
//! Procedures are checked bottom-up by SCC of the local call graph so
//! callee parameter types are as refined as possible before callers are
//! checked; cyclic components iterate to a fixed point. Edges are keyed by
//! procedure name (overloads are not distinguishable before resolution).

use std::collections::{BTreeMap, BTreeSet};

use marl_ast::pos::Placed;
use marl_ast::proc::{Module, ProcImpl};
use marl_ast::stmt::{Exp, Stmt};

pub type CallGraph = BTreeMap<Box<str>, BTreeSet<Box<str>>>;

/// Build the name-level call graph of a module, with edges only to
/// procedures defined locally.
pub fn local_call_graph(module: &Module) -> CallGraph {
    let mut graph: CallGraph = BTreeMap::new();
    for (name, defs) in &module.procs {
        let mut callees = BTreeSet::new();
        for def in defs {
            if let ProcImpl::Source { body } = &def.body {
                collect_callees(body, module, &mut callees);
            }
        }
        graph.insert(name.clone(), callees);
    }
    graph
}

fn collect_callees(stmts: &[Placed<Stmt>], module: &Module, out: &mut BTreeSet<Box<str>>) {
    for stmt in stmts {
        match &stmt.node {
            Stmt::Call(call) => {
                if !module.candidates(&call.name).is_empty() {
                    out.insert(call.name.clone());
                }
                collect_exp_callees(&call.args, module, out);
            }
            Stmt::Foreign { args, .. } => collect_exp_callees(args, module, out),
            Stmt::TestBool(_) | Stmt::Nop | Stmt::Fail | Stmt::Break | Stmt::Next => {}
            Stmt::And(body) | Stmt::Loop { body, .. } | Stmt::Or(body, _) => {
                collect_callees(body, module, out)
            }
            Stmt::Not(inner) => collect_callees(std::slice::from_ref(inner), module, out),
            Stmt::Cond {
                test,
                then_branch,
                else_branch,
                ..
            } => {
                collect_callees(std::slice::from_ref(test), module, out);
                collect_callees(then_branch, module, out);
                collect_callees(else_branch, module, out);
            }
            Stmt::UseResources { body, .. } => collect_callees(body, module, out),
            Stmt::Case { cases, default, .. } => {
                for (_, body) in cases {
                    collect_callees(body, module, out);
                }
                if let Some(body) = default {
                    collect_callees(body, module, out);
                }
            }
            Stmt::For { body, .. } => collect_callees(body, module, out),
        }
    }
}

fn collect_exp_callees(args: &[Placed<Exp>], module: &Module, out: &mut BTreeSet<Box<str>>) {
    for arg in args {
        match &arg.node {
            Exp::AnonProc { body, .. } => collect_callees(body, module, out),
            Exp::ProcRef { spec, args } => {
                if !module.candidates(&spec.name).is_empty() {
                    out.insert(spec.name.clone());
                }
                collect_exp_callees(args, module, out);
            }
            Exp::Typed { exp, .. } => {
                collect_exp_callees(std::slice::from_ref(exp), module, out)
            }
            _ => {}
        }
    }
}

/// Strongly-connected components in bottom-up order: every component comes
/// after the components it calls into.
pub fn bottom_up_sccs(graph: &CallGraph) -> Vec<Vec<Box<str>>> {
    fn dfs(
        node: &str,
        graph: &CallGraph,
        visited: &mut BTreeSet<Box<str>>,
        order: &mut Vec<Box<str>>,
    ) {
        if !visited.insert(node.into()) {
            return;
        }
        if let Some(callees) = graph.get(node) {
            for next in callees {
                dfs(next, graph, visited, order);
            }
        }
        order.push(node.into());
    }

    fn dfs_rev(
        node: &str,
        reverse: &CallGraph,
        visited: &mut BTreeSet<Box<str>>,
        component: &mut Vec<Box<str>>,
    ) {
        if !visited.insert(node.into()) {
            return;
        }
        component.push(node.into());
        if let Some(callers) = reverse.get(node) {
            for next in callers {
                dfs_rev(next, reverse, visited, component);
            }
        }
    }

    let mut visited = BTreeSet::new();
    let mut order = Vec::new();
    for node in graph.keys() {
        dfs(node, graph, &mut visited, &mut order);
    }

    let mut reverse: CallGraph = graph
        .keys()
        .map(|node| (node.clone(), BTreeSet::new()))
        .collect();
    for (from, tos) in graph {
        for to in tos {
            reverse.entry(to.clone()).or_default().insert(from.clone());
        }
    }

    // Popping the finish-time order yields components callers-first; the
    // checker wants callees first, so collect and reverse.
    let mut rev_visited = BTreeSet::new();
    let mut components = Vec::new();
    while let Some(node) = order.pop() {
        if rev_visited.contains(&node) {
            continue;
        }
        let mut component = Vec::new();
        dfs_rev(&node, &reverse, &mut rev_visited, &mut component);
        components.push(component);
    }
    components.reverse();
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> CallGraph {
        edges
            .iter()
            .map(|(from, tos)| {
                (
                    Box::from(*from),
                    tos.iter().map(|t| Box::from(*t)).collect(),
                )
            })
            .collect()
    }

    fn position(sccs: &[Vec<Box<str>>], name: &str) -> usize {
        sccs.iter()
            .position(|scc| scc.iter().any(|n| n.as_ref() == name))
            .unwrap()
    }

    #[test]
    fn test_callees_come_first() {
        let g = graph(&[("main", &["helper"]), ("helper", &["leaf"]), ("leaf", &[])]);
        let sccs = bottom_up_sccs(&g);
        assert_eq!(sccs.len(), 3);
        assert!(position(&sccs, "leaf") < position(&sccs, "helper"));
        assert!(position(&sccs, "helper") < position(&sccs, "main"));
    }

    #[test]
    fn test_cycle_is_one_component() {
        let g = graph(&[("even", &["odd"]), ("odd", &["even"]), ("main", &["even"])]);
        let sccs = bottom_up_sccs(&g);
        let cycle = sccs
            .iter()
            .find(|scc| scc.len() == 2)
            .expect("even/odd component");
        assert!(cycle.iter().any(|n| n.as_ref() == "even"));
        assert!(cycle.iter().any(|n| n.as_ref() == "odd"));
        assert!(position(&sccs, "even") < position(&sccs, "main"));
    }

    #[test]
    fn test_self_recursion() {
        let g = graph(&[("fact", &["fact"])]);
        let sccs = bottom_up_sccs(&g);
        assert_eq!(sccs.len(), 1);
    }
}
