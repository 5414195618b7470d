//! Mermaid `stateDiagram-v2` rendering.
//!
//! The full diagram shows every edge plus hook pseudo-states
//! (`<state>_before`, `<state>_hooks`). The compact one drops hooks and
//! error edges but keeps timeouts and choice branches.

use crate::duration::format_duration;
use crate::graph::{EdgeKind, WorkflowGraph};
use std::fmt::Write;

pub fn generate_diagram(graph: &WorkflowGraph) -> String {
    render(graph, false)
}

pub fn generate_diagram_compact(graph: &WorkflowGraph) -> String {
    render(graph, true)
}

fn render(graph: &WorkflowGraph, compact: bool) -> String {
    let mut out = String::from("stateDiagram-v2\n");
    let _ = writeln!(out, "    [*] --> {}", graph.initial());

    for name in graph.state_names() {
        let Some(state) = graph.state(name) else {
            continue;
        };

        let show_hooks = !compact;
        if show_hooks && !state.before.is_empty() {
            let _ = writeln!(
                out,
                "    state \"{name} before ({})\" as {name}_before",
                state.before.len()
            );
            let _ = writeln!(out, "    {name}_before --> {name}");
        }
        let after_node = (show_hooks && !state.after.is_empty()).then(|| format!("{name}_hooks"));
        if let Some(node) = &after_node {
            let _ = writeln!(
                out,
                "    state \"{name} after ({})\" as {node}",
                state.after.len()
            );
        }

        for edge in graph.edges_from(name) {
            match &edge.kind {
                EdgeKind::Next => match &after_node {
                    Some(node) => {
                        let _ = writeln!(out, "    {name} --> {node}");
                        let _ = writeln!(out, "    {node} --> {}", edge.to);
                    }
                    None => {
                        let _ = writeln!(out, "    {name} --> {}", edge.to);
                    }
                },
                EdgeKind::Error => {
                    if !compact {
                        let _ = writeln!(out, "    {name} --> {} : error", edge.to);
                    }
                }
                EdgeKind::Timeout => {
                    let label = state.timeout.map(format_duration).unwrap_or_default();
                    let _ = writeln!(out, "    {name} --> {} : timeout:{label}", edge.to);
                }
                EdgeKind::Choice(label) => {
                    let _ = writeln!(out, "    {name} --> {} : {label}", edge.to);
                }
                EdgeKind::Default => {
                    let _ = writeln!(out, "    {name} --> {} : default", edge.to);
                }
            }
        }
    }

    for terminal in graph.terminals() {
        let _ = writeln!(out, "    {terminal} --> [*]");
    }
    out
}
