use crate::setup::load_graph;
use anyhow::Result;
use erg_workflow::{generate_diagram, generate_diagram_compact};
use std::path::Path;

/// Execute `erg workflow validate [path]`
pub fn validate(path: Option<&Path>) -> Result<()> {
    let graph = load_graph(path)?;
    let label = path.map_or_else(|| "built-in workflow".to_string(), |p| p.display().to_string());
    println!(
        "{label}: workflow \"{}\" is valid ({} states, start: {})",
        graph.name(),
        graph.state_names().len(),
        graph.initial()
    );
    for warning in graph.warnings() {
        println!("  warning: {warning}");
    }
    Ok(())
}

/// Execute `erg workflow diagram [path]`
pub fn diagram(path: Option<&Path>, compact: bool) -> Result<()> {
    let graph = load_graph(path)?;
    let text = if compact {
        generate_diagram_compact(&graph)
    } else {
        generate_diagram(&graph)
    };
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
    Ok(())
}
