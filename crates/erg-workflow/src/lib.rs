//! Workflow definitions: the YAML schema, the validated [`WorkflowGraph`],
//! the built-in default workflow, and Mermaid rendering.

pub mod defaults;
pub mod diagram;
pub mod duration;
pub mod error;
pub mod graph;
pub mod parser;
pub mod schema;

pub use defaults::{default_graph, DEFAULT_WORKFLOW};
pub use diagram::{generate_diagram, generate_diagram_compact};
pub use error::ConfigError;
pub use graph::WorkflowGraph;
pub use parser::{load_workflow, parse_workflow};
pub use schema::{ChoiceRule, HookConfig, SourceConfig, StateConfig, StateKind, WorkflowConfig};
