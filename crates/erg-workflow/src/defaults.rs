use crate::error::ConfigError;
use crate::graph::WorkflowGraph;
use crate::parser::parse_workflow;

/// The workflow used when no workflow file is configured.
pub const DEFAULT_WORKFLOW: &str = r#"workflow: default
start: coding

source:
  provider: github
  filter:
    label: queued

states:
  coding:
    type: task
    action: ai.code
    next: open_pr
    error: failed

  open_pr:
    type: task
    action: github.create_pr
    next: await_review
    error: failed

  await_review:
    type: wait
    event: pr.reviewed
    next: await_ci
    error: failed

  await_ci:
    type: wait
    event: ci.complete
    timeout: 2h
    timeout_next: failed
    next: check_ci_result
    error: failed

  check_ci_result:
    type: choice
    choices:
      - variable: ci_status
        equals: passing
        next: merge
      - variable: ci_status
        equals: pending
        next: await_ci
      - variable: ci_status
        equals: failing
        next: failed

  merge:
    type: task
    action: github.merge
    next: done
    error: failed

  done:
    type: succeed

  failed:
    type: fail
"#;

pub fn default_graph() -> Result<WorkflowGraph, ConfigError> {
    parse_workflow(DEFAULT_WORKFLOW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StateKind;
    use std::time::Duration;

    #[test]
    fn default_workflow_is_valid() {
        let g = default_graph().unwrap();
        assert_eq!(g.initial(), "coding");
        assert!(g.warnings().is_empty());
        let mut terminals = g.terminals();
        terminals.sort();
        assert_eq!(terminals, vec!["done", "failed"]);
        assert_eq!(g.source().unwrap().filter.label, "queued");
    }

    #[test]
    fn default_path_reaches_merge() {
        let g = default_graph().unwrap();
        let path = ["coding", "open_pr", "await_review", "await_ci", "check_ci_result"];
        for pair in path.windows(2) {
            let s = g.state(pair[0]).unwrap();
            assert_eq!(s.next.as_deref(), Some(pair[1]), "{} -> {}", pair[0], pair[1]);
            assert_eq!(g.error_target(pair[0]), Some("failed"));
        }
        let choice = g.state("check_ci_result").unwrap();
        assert_eq!(choice.kind, StateKind::Choice);
        assert_eq!(choice.choices[0].next, "merge");
        assert_eq!(g.state("merge").unwrap().next.as_deref(), Some("done"));

        let ci = g.state("await_ci").unwrap();
        assert_eq!(ci.timeout, Some(Duration::from_secs(7200)));
        assert_eq!(ci.timeout_next.as_deref(), Some("failed"));
    }
}
