use crate::error::ConfigError;
use crate::schema::{SourceConfig, StateConfig, StateKind, WorkflowConfig};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::warn;

/// Kind of a rendered or followed edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    Next,
    Error,
    Timeout,
    Choice(String),
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// A validated, immutable workflow. Shared read-only across sessions.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    name: String,
    initial: String,
    source: Option<SourceConfig>,
    states: BTreeMap<String, StateConfig>,
    /// States in breadth-first order from the initial state, unreachable
    /// ones last.
    order: Vec<String>,
    failure_terminal: Option<String>,
    warnings: Vec<String>,
}

impl WorkflowGraph {
    /// Validate `config` and build the graph.
    pub fn new(config: WorkflowConfig) -> Result<Self, ConfigError> {
        let WorkflowConfig {
            workflow,
            start,
            source,
            states,
        } = config;

        if states.is_empty() {
            return Err(ConfigError::NoStates);
        }
        if start.is_empty() {
            return Err(ConfigError::MissingInitial);
        }
        if !states.contains_key(&start) {
            return Err(ConfigError::UnknownInitial(start));
        }
        if !states.values().any(|s| s.kind.is_terminal()) {
            return Err(ConfigError::NoTerminal);
        }

        for (name, state) in &states {
            validate_state(name, state, &states)?;
        }

        let failure_terminal = pick_failure_terminal(&states);
        for (name, state) in &states {
            if needs_error_edge(state) && state.error.is_none() && failure_terminal.is_none() {
                return Err(ConfigError::NoFailureTerminal {
                    state: name.clone(),
                });
            }
        }

        let mut graph = Self {
            name: workflow,
            initial: start,
            source,
            states,
            order: Vec::new(),
            failure_terminal,
            warnings: Vec::new(),
        };

        let reachable = graph.reachable_order();
        let seen: HashSet<&str> = reachable.iter().map(String::as_str).collect();
        let unreachable: Vec<String> = graph
            .states
            .keys()
            .filter(|k| !seen.contains(k.as_str()))
            .cloned()
            .collect();
        for name in &unreachable {
            let msg = format!("state \"{name}\" is unreachable from \"{}\"", graph.initial);
            warn!(workflow = %graph.name, "{msg}");
            graph.warnings.push(msg);
        }
        graph.order = reachable.into_iter().chain(unreachable).collect();

        Ok(graph)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn source(&self) -> Option<&SourceConfig> {
        self.source.as_ref()
    }

    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&StateConfig> {
        self.states.get(name)
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.kind.is_terminal())
    }

    /// Terminal state names.
    pub fn terminals(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|n| self.is_terminal(n))
            .map(String::as_str)
            .collect()
    }

    /// State names, initial first.
    pub fn state_names(&self) -> &[String] {
        &self.order
    }

    /// Advisory validation findings (unreachable states).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Where a failure in `name` goes: its explicit `error` edge, otherwise
    /// the workflow's failure terminal.
    pub fn error_target(&self, name: &str) -> Option<&str> {
        let state = self.state(name)?;
        if !needs_error_edge(state) {
            return None;
        }
        state
            .error
            .as_deref()
            .or(self.failure_terminal.as_deref())
    }

    /// The fail state that absorbs implicit error edges.
    pub fn failure_terminal(&self) -> Option<&str> {
        self.failure_terminal.as_deref()
    }

    /// Outgoing edges of one state, in rendering order.
    pub fn edges_from(&self, name: &str) -> Vec<Edge> {
        let Some(state) = self.state(name) else {
            return Vec::new();
        };
        let edge = |to: &str, kind: EdgeKind| Edge {
            from: name.to_string(),
            to: to.to_string(),
            kind,
        };

        let mut out = Vec::new();
        if let Some(next) = &state.next {
            out.push(edge(next, EdgeKind::Next));
        }
        for rule in &state.choices {
            out.push(edge(&rule.next, EdgeKind::Choice(rule.label())));
        }
        if let Some(default) = &state.default {
            out.push(edge(default, EdgeKind::Default));
        }
        if let Some(to) = &state.timeout_next {
            out.push(edge(to, EdgeKind::Timeout));
        }
        if needs_error_edge(state) {
            if let Some(to) = state.error.as_ref().or(self.failure_terminal.as_ref()) {
                out.push(edge(to, EdgeKind::Error));
            }
        }
        out
    }

    fn reachable_order(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([self.initial.clone()]);
        seen.insert(self.initial.clone());

        while let Some(name) = queue.pop_front() {
            for e in self.edges_from(&name) {
                if seen.insert(e.to.clone()) {
                    queue.push_back(e.to);
                }
            }
            order.push(name);
        }
        order
    }
}

/// Task, wait and pass states can fail (hooks, actions); choice and
/// terminal states cannot.
fn needs_error_edge(state: &StateConfig) -> bool {
    matches!(state.kind, StateKind::Task | StateKind::Wait | StateKind::Pass)
}

/// Prefer a fail state named `failed`, else the first fail state by name.
fn pick_failure_terminal(states: &BTreeMap<String, StateConfig>) -> Option<String> {
    let fails: Vec<&String> = states
        .iter()
        .filter(|(_, s)| s.kind == StateKind::Fail)
        .map(|(n, _)| n)
        .collect();
    fails
        .iter()
        .find(|n| n.as_str() == "failed")
        .or(fails.first())
        .map(|n| n.to_string())
}

fn validate_state(
    name: &str,
    state: &StateConfig,
    states: &BTreeMap<String, StateConfig>,
) -> Result<(), ConfigError> {
    let check_target = |edge: &'static str, target: &str| {
        if states.contains_key(target) {
            Ok(())
        } else {
            Err(ConfigError::UnknownTarget {
                state: name.to_string(),
                edge,
                target: target.to_string(),
            })
        }
    };
    let invalid = |detail: &str| ConfigError::Invalid {
        state: name.to_string(),
        detail: detail.to_string(),
    };

    match state.kind {
        StateKind::Task | StateKind::Wait | StateKind::Pass => {
            let next = state.next.as_deref().ok_or_else(|| ConfigError::MissingNext {
                state: name.to_string(),
            })?;
            check_target("next", next)?;
            if !state.choices.is_empty() || state.default.is_some() {
                return Err(invalid("only choice states may have `choices` or `default`"));
            }
            if state.kind == StateKind::Task && state.action.is_none() {
                return Err(ConfigError::MissingField {
                    state: name.to_string(),
                    kind: "task",
                    field: "action",
                });
            }
            if state.kind == StateKind::Wait && state.event.is_none() {
                return Err(ConfigError::MissingField {
                    state: name.to_string(),
                    kind: "wait",
                    field: "event",
                });
            }
        }
        StateKind::Choice => {
            if state.next.is_some() {
                return Err(ConfigError::ChoiceWithNext {
                    state: name.to_string(),
                });
            }
            if state.choices.is_empty() {
                return Err(ConfigError::EmptyChoice {
                    state: name.to_string(),
                });
            }
            let mut keys = HashSet::new();
            for rule in &state.choices {
                check_target("choice", &rule.next)?;
                if !keys.insert((rule.variable.as_str(), rule.equals.as_str())) {
                    return Err(ConfigError::DuplicateChoice {
                        state: name.to_string(),
                        variable: rule.variable.clone(),
                        value: rule.equals.clone(),
                    });
                }
            }
            if let Some(default) = &state.default {
                check_target("default", default)?;
            }
            if state.error.is_some() || state.timeout.is_some() || state.timeout_next.is_some() {
                return Err(invalid("choice states cannot have error or timeout transitions"));
            }
            if !state.before.is_empty() || !state.after.is_empty() {
                return Err(invalid("choice states cannot have hooks"));
            }
        }
        StateKind::Succeed | StateKind::Fail => {
            if state.next.is_some()
                || state.error.is_some()
                || state.timeout_next.is_some()
                || !state.choices.is_empty()
                || state.default.is_some()
            {
                return Err(invalid("terminal states cannot have transitions"));
            }
            if !state.before.is_empty() || !state.after.is_empty() {
                return Err(invalid("terminal states cannot have hooks"));
            }
        }
    }

    if let Some(err) = &state.error {
        check_target("error", err)?;
    }
    if let Some(to) = &state.timeout_next {
        check_target("timeout", to)?;
        if state.timeout.is_none() {
            return Err(invalid("`timeout_next` requires `timeout`"));
        }
    }
    if state.timeout.is_some_and(|t| t.is_zero()) {
        return Err(invalid("`timeout` must be positive"));
    }
    if state.before.iter().chain(&state.after).any(|h| h.run.trim().is_empty()) {
        return Err(invalid("hook `run` cannot be empty"));
    }
    Ok(())
}
