use thiserror::Error;

/// Workflow definition errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workflow YAML: {0}")]
    Parse(String),

    #[error("workflow has no states")]
    NoStates,

    #[error("workflow has no start state")]
    MissingInitial,

    #[error("start state \"{0}\" does not exist")]
    UnknownInitial(String),

    #[error("workflow has no terminal (succeed/fail) state")]
    NoTerminal,

    #[error("state \"{state}\" must have exactly one `next` transition")]
    MissingNext { state: String },

    #[error("choice state \"{state}\" cannot have a plain `next` transition")]
    ChoiceWithNext { state: String },

    #[error("choice state \"{state}\" has no choices")]
    EmptyChoice { state: String },

    #[error("choice state \"{state}\" has more than one branch for {variable} == {value}")]
    DuplicateChoice {
        state: String,
        variable: String,
        value: String,
    },

    #[error("state \"{state}\" {edge} target \"{target}\" does not exist")]
    UnknownTarget {
        state: String,
        edge: &'static str,
        target: String,
    },

    #[error("{kind} state \"{state}\" requires `{field}`")]
    MissingField {
        state: String,
        kind: &'static str,
        field: &'static str,
    },

    #[error("state \"{state}\": {detail}")]
    Invalid { state: String, detail: String },

    #[error("unknown source provider \"{0}\"")]
    UnknownProvider(String),

    #[error("state \"{state}\" has no error transition and the workflow has no fail state")]
    NoFailureTerminal { state: String },
}
