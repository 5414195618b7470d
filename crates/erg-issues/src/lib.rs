//! Issue tracker providers.
//!
//! A [`Provider`] fetches open work items for a repository and knows how to
//! name branches and link PRs back to them. Write-back (comments, label
//! removal) is an optional capability exposed through
//! [`Provider::actions`].

pub mod asana;
pub mod branch;
pub mod error;
pub mod github;
pub mod linear;
pub mod provider;
pub mod registry;

pub use asana::AsanaProvider;
pub use error::ProviderError;
pub use github::GitHubProvider;
pub use linear::LinearProvider;
pub use provider::{
    label_matches, FilterConfig, Issue, Provider, ProviderActions, RecordedAction, RepoSettings, Source,
    StaticProvider,
};
pub use registry::ProviderRegistry;
