use crate::asana::AsanaProvider;
use crate::github::GitHubProvider;
use crate::linear::LinearProvider;
use crate::provider::{Provider, RepoSettings, Source};
use erg_core::Executor;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The set of known providers plus which ones are currently disabled for
/// missing credentials.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
    disabled: Mutex<HashSet<Source>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers,
            disabled: Mutex::new(HashSet::new()),
        }
    }

    /// GitHub, Asana and Linear with real transports.
    pub fn standard(
        exec: Arc<dyn Executor>,
        settings: Arc<dyn RepoSettings>,
        timeout: Duration,
    ) -> Self {
        Self::new(vec![
            Arc::new(GitHubProvider::new(exec)),
            Arc::new(AsanaProvider::new(settings.clone(), timeout)),
            Arc::new(LinearProvider::new(settings, timeout)),
        ])
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn Provider>> {
        self.providers.iter().find(|p| p.source() == source).cloned()
    }

    pub fn all(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    /// Mark a provider disabled. Returns true only on the first call, so the
    /// caller reports the condition once.
    pub fn disable(&self, source: Source) -> bool {
        self.disabled
            .lock()
            .map(|mut d| d.insert(source))
            .unwrap_or(false)
    }

    pub fn is_disabled(&self, source: Source) -> bool {
        self.disabled
            .lock()
            .map(|d| d.contains(&source))
            .unwrap_or(false)
    }

    /// Re-enable a disabled provider once it reports configured for `repo`.
    /// Returns true when the provider is usable.
    pub fn check_enabled(&self, source: Source, repo: &Path) -> bool {
        if !self.is_disabled(source) {
            return true;
        }
        let configured = self.get(source).map(|p| p.is_configured(repo)).unwrap_or(false);
        if configured {
            if let Ok(mut d) = self.disabled.lock() {
                d.remove(&source);
            }
        }
        configured
    }
}
