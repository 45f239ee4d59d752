//! Provider registry
//!
//! Maps tool names to provider instances and holds the on-demand loader
//! table. Providers are immutable once registered; registration is rare and
//! effectively append-only after startup.

use crate::errors::{EngineError, Result};
use crate::tools::provider::Provider;
use crate::tools::types::ToolSchema;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle to a registered provider
pub type ProviderRef = Arc<dyn Provider>;

type Constructor = Arc<dyn Fn() -> Vec<ProviderRef> + Send + Sync>;

/// Lazily constructed provider group
///
/// Fires when a lookup asks for `name` or when any keyword appears in the
/// call context. A loader fires at most once.
#[derive(Clone)]
pub struct OnDemandLoader {
    pub name: String,
    pub keywords: Vec<String>,
    constructor: Constructor,
}

impl OnDemandLoader {
    pub fn new<I, S, F>(name: impl Into<String>, keywords: I, constructor: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn() -> Vec<ProviderRef> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
            constructor: Arc::new(constructor),
        }
    }

    /// Whether any keyword occurs in `context` (case-insensitive)
    pub fn matches_context(&self, context: &str) -> bool {
        let context = context.to_lowercase();
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && context.contains(k.as_str()))
    }

    fn construct(&self) -> Vec<ProviderRef> {
        (self.constructor)()
    }
}

impl fmt::Debug for OnDemandLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDemandLoader")
            .field("name", &self.name)
            .field("keywords", &self.keywords)
            .finish()
    }
}

/// Tool registry
#[derive(Default)]
pub struct ToolRegistry {
    /// Map of tool name to provider
    tools: Mutex<HashMap<String, ProviderRef>>,

    /// Loaders that have not fired yet
    loaders: Mutex<Vec<OnDemandLoader>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tools(&self) -> MutexGuard<'_, HashMap<String, ProviderRef>> {
        self.tools.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn loaders(&self) -> MutexGuard<'_, Vec<OnDemandLoader>> {
        self.loaders.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a provider; names are unique
    pub fn register(&self, provider: ProviderRef) -> Result<()> {
        let name = provider.name().to_string();
        let mut tools = self.tools();
        if tools.contains_key(&name) {
            return Err(EngineError::Generic(format!(
                "Tool '{}' is already registered",
                name
            )));
        }
        tracing::debug!(tool = %name, category = %provider.schema().category, "Registered tool");
        tools.insert(name, provider);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<ProviderRef> {
        let removed = self.tools().remove(name);
        if removed.is_some() {
            tracing::debug!(tool = %name, "Unregistered tool");
        }
        removed
    }

    pub fn register_on_demand(&self, loader: OnDemandLoader) {
        tracing::debug!(loader = %loader.name, keywords = ?loader.keywords, "Registered on-demand loader");
        self.loaders().push(loader);
    }

    /// Get provider by name
    pub fn get(&self, name: &str) -> Option<ProviderRef> {
        self.tools().get(name).cloned()
    }

    /// Check if tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools().contains_key(name)
    }

    /// Look a tool up, consulting the loader table once when it is missing
    ///
    /// Loaders named after the tool fire first; otherwise every loader whose
    /// keywords occur in `context` fires.
    pub fn resolve(&self, name: &str, context: &str) -> Option<ProviderRef> {
        if let Some(provider) = self.get(name) {
            return Some(provider);
        }

        let mut loaders = self.loaders();
        // another caller may have loaded it while we waited for the table
        if let Some(provider) = self.get(name) {
            return Some(provider);
        }

        let by_name = loaders.iter().any(|l| l.name == name);
        let fired = take_matching(&mut loaders, |l| {
            if by_name {
                l.name == name
            } else {
                l.matches_context(context)
            }
        });
        if fired.is_empty() {
            return None;
        }

        self.install(&fired);
        drop(loaders);
        self.get(name)
    }

    /// Fire every loader whose keywords occur in `context`
    pub fn load_matching(&self, context: &str) -> Vec<String> {
        let mut loaders = self.loaders();
        let fired = take_matching(&mut loaders, |l| l.matches_context(context));
        self.install(&fired)
    }

    fn install(&self, fired: &[OnDemandLoader]) -> Vec<String> {
        let mut loaded = Vec::new();
        for loader in fired {
            for provider in loader.construct() {
                let name = provider.name().to_string();
                match self.register(provider) {
                    Ok(()) => loaded.push(name),
                    Err(e) => {
                        tracing::warn!(loader = %loader.name, tool = %name, error = %e, "On-demand provider skipped");
                    }
                }
            }
            tracing::info!(loader = %loader.name, tools = ?loaded, "Loaded tools on demand");
        }
        loaded
    }

    /// Names of loaders that have not fired yet
    pub fn pending_loaders(&self) -> Vec<String> {
        self.loaders().iter().map(|l| l.name.clone()).collect()
    }

    /// Get all tool names, sorted
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all tool schemas, sorted by name
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> =
            self.tools().values().map(|p| p.schema().clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Get read-only tool names
    pub fn read_only_tools(&self) -> Vec<String> {
        self.names_where(|schema| schema.read_only)
    }

    /// Get write tool names
    pub fn write_tools(&self) -> Vec<String> {
        self.names_where(|schema| !schema.read_only)
    }

    fn names_where(&self, pred: impl Fn(&ToolSchema) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools()
            .iter()
            .filter(|(_, provider)| pred(provider.schema()))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Get total number of tools
    pub fn len(&self) -> usize {
        self.tools().len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools().is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .field("pending_loaders", &self.pending_loaders())
            .finish()
    }
}

fn take_matching(
    loaders: &mut Vec<OnDemandLoader>,
    pred: impl Fn(&OnDemandLoader) -> bool,
) -> Vec<OnDemandLoader> {
    let mut fired = Vec::new();
    let mut i = 0;
    while i < loaders.len() {
        if pred(&loaders[i]) {
            fired.push(loaders.remove(i));
        } else {
            i += 1;
        }
    }
    fired
}
