//! Access policy
//!
//! Resolution order, first match wins: deny-list, allow-list exclusion,
//! per-tool override, provider default, global default.

use crate::config::PolicyConfig;
use crate::tools::types::Policy;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct PolicyState {
    default: Policy,
    deny_list: HashSet<String>,
    /// Empty means no allow-list is in force
    allow_list: HashSet<String>,
    overrides: HashMap<String, Policy>,
}

/// Policy manager
#[derive(Debug, Default)]
pub struct PolicyManager {
    state: Mutex<PolicyState>,
}

impl PolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            state: Mutex::new(PolicyState {
                default: config.default_policy,
                deny_list: config.deny_list.iter().cloned().collect(),
                allow_list: config.allow_list.iter().cloned().collect(),
                overrides: config.overrides.clone(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Effective policy for `tool`
    pub fn resolve(&self, tool: &str, provider_default: Option<Policy>) -> Policy {
        let state = self.state();

        if state.deny_list.contains(tool) {
            return Policy::Deny;
        }
        if !state.allow_list.is_empty() && !state.allow_list.contains(tool) {
            return Policy::Deny;
        }
        if let Some(policy) = state.overrides.get(tool) {
            return *policy;
        }
        provider_default.unwrap_or(state.default)
    }

    /// Set a per-tool override, or the global default when `tool` is `None`
    pub fn set_policy(&self, tool: Option<&str>, policy: Policy) {
        let mut state = self.state();
        match tool {
            Some(name) => {
                state.overrides.insert(name.to_string(), policy);
            }
            None => state.default = policy,
        }
    }

    pub fn deny(&self, tool: &str) {
        self.state().deny_list.insert(tool.to_string());
    }

    /// Lift a deny and force `Allow`
    ///
    /// An allow-list already in force is extended to include the tool.
    pub fn allow(&self, tool: &str) {
        let mut state = self.state();
        state.deny_list.remove(tool);
        if !state.allow_list.is_empty() {
            state.allow_list.insert(tool.to_string());
        }
        state.overrides.insert(tool.to_string(), Policy::Allow);
    }

    /// Install an allow-list; an empty list removes it
    pub fn set_allow_list<I, S>(&self, tools: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().allow_list = tools.into_iter().map(Into::into).collect();
    }

    pub fn default_policy(&self) -> Policy {
        self.state().default
    }

    /// Current state in config form (lists sorted)
    pub fn to_config(&self) -> PolicyConfig {
        let state = self.state();
        let mut deny_list: Vec<String> = state.deny_list.iter().cloned().collect();
        deny_list.sort();
        let mut allow_list: Vec<String> = state.allow_list.iter().cloned().collect();
        allow_list.sort();
        PolicyConfig {
            default_policy: state.default,
            deny_list,
            allow_list,
            overrides: state.overrides.clone(),
        }
    }
}
