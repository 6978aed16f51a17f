//! Model routing.
//!
//! Maps a requested model name/alias onto a concrete backend provider and
//! backend model id. The table is static configuration: loaded once at
//! startup (JSON file or built-in defaults), never mutated, read without
//! locking. Lookup is exact-match against aliases; first matching entry wins.

use crate::errors::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Backend provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// "Responses"-style HTTPS JSON backend.
    Responses,
    /// "Converse"-style backend (Bedrock-equivalent).
    Converse,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Responses => "responses",
            Provider::Converse => "converse",
        }
    }
}

/// One row of the static routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub provider: Provider,
    pub backend_model_id: String,
    pub aliases: HashSet<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub capabilities: HashSet<String>,
}

/// Outcome of routing one request. `is_supported == false` is terminal: the
/// request is rejected before any provider call and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub provider: Provider,
    pub requested_model: String,
    pub backend_model: String,
    pub is_supported: bool,
}

/// The startup-loaded routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    pub entries: Vec<RoutingEntry>,
    pub default_provider: Provider,
    pub default_model: String,
}

impl RoutingTable {
    /// Load a routing table from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let table: RoutingTable = serde_json::from_str(&content)?;
        Ok(table)
    }

    /// Built-in table used when no config file is supplied.
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                RoutingEntry {
                    provider: Provider::Responses,
                    backend_model_id: "gpt-4o".to_string(),
                    aliases: ["gpt-4o", "gpt-4o-2024-08-06", "default"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    capabilities: ["tools", "streaming", "reasoning"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
                RoutingEntry {
                    provider: Provider::Responses,
                    backend_model_id: "o4-mini".to_string(),
                    aliases: ["o4-mini", "reasoning-mini"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    capabilities: ["tools", "streaming", "reasoning"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
                RoutingEntry {
                    provider: Provider::Converse,
                    backend_model_id: "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string(),
                    aliases: ["claude-3-5-sonnet-20241022", "claude-3-5-sonnet", "sonnet"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    capabilities: ["tools", "streaming"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
                RoutingEntry {
                    provider: Provider::Converse,
                    backend_model_id: "qwen.qwen3-coder-480b-a35b-v1:0".to_string(),
                    aliases: ["qwen-3-coder", "qwen3-coder"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                    capabilities: ["tools", "streaming"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
            ],
            default_provider: Provider::Responses,
            default_model: "gpt-4o".to_string(),
        }
    }

    /// Resolve a requested model to a routing decision.
    ///
    /// Exact alias match across entries, first match wins. A miss produces
    /// `is_supported = false`; callers must reject without retrying.
    pub fn resolve(&self, requested_model: &str) -> RoutingDecision {
        for entry in &self.entries {
            if entry.aliases.contains(requested_model) {
                return RoutingDecision {
                    provider: entry.provider,
                    requested_model: requested_model.to_string(),
                    backend_model: entry.backend_model_id.clone(),
                    is_supported: true,
                };
            }
        }
        RoutingDecision {
            provider: self.default_provider,
            requested_model: requested_model.to_string(),
            backend_model: self.default_model.clone(),
            is_supported: false,
        }
    }

    /// Resolve, turning a miss into the terminal routing error.
    pub fn resolve_supported(&self, requested_model: &str) -> GatewayResult<RoutingDecision> {
        let decision = self.resolve(requested_model);
        if !decision.is_supported {
            return Err(GatewayError::UnsupportedModel {
                model: requested_model.to_string(),
            });
        }
        Ok(decision)
    }

    /// Summary counts for the stats endpoint.
    pub fn stats(&self) -> RoutingTableStats {
        let mut per_provider: HashMap<String, usize> = HashMap::new();
        for entry in &self.entries {
            *per_provider.entry(entry.provider.as_str().to_string()).or_insert(0) += 1;
        }
        RoutingTableStats {
            total_entries: self.entries.len(),
            total_aliases: self.entries.iter().map(|e| e.aliases.len()).sum(),
            per_provider,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTableStats {
    pub total_entries: usize,
    pub total_aliases: usize,
    pub per_provider: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn resolves_known_aliases() {
        let table = RoutingTable::builtin();

        let d = table.resolve("claude-3-5-sonnet-20241022");
        assert!(d.is_supported);
        assert_eq!(d.provider, Provider::Converse);
        assert_eq!(d.backend_model, "anthropic.claude-3-5-sonnet-20241022-v2:0");
        assert_eq!(d.requested_model, "claude-3-5-sonnet-20241022");

        let d = table.resolve("qwen-3-coder");
        assert!(d.is_supported);
        assert_eq!(d.provider, Provider::Converse);
    }

    #[test]
    fn lookup_is_exact_not_prefix() {
        let table = RoutingTable::builtin();
        assert!(!table.resolve("gpt-4o-mini-preview-of-something").is_supported);
        assert!(!table.resolve("gpt-4").is_supported);
        assert!(table.resolve("gpt-4o").is_supported);
    }

    #[test]
    fn miss_is_unsupported_and_errors() {
        let table = RoutingTable::builtin();
        let d = table.resolve("no-such-model");
        assert!(!d.is_supported);

        let err = table.resolve_supported("no-such-model").unwrap_err();
        assert!(err.to_string().contains("no-such-model"));
        assert!(!err.is_retryable());
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn loads_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "entries": [{{
                    "provider": "converse",
                    "backend_model_id": "meta.llama3-70b-instruct-v1:0",
                    "aliases": ["llama-70b"]
                }}],
                "default_provider": "responses",
                "default_model": "gpt-4o"
            }}"#
        )
        .unwrap();

        let table = RoutingTable::load_from_file(file.path()).unwrap();
        assert_eq!(table.entries.len(), 1);
        let d = table.resolve("llama-70b");
        assert!(d.is_supported);
        assert_eq!(d.provider, Provider::Converse);
    }

    #[test]
    fn stats_counts_entries_per_provider() {
        let stats = RoutingTable::builtin().stats();
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.per_provider.get("responses"), Some(&2));
        assert_eq!(stats.per_provider.get("converse"), Some(&2));
    }
}
