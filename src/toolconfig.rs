//! External tool-server registry and per-run manifests.
//!
//! The agent binary loads every declared tool server into its context window
//! at startup, so each run gets a manifest trimmed to the servers its plan
//! actually names. This is an overhead optimization, not a security
//! boundary; writes are constrained by the sandbox.

use crate::constants::EXTERNAL_TOOL_PREFIX;
use crate::{NightshiftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Launch definition for one external tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Registry of all tool servers the user has declared, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    servers: BTreeMap<String, ToolServer>,
}

/// On-disk manifest shape, shared by the registry file and per-run files.
#[derive(Debug, Serialize, Deserialize, Default)]
struct Manifest {
    #[serde(default)]
    servers: BTreeMap<String, ToolServer>,
}

impl ToolRegistry {
    /// Load from the user-local registry file. A missing file is non-fatal
    /// and equivalent to an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no tool registry file; using empty registry");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(NightshiftError::StorageIo(format!(
                    "{}: {e}",
                    path.display()
                )))
            }
        };
        let manifest: Manifest = serde_json::from_str(&raw)?;
        debug!(servers = manifest.servers.len(), "tool registry loaded");
        Ok(Self {
            servers: manifest.servers,
        })
    }

    pub fn from_servers(servers: BTreeMap<String, ToolServer>) -> Self {
        Self { servers }
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Registry documentation block embedded in planning prompts.
    pub fn describe_for_prompt(&self) -> String {
        if self.servers.is_empty() {
            return "No external tool servers are configured.".to_string();
        }
        let mut doc = String::from(
            "External tool servers (reference operations as ext__<server>__<operation>):\n",
        );
        for (name, server) in &self.servers {
            doc.push_str(&format!("- {name}: {}\n", server.command));
        }
        doc
    }

    /// Extract the distinct server names referenced by qualified tool
    /// identifiers, in first-seen order.
    pub fn referenced_servers(allowed_tools: &[String]) -> Vec<String> {
        let mut names = Vec::new();
        for tool in allowed_tools {
            let Some(rest) = tool.strip_prefix(EXTERNAL_TOOL_PREFIX) else {
                continue;
            };
            let server = match rest.split_once("__") {
                Some((server, _op)) => server,
                None => rest,
            };
            if !server.is_empty() && !names.iter().any(|n| n == server) {
                names.push(server.to_string());
            }
        }
        names
    }

    /// Select only the servers a plan's tool list references. Unknown server
    /// names fail; free-form short tool names are ignored here.
    pub fn minimal_manifest(&self, allowed_tools: &[String]) -> Result<BTreeMap<String, ToolServer>> {
        let mut selected = BTreeMap::new();
        for name in Self::referenced_servers(allowed_tools) {
            match self.servers.get(&name) {
                Some(server) => {
                    selected.insert(name, server.clone());
                }
                None => return Err(NightshiftError::UnknownTool(name)),
            }
        }
        Ok(selected)
    }

    /// Write the per-run manifest to a temp file. The guard's Drop removes
    /// it when the worker finishes.
    pub fn write_manifest(&self, allowed_tools: &[String]) -> Result<ToolConfigFile> {
        let servers = self.minimal_manifest(allowed_tools)?;
        if !servers.is_empty() {
            debug!(count = servers.len(), "per-run tool manifest selected");
        }
        let manifest = Manifest { servers };
        let mut file = NamedTempFile::new()
            .map_err(|e| NightshiftError::StorageIo(format!("tool manifest: {e}")))?;
        file.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
            .map_err(|e| NightshiftError::StorageIo(format!("tool manifest: {e}")))?;
        Ok(ToolConfigFile { file })
    }

    /// Validate a plan's tool identifiers without writing anything.
    pub fn validate_tools(&self, allowed_tools: &[String]) -> Result<()> {
        for tool in allowed_tools {
            if tool.trim().is_empty() {
                warn!("plan contains an empty tool identifier");
                return Err(NightshiftError::UnknownTool(String::new()));
            }
        }
        self.minimal_manifest(allowed_tools).map(|_| ())
    }
}

/// Guard over a written per-run manifest.
pub struct ToolConfigFile {
    file: NamedTempFile,
}

impl ToolConfigFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> ToolRegistry {
        let mut servers = BTreeMap::new();
        servers.insert(
            "arxiv".to_string(),
            ToolServer {
                command: "arxiv-server".to_string(),
                args: vec!["--stdio".to_string()],
                env: BTreeMap::new(),
            },
        );
        servers.insert(
            "notion".to_string(),
            ToolServer {
                command: "notion-server".to_string(),
                args: Vec::new(),
                env: BTreeMap::from([("NOTION_TOKEN".to_string(), "tok".to_string())]),
            },
        );
        ToolRegistry::from_servers(servers)
    }

    #[test]
    fn missing_registry_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = ToolRegistry::load(&dir.path().join("tool_servers.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tool_servers.json");
        std::fs::write(
            &path,
            r#"{"servers":{"arxiv":{"command":"arxiv-server","args":["--stdio"]}}}"#,
        )
        .unwrap();
        let registry = ToolRegistry::load(&path).unwrap();
        assert_eq!(registry.server_names(), vec!["arxiv"]);
    }

    #[test]
    fn referenced_servers_parsed_from_qualified_names() {
        let tools = vec![
            "Write".to_string(),
            "ext__arxiv__search".to_string(),
            "ext__arxiv__download".to_string(),
            "ext__notion__create_page".to_string(),
            "WebSearch".to_string(),
        ];
        assert_eq!(
            ToolRegistry::referenced_servers(&tools),
            vec!["arxiv".to_string(), "notion".to_string()]
        );
    }

    #[test]
    fn minimal_manifest_selects_only_referenced() {
        let registry = registry();
        let selected = registry
            .minimal_manifest(&["Write".to_string(), "ext__arxiv__search".to_string()])
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected.contains_key("arxiv"));
    }

    #[test]
    fn plain_tools_produce_empty_manifest() {
        let registry = registry();
        let selected = registry
            .minimal_manifest(&["Write".to_string(), "Read".to_string()])
            .unwrap();
        assert!(selected.is_empty());
    }

    #[test]
    fn unknown_server_rejected() {
        let registry = registry();
        let result = registry.minimal_manifest(&["ext__github__create_issue".to_string()]);
        assert!(matches!(result, Err(NightshiftError::UnknownTool(name)) if name == "github"));
    }

    #[test]
    fn manifest_file_written_and_scoped() {
        let registry = registry();
        let written_path;
        {
            let manifest = registry
                .write_manifest(&["ext__arxiv__search".to_string()])
                .unwrap();
            written_path = manifest.path().to_path_buf();
            let raw = std::fs::read_to_string(manifest.path()).unwrap();
            assert!(raw.contains("arxiv-server"));
            assert!(!raw.contains("notion-server"));
        }
        assert!(!written_path.exists(), "manifest should be removed on drop");
    }
}
