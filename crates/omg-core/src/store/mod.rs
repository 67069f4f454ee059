//! The Graph Store: read/write node files, maintain the registry, atomic
//! file ops, directory scaffold (spec §4.1).

mod atomic;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::model::{Node, NodeType, Registry, RegistryEntry};

pub use atomic::atomic_write;

const REGISTRY_FILE: &str = ".registry.json";

/// Rejects `..`, `/`, `\` in path-component arguments (sessionKey, domain,
/// filename) per spec §4.1.
pub(crate) fn validate_path_component(component: &str) -> Result<(), StoreError> {
    if component.is_empty()
        || component.contains("..")
        || component.contains('/')
        || component.contains('\\')
    {
        return Err(StoreError::InvalidPath(component.to_string()));
    }
    Ok(())
}

/// Lowercase-kebab slug: ASCII alphanumeric and dash only.
pub(crate) fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut last_was_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "node".to_string()
    } else {
        out
    }
}

pub(crate) fn date_prefix(iso_datetime: &str) -> &str {
    iso_datetime.get(0..10).unwrap_or(iso_datetime)
}

struct State {
    registry: Registry,
}

/// Owns all writes to `omgRoot/`. Every mutating operation is serialized
/// through a single async mutex, a FIFO queue of single-caller critical
/// sections (spec §4.1, §9). Pipelines read a snapshot and hand back edit
/// plans; they never touch the filesystem directly.
pub struct GraphStore {
    root: PathBuf,
    state: Mutex<State>,
}

impl GraphStore {
    /// Loads the registry from disk. A missing or corrupt registry file is
    /// not fatal — it's logged and replaced with an empty registry, matching
    /// "Registry corruption -> defaults" in spec §4.1.
    pub async fn load(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let registry = Self::read_registry_file(&root).await.unwrap_or_else(|e| {
            warn!("registry load failed, starting with empty registry: {e}");
            Registry::new()
        });

        GraphStore {
            root,
            state: Mutex::new(State { registry }),
        }
    }

    async fn read_registry_file(root: &Path) -> Result<Registry, String> {
        let path = root.join(REGISTRY_FILE);
        if !path.exists() {
            return Ok(Registry::new());
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn nodes_dir(&self, node_type: NodeType) -> PathBuf {
        self.root.join("nodes").join(node_type.dir_name())
    }

    /// Parses YAML front-matter + body; returns `None` on missing file,
    /// malformed YAML, or validation failure. Read failures are non-fatal.
    pub async fn read_node(&self, file_path: &Path) -> Option<Node> {
        let raw = tokio::fs::read_to_string(file_path).await.ok()?;
        let parsed = obsidian_fs::parse_frontmatter(&raw);
        let frontmatter = parsed.frontmatter?;
        let value = serde_json::Value::Object(frontmatter.into_iter().collect());
        let mut node: Node = serde_json::from_value(value).ok()?;
        node.body = parsed.content.to_string();
        node.validate().ok()?;
        Some(node)
    }

    /// Nodes of the given type, ordered by `updated` descending. Empty if
    /// the directory is missing.
    pub async fn list_nodes_by_type(&self, node_type: NodeType) -> Vec<Node> {
        let dir = self.nodes_dir(node_type);
        let mut nodes = self.scan_dir(&dir).await;
        nodes.sort_by(|a, b| b.updated.cmp(&a.updated));
        nodes
    }

    pub async fn list_all_nodes(&self) -> Vec<Node> {
        let mut all = Vec::new();
        for node_type in NodeType::ALL {
            all.extend(self.scan_dir(&self.nodes_dir(node_type)).await);
        }
        all.sort_by(|a, b| b.updated.cmp(&a.updated));
        all
    }

    async fn scan_dir(&self, dir: &Path) -> Vec<Node> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return out,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if is_hidden {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Some(node) = self.read_node(&path).await {
                out.push(node);
            }
        }
        out
    }

    /// Atomic write: write to `omgRoot/.tmp-<rand>.md`, rename over
    /// destination. Assigns a new file path (`<slug>-YYYY-MM-DD.md`) for
    /// nodes not already in the registry; reuses the existing path for
    /// updates. Upserts the registry entry and persists it.
    pub async fn write_node(&self, node: &Node) -> Result<PathBuf, StoreError> {
        node.validate()?;

        let mut state = self.state.lock().await;

        let file_path = match state.registry.get(&node.id) {
            Some(existing) => existing.file_path.clone(),
            None => self.allocate_file_path(&state.registry, node)?,
        };

        let absolute = self.root.join(&file_path);
        let serialized = self.serialize_node(node)?;
        atomic_write(&absolute, &serialized)
            .await
            .map_err(|source| StoreError::AtomicWrite {
                path: file_path.display().to_string(),
                source,
            })?;

        state
            .registry
            .insert(node.id.clone(), RegistryEntry::from_node(node, file_path.clone()));
        self.persist_registry(&state.registry).await?;

        Ok(file_path)
    }

    fn allocate_file_path(&self, registry: &Registry, node: &Node) -> Result<PathBuf, StoreError> {
        let base_slug = slugify(
            node.canonical_key
                .as_deref()
                .unwrap_or(node.description.as_str()),
        );
        let date = date_prefix(&node.created);
        validate_path_component(&base_slug)?;

        let existing_file_names: std::collections::HashSet<String> = registry
            .values()
            .filter_map(|e| e.file_path.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();

        let mut candidate = format!("{base_slug}-{date}.md");
        let mut suffix = 2;
        while existing_file_names.contains(&candidate) {
            candidate = format!("{base_slug}-{date}-{suffix}.md");
            suffix += 1;
        }

        Ok(PathBuf::from("nodes").join(node.node_type.dir_name()).join(candidate))
    }

    fn serialize_node(&self, node: &Node) -> Result<String, StoreError> {
        let value = serde_json::to_value(node).map_err(|e| StoreError::InvalidPath(e.to_string()))?;
        let frontmatter: obsidian_fs::Frontmatter = match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => unreachable!("Node always serializes to a JSON object"),
        };
        obsidian_fs::build_note_with_frontmatter(&frontmatter, &node.body).map_err(StoreError::from)
    }

    /// Upserts a registry entry directly, without writing a node file.
    /// Used by callers that already wrote the file themselves (e.g. the
    /// merge executor patching an existing node in place).
    pub async fn upsert_registry(&self, id: &str, entry: RegistryEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.registry.insert(id.to_string(), entry);
        self.persist_registry(&state.registry).await
    }

    /// Flags a node archived in the registry. The node file is not deleted.
    pub async fn archive(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.registry.get_mut(id) {
            entry.archived = true;
        }
        self.persist_registry(&state.registry).await
    }

    pub async fn get_entries(&self) -> Registry {
        self.state.lock().await.registry.clone()
    }

    pub async fn get_node_file_paths(&self, ids: &[String]) -> HashMap<String, PathBuf> {
        let state = self.state.lock().await;
        ids.iter()
            .filter_map(|id| state.registry.get(id).map(|e| (id.clone(), e.file_path.clone())))
            .collect()
    }

    async fn persist_registry(&self, registry: &Registry) -> Result<(), StoreError> {
        let path = self.root.join(REGISTRY_FILE);
        let serialized = serde_json::to_string_pretty(registry)
            .map_err(|e| StoreError::InvalidPath(e.to_string()))?;
        atomic_write(&path, &serialized)
            .await
            .map_err(|source| StoreError::AtomicWrite {
                path: REGISTRY_FILE.to_string(),
                source,
            })
    }

    /// Idempotent creation of the directory tree and template seed files.
    /// Returns immediately if `index.md` already exists.
    pub async fn scaffold_if_needed(&self) -> Result<(), StoreError> {
        let index_path = self.root.join("index.md");
        if index_path.exists() {
            return Ok(());
        }

        for node_type in NodeType::ALL {
            tokio::fs::create_dir_all(self.nodes_dir(node_type))
                .await
                .map_err(|source| StoreError::Io {
                    path: self.nodes_dir(node_type).display().to_string(),
                    source,
                })?;
        }
        tokio::fs::create_dir_all(self.root.join("mocs"))
            .await
            .map_err(|source| StoreError::Io {
                path: "mocs".to_string(),
                source,
            })?;

        atomic_write(&index_path, "# Index\n\n").await.map_err(|source| {
            StoreError::AtomicWrite {
                path: "index.md".to_string(),
                source,
            }
        })?;
        atomic_write(&self.root.join("now.md"), "# Now\n\n")
            .await
            .map_err(|source| StoreError::AtomicWrite {
                path: "now.md".to_string(),
                source,
            })
    }

    /// Rewrites `index.md` with a sorted wikilink list of MOC files.
    pub async fn regenerate_index(&self) -> Result<(), StoreError> {
        let state = self.state.lock().await;
        let mut domains: std::collections::HashSet<String> = std::collections::HashSet::new();
        for entry in state.registry.values() {
            if !entry.archived {
                domains.insert(crate::similarity::resolve_domain_for_entry(entry));
            }
        }
        drop(state);

        let mut entries: Vec<(String, String)> = domains
            .into_iter()
            .map(|d| (format!("omg/moc-{d}"), format!("{d} notes")))
            .collect();
        entries.sort();

        let body = wiki_links::render_link_list(&entries);
        let content = format!("# Index\n\n{body}\n");
        atomic_write(&self.root.join("index.md"), &content)
            .await
            .map_err(|source| StoreError::AtomicWrite {
                path: "index.md".to_string(),
                source,
            })
    }

    /// Reads all non-archived nodes whose resolved domain equals `domain`,
    /// orders by `updated` descending, writes `mocs/moc-<domain>.md`.
    pub async fn regenerate_moc(&self, domain: &str) -> Result<(), StoreError> {
        validate_path_component(domain)?;

        let state = self.state.lock().await;
        let mut entries: Vec<&RegistryEntry> = state
            .registry
            .values()
            .filter(|e| !e.archived && crate::similarity::resolve_domain_for_entry(e) == domain)
            .collect();
        entries.sort_by(|a, b| b.updated.cmp(&a.updated));

        let rows: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.id.clone(), e.description.clone()))
            .collect();
        drop(state);

        let body = wiki_links::render_link_list(&rows);
        let content = format!("# {domain}\n\n{body}\n");
        let path = self.root.join("mocs").join(format!("moc-{domain}.md"));
        atomic_write(&path, &content)
            .await
            .map_err(|source| StoreError::AtomicWrite {
                path: format!("mocs/moc-{domain}.md"),
                source,
            })
    }
}
