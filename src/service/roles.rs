//! Built-in role prompts, grouped by tags.
//!
//! The role list is a TOML file of `[[roles]]` tables:
//!
//! ```toml
//! [[roles]]
//! title = "Pirate"
//! content = "You are a pirate. Answer every question in pirate speak."
//! tags = ["fun"]
//! ```

use std::{collections::BTreeSet, ops::Deref, path::Path, sync::Arc};

use serde::Deserialize;
use tracing::{info, instrument};

use crate::base::types::Res;

// Types.

/// A named system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoleEntry {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RoleFile {
    #[serde(default)]
    roles: Vec<RoleEntry>,
}

// Traits.

/// Generic source of role prompts.
pub trait GenericRoleCatalog: Send + Sync + 'static {
    /// Every tag used by at least one role, deduplicated and sorted.
    fn all_unique_tags(&self) -> BTreeSet<String>;

    /// Roles carrying the given tag, in file order.
    fn roles_by_tag(&self, tag: &str) -> Vec<RoleEntry>;
}

// Structs.

/// Role catalog for the application.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct RoleCatalog {
    inner: Arc<dyn GenericRoleCatalog>,
}

impl Deref for RoleCatalog {
    type Target = dyn GenericRoleCatalog;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl RoleCatalog {
    pub fn new(inner: Arc<dyn GenericRoleCatalog>) -> Self {
        Self { inner }
    }

    /// Load the role list from a TOML file; a missing file yields an empty catalog.
    #[instrument(skip_all)]
    pub fn from_file(path: &Path) -> Res<Self> {
        let roles = if path.exists() {
            let file: RoleFile = config::Config::builder()
                .add_source(config::File::from(path.to_path_buf()))
                .build()?
                .try_deserialize()?;
            file.roles
        } else {
            Vec::new()
        };

        info!("Loaded {} roles from `{}`.", roles.len(), path.display());

        Ok(Self::new(Arc::new(StaticRoleCatalog::new(roles))))
    }
}

/// Role catalog over a fixed list of roles.
pub struct StaticRoleCatalog {
    roles: Vec<RoleEntry>,
}

impl StaticRoleCatalog {
    pub fn new(roles: Vec<RoleEntry>) -> Self {
        Self { roles }
    }
}

impl GenericRoleCatalog for StaticRoleCatalog {
    fn all_unique_tags(&self) -> BTreeSet<String> {
        self.roles.iter().flat_map(|role| role.tags.iter().cloned()).collect()
    }

    fn roles_by_tag(&self, tag: &str) -> Vec<RoleEntry> {
        self.roles.iter().filter(|role| role.tags.iter().any(|t| t == tag)).cloned().collect()
    }
}

// Tests.
