use std::collections::HashMap;

use crate::protocol::models::CapabilityKind;
use crate::types::{McpPrompt, McpResource, McpTool};

/// Joins a server name and a local capability name.
pub const SEPARATOR: &str = "__";

/// Everything one server listed, ready to be indexed.
#[derive(Debug, Clone, Default)]
pub struct ServerListing {
    pub server: String,
    pub tools: Vec<McpTool>,
    pub prompts: Vec<McpPrompt>,
    pub resources: Vec<McpResource>,
}

/// Where a qualified name leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRoute {
    pub qualified: String,
    pub server: String,
    pub local: String,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    route: CapabilityRoute,
    item: T,
}

/// Reverse index from qualified names to their owning server.
///
/// The index is never mutated once published; the manager swaps in a new
/// one whenever the connected set changes.
#[derive(Debug, Clone, Default)]
pub struct CapabilityIndex {
    tools: HashMap<String, Entry<McpTool>>,
    prompts: HashMap<String, Entry<McpPrompt>>,
    resources: HashMap<String, Entry<McpResource>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `{server}__{name}`
    pub fn qualify(server: &str, name: &str) -> String {
        format!("{}{}{}", server, SEPARATOR, name)
    }

    /// Split at the first separator. Server names never contain it, local
    /// names may.
    pub fn split(qualified: &str) -> Option<(&str, &str)> {
        qualified
            .split_once(SEPARATOR)
            .filter(|(server, local)| !server.is_empty() && !local.is_empty())
    }

    pub fn from_listings(listings: impl IntoIterator<Item = ServerListing>) -> Self {
        let mut index = Self::new();
        for listing in listings {
            index.insert(listing);
        }
        index
    }

    /// A copy with `listing` replacing whatever its server had before.
    pub fn with_server(&self, listing: ServerListing) -> Self {
        let mut index = self.without_server(&listing.server);
        index.insert(listing);
        index
    }

    /// A copy without any entry owned by `server`.
    pub fn without_server(&self, server: &str) -> Self {
        let keep_tools = |e: &&Entry<McpTool>| e.route.server != server;
        let keep_prompts = |e: &&Entry<McpPrompt>| e.route.server != server;
        let keep_resources = |e: &&Entry<McpResource>| e.route.server != server;
        Self {
            tools: self
                .tools
                .values()
                .filter(keep_tools)
                .map(|e| (e.route.qualified.clone(), e.clone()))
                .collect(),
            prompts: self
                .prompts
                .values()
                .filter(keep_prompts)
                .map(|e| (e.route.qualified.clone(), e.clone()))
                .collect(),
            resources: self
                .resources
                .values()
                .filter(keep_resources)
                .map(|e| (e.route.qualified.clone(), e.clone()))
                .collect(),
        }
    }

    fn insert(&mut self, listing: ServerListing) {
        let server = listing.server;
        for tool in listing.tools {
            let route = route(&server, &tool.name);
            self.tools.insert(route.qualified.clone(), Entry { route, item: tool });
        }
        for prompt in listing.prompts {
            let route = route(&server, &prompt.name);
            self.prompts
                .insert(route.qualified.clone(), Entry { route, item: prompt });
        }
        for resource in listing.resources {
            let route = route(&server, &resource.uri);
            self.resources
                .insert(route.qualified.clone(), Entry { route, item: resource });
        }
    }

    pub fn lookup(&self, kind: CapabilityKind, qualified: &str) -> Option<&CapabilityRoute> {
        match kind {
            CapabilityKind::Tools => self.tools.get(qualified).map(|e| &e.route),
            CapabilityKind::Prompts => self.prompts.get(qualified).map(|e| &e.route),
            CapabilityKind::Resources => self.resources.get(qualified).map(|e| &e.route),
        }
    }

    pub fn contains(&self, kind: CapabilityKind, qualified: &str) -> bool {
        self.lookup(kind, qualified).is_some()
    }

    /// Whether any entry of any kind belongs to `server`.
    pub fn indexes_server(&self, server: &str) -> bool {
        self.tools.values().any(|e| e.route.server == server)
            || self.prompts.values().any(|e| e.route.server == server)
            || self.resources.values().any(|e| e.route.server == server)
    }

    pub fn len(&self, kind: CapabilityKind) -> usize {
        match kind {
            CapabilityKind::Tools => self.tools.len(),
            CapabilityKind::Prompts => self.prompts.len(),
            CapabilityKind::Resources => self.resources.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.prompts.is_empty() && self.resources.is_empty()
    }

    /// Tools under their qualified names, sorted.
    pub fn tools(&self) -> Vec<McpTool> {
        let mut tools: Vec<McpTool> = self
            .tools
            .values()
            .map(|e| McpTool {
                name: e.route.qualified.clone(),
                ..e.item.clone()
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn prompts(&self) -> Vec<McpPrompt> {
        let mut prompts: Vec<McpPrompt> = self
            .prompts
            .values()
            .map(|e| McpPrompt {
                name: e.route.qualified.clone(),
                ..e.item.clone()
            })
            .collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    /// Resources with their URI qualified, sorted.
    pub fn resources(&self) -> Vec<McpResource> {
        let mut resources: Vec<McpResource> = self
            .resources
            .values()
            .map(|e| McpResource {
                uri: e.route.qualified.clone(),
                ..e.item.clone()
            })
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Qualified tool names owned by `server`.
    pub fn server_tools(&self, server: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|e| e.route.server == server)
            .map(|e| e.route.qualified.clone())
            .collect();
        names.sort();
        names
    }
}

fn route(server: &str, local: &str) -> CapabilityRoute {
    CapabilityRoute {
        qualified: CapabilityIndex::qualify(server, local),
        server: server.to_string(),
        local: local.to_string(),
    }
}
