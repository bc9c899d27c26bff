//! Tenant namespace mapping between client-visible and fully-qualified destination names.

use crate::core::config::{TenantConfig, TenantEntry, TenantScope};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

const SYSTEM_PREFIX: &str = "$SYS";
const USER_TOKEN: &str = "{user}";
const PROTOCOL_TOKEN: &str = "{protocol}";
const DEFAULT_TENANT: &str = "default";
const ANONYMOUS: &str = "anonymous";

/// Pure name translation for one tenant path.
///
/// With a non-empty tenant path, a leading `/` in the client name is stored as
/// `_` and a leading `_` as `__`, so `to_original(to_qualified(d)) == d` for
/// every name outside the `$SYS` and global prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceResolver {
    tenant_path: String,
    globals: Vec<String>,
}

impl NamespaceResolver {
    pub fn new(tenant_path: impl Into<String>, globals: Vec<String>) -> Self {
        let mut tenant_path = tenant_path.into();
        if tenant_path == "/" {
            tenant_path.clear();
        }
        let globals = globals.into_iter().filter(|g| g.len() > 1).collect();
        Self {
            tenant_path,
            globals,
        }
    }

    pub fn tenant_path(&self) -> &str {
        &self.tenant_path
    }

    /// Names shared by every tenant; never remapped.
    pub fn is_global(&self, name: &str) -> bool {
        name.starts_with(SYSTEM_PREFIX) || self.globals.iter().any(|g| name.starts_with(g.as_str()))
    }

    pub fn to_qualified(&self, name: &str) -> String {
        if self.is_global(name) || self.tenant_path.is_empty() {
            return name.to_string();
        }
        let escaped = if let Some(rest) = name.strip_prefix('/') {
            format!("_{rest}")
        } else if let Some(rest) = name.strip_prefix('_') {
            format!("__{rest}")
        } else {
            name.to_string()
        };
        format!("{}{}", self.tenant_path, escaped)
    }

    /// Names under the tenant path are unescaped before the global check,
    /// so a tenant rooted below a global prefix still round-trips.
    pub fn to_original(&self, fqn: &str) -> String {
        if self.tenant_path.is_empty() {
            return fqn.to_string();
        }
        let Some(name) = fqn.strip_prefix(self.tenant_path.as_str()) else {
            return fqn.to_string();
        };
        if let Some(rest) = name.strip_prefix("__") {
            format!("_{rest}")
        } else if let Some(rest) = name.strip_prefix('_') {
            format!("/{rest}")
        } else {
            name.to_string()
        }
    }
}

/// Per-session resolver plus the names this session has mapped so far.
#[derive(Debug, Default)]
pub struct NamespaceMap {
    resolver: NamespaceResolver,
    originals: Mutex<HashMap<String, String>>,
}

impl NamespaceMap {
    pub fn new(resolver: NamespaceResolver) -> Self {
        Self {
            resolver,
            originals: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &NamespaceResolver {
        &self.resolver
    }

    pub fn map(&self, name: &str) -> String {
        let fqn = self.resolver.to_qualified(name);
        self.originals
            .lock()
            .entry(fqn.clone())
            .or_insert_with(|| name.to_string());
        fqn
    }

    pub fn original(&self, fqn: &str) -> String {
        if let Some(name) = self.originals.lock().get(fqn) {
            return name.clone();
        }
        self.resolver.to_original(fqn)
    }

    pub fn forget(&self, fqn: &str) {
        self.originals.lock().remove(fqn);
    }
}

/// Picks the tenant path for a login from the configured tenant entries.
#[derive(Debug, Clone, Default)]
pub struct TenantManagement {
    users: Vec<TenantEntry>,
    globals: Vec<String>,
}

impl TenantManagement {
    pub fn new(config: &TenantConfig) -> Self {
        let mut users = Vec::new();
        let mut globals = Vec::new();
        for entry in &config.entries {
            match entry.scope {
                TenantScope::User => users.push(entry.clone()),
                TenantScope::Global => globals.push(entry.namespace_root.clone()),
            }
        }
        Self { users, globals }
    }

    /// Build the resolver for `username` connecting over `protocol`.
    ///
    /// An exact username entry wins over `default`; without either the session
    /// lives in the root namespace.
    pub fn resolve(&self, username: Option<&str>, protocol: &str) -> NamespaceResolver {
        let username = username.unwrap_or(ANONYMOUS);
        let root = self
            .users
            .iter()
            .find(|entry| entry.name == username)
            .or_else(|| self.users.iter().find(|entry| entry.name == DEFAULT_TENANT))
            .map(|entry| entry.namespace_root.as_str())
            .unwrap_or("");
        let mut tenant_path = root
            .replace(USER_TOKEN, username)
            .replace(PROTOCOL_TOKEN, protocol)
            .replace('"', "");
        if tenant_path.len() > 1 && !tenant_path.ends_with('/') {
            tenant_path.push('/');
        }
        let resolver = NamespaceResolver::new(tenant_path, self.globals.clone());
        if !resolver.tenant_path().is_empty() && resolver.is_global(resolver.tenant_path()) {
            warn!(
                user = %username,
                tenant_path = %resolver.tenant_path(),
                "tenant path lies under a global root; client names under that root are shared"
            );
        }
        debug!(user = %username, tenant_path = %resolver.tenant_path(), "namespace mapping resolved");
        resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, root: &str, scope: TenantScope) -> TenantEntry {
        TenantEntry {
            name: name.to_string(),
            namespace_root: root.to_string(),
            scope,
        }
    }

    #[test]
    fn round_trip_outside_global_prefixes() {
        let resolver = NamespaceResolver::new("/tenants/acme/", vec!["/shared".to_string()]);
        for name in ["room/1", "/room/1", "_hidden", "__double", "/", "_", "", "a_b/c"] {
            let fqn = resolver.to_qualified(name);
            assert!(fqn.starts_with("/tenants/acme/"), "{fqn}");
            assert_eq!(resolver.to_original(&fqn), name);
        }
    }

    #[test]
    fn system_and_global_names_pass_through() {
        let resolver = NamespaceResolver::new("/tenants/acme/", vec!["/shared".to_string()]);
        for name in ["$SYS/broker/uptime", "/shared/alerts"] {
            assert_eq!(resolver.to_qualified(name), name);
            assert_eq!(resolver.to_original(name), name);
        }
    }

    #[test]
    fn tenant_below_global_root_still_round_trips() {
        let config = TenantConfig {
            entries: vec![
                entry("default", "shared/{user}", TenantScope::User),
                entry("shared", "shared/", TenantScope::Global),
            ],
        };
        let resolver = TenantManagement::new(&config).resolve(Some("acme"), "mqtt");
        assert_eq!(resolver.tenant_path(), "shared/acme/");
        for name in ["room/1", "_x", "/y"] {
            let fqn = resolver.to_qualified(name);
            assert_eq!(resolver.to_original(&fqn), name);
        }
        assert_eq!(resolver.to_qualified("shared/alerts"), "shared/alerts");
        assert_eq!(resolver.to_original("shared/alerts"), "shared/alerts");
    }

    #[test]
    fn root_tenant_is_identity() {
        let resolver = NamespaceResolver::new("/", Vec::new());
        assert_eq!(resolver.tenant_path(), "");
        assert_eq!(resolver.to_qualified("/room/1"), "/room/1");
        assert_eq!(resolver.to_original("_x"), "_x");
    }

    #[test]
    fn foreign_names_are_left_alone() {
        let resolver = NamespaceResolver::new("/tenants/acme/", Vec::new());
        assert_eq!(resolver.to_original("/tenants/other/x"), "/tenants/other/x");
    }

    #[test]
    fn tenant_lookup_prefers_user_then_default() {
        let config = TenantConfig {
            entries: vec![
                entry("default", "/tenants/{user}", TenantScope::User),
                entry("admin", "/", TenantScope::User),
                entry("metrics", "/global", TenantScope::Global),
            ],
        };
        let tenants = TenantManagement::new(&config);
        let alice = tenants.resolve(Some("alice"), "mqtt");
        assert_eq!(alice.tenant_path(), "/tenants/alice/");
        assert!(alice.is_global("/global/stats"));
        assert_eq!(tenants.resolve(Some("admin"), "mqtt").tenant_path(), "");
        assert_eq!(
            tenants.resolve(None, "stomp").tenant_path(),
            "/tenants/anonymous/"
        );
    }

    #[test]
    fn protocol_token_is_substituted() {
        let config = TenantConfig {
            entries: vec![entry("default", "/{protocol}/\"{user}\"", TenantScope::User)],
        };
        let resolver = TenantManagement::new(&config).resolve(Some("bob"), "amqp");
        assert_eq!(resolver.tenant_path(), "/amqp/bob/");
    }

    #[test]
    fn namespace_map_remembers_and_forgets() {
        let map = NamespaceMap::new(NamespaceResolver::new("/t/", Vec::new()));
        let fqn = map.map("/room");
        assert_eq!(fqn, "/t/_room");
        assert_eq!(map.original(&fqn), "/room");
        map.forget(&fqn);
        assert_eq!(map.original(&fqn), "/room");
    }
}
