//! Store connection configuration

/// Connection settings for [`crate::SurrealStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Engine endpoint: `mem://`, `surrealkv://<path>`, `ws://host:port`, `wss://...`
    pub endpoint: String,
    /// Namespace (default: "diskuze")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Credentials; sign-in happens only when both are present
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether the credentials belong to a root user (true) or database user (false)
    pub is_root: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("mem://")
    }
}

impl StoreConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "diskuze".to_string(),
            database: "main".to_string(),
            username: None,
            password: None,
            is_root: false,
        }
    }

    /// Set custom namespace
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    /// Set custom database
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Set credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set whether this is a root user
    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - DISKUZE_DB_URL (optional, default: "mem://")
    /// - DISKUZE_DB_NAMESPACE (optional, default: "diskuze")
    /// - DISKUZE_DB_DATABASE (optional, default: "main")
    /// - DISKUZE_DB_USERNAME / DISKUZE_DB_PASSWORD (optional)
    /// - DISKUZE_DB_ROOT (optional, default: "false")
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new(lookup("DISKUZE_DB_URL").unwrap_or_else(|| "mem://".to_string()));
        if let Some(ns) = lookup("DISKUZE_DB_NAMESPACE") {
            config.namespace = ns;
        }
        if let Some(db) = lookup("DISKUZE_DB_DATABASE") {
            config.database = db;
        }
        config.username = lookup("DISKUZE_DB_USERNAME").filter(|v| !v.is_empty());
        config.password = lookup("DISKUZE_DB_PASSWORD").filter(|v| !v.is_empty());
        config.is_root = lookup("DISKUZE_DB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_to_in_memory() {
        let config = StoreConfig::from_lookup(|_| None);
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.endpoint, "mem://");
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_reads_overrides() {
        let env: HashMap<&str, &str> = [
            ("DISKUZE_DB_URL", "ws://db:8000"),
            ("DISKUZE_DB_NAMESPACE", "prod"),
            ("DISKUZE_DB_USERNAME", "svc"),
            ("DISKUZE_DB_PASSWORD", "secret"),
            ("DISKUZE_DB_ROOT", "TRUE"),
        ]
        .into_iter()
        .collect();

        let config = StoreConfig::from_lookup(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.endpoint, "ws://db:8000");
        assert_eq!(config.namespace, "prod");
        assert_eq!(config.database, "main");
        assert_eq!(config.credentials(), Some(("svc", "secret")));
        assert!(config.is_root);
    }
}
