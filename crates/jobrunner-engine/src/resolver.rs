use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{EngineError, Result};

/// Maps a job's site to the hostname its action should target.
///
/// `Ok(None)` means the site has no hostname; `Err` means the lookup
/// itself failed. The claimers treat both as "release and skip".
#[async_trait]
pub trait HostnameResolver: Send + Sync {
    async fn resolve_hostname(&self, site_id: &str) -> Result<Option<String>>;
}

/// Resolver backed by the `domains` table.
pub struct SqliteHostnameResolver {
    conn: Mutex<Connection>,
}

impl SqliteHostnameResolver {
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl HostnameResolver for SqliteHostnameResolver {
    async fn resolve_hostname(&self, site_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| EngineError::Resolver {
            site_id: site_id.to_string(),
            reason: "sqlite connection lock poisoned".to_string(),
        })?;
        let hostname = conn
            .query_row(
                "SELECT hostname FROM domains WHERE site_id = ?1",
                [site_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hostname.filter(|h| !h.trim().is_empty()))
    }
}

/// Fixed site → hostname table. Useful when sites are known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, site_id: &str, hostname: &str) -> Self {
        self.hosts.insert(site_id.to_string(), hostname.to_string());
        self
    }
}

#[async_trait]
impl HostnameResolver for StaticResolver {
    async fn resolve_hostname(&self, site_id: &str) -> Result<Option<String>> {
        Ok(self.hosts.get(site_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_resolver_reads_domains() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO domains (site_id, hostname) VALUES ('s1', 'one.example.com')",
            [],
        )
        .unwrap();
        let resolver = SqliteHostnameResolver::new(conn).unwrap();
        assert_eq!(
            resolver.resolve_hostname("s1").await.unwrap().as_deref(),
            Some("one.example.com")
        );
        assert!(resolver.resolve_hostname("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn static_resolver_lookup() {
        let resolver = StaticResolver::new().with("s1", "one.example.com");
        assert!(resolver.resolve_hostname("s1").await.unwrap().is_some());
        assert!(resolver.resolve_hostname("s2").await.unwrap().is_none());
    }
}
