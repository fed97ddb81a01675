//! Private environment-override table for launched programs
//!
//! The host can ask that "future launches see this modified environment".
//! The agent's own process environment cannot always be mutated after start,
//! so those writes land in a private name=value table instead. The table is
//! seeded once at startup from an optional externally supplied list; when it
//! exists it takes precedence over the ambient environment for subsequent
//! launches.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct EnvironmentTable {
    table: RwLock<Option<HashMap<String, String>>>,
}

impl EnvironmentTable {
    /// Absent seed means "use the ambient environment only"
    pub fn new(seed: Option<Vec<(String, String)>>) -> Self {
        Self {
            table: RwLock::new(seed.map(|pairs| pairs.into_iter().collect())),
        }
    }

    /// Replace the table wholesale. Only used for explicit re-initialization.
    pub async fn reseed(&self, seed: Option<Vec<(String, String)>>) {
        *self.table.write().await = seed.map(|pairs| pairs.into_iter().collect());
    }

    /// Store an override for future launches, creating the table on first
    /// write
    pub async fn set(&self, name: &str, value: &str) {
        let mut table = self.table.write().await;
        table
            .get_or_insert_with(HashMap::new)
            .insert(name.to_string(), value.to_string());
        debug!(name, "environment override recorded");
    }

    pub async fn remove(&self, name: &str) {
        if let Some(table) = self.table.write().await.as_mut() {
            table.remove(name);
        }
    }

    /// Look a variable up the way a launched program would see it:
    /// override table first, ambient environment second
    pub async fn get(&self, name: &str) -> Option<String> {
        if let Some(table) = self.table.read().await.as_ref() {
            if let Some(v) = table.get(name) {
                return Some(v.clone());
            }
        }
        std::env::var(name).ok()
    }

    /// The full environment a launched program would observe
    pub async fn snapshot(&self) -> HashMap<String, String> {
        let mut out: HashMap<String, String> = std::env::vars().collect();
        if let Some(table) = self.table.read().await.as_ref() {
            for (k, v) in table {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }

    /// Apply the override table to a command about to be spawned
    pub async fn apply(&self, cmd: &mut tokio::process::Command) {
        if let Some(table) = self.table.read().await.as_ref() {
            for (k, v) in table {
                cmd.env(k, v);
            }
        }
    }
}
