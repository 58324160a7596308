// ABOUTME: One-time migration of display-name keyed member records to stable identity keys.
// ABOUTME: Resolves names through an injected resolver, merges into canonical entries, and reports leftovers.

use std::fmt;

use async_trait::async_trait;
use evobot_core::MemberTable;
use thiserror::Error;

use crate::backend::Store;
use crate::error::StoreError;

/// Maps a display name to the member's stable identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, display_name: &str) -> Option<String>;
}

/// Legacy entries that could not be resolved. The rest of the pass still
/// completed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved legacy entries: {}", .unresolved.join(", "))]
pub struct PartialMigration {
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// (legacy key, identity) pairs folded during this pass.
    pub migrated: Vec<(String, String)>,
    pub unresolved: Vec<String>,
}

impl MigrationReport {
    pub fn changed(&self) -> bool {
        !self.migrated.is_empty()
    }

    pub fn partial(&self) -> Option<PartialMigration> {
        if self.unresolved.is_empty() {
            None
        } else {
            Some(PartialMigration {
                unresolved: self.unresolved.clone(),
            })
        }
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} migrated, {} unresolved",
            self.migrated.len(),
            self.unresolved.len()
        )
    }
}

/// Folds every pending legacy entry of a member table into its canonical entry.
pub struct LegacyKeyMigrator<'a> {
    resolver: &'a dyn IdentityResolver,
}

impl<'a> LegacyKeyMigrator<'a> {
    pub fn new(resolver: &'a dyn IdentityResolver) -> Self {
        Self { resolver }
    }

    pub async fn run(&self, table: &mut MemberTable) -> MigrationReport {
        let mut report = MigrationReport::default();

        for legacy_key in table.pending_legacy() {
            // Numeric keys are already identities that were filed as legacy.
            let identity = if legacy_key.chars().all(|c| c.is_ascii_digit()) {
                Some(legacy_key.clone())
            } else {
                self.resolver.resolve(&legacy_key).await
            };

            match identity {
                Some(identity) if table.fold_legacy(&legacy_key, &identity) => {
                    tracing::debug!("migrated legacy entry '{}' to {}", legacy_key, identity);
                    report.migrated.push((legacy_key, identity));
                }
                _ => report.unresolved.push(legacy_key),
            }
        }

        report
    }
}

impl Store {
    /// Load the member table under `key`, migrate it, and persist it only if
    /// something changed. An absent or unreadable table migrates as empty
    /// and nothing is written.
    pub async fn migrate_legacy(&self, key: &str, resolver: &dyn IdentityResolver) -> Result<MigrationReport, StoreError> {
        let Some(mut table) = self.get_opt::<MemberTable>(key).await? else {
            tracing::debug!("no member table under '{}', nothing to migrate", key);
            return Ok(MigrationReport::default());
        };

        let report = LegacyKeyMigrator::new(resolver).run(&mut table).await;
        if report.changed() {
            self.put(key, &table).await?;
        }

        if let Some(partial) = report.partial() {
            tracing::warn!("migration of '{}' incomplete: {}", key, partial);
        }
        tracing::info!("migration of '{}': {}", key, report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStore, ChannelStoreOptions};
    use crate::testing::MemoryTransport;
    use evobot_core::{ChannelId, LegacyEntry};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct Directory(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl IdentityResolver for Directory {
        async fn resolve(&self, display_name: &str) -> Option<String> {
            self.0.get(display_name).map(|id| id.to_string())
        }
    }

    fn directory() -> Directory {
        Directory(HashMap::from([("PlayerOne", "42"), ("Healbot", "77")]))
    }

    fn legacy(fields: serde_json::Value) -> LegacyEntry {
        serde_json::from_value(fields).unwrap()
    }

    fn store() -> Store {
        let transport = Arc::new(MemoryTransport::new());
        Store::new(Arc::new(ChannelStore::new(
            transport,
            ChannelId(3),
            ChannelStoreOptions::default(),
        )))
    }

    fn seeded_table() -> MemberTable {
        let mut table = MemberTable::default();
        table.legacy.insert("PlayerOne".to_string(), legacy(json!({"level": 120})));
        table.legacy.insert("Ghost".to_string(), legacy(json!({"level": 3})));
        table.legacy.insert("1234".to_string(), legacy(json!({"job": "smith"})));
        table
    }

    #[tokio::test]
    async fn resolvable_entries_migrate_and_leftovers_are_reported() {
        let resolver = directory();
        let mut table = seeded_table();

        let report = LegacyKeyMigrator::new(&resolver).run(&mut table).await;

        assert_eq!(report.unresolved, vec!["Ghost".to_string()]);
        assert_eq!(report.migrated.len(), 2);
        assert_eq!(table.canonical["42"].fields["level"], json!(120));
        assert_eq!(table.canonical["42"].name.as_deref(), Some("PlayerOne"));
        assert_eq!(table.canonical["1234"].fields["job"], json!("smith"));
        assert!(table.legacy["PlayerOne"].is_migrated());
        assert!(!table.legacy["Ghost"].is_migrated());

        let partial = report.partial().unwrap();
        assert_eq!(partial.unresolved, vec!["Ghost".to_string()]);
        assert!(partial.to_string().contains("Ghost"));
    }

    #[tokio::test]
    async fn running_twice_equals_running_once() {
        let store = store();
        store.put("jobs", &seeded_table()).await.unwrap();

        let first = store.migrate_legacy("jobs", &directory()).await.unwrap();
        let once: MemberTable = store.get("jobs").await.unwrap();

        let second = store.migrate_legacy("jobs", &directory()).await.unwrap();
        let twice: MemberTable = store.get("jobs").await.unwrap();

        assert!(first.changed());
        assert!(!second.changed());
        assert_eq!(second.unresolved, vec!["Ghost".to_string()]);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn absent_table_writes_nothing() {
        let store = store();
        let report = store.migrate_legacy("jobs", &directory()).await.unwrap();
        assert_eq!(report, MigrationReport::default());
        assert!(store.get_value("jobs").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn existing_canonical_values_win() {
        let store = store();
        let mut table = MemberTable::default();
        table.legacy.insert(
            "Healbot".to_string(),
            legacy(json!({"level": 50, "class": "priest", "stats": {"hp": 10, "mp": 20}})),
        );
        let canonical = table
            .canonical
            .entry("77".to_string())
            .or_insert_with(|| evobot_core::CanonicalEntry::new("77"));
        canonical.fields.insert("level".to_string(), json!(60));
        canonical.fields.insert("class".to_string(), json!(""));
        canonical.fields.insert("stats".to_string(), json!({"hp": 15}));
        store.put("jobs", &table).await.unwrap();

        store.migrate_legacy("jobs", &directory()).await.unwrap();
        let migrated: MemberTable = store.get("jobs").await.unwrap();
        let entry = &migrated.canonical["77"];

        assert_eq!(entry.fields["level"], json!(60));
        assert_eq!(entry.fields["class"], json!("priest"));
        assert_eq!(entry.fields["stats"], json!({"hp": 15, "mp": 20}));
    }
}
