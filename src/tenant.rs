use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::background;
use crate::clock::{Clock, SystemClock};
use crate::engine::{AvailabilityMode, Engine};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Per-engine settings shared by every tenant of one server.
#[derive(Clone)]
pub struct TenantSettings {
    pub mode: AvailabilityMode,
    pub compact_threshold: u64,
    pub clock: Arc<dyn Clock>,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            mode: AvailabilityMode::Rules,
            compact_threshold: 1000,
            clock: Arc::new(SystemClock::utc()),
        }
    }
}

/// Manages per-tenant engines. Each tenant (one schedule owner) gets its own
/// Engine, WAL file, compactor and notice log.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // No path traversal through the database name
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections racing on a fresh tenant must share one engine.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.settings.mode,
            self.settings.clock.clone(),
        )?);

        tokio::spawn(background::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));
        tokio::spawn(background::run_notice_log(engine.clone(), safe_name));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, Weekday};
    use std::fs;
    use ulid::Ulid;

    fn manager(dir: &std::path::Path) -> TenantManager {
        let now = NaiveDate::from_ymd_opt(2024, 6, 9).unwrap().and_hms_opt(8, 0, 0).unwrap();
        TenantManager::new(
            dir.to_path_buf(),
            TenantSettings {
                clock: Arc::new(crate::clock::ManualClock::new(now)),
                ..TenantSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(dir.path());
        let admin = Actor::admin("coach");

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let rule = AvailabilityRule {
            id: Ulid::new(),
            recurrence: Recurrence::Weekly(vec![Weekday::Mon]),
            span: Span::hm((9, 0), (11, 0)),
            slot_minutes: 60,
            active: true,
        };
        eng_a.put_rule(&admin, rule).await.unwrap();

        let monday = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let avail_a = eng_a.availability(&admin, monday, monday).await.unwrap();
        assert_eq!(avail_a.len(), 2);
        let avail_b = eng_b.availability(&admin, monday, monday).await.unwrap();
        assert!(avail_b.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(dir.path());

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_gym").unwrap();
        assert!(dir.path().join("my_gym.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(dir.path());

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(dir.path());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.path().join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(dir.path());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_inherits_mode() {
        let dir = tempfile::tempdir().unwrap();
        let tm = TenantManager::new(
            dir.path().to_path_buf(),
            TenantSettings { mode: AvailabilityMode::Slots, ..TenantSettings::default() },
        );
        let eng = tm.get_or_create("curated").unwrap();
        assert_eq!(eng.mode(), AvailabilityMode::Slots);
    }
}
