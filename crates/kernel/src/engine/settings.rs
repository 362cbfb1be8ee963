//! Platform settings cache.
//!
//! The organization restriction depends on the platform `Settings` document.
//! Reading it on every query would double backend load, so the parsed value is
//! kept in an in-process Moka cache with a short TTL.

use std::future::Future;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tracing::debug;

use crate::error::EngineResult;
use crate::models::Document;

/// Entity type of the platform settings document.
pub const SETTINGS_TYPE: &str = "Settings";

/// Platform-wide flags the access compiler depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformSettings {
    /// When set, the platform is restricted to this organization.
    pub platform_organization: Option<String>,
}

impl PlatformSettings {
    /// Read the flags from a stored settings document.
    pub fn from_document(doc: &Document) -> Self {
        let platform_organization = doc
            .attribute("platform_organization")
            .and_then(Value::as_str)
            .filter(|org| !org.is_empty())
            .map(str::to_string);
        Self {
            platform_organization,
        }
    }
}

/// TTL cache around the platform settings.
#[derive(Clone)]
pub struct SettingsCache {
    local: Cache<(), PlatformSettings>,
}

impl SettingsCache {
    pub fn new(ttl: Duration) -> Self {
        let local = Cache::builder().max_capacity(1).time_to_live(ttl).build();
        Self { local }
    }

    /// Cached settings, or the result of `load` on a miss.
    pub async fn get_or_load<F>(&self, load: F) -> EngineResult<PlatformSettings>
    where
        F: Future<Output = EngineResult<PlatformSettings>>,
    {
        if let Some(settings) = self.local.get(&()).await {
            return Ok(settings);
        }
        let settings = load.await?;
        debug!(
            restricted = settings.platform_organization.is_some(),
            "platform settings loaded"
        );
        self.local.insert((), settings.clone()).await;
        Ok(settings)
    }

    /// Drop the cached value so the next read reloads it.
    pub async fn invalidate(&self) {
        self.local.invalidate(&()).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_from_document() {
        let doc = Document::new("s", SETTINGS_TYPE, "kestrel_internal_objects")
            .with_attribute("platform_organization", json!("org-1"));
        assert_eq!(
            PlatformSettings::from_document(&doc).platform_organization,
            Some("org-1".into())
        );

        let doc = Document::new("s", SETTINGS_TYPE, "kestrel_internal_objects")
            .with_attribute("platform_organization", json!(""));
        assert_eq!(PlatformSettings::from_document(&doc), PlatformSettings::default());
    }

    #[tokio::test]
    async fn loads_once_until_invalidated() {
        let cache = SettingsCache::new(Duration::from_secs(60));
        let first = cache
            .get_or_load(async {
                Ok(PlatformSettings {
                    platform_organization: Some("org-1".into()),
                })
            })
            .await
            .unwrap();
        assert_eq!(first.platform_organization.as_deref(), Some("org-1"));

        let cached = cache
            .get_or_load(async { Ok(PlatformSettings::default()) })
            .await
            .unwrap();
        assert_eq!(cached, first, "second read served from cache");

        cache.invalidate().await;
        let reloaded = cache
            .get_or_load(async { Ok(PlatformSettings::default()) })
            .await
            .unwrap();
        assert_eq!(reloaded, PlatformSettings::default());
    }
}
