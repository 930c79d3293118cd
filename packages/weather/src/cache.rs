//! Per-zone rainfall cache.
//!
//! One entry per zone lives in the [`SpatialStore`]. A fresh entry is
//! served without contacting the provider; an expired or missing one
//! triggers a bounded provider call whose result overwrites the entry.
//! Provider failures degrade to `0.0` and leave the stored entry as it
//! was.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flood_map_config::RainfallConfig;
use flood_map_database::SpatialStore;
use flood_map_flood_models::clock::Clock;
use flood_map_flood_models::{GeoPoint, RainfallCacheEntry, RainfallReading};

use crate::{RainfallProvider, WeatherError};

/// TTL cache in front of a [`RainfallProvider`].
///
/// Refreshes are serialized per zone: two callers asking for the same
/// zone at once produce a single provider call, while different zones
/// refresh independently.
pub struct RainfallCache {
    store: Arc<dyn SpatialStore>,
    provider: Arc<dyn RainfallProvider>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    timeout: Duration,
    zone_locks: Mutex<BTreeMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RainfallCache {
    /// Creates a cache using the TTL and provider timeout from `config`.
    #[must_use]
    pub fn new(
        store: Arc<dyn SpatialStore>,
        provider: Arc<dyn RainfallProvider>,
        clock: Arc<dyn Clock>,
        config: &RainfallConfig,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            ttl: chrono::Duration::from_std(config.cache_ttl()).unwrap_or(chrono::Duration::MAX),
            timeout: config.provider_timeout(),
            zone_locks: Mutex::new(BTreeMap::new()),
        }
    }

    fn zone_lock(&self, zone_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.zone_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(zone_id).or_default())
    }

    /// Hourly-equivalent rainfall (`rain_1h + rain_3h / 3`, mm) for a zone.
    ///
    /// Serves the cached reading while `now - fetched_at < ttl`. Otherwise
    /// asks the provider for `centroid` and upserts the zone's entry. If
    /// the provider fails or times out the failure is logged, the stored
    /// entry is left untouched, and `0.0` is returned.
    pub async fn get_rainfall(&self, zone_id: i64, centroid: GeoPoint) -> f64 {
        let lock = self.zone_lock(zone_id);
        let _guard = lock.lock().await;

        match self.store.get_rainfall_cache(zone_id).await {
            Ok(Some(entry)) if entry.is_fresh(self.clock.now(), self.ttl) => {
                log::debug!("Rainfall cache hit for zone {zone_id}");
                return entry.reading.hourly_rate();
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("Rainfall cache read failed for zone {zone_id}: {e}");
            }
        }

        let reading = match self.fetch_bounded(centroid).await {
            Ok(reading) => reading,
            Err(e) => {
                log::warn!("Rainfall provider failed for zone {zone_id}: {e}");
                return 0.0;
            }
        };

        let entry = RainfallCacheEntry {
            zone_id,
            reading,
            fetched_at: self.clock.now(),
        };
        if let Err(e) = self.store.upsert_rainfall_cache(entry).await {
            log::warn!("Failed to cache rainfall for zone {zone_id}: {e}");
        }

        reading.hourly_rate()
    }

    async fn fetch_bounded(&self, centroid: GeoPoint) -> Result<RainfallReading, WeatherError> {
        tokio::time::timeout(self.timeout, self.provider.fetch(centroid))
            .await
            .map_err(|_| WeatherError::Timeout {
                millis: self.timeout.as_millis(),
            })?
    }
}
