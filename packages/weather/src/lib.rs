#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Live rainfall for flood risk scoring.
//!
//! [`RainfallProvider`] is the seam to an external weather service, with
//! [`openweather::OpenWeatherProvider`] as the production client.
//! [`cache::RainfallCache`] sits in front of a provider and keeps one
//! reading per zone for a configurable TTL, so a recomputation cycle
//! only hits the network for zones whose reading has expired.

pub mod cache;
pub mod openweather;

use async_trait::async_trait;
use flood_map_flood_models::{GeoPoint, RainfallReading};
use thiserror::Error;

pub use cache::RainfallCache;
pub use openweather::OpenWeatherProvider;

/// Errors from a rainfall provider call.
#[derive(Debug, Error)]
pub enum WeatherError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("Provider returned HTTP {status}")]
    Status {
        /// The HTTP status code.
        status: u16,
    },

    /// The response body did not have the expected shape.
    #[error("Parse error: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// The provider did not answer within the configured bound.
    #[error("Provider call timed out after {millis} ms")]
    Timeout {
        /// The bound that was exceeded.
        millis: u128,
    },

    /// No API key is configured, so live fetches are disabled.
    #[error("No rainfall provider API key configured")]
    MissingApiKey,
}

/// A source of current rainfall at a location.
#[async_trait]
pub trait RainfallProvider: Send + Sync {
    /// Fetches the latest 1-hour and 3-hour accumulations at `location`.
    ///
    /// Missing accumulations (no rain reported) are returned as `0.0`.
    async fn fetch(&self, location: GeoPoint) -> Result<RainfallReading, WeatherError>;
}
