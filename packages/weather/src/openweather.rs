//! `OpenWeather` current-weather client.
//!
//! Queries the `/data/2.5/weather` endpoint and reads the optional
//! `rain.1h` and `rain.3h` accumulations (millimetres).
//!
//! See <https://openweathermap.org/current#rain>

use async_trait::async_trait;
use flood_map_config::RainfallConfig;
use flood_map_flood_models::{GeoPoint, RainfallReading};

use crate::{RainfallProvider, WeatherError};

/// HTTP client for the `OpenWeather` current-weather API.
pub struct OpenWeatherProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherProvider {
    /// Builds a client using the configured endpoint, key and timeout.
    ///
    /// # Errors
    ///
    /// Returns [`WeatherError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &RainfallConfig) -> Result<Self, WeatherError> {
        let client = reqwest::Client::builder()
            .timeout(config.provider_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl RainfallProvider for OpenWeatherProvider {
    async fn fetch(&self, location: GeoPoint) -> Result<RainfallReading, WeatherError> {
        if self.api_key.is_empty() {
            return Err(WeatherError::MissingApiKey);
        }

        let resp = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", location.latitude.to_string()),
                ("lon", location.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(WeatherError::Status {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = resp.json().await?;
        parse_response(&body)
    }
}

/// Parses a current-weather response body.
///
/// The `rain` object and either of its keys may be absent, which means
/// no rain was measured.
fn parse_response(body: &serde_json::Value) -> Result<RainfallReading, WeatherError> {
    if !body.is_object() {
        return Err(WeatherError::Parse {
            message: "OpenWeather response is not an object".to_string(),
        });
    }

    let rain = &body["rain"];
    if !(rain.is_null() || rain.is_object()) {
        return Err(WeatherError::Parse {
            message: "OpenWeather `rain` field is not an object".to_string(),
        });
    }

    Ok(RainfallReading {
        rain_1h_mm: accumulation(rain, "1h")?,
        rain_3h_mm: accumulation(rain, "3h")?,
    })
}

fn accumulation(rain: &serde_json::Value, key: &str) -> Result<f64, WeatherError> {
    let value = &rain[key];
    if value.is_null() {
        return Ok(0.0);
    }

    value
        .as_f64()
        .filter(|mm| mm.is_finite() && *mm >= 0.0)
        .ok_or_else(|| WeatherError::Parse {
            message: format!("Invalid rain.{key} in OpenWeather response: {value}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_accumulations() {
        let body = serde_json::json!({
            "weather": [{"main": "Rain"}],
            "rain": {"1h": 3.2, "3h": 7.5}
        });
        let reading = parse_response(&body).unwrap();
        assert!((reading.rain_1h_mm - 3.2).abs() < 1e-12);
        assert!((reading.rain_3h_mm - 7.5).abs() < 1e-12);
    }

    #[test]
    fn missing_rain_means_dry() {
        let body = serde_json::json!({"weather": [{"main": "Clear"}]});
        let reading = parse_response(&body).unwrap();
        assert!(reading.rain_1h_mm.abs() < f64::EPSILON);
        assert!(reading.rain_3h_mm.abs() < f64::EPSILON);
    }

    #[test]
    fn partial_rain_defaults_other_key() {
        let body = serde_json::json!({"rain": {"3h": 6}});
        let reading = parse_response(&body).unwrap();
        assert!(reading.rain_1h_mm.abs() < f64::EPSILON);
        assert!((reading.hourly_rate() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(parse_response(&serde_json::json!([])).is_err());
        assert!(parse_response(&serde_json::json!({"rain": 4})).is_err());
        assert!(parse_response(&serde_json::json!({"rain": {"1h": "lots"}})).is_err());
        assert!(parse_response(&serde_json::json!({"rain": {"1h": -1.0}})).is_err());
    }

    #[tokio::test]
    async fn empty_api_key_never_calls_out() {
        let provider = OpenWeatherProvider::new(&RainfallConfig {
            cache_ttl_secs: 1800,
            provider_timeout_secs: 1,
            base_url: "http://127.0.0.1:9/unreachable".to_string(),
            api_key: String::new(),
        })
        .unwrap();

        let err = provider.fetch(GeoPoint::new(28.6, 77.2)).await.unwrap_err();
        assert!(matches!(err, WeatherError::MissingApiKey));
    }
}
