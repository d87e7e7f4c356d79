//! Reverse geocoding of photo coordinates into short place names.

use crate::config::ExtractionConfig;
use crate::error::ExternalServiceError;
use crate::metadata_store::Coordinates;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

const SERVICE: &str = "geocoder";

/// Administrative parts of a reverse geocoding result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Place {
    /// Town, village or hamlet
    pub locality: Option<String>,
    pub city: Option<String>,
    /// State, province or prefecture
    pub region: Option<String>,
    pub country: Option<String>,
    /// ISO 3166-1 alpha-2, any case
    pub country_code: Option<String>,
}

impl Place {
    /// `locality-or-city, region[, country]`, with the country left out when
    /// it is the home country. `None` when nothing usable is present.
    pub fn display_name(&self, home_country_code: &str) -> Option<String> {
        let domestic = self
            .country_code
            .as_deref()
            .map(|code| code.eq_ignore_ascii_case(home_country_code))
            .unwrap_or(false);

        let candidates = [
            self.locality.as_deref().or(self.city.as_deref()),
            self.region.as_deref(),
            if domestic { None } else { self.country.as_deref() },
        ];

        let mut parts: Vec<&str> = Vec::with_capacity(3);
        for part in candidates.into_iter().flatten().map(str::trim) {
            if !part.is_empty() && parts.last() != Some(&part) {
                parts.push(part);
            }
        }

        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

/// Place name shown when coordinates cannot be named
pub fn coordinate_label(coordinates: Coordinates) -> String {
    format!("{:.4}, {:.4}", coordinates.latitude, coordinates.longitude)
}

/// Turns coordinates into administrative place parts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    /// `Ok(None)` when the service knows nothing about the coordinates
    async fn reverse(&self, coordinates: Coordinates) -> Result<Option<Place>, ExternalServiceError>;
}

/// Reverse geocoder speaking the Nominatim `/reverse` protocol
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    state: Option<String>,
    province: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

impl From<NominatimAddress> for Place {
    fn from(address: NominatimAddress) -> Self {
        Self {
            locality: address.town.or(address.village).or(address.hamlet),
            city: address.city,
            region: address.state.or(address.province),
            country: address.country,
            country_code: address.country_code,
        }
    }
}

impl NominatimGeocoder {
    pub fn new(config: &ExtractionConfig) -> Result<Self, ExternalServiceError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.geocode_timeout())
            .connect_timeout(Duration::from_secs(config.geocode_timeout_secs.min(5)))
            .build()
            .map_err(|e| ExternalServiceError::Network {
                service: SERVICE,
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: config.geocoder_url.clone(),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    #[instrument(skip(self), fields(lat = coordinates.latitude, lon = coordinates.longitude))]
    async fn reverse(&self, coordinates: Coordinates) -> Result<Option<Place>, ExternalServiceError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", coordinates.latitude.to_string()),
                ("lon", coordinates.longitude.to_string()),
                ("zoom", "10".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| ExternalServiceError::Network {
                service: SERVICE,
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalServiceError::Status {
                service: SERVICE,
                status,
                body,
            });
        }

        let parsed: NominatimResponse =
            response
                .json()
                .await
                .map_err(|e| ExternalServiceError::Parse {
                    service: SERVICE,
                    message: e.to_string(),
                })?;

        debug!(found = parsed.address.is_some(), "Reverse geocode answered");
        Ok(parsed.address.map(Place::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paris() -> Place {
        Place {
            locality: None,
            city: Some("Paris".into()),
            region: Some("Île-de-France".into()),
            country: Some("France".into()),
            country_code: Some("fr".into()),
        }
    }

    #[test]
    fn test_display_name_foreign_country() {
        assert_eq!(
            paris().display_name("us").as_deref(),
            Some("Paris, Île-de-France, France")
        );
    }

    #[test]
    fn test_display_name_domestic_country_dropped() {
        assert_eq!(
            paris().display_name("FR").as_deref(),
            Some("Paris, Île-de-France")
        );
    }

    #[test]
    fn test_display_name_prefers_locality_and_skips_repeats() {
        let place = Place {
            locality: Some("Singapore".into()),
            city: Some("Ignored".into()),
            region: Some("Singapore".into()),
            country: Some("Singapore".into()),
            country_code: Some("sg".into()),
        };
        assert_eq!(place.display_name("us").as_deref(), Some("Singapore"));
    }

    #[test]
    fn test_display_name_empty_place() {
        assert_eq!(Place::default().display_name("us"), None);

        let blank = Place {
            region: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.display_name("us"), None);
    }

    #[test]
    fn test_coordinate_label() {
        let coordinates = Coordinates::new(48.8566, 2.3522).unwrap();
        assert_eq!(coordinate_label(coordinates), "48.8566, 2.3522");

        let south_west = Coordinates::new(-33.868_82, -70.123_456).unwrap();
        assert_eq!(coordinate_label(south_west), "-33.8688, -70.1235");
    }

    #[test]
    fn test_nominatim_address_mapping() {
        let json = r#"{
            "place_id": 1,
            "address": {
                "village": "Hallstatt",
                "state": "Upper Austria",
                "country": "Austria",
                "country_code": "at"
            }
        }"#;

        let parsed: NominatimResponse = serde_json::from_str(json).unwrap();
        let place = Place::from(parsed.address.unwrap());
        assert_eq!(
            place.display_name("us").as_deref(),
            Some("Hallstatt, Upper Austria, Austria")
        );

        let empty: NominatimResponse =
            serde_json::from_str(r#"{"error": "Unable to geocode"}"#).unwrap();
        assert!(empty.address.is_none());
    }
}
