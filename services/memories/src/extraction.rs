//! Best-effort derivation of date and place from uploaded photos.
//!
//! Nothing in here fails: unreadable EXIF, a slow parser or an unavailable
//! geocoder all degrade to missing fields.

use crate::config::ExtractionConfig;
use crate::geocoder::{coordinate_label, ReverseGeocoder};
use crate::metadata_store::{Coordinates, EventInput};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use exif::{Exif, In, Tag, Value};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A file received from a caller
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: String,
    pub bytes: Bytes,
    /// Last-modified time reported by the client
    pub last_modified: Option<DateTime<Utc>>,
}

/// What a single file revealed about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileMetadata {
    pub date: Option<NaiveDate>,
    pub coordinates: Option<Coordinates>,
}

/// A named place and the coordinates it was derived from. Always taken from
/// the same file.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedPlace {
    pub name: String,
    pub coordinates: Coordinates,
}

/// Values proposed to pre-fill an event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub date: Option<NaiveDate>,
    pub place: Option<ProposedPlace>,
}

/// Which event fields the user has set by hand
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ManualFields {
    pub date: bool,
    pub location: bool,
}

impl ManualFields {
    /// Treat every non-blank field of `input` as set by hand
    pub fn from_input(input: &EventInput) -> Self {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        Self {
            date: filled(&input.date),
            location: filled(&input.location),
        }
    }
}

impl Proposal {
    /// Copy proposed values into `input`, leaving hand-set fields alone.
    /// Location and coordinates are written together.
    pub fn fill(&self, input: &mut EventInput, manual: ManualFields) {
        if !manual.date {
            if let Some(date) = self.date {
                input.date = Some(date.format("%Y-%m-%d").to_string());
            }
        }

        if !manual.location {
            if let Some(ref place) = self.place {
                input.location = Some(place.name.clone());
                input.latitude = Some(place.coordinates.latitude);
                input.longitude = Some(place.coordinates.longitude);
            }
        }
    }
}

/// One step of the capture date fallback chain
#[derive(Debug, Clone, Copy)]
enum DateSource {
    Exif(Tag),
    FileModified,
}

/// Capture date sources, most trusted first
const DATE_SOURCES: [DateSource; 5] = [
    DateSource::Exif(Tag::DateTimeOriginal),
    DateSource::Exif(Tag::DateTimeDigitized),
    DateSource::Exif(Tag::DateTime),
    DateSource::Exif(Tag::GPSDateStamp),
    DateSource::FileModified,
];

/// Derives event date and place from batches of photos
pub struct ExtractionPipeline {
    geocoder: Arc<dyn ReverseGeocoder>,
    home_country_code: String,
    geocode_timeout: Duration,
    exif_timeout: Duration,
}

impl ExtractionPipeline {
    pub fn new(geocoder: Arc<dyn ReverseGeocoder>, config: &ExtractionConfig) -> Self {
        Self {
            geocoder,
            home_country_code: config.home_country_code.clone(),
            geocode_timeout: config.geocode_timeout(),
            exif_timeout: config.exif_timeout(),
        }
    }

    pub fn with_timeouts(mut self, geocode: Duration, exif: Duration) -> Self {
        self.geocode_timeout = geocode;
        self.exif_timeout = exif;
        self
    }

    /// Date and coordinates of a single file
    pub async fn read_file(&self, file: &UploadedFile) -> FileMetadata {
        let bytes = file.bytes.clone();
        let last_modified = file.last_modified;
        let parse = tokio::task::spawn_blocking(move || read_metadata(&bytes, last_modified));

        match tokio::time::timeout(self.exif_timeout, parse).await {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) => {
                warn!(error = %e, file = ?file.file_name, "EXIF parsing task failed");
                FileMetadata {
                    date: last_modified.map(|t| t.date_naive()),
                    coordinates: None,
                }
            }
            Err(_) => {
                warn!(file = ?file.file_name, "EXIF parsing timed out");
                FileMetadata {
                    date: last_modified.map(|t| t.date_naive()),
                    coordinates: None,
                }
            }
        }
    }

    /// Human readable name for coordinates; falls back to the coordinates
    /// themselves when the geocoder fails, times out or knows nothing.
    #[instrument(skip(self), fields(lat = coordinates.latitude, lon = coordinates.longitude))]
    pub async fn place_name(&self, coordinates: Coordinates) -> String {
        let named = match tokio::time::timeout(
            self.geocode_timeout,
            self.geocoder.reverse(coordinates),
        )
        .await
        {
            Ok(Ok(place)) => place.and_then(|p| p.display_name(&self.home_country_code)),
            Ok(Err(e)) => {
                warn!(error = %e, "Reverse geocoding failed");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.geocode_timeout.as_millis() as u64,
                    "Reverse geocoding timed out"
                );
                None
            }
        };

        named.unwrap_or_else(|| {
            metrics::counter!("memories.extraction.geocode_fallback").increment(1);
            coordinate_label(coordinates)
        })
    }

    /// Merge a batch into one proposal. The first file wins each field; later
    /// files only fill what earlier ones lacked. Only the winning coordinates
    /// are geocoded.
    #[instrument(skip(self, files), fields(file_count = files.len()))]
    pub async fn propose(&self, files: &[UploadedFile]) -> Proposal {
        let mut date = None;
        let mut coordinates = None;

        for file in files {
            if date.is_some() && coordinates.is_some() {
                break;
            }

            let metadata = self.read_file(file).await;
            date = date.or(metadata.date);
            coordinates = coordinates.or(metadata.coordinates);
        }

        let place = match coordinates {
            Some(coordinates) => Some(ProposedPlace {
                name: self.place_name(coordinates).await,
                coordinates,
            }),
            None => None,
        };

        debug!(date = ?date, place = ?place, "Extraction proposal ready");
        Proposal { date, place }
    }
}

fn read_metadata(bytes: &[u8], last_modified: Option<DateTime<Utc>>) -> FileMetadata {
    let exif = match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
        Ok(exif) => Some(exif),
        Err(e) => {
            debug!(error = %e, "No readable EXIF block");
            None
        }
    };

    FileMetadata {
        date: capture_date(exif.as_ref(), last_modified),
        coordinates: exif.as_ref().and_then(gps_coordinates),
    }
}

fn capture_date(exif: Option<&Exif>, last_modified: Option<DateTime<Utc>>) -> Option<NaiveDate> {
    DATE_SOURCES.iter().find_map(|source| match *source {
        DateSource::Exif(tag) => exif.and_then(|exif| exif_date(exif, tag)),
        DateSource::FileModified => last_modified.map(|t| t.date_naive()),
    })
}

fn exif_date(exif: &Exif, tag: Tag) -> Option<NaiveDate> {
    match exif.get_field(tag, In::PRIMARY)?.value {
        Value::Ascii(ref values) => values.first().and_then(|raw| parse_exif_date(raw)),
        _ => None,
    }
}

/// Calendar date from `YYYY:MM:DD[ HH:MM:SS]` (dashes accepted too)
fn parse_exif_date(raw: &[u8]) -> Option<NaiveDate> {
    let text = std::str::from_utf8(raw).ok()?;
    let head = text.trim_matches(|c: char| c.is_whitespace() || c == '\0').get(..10)?;

    NaiveDate::parse_from_str(head, "%Y:%m:%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y-%m-%d"))
        .ok()
}

fn gps_coordinates(exif: &Exif) -> Option<Coordinates> {
    let latitude = gps_degrees(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, b'S')?;
    let longitude = gps_degrees(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, b'W')?;
    Coordinates::new(latitude, longitude)
}

/// Degrees/minutes/seconds rationals to signed decimal degrees
fn gps_degrees(exif: &Exif, value_tag: Tag, ref_tag: Tag, negative_ref: u8) -> Option<f64> {
    let parts = match exif.get_field(value_tag, In::PRIMARY)?.value {
        Value::Rational(ref parts) if !parts.is_empty() => parts,
        _ => return None,
    };

    let mut degrees = 0.0;
    for (part, divisor) in parts.iter().zip([1.0, 60.0, 3600.0]) {
        let value = part.to_f64();
        if !value.is_finite() {
            return None;
        }
        degrees += value / divisor;
    }

    let negative = exif
        .get_field(ref_tag, In::PRIMARY)
        .and_then(|field| match field.value {
            Value::Ascii(ref values) => values.first().and_then(|v| v.first().copied()),
            _ => None,
        })
        .is_some_and(|c| c.eq_ignore_ascii_case(&negative_ref));

    Some(if negative { -degrees } else { degrees })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use exif::experimental::Writer;
    use exif::{Field, Rational};

    pub fn ascii(tag: Tag, text: &str) -> Field {
        Field {
            tag,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![text.as_bytes().to_vec()]),
        }
    }

    fn dms(degrees: u32, minutes: u32, hundredth_seconds: u32) -> Value {
        Value::Rational(vec![
            Rational { num: degrees, denom: 1 },
            Rational { num: minutes, denom: 1 },
            Rational { num: hundredth_seconds, denom: 100 },
        ])
    }

    /// GPS fields for 48.8566 N, 2.3522 E (Paris)
    pub fn paris_gps() -> Vec<Field> {
        vec![
            ascii(Tag::GPSLatitudeRef, "N"),
            Field {
                tag: Tag::GPSLatitude,
                ifd_num: In::PRIMARY,
                value: dms(48, 51, 2376),
            },
            ascii(Tag::GPSLongitudeRef, "E"),
            Field {
                tag: Tag::GPSLongitude,
                ifd_num: In::PRIMARY,
                value: dms(2, 21, 792),
            },
        ]
    }

    /// GPS fields for 33.8688 S, 151.2093 E (Sydney)
    pub fn sydney_gps() -> Vec<Field> {
        vec![
            ascii(Tag::GPSLatitudeRef, "S"),
            Field {
                tag: Tag::GPSLatitude,
                ifd_num: In::PRIMARY,
                value: dms(33, 52, 768),
            },
            ascii(Tag::GPSLongitudeRef, "E"),
            Field {
                tag: Tag::GPSLongitude,
                ifd_num: In::PRIMARY,
                value: dms(151, 12, 3348),
            },
        ]
    }

    /// A TIFF container carrying only the given EXIF fields
    pub fn tiff_with(fields: &[Field]) -> Bytes {
        let mut writer = Writer::new();
        for field in fields {
            writer.push_field(field);
        }
        let mut buffer = Cursor::new(Vec::new());
        writer.write(&mut buffer, false).unwrap();
        Bytes::from(buffer.into_inner())
    }

    pub fn upload(bytes: Bytes, last_modified: Option<DateTime<Utc>>) -> UploadedFile {
        UploadedFile {
            file_name: Some("IMG_0001.tif".into()),
            content_type: "image/tiff".into(),
            bytes,
            last_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::error::ExternalServiceError;
    use crate::geocoder::{MockReverseGeocoder, Place};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn pipeline(geocoder: impl ReverseGeocoder + 'static) -> ExtractionPipeline {
        ExtractionPipeline::new(Arc::new(geocoder), &ExtractionConfig::default())
    }

    fn failing_geocoder() -> MockReverseGeocoder {
        let mut geocoder = MockReverseGeocoder::new();
        geocoder.expect_reverse().returning(|_| {
            Err(ExternalServiceError::Status {
                service: "geocoder",
                status: 503,
                body: "busy".into(),
            })
        });
        geocoder
    }

    fn assert_close(coordinates: Coordinates, latitude: f64, longitude: f64) {
        assert!((coordinates.latitude - latitude).abs() < 1e-4, "{coordinates:?}");
        assert!((coordinates.longitude - longitude).abs() < 1e-4, "{coordinates:?}");
    }

    #[test]
    fn test_parse_exif_date_formats() {
        assert_eq!(parse_exif_date(b"2023:07:14 10:00:00"), Some(date("2023-07-14")));
        assert_eq!(parse_exif_date(b"2023:07:14"), Some(date("2023-07-14")));
        assert_eq!(parse_exif_date(b"2023-07-14T10:00:00"), Some(date("2023-07-14")));
        assert_eq!(parse_exif_date(b"0000:00:00 00:00:00"), None);
        assert_eq!(parse_exif_date(b"    :  :     :  :  "), None);
        assert_eq!(parse_exif_date(b"2023"), None);
    }

    #[test]
    fn test_date_priority_primary_tag_wins() {
        let bytes = tiff_with(&[
            ascii(Tag::DateTime, "2024:01:01 09:00:00"),
            ascii(Tag::DateTimeOriginal, "2023:07:14 10:00:00"),
            ascii(Tag::DateTimeDigitized, "2023:08:01 10:00:00"),
        ]);

        let metadata = read_metadata(&bytes, None);
        assert_eq!(metadata.date, Some(date("2023-07-14")));
    }

    #[test]
    fn test_date_priority_skips_unparseable_tags() {
        let bytes = tiff_with(&[
            ascii(Tag::DateTimeOriginal, "0000:00:00 00:00:00"),
            ascii(Tag::DateTimeDigitized, "garbage"),
            ascii(Tag::DateTime, "2022:02:22 22:22:22"),
        ]);

        let metadata = read_metadata(&bytes, None);
        assert_eq!(metadata.date, Some(date("2022-02-22")));
    }

    #[test]
    fn test_gps_date_stamp_before_file_time() {
        let bytes = tiff_with(&[ascii(Tag::GPSDateStamp, "2021:05:06")]);
        let modified = Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap();

        let metadata = read_metadata(&bytes, Some(modified));
        assert_eq!(metadata.date, Some(date("2021-05-06")));
    }

    #[test]
    fn test_gps_coordinates_signed_by_reference() {
        let metadata = read_metadata(&tiff_with(&paris_gps()), None);
        assert_close(metadata.coordinates.unwrap(), 48.8566, 2.3522);

        let metadata = read_metadata(&tiff_with(&sydney_gps()), None);
        assert_close(metadata.coordinates.unwrap(), -33.8688, 151.2093);
    }

    #[test]
    fn test_file_without_exif_uses_modified_time() {
        let modified = Utc.with_ymd_and_hms(2020, 12, 31, 23, 0, 0).unwrap();

        let metadata = read_metadata(b"definitely not an image", Some(modified));
        assert_eq!(metadata.date, Some(date("2020-12-31")));
        assert_eq!(metadata.coordinates, None);
    }

    #[tokio::test]
    async fn test_propose_single_file_without_exif() {
        let modified = Utc.with_ymd_and_hms(2019, 4, 20, 8, 0, 0).unwrap();
        let mut geocoder = MockReverseGeocoder::new();
        geocoder.expect_reverse().never();

        let proposal = pipeline(geocoder)
            .propose(&[upload(Bytes::from_static(b"\x89PNG junk"), Some(modified))])
            .await;

        assert_eq!(proposal.date, Some(date("2019-04-20")));
        assert_eq!(proposal.place, None);
    }

    #[tokio::test]
    async fn test_propose_first_available_per_field() {
        let mut geocoder = MockReverseGeocoder::new();
        geocoder.expect_reverse().times(1).returning(|_| {
            Ok(Some(Place {
                city: Some("Paris".into()),
                region: Some("Île-de-France".into()),
                country: Some("France".into()),
                country_code: Some("fr".into()),
                ..Default::default()
            }))
        });

        let files = [
            upload(Bytes::from_static(b"no metadata"), None),
            upload(tiff_with(&[ascii(Tag::DateTimeOriginal, "2023:07:14 10:00:00")]), None),
            upload(tiff_with(&paris_gps()), None),
        ];

        let proposal = pipeline(geocoder).propose(&files).await;

        assert_eq!(proposal.date, Some(date("2023-07-14")));
        let place = proposal.place.unwrap();
        assert_eq!(place.name, "Paris, Île-de-France, France");
        assert_close(place.coordinates, 48.8566, 2.3522);
    }

    #[tokio::test]
    async fn test_propose_first_file_location_beats_later_ones() {
        let mut geocoder = MockReverseGeocoder::new();
        geocoder
            .expect_reverse()
            .times(1)
            .withf(|c| c.latitude < 0.0)
            .returning(|_| Ok(None));

        let files = [
            upload(tiff_with(&sydney_gps()), None),
            upload(tiff_with(&paris_gps()), None),
        ];

        let proposal = pipeline(geocoder).propose(&files).await;
        let place = proposal.place.unwrap();
        assert_close(place.coordinates, -33.8688, 151.2093);
        assert_eq!(place.name, coordinate_label(place.coordinates));
    }

    #[tokio::test]
    async fn test_geocoder_failure_falls_back_to_coordinates() {
        let coordinates = Coordinates::new(48.8566, 2.3522).unwrap();

        let name = pipeline(failing_geocoder()).place_name(coordinates).await;
        assert_eq!(name, "48.8566, 2.3522");
    }

    struct StalledGeocoder;

    #[async_trait]
    impl ReverseGeocoder for StalledGeocoder {
        async fn reverse(&self, _: Coordinates) -> Result<Option<Place>, ExternalServiceError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_geocoder_timeout_falls_back_to_coordinates() {
        let pipeline = pipeline(StalledGeocoder)
            .with_timeouts(Duration::from_millis(50), Duration::from_secs(3));
        let coordinates = Coordinates::new(-33.8688, 151.2093).unwrap();

        assert_eq!(pipeline.place_name(coordinates).await, "-33.8688, 151.2093");
    }

    #[test]
    fn test_fill_respects_manual_fields() {
        let proposal = Proposal {
            date: Some(date("2023-07-14")),
            place: Some(ProposedPlace {
                name: "Paris, France".into(),
                coordinates: Coordinates::new(48.8566, 2.3522).unwrap(),
            }),
        };

        let mut input = EventInput {
            title: Some("Trip".into()),
            date: Some("2023-07-20".into()),
            ..Default::default()
        };
        let manual = ManualFields::from_input(&input);
        assert!(manual.date);
        assert!(!manual.location);

        proposal.fill(&mut input, manual);
        assert_eq!(input.date.as_deref(), Some("2023-07-20"));
        assert_eq!(input.location.as_deref(), Some("Paris, France"));
        assert_eq!(input.latitude, Some(48.8566));
        assert_eq!(input.longitude, Some(2.3522));

        let mut blank = EventInput::default();
        Proposal::default().fill(&mut blank, ManualFields::default());
        assert_eq!(blank.date, None);
        assert_eq!(blank.location, None);
    }
}
