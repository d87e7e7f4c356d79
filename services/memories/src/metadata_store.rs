use crate::config::DatabaseConfig;
use crate::error::{LifecycleError, LifecycleResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, FromRow};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A latitude/longitude pair in decimal degrees.
///
/// Only constructed when both halves are present and in range, so a stored
/// event never carries a one-sided pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self { latitude, longitude })
    }

    fn from_columns(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(lat), Some(lon)) => Self::new(lat, lon),
            _ => None,
        }
    }
}

/// A recorded memory
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    /// Calendar date of the memory, no time component
    pub date: NaiveDate,
    pub location: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    title: String,
    date: NaiveDate,
    location: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            date: row.date,
            location: row.location,
            coordinates: Coordinates::from_columns(row.latitude, row.longitude),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// A user-uploaded image attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Photo {
    pub id: Uuid,
    pub event_id: Uuid,
    /// Locator into the blob store
    pub url: String,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
}

/// A generated decorative image attached to an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundImage {
    pub id: Uuid,
    pub event_id: Uuid,
    pub url: String,
    /// How the image was generated
    pub prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An event with its photos (by sort order, then creation time) and
/// background images (by creation time)
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetails {
    pub event: Event,
    pub photos: Vec<Photo>,
    pub background_images: Vec<BackgroundImage>,
}

/// Event fields as submitted by a caller, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    pub title: Option<String>,
    /// `YYYY-MM-DD`, an RFC 3339 timestamp is also accepted
    pub date: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Validated event fields ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct EventFields {
    pub title: String,
    pub date: NaiveDate,
    pub location: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl EventInput {
    /// Validate required fields and normalise the optional ones.
    ///
    /// Blank strings count as absent. Coordinates are only kept together with
    /// a location, and must be supplied as a complete pair.
    pub fn validate(&self) -> LifecycleResult<EventFields> {
        let title = non_blank(self.title.as_deref())
            .ok_or_else(|| LifecycleError::validation("title is required"))?;

        let raw_date = non_blank(self.date.as_deref())
            .ok_or_else(|| LifecycleError::validation("date is required"))?;
        let date = parse_date(&raw_date).ok_or_else(|| {
            LifecycleError::validation(format!("date '{raw_date}' is not a valid calendar date"))
        })?;

        let coordinates = match (self.latitude, self.longitude) {
            (None, None) => None,
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon).ok_or_else(|| {
                LifecycleError::validation(format!("coordinates ({lat}, {lon}) are out of range"))
            })?),
            _ => {
                return Err(LifecycleError::validation(
                    "latitude and longitude must be provided together",
                ))
            }
        };

        let location = non_blank(self.location.as_deref());
        let coordinates = if location.is_some() { coordinates } else { None };

        Ok(EventFields {
            title,
            date,
            location,
            coordinates,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.date_naive())
        })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id BLOB PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    date TEXT NOT NULL,
    location TEXT,
    latitude REAL,
    longitude REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
    id BLOB PRIMARY KEY NOT NULL,
    event_id BLOB NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS background_images (
    id BLOB PRIMARY KEY NOT NULL,
    event_id BLOB NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    prompt TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_date ON events(date);
CREATE INDEX IF NOT EXISTS idx_photos_event_id ON photos(event_id);
CREATE INDEX IF NOT EXISTS idx_background_images_event_id ON background_images(event_id);
"#;

/// Nullable columns added after the first release. Older databases get them
/// through `ALTER TABLE` on startup.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    ("events", "location", "TEXT"),
    ("events", "latitude", "REAL"),
    ("events", "longitude", "REAL"),
    ("background_images", "prompt", "TEXT"),
];

const EVENT_COLUMNS: &str =
    "id, title, date, location, latitude, longitude, created_at, updated_at";
const PHOTO_ORDER: &str = "ORDER BY sort_order ASC, created_at ASC, rowid ASC";
const BACKGROUND_ORDER: &str = "ORDER BY created_at ASC, rowid ASC";

/// Relational store for events, photos and background images
pub struct MetadataStore {
    pool: SqlitePool,
    schema_ready: OnceCell<()>,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> LifecycleResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_with(options)
            .await?;

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self::from_pool(pool))
    }

    /// Private in-memory database, used by tests and local development
    pub async fn in_memory() -> LifecycleResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // Every connection to :memory: is a separate database, so keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    /// Make sure tables and additive columns exist. Runs at most once per
    /// store, concurrent first callers wait for the same initialisation.
    pub async fn ensure_schema(&self) -> LifecycleResult<()> {
        self.schema_ready
            .get_or_try_init(|| self.init_schema())
            .await?;
        Ok(())
    }

    async fn init_schema(&self) -> LifecycleResult<()> {
        info!("Initializing metadata schema");

        self.pool.execute(SCHEMA).await?;

        for (table, column, ddl_type) in ADDITIVE_COLUMNS {
            let existing: Vec<String> =
                sqlx::query_scalar("SELECT name FROM pragma_table_info(?1)")
                    .bind(*table)
                    .fetch_all(&self.pool)
                    .await?;

            if !existing.iter().any(|name| name.as_str() == *column) {
                info!(table = %table, column = %column, "Adding missing column");
                sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl_type}"))
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    /// Create an event from caller input
    #[instrument(skip(self, input))]
    pub async fn create_event(&self, input: &EventInput) -> LifecycleResult<Event> {
        let fields = input.validate()?;
        self.ensure_schema().await?;

        let now = Utc::now();
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO events (id, title, date, location, latitude, longitude, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&fields.title)
        .bind(fields.date)
        .bind(&fields.location)
        .bind(fields.coordinates.map(|c| c.latitude))
        .bind(fields.coordinates.map(|c| c.longitude))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(event_id = %row.id, "Event created");
        Ok(row.into())
    }

    /// Overwrite title, date, location and coordinates of an event
    #[instrument(skip(self, input), fields(event_id = %id))]
    pub async fn update_event(&self, id: Uuid, input: &EventInput) -> LifecycleResult<Event> {
        let fields = input.validate()?;
        self.ensure_schema().await?;

        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET title = ?2, date = ?3, location = ?4, latitude = ?5, longitude = ?6, updated_at = ?7
            WHERE id = ?1
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&fields.title)
        .bind(fields.date)
        .bind(&fields.location)
        .bind(fields.coordinates.map(|c| c.latitude))
        .bind(fields.coordinates.map(|c| c.longitude))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Event::from)
            .ok_or_else(|| LifecycleError::not_found(format!("Event {id}")))
    }

    /// Delete an event; photos and background images go with it
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn delete_event(&self, id: Uuid) -> LifecycleResult<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All events, earliest date first
    pub async fn list_events(&self) -> LifecycleResult<Vec<Event>> {
        self.ensure_schema().await?;

        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY date ASC, created_at ASC, rowid ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    /// All events with their photos and background images, earliest date first
    pub async fn list_event_details(&self) -> LifecycleResult<Vec<EventDetails>> {
        let events = self.list_events().await?;

        let photos = sqlx::query_as::<_, Photo>(&format!(
            "SELECT id, event_id, url, sort_order, created_at FROM photos {PHOTO_ORDER}"
        ))
        .fetch_all(&self.pool)
        .await?;

        let backgrounds = sqlx::query_as::<_, BackgroundImage>(&format!(
            "SELECT id, event_id, url, prompt, created_at FROM background_images {BACKGROUND_ORDER}"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut photos_by_event: HashMap<Uuid, Vec<Photo>> = HashMap::new();
        for photo in photos {
            photos_by_event.entry(photo.event_id).or_default().push(photo);
        }

        let mut backgrounds_by_event: HashMap<Uuid, Vec<BackgroundImage>> = HashMap::new();
        for image in backgrounds {
            backgrounds_by_event
                .entry(image.event_id)
                .or_default()
                .push(image);
        }

        Ok(events
            .into_iter()
            .map(|event| EventDetails {
                photos: photos_by_event.remove(&event.id).unwrap_or_default(),
                background_images: backgrounds_by_event.remove(&event.id).unwrap_or_default(),
                event,
            })
            .collect())
    }

    /// Get an event with its photos and background images
    pub async fn get_event(&self, id: Uuid) -> LifecycleResult<EventDetails> {
        self.find_event(id)
            .await?
            .ok_or_else(|| LifecycleError::not_found(format!("Event {id}")))
    }

    /// Like `get_event`, but an unknown id is `None`
    pub async fn find_event(&self, id: Uuid) -> LifecycleResult<Option<EventDetails>> {
        self.ensure_schema().await?;

        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let photos = sqlx::query_as::<_, Photo>(&format!(
            "SELECT id, event_id, url, sort_order, created_at FROM photos WHERE event_id = ?1 {PHOTO_ORDER}"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let background_images = sqlx::query_as::<_, BackgroundImage>(&format!(
            "SELECT id, event_id, url, prompt, created_at FROM background_images WHERE event_id = ?1 {BACKGROUND_ORDER}"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(EventDetails {
            event: row.into(),
            photos,
            background_images,
        }))
    }

    pub async fn event_exists(&self, id: Uuid) -> LifecycleResult<bool> {
        self.ensure_schema().await?;

        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(found.is_some())
    }

    /// Attach a photo row to an existing event
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn add_photo(
        &self,
        event_id: Uuid,
        url: &str,
        sort_order: i64,
    ) -> LifecycleResult<Photo> {
        self.ensure_schema().await?;

        sqlx::query_as::<_, Photo>(
            r#"
            INSERT INTO photos (id, event_id, url, sort_order, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id, event_id, url, sort_order, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(url)
        .bind(sort_order)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| missing_owner(e, event_id))
    }

    pub async fn get_photo(&self, photo_id: Uuid) -> LifecycleResult<Option<Photo>> {
        self.ensure_schema().await?;

        let photo = sqlx::query_as::<_, Photo>(
            "SELECT id, event_id, url, sort_order, created_at FROM photos WHERE id = ?1",
        )
        .bind(photo_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(photo)
    }

    /// Delete a photo row and hand back what was deleted
    #[instrument(skip(self), fields(photo_id = %photo_id))]
    pub async fn take_photo(&self, photo_id: Uuid) -> LifecycleResult<Option<Photo>> {
        self.ensure_schema().await?;

        let photo = sqlx::query_as::<_, Photo>(
            "DELETE FROM photos WHERE id = ?1 RETURNING id, event_id, url, sort_order, created_at",
        )
        .bind(photo_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(photo)
    }

    pub async fn remove_photo(&self, photo_id: Uuid) -> LifecycleResult<bool> {
        Ok(self.take_photo(photo_id).await?.is_some())
    }

    /// Sort order placing a new photo after every existing one
    pub async fn next_sort_order(&self, event_id: Uuid) -> LifecycleResult<i64> {
        self.ensure_schema().await?;

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM photos WHERE event_id = ?1",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    /// Attach a background image row to an existing event
    #[instrument(skip(self, prompt), fields(event_id = %event_id))]
    pub async fn add_background_image(
        &self,
        event_id: Uuid,
        url: &str,
        prompt: Option<&str>,
    ) -> LifecycleResult<BackgroundImage> {
        self.ensure_schema().await?;

        sqlx::query_as::<_, BackgroundImage>(
            r#"
            INSERT INTO background_images (id, event_id, url, prompt, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id, event_id, url, prompt, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(url)
        .bind(prompt)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| missing_owner(e, event_id))
    }

    pub async fn get_background_image(
        &self,
        image_id: Uuid,
    ) -> LifecycleResult<Option<BackgroundImage>> {
        self.ensure_schema().await?;

        let image = sqlx::query_as::<_, BackgroundImage>(
            "SELECT id, event_id, url, prompt, created_at FROM background_images WHERE id = ?1",
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    /// Delete a background image row and hand back what was deleted
    #[instrument(skip(self), fields(image_id = %image_id))]
    pub async fn take_background_image(
        &self,
        image_id: Uuid,
    ) -> LifecycleResult<Option<BackgroundImage>> {
        self.ensure_schema().await?;

        let image = sqlx::query_as::<_, BackgroundImage>(
            "DELETE FROM background_images WHERE id = ?1 RETURNING id, event_id, url, prompt, created_at",
        )
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(image)
    }

    pub async fn remove_background_image(&self, image_id: Uuid) -> LifecycleResult<bool> {
        Ok(self.take_background_image(image_id).await?.is_some())
    }

    /// Round trip to the database (for readiness checks)
    pub async fn ping(&self) -> LifecycleResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// A foreign key failure on insert means the owning event is gone
fn missing_owner(error: sqlx::Error, event_id: Uuid) -> LifecycleError {
    let is_fk_violation = error
        .as_database_error()
        .map(|e| e.is_foreign_key_violation())
        .unwrap_or(false);

    if is_fk_violation {
        LifecycleError::not_found(format!("Event {event_id}"))
    } else {
        LifecycleError::Database(error)
    }
}
