//! Memories Service
//!
//! Event and media lifecycle service behind the memories timeline. It owns
//! events (a title, a date and an optional place), the photos attached to
//! them and decorative background images generated for located events.
//!
//! ## Features
//!
//! - **Authoritative Metadata Store**: SQLite-backed events, photos and
//!   background images with cascading deletes and idempotent schema setup
//! - **Blob Storage**: S3 or S3-compatible object storage addressed by opaque
//!   URL, with best-effort cleanup
//! - **Photo Metadata Extraction**: capture date and GPS position from EXIF,
//!   reverse geocoded into a short place name, degrading silently
//! - **Background Image Generation**: sketches and backgrounds generated off
//!   the request path by a bounded worker
//!
//! ## Architecture
//!
//! ```text
//!   HTTP API                                       SQLite
//! ┌──────────────┐      ┌──────────────┐        ┌──────────────┐
//! │ /events      │─────▶│ Lifecycle    │───────▶│ events       │
//! │ /extract     │      │ Manager      │        │ photos       │
//! └──────────────┘      └──────────────┘        │ backgrounds  │
//!        │                │    │     ▲          └──────────────┘
//!        ▼                │    │     │
//! ┌──────────────┐        │    │     │ attach    ┌──────────────┐
//! │ Extraction   │◀───────┘    │     └───────────│ Background   │
//! │ EXIF + Geo   │             │                 │ Worker       │
//! └──────────────┘             ▼                 └──────────────┘
//!                       ┌──────────────┐                ▲
//!                       │ Blob Store   │      job queue │
//!                       │ photos/      │◀───────────────┘
//!                       │ sketches/    │
//!                       │ backgrounds/ │
//!                       └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod extraction;
pub mod generator;
pub mod geocoder;
pub mod lifecycle;
pub mod metadata_store;

pub use api::{create_router, start_api_server, AppState};
pub use blob_store::{BlobStore, GeneratedKind, MemoryBlobStore, S3BlobStore, StorageError};
pub use config::Config;
pub use error::{ExternalServiceError, LifecycleError, LifecycleResult};
pub use extraction::{ExtractionPipeline, Proposal, UploadedFile};
pub use generator::{BackgroundJob, BackgroundWorker, ImageGenerator, JobQueue, OpenAiImageGenerator};
pub use geocoder::{NominatimGeocoder, ReverseGeocoder};
pub use lifecycle::{CreateOutcome, Lifecycle, PhotoFailure};
pub use metadata_store::{BackgroundImage, Coordinates, Event, EventDetails, EventInput, MetadataStore, Photo};
