//! Event and media lifecycle across the metadata store and the blob store.
//!
//! The metadata store is authoritative: a row is the only evidence that a
//! photo or background image exists. Blobs are written before their rows and
//! deleted after them, and blob cleanup failures are only logged.

use crate::blob_store::{
    delete_best_effort, extension_for, generated_key, photo_key, BlobStore, GeneratedKind,
};
use crate::error::{LifecycleError, LifecycleResult};
use crate::extraction::{ExtractionPipeline, ManualFields, UploadedFile};
use crate::generator::{BackgroundJob, GeneratedImage, JobQueue};
use crate::metadata_store::{
    BackgroundImage, Event, EventDetails, EventInput, MetadataStore, Photo,
};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A file from a batch that could not be attached
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoFailure {
    pub file_name: Option<String>,
    pub error: String,
}

/// Result of creating an event together with its photos
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub event: EventDetails,
    pub photo_failures: Vec<PhotoFailure>,
}

/// Result of attaching a batch of photos to an existing event
#[derive(Debug, Clone, Default)]
pub struct AttachOutcome {
    pub photos: Vec<Photo>,
    pub failures: Vec<PhotoFailure>,
}

/// Orchestrates event, photo and background image changes
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    extraction: Arc<ExtractionPipeline>,
    jobs: Option<JobQueue>,
}

impl Lifecycle {
    pub fn new(
        store: Arc<MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        extraction: Arc<ExtractionPipeline>,
    ) -> Self {
        Self {
            store,
            blobs,
            extraction,
            jobs: None,
        }
    }

    /// Hand background image jobs for new located events to `jobs`
    pub fn with_jobs(mut self, jobs: JobQueue) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn extraction(&self) -> &ExtractionPipeline {
        &self.extraction
    }

    pub async fn list_events(&self) -> LifecycleResult<Vec<EventDetails>> {
        self.store.list_event_details().await
    }

    pub async fn get_event(&self, id: Uuid) -> LifecycleResult<EventDetails> {
        self.store.get_event(id).await
    }

    /// Create an event, then attach each staged file in order.
    ///
    /// Fields the caller left blank are filled from the files first. A photo
    /// that cannot be stored is reported in the outcome and does not undo the
    /// event or the other photos.
    #[instrument(skip(self, input, files), fields(file_count = files.len()))]
    pub async fn create_event(
        &self,
        mut input: EventInput,
        files: Vec<UploadedFile>,
    ) -> LifecycleResult<CreateOutcome> {
        let manual = ManualFields::from_input(&input);
        if !files.is_empty() && !(manual.date && manual.location) {
            let proposal = self.extraction.propose(&files).await;
            proposal.fill(&mut input, manual);
        }

        let event = self.store.create_event(&input).await?;
        metrics::counter!("memories.events.created").increment(1);
        info!(event_id = %event.id, "Event created");

        let mut photos = Vec::with_capacity(files.len());
        let mut photo_failures = Vec::new();

        for (index, file) in files.into_iter().enumerate() {
            let file_name = file.file_name.clone();
            match self.store_photo(event.id, file, index as i64).await {
                Ok(photo) => photos.push(photo),
                Err(e) => {
                    warn!(event_id = %event.id, file = ?file_name, error = %e, "Photo not attached");
                    photo_failures.push(PhotoFailure {
                        file_name,
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Some(ref location) = event.location {
            self.enqueue_background_job(event.id, location);
        }

        Ok(CreateOutcome {
            event: EventDetails {
                event,
                photos,
                background_images: Vec::new(),
            },
            photo_failures,
        })
    }

    /// Replace title, date, location and coordinates. Media is untouched.
    pub async fn update_event(&self, id: Uuid, input: &EventInput) -> LifecycleResult<Event> {
        let event = self.store.update_event(id, input).await?;
        info!(event_id = %id, "Event updated");
        Ok(event)
    }

    /// Remove every blob of the event, then the event row and, by cascade,
    /// all media rows. `false` only when the event does not exist.
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn delete_event(&self, id: Uuid) -> LifecycleResult<bool> {
        let Some(details) = self.store.find_event(id).await? else {
            return Ok(false);
        };

        let urls: Vec<&str> = details
            .photos
            .iter()
            .map(|p| p.url.as_str())
            .chain(details.background_images.iter().map(|b| b.url.as_str()))
            .collect();

        debug!(blob_count = urls.len(), "Cleaning up event blobs");
        join_all(
            urls.iter()
                .map(|url| delete_best_effort(self.blobs.as_ref(), url)),
        )
        .await;

        let deleted = self.store.delete_event(id).await?;
        if deleted {
            metrics::counter!("memories.events.deleted").increment(1);
            info!("Event deleted");
        }
        Ok(deleted)
    }

    /// Attach one photo after the existing ones
    #[instrument(skip(self, file), fields(event_id = %event_id))]
    pub async fn attach_photo(&self, event_id: Uuid, file: UploadedFile) -> LifecycleResult<Photo> {
        self.require_event(event_id).await?;
        let sort_order = self.store.next_sort_order(event_id).await?;
        self.store_photo(event_id, file, sort_order).await
    }

    /// Attach files in order after the existing photos. Unknown event is an
    /// error; failures of single files are reported per file.
    #[instrument(skip(self, files), fields(event_id = %event_id, file_count = files.len()))]
    pub async fn attach_photos(
        &self,
        event_id: Uuid,
        files: Vec<UploadedFile>,
    ) -> LifecycleResult<AttachOutcome> {
        self.require_event(event_id).await?;
        let mut sort_order = self.store.next_sort_order(event_id).await?;
        let mut outcome = AttachOutcome::default();

        for file in files {
            let file_name = file.file_name.clone();
            match self.store_photo(event_id, file, sort_order).await {
                Ok(photo) => {
                    outcome.photos.push(photo);
                    sort_order += 1;
                }
                Err(e) => {
                    warn!(file = ?file_name, error = %e, "Photo not attached");
                    outcome.failures.push(PhotoFailure {
                        file_name,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Remove a photo of `event_id`. `false` when no such photo belongs to it.
    #[instrument(skip(self), fields(event_id = %event_id, photo_id = %photo_id))]
    pub async fn detach_photo(&self, event_id: Uuid, photo_id: Uuid) -> LifecycleResult<bool> {
        match self.store.get_photo(photo_id).await? {
            Some(photo) if photo.event_id == event_id => {}
            _ => return Ok(false),
        }

        let Some(photo) = self.store.take_photo(photo_id).await? else {
            return Ok(false);
        };

        delete_best_effort(self.blobs.as_ref(), &photo.url).await;
        metrics::counter!("memories.photos.detached").increment(1);
        Ok(true)
    }

    /// Store a generated image and its row. `NotFound` when the event is gone.
    #[instrument(skip(self, image, prompt), fields(event_id = %event_id, kind = ?kind))]
    pub async fn attach_background_image(
        &self,
        event_id: Uuid,
        kind: GeneratedKind,
        index: u32,
        image: &GeneratedImage,
        prompt: &str,
    ) -> LifecycleResult<BackgroundImage> {
        self.require_event(event_id).await?;

        let key = generated_key(
            kind,
            event_id,
            Utc::now().timestamp_millis(),
            index,
            &extension_for(&image.content_type, None),
        );
        let url = self
            .blobs
            .put(&key, image.bytes.clone(), &image.content_type)
            .await?;

        match self
            .store
            .add_background_image(event_id, &url, Some(prompt))
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                delete_best_effort(self.blobs.as_ref(), &url).await;
                Err(e)
            }
        }
    }

    /// Remove a background image of `event_id`. `false` when no such image belongs to it.
    #[instrument(skip(self), fields(event_id = %event_id, image_id = %image_id))]
    pub async fn remove_background_image(
        &self,
        event_id: Uuid,
        image_id: Uuid,
    ) -> LifecycleResult<bool> {
        match self.store.get_background_image(image_id).await? {
            Some(image) if image.event_id == event_id => {}
            _ => return Ok(false),
        }

        let Some(image) = self.store.take_background_image(image_id).await? else {
            return Ok(false);
        };

        delete_best_effort(self.blobs.as_ref(), &image.url).await;
        Ok(true)
    }

    async fn require_event(&self, event_id: Uuid) -> LifecycleResult<()> {
        if self.store.event_exists(event_id).await? {
            Ok(())
        } else {
            Err(LifecycleError::not_found(format!("Event {event_id}")))
        }
    }

    /// Blob first, then row. A row failure leaves at most an orphan blob,
    /// which is removed best effort.
    async fn store_photo(
        &self,
        event_id: Uuid,
        file: UploadedFile,
        sort_order: i64,
    ) -> LifecycleResult<Photo> {
        if file.bytes.is_empty() {
            return Err(LifecycleError::validation("file is empty"));
        }

        let key = photo_key(&extension_for(&file.content_type, file.file_name.as_deref()));
        let url = match self.blobs.put(&key, file.bytes, &file.content_type).await {
            Ok(url) => url,
            Err(e) => {
                metrics::counter!("memories.photos.failed").increment(1);
                return Err(e.into());
            }
        };

        match self.store.add_photo(event_id, &url, sort_order).await {
            Ok(photo) => {
                metrics::counter!("memories.photos.attached").increment(1);
                debug!(photo_id = %photo.id, url = %url, "Photo attached");
                Ok(photo)
            }
            Err(e) => {
                metrics::counter!("memories.photos.failed").increment(1);
                delete_best_effort(self.blobs.as_ref(), &url).await;
                Err(e)
            }
        }
    }

    fn enqueue_background_job(&self, event_id: Uuid, location: &str) {
        if let Some(ref jobs) = self.jobs {
            jobs.enqueue(BackgroundJob {
                event_id,
                location: location.to_string(),
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::blob_store::{MockBlobStore, StorageError};
    use crate::extraction::fixtures::{paris_gps, tiff_with, upload};
    use bytes::Bytes;
    use chrono::NaiveDate;

    fn png() -> GeneratedImage {
        GeneratedImage {
            bytes: Bytes::from_static(b"\x89PNG"),
            content_type: "image/png".into(),
        }
    }

    #[tokio::test]
    async fn test_create_event_with_photos() {
        let (lifecycle, blobs) = lifecycle().await;

        let outcome = lifecycle
            .create_event(input("Road trip", "2022-06-01"), vec![jpeg("a.jpg"), jpeg("b.jpg")])
            .await
            .unwrap();

        assert!(outcome.photo_failures.is_empty());
        assert_eq!(outcome.event.photos.len(), 2);
        assert_eq!(outcome.event.photos[0].sort_order, 0);
        assert_eq!(outcome.event.photos[1].sort_order, 1);
        assert_eq!(blobs.len(), 2);

        let fetched = lifecycle.get_event(outcome.event.event.id).await.unwrap();
        assert_eq!(fetched.photos, outcome.event.photos);
        assert!(fetched.photos[0].url.starts_with("memory://photos/"));
    }

    #[tokio::test]
    async fn test_create_event_blob_failure_skips_only_that_photo() {
        let (lifecycle, blobs) = lifecycle().await;
        blobs.fail_next_puts(1);

        let outcome = lifecycle
            .create_event(input("Concert", "2022-03-03"), vec![jpeg("lost.jpg"), jpeg("kept.jpg")])
            .await
            .unwrap();

        assert_eq!(outcome.photo_failures.len(), 1);
        assert_eq!(outcome.photo_failures[0].file_name.as_deref(), Some("lost.jpg"));
        assert_eq!(outcome.event.photos.len(), 1);

        let fetched = lifecycle.get_event(outcome.event.event.id).await.unwrap();
        assert_eq!(fetched.photos.len(), 1);
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_create_event_fills_blank_fields_from_photos() {
        let (lifecycle, _blobs) = lifecycle().await;
        let mut fields = paris_gps();
        fields.push(crate::extraction::fixtures::ascii(
            exif::Tag::DateTimeOriginal,
            "2018:08:18 18:18:18",
        ));

        let outcome = lifecycle
            .create_event(
                EventInput {
                    title: Some("Summer in France".into()),
                    ..Default::default()
                },
                vec![upload(tiff_with(&fields), None)],
            )
            .await
            .unwrap();

        let event = outcome.event.event;
        assert_eq!(event.date, NaiveDate::from_ymd_opt(2018, 8, 18).unwrap());
        assert_eq!(event.location.as_deref(), Some("Lyon, France"));
        assert!(event.coordinates.is_some());
    }

    #[tokio::test]
    async fn test_create_event_keeps_manual_fields() {
        let (lifecycle, _blobs) = lifecycle().await;

        let outcome = lifecycle
            .create_event(
                EventInput {
                    location: Some("Home".into()),
                    ..input("Birthday", "2020-02-02")
                },
                vec![upload(tiff_with(&paris_gps()), None)],
            )
            .await
            .unwrap();

        assert_eq!(outcome.event.event.location.as_deref(), Some("Home"));
        assert_eq!(outcome.event.event.coordinates, None);
    }

    #[tokio::test]
    async fn test_create_event_without_date_anywhere_is_validation_error() {
        let (lifecycle, blobs) = lifecycle().await;

        let err = lifecycle
            .create_event(
                EventInput {
                    title: Some("Undated".into()),
                    ..Default::default()
                },
                vec![jpeg("plain.jpg")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Validation(_)));
        assert!(blobs.is_empty());
        assert!(lifecycle.list_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_located_event_enqueues_background_job() {
        let (queue, mut receiver) = JobQueue::bounded(4);
        let (lifecycle, _blobs) = lifecycle().await;
        let lifecycle = lifecycle.with_jobs(queue);

        let unlocated = lifecycle
            .create_event(input("Indoors", "2021-01-01"), vec![])
            .await
            .unwrap();
        let located = lifecycle
            .create_event(
                EventInput {
                    location: Some("Reykjavík, Iceland".into()),
                    ..input("Aurora", "2021-02-02")
                },
                vec![],
            )
            .await
            .unwrap();

        let job = receiver.try_recv().unwrap();
        assert_eq!(job.event_id, located.event.event.id);
        assert_eq!(job.location, "Reykjavík, Iceland");
        assert_ne!(job.event_id, unlocated.event.event.id);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attach_photo_to_missing_event_leaves_nothing() {
        let (lifecycle, blobs) = lifecycle().await;

        let err = lifecycle
            .attach_photo(Uuid::new_v4(), jpeg("orphan.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::NotFound(_)));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_attach_photos_appends_after_existing() {
        let (lifecycle, _blobs) = lifecycle().await;
        let created = lifecycle
            .create_event(input("Garden", "2020-05-05"), vec![jpeg("first.jpg")])
            .await
            .unwrap();
        let id = created.event.event.id;

        let outcome = lifecycle
            .attach_photos(id, vec![jpeg("second.jpg"), jpeg("third.jpg")])
            .await
            .unwrap();
        assert!(outcome.failures.is_empty());

        let single = lifecycle.attach_photo(id, jpeg("fourth.jpg")).await.unwrap();
        assert_eq!(single.sort_order, 3);

        let orders: Vec<i64> = lifecycle
            .get_event(id)
            .await
            .unwrap()
            .photos
            .iter()
            .map(|p| p.sort_order)
            .collect();
        assert_eq!(orders, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_attach_empty_file_is_rejected() {
        let (lifecycle, blobs) = lifecycle().await;
        let created = lifecycle
            .create_event(input("Empty", "2020-05-05"), vec![])
            .await
            .unwrap();

        let mut empty = jpeg("empty.jpg");
        empty.bytes = Bytes::new();
        let err = lifecycle
            .attach_photo(created.event.event.id, empty)
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Validation(_)));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_detach_photo_tolerates_blob_failure() {
        let (lifecycle, blobs) = lifecycle().await;
        let created = lifecycle
            .create_event(input("Zoo", "2019-09-09"), vec![jpeg("lion.jpg")])
            .await
            .unwrap();
        let event_id = created.event.event.id;
        let photo_id = created.event.photos[0].id;

        blobs.fail_next_deletes(1);
        assert!(lifecycle.detach_photo(event_id, photo_id).await.unwrap());
        assert!(!lifecycle.detach_photo(event_id, photo_id).await.unwrap());
        assert!(lifecycle.get_event(event_id).await.unwrap().photos.is_empty());
    }

    #[tokio::test]
    async fn test_detach_photo_of_other_event_is_refused() {
        let (lifecycle, blobs) = lifecycle().await;
        let a = lifecycle
            .create_event(input("A", "2019-01-01"), vec![jpeg("a.jpg")])
            .await
            .unwrap();
        let b = lifecycle
            .create_event(input("B", "2019-01-02"), vec![])
            .await
            .unwrap();

        let photo_id = a.event.photos[0].id;
        assert!(!lifecycle.detach_photo(b.event.event.id, photo_id).await.unwrap());
        assert_eq!(lifecycle.get_event(a.event.event.id).await.unwrap().photos.len(), 1);
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_event_removes_rows_even_when_blob_deletes_fail() {
        let mut mock = MockBlobStore::new();
        let mut counter = 0;
        mock.expect_put().returning(move |key, _, _| {
            counter += 1;
            Ok(format!("memory://{key}#{counter}"))
        });
        mock.expect_delete()
            .times(3)
            .returning(|_| Err(StorageError::Transport("bucket offline".into())));

        let lifecycle = lifecycle_with(Arc::new(mock)).await;
        let created = lifecycle
            .create_event(input("Wedding", "2018-06-16"), vec![jpeg("1.jpg"), jpeg("2.jpg")])
            .await
            .unwrap();
        let id = created.event.event.id;
        lifecycle
            .attach_background_image(id, GeneratedKind::Background, 0, &png(), "lace")
            .await
            .unwrap();

        assert!(lifecycle.delete_event(id).await.unwrap());

        assert!(matches!(
            lifecycle.get_event(id).await,
            Err(LifecycleError::NotFound(_))
        ));
        assert!(lifecycle.list_events().await.unwrap().is_empty());
        for photo in &created.event.photos {
            assert_eq!(lifecycle.store().get_photo(photo.id).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_delete_event_cleans_blobs() {
        let (lifecycle, blobs) = lifecycle().await;
        let created = lifecycle
            .create_event(input("Move", "2017-07-07"), vec![jpeg("box.jpg")])
            .await
            .unwrap();
        let id = created.event.event.id;
        lifecycle
            .attach_background_image(id, GeneratedKind::Sketch, 0, &png(), "boxes")
            .await
            .unwrap();
        assert_eq!(blobs.len(), 2);

        assert!(lifecycle.delete_event(id).await.unwrap());
        assert!(blobs.is_empty());
        assert!(!lifecycle.delete_event(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_background_image_key_and_prompt() {
        let (lifecycle, blobs) = lifecycle().await;
        let created = lifecycle
            .create_event(input("Lake", "2016-08-08"), vec![])
            .await
            .unwrap();
        let id = created.event.event.id;

        let image = lifecycle
            .attach_background_image(id, GeneratedKind::Sketch, 1, &png(), "a lake at dawn")
            .await
            .unwrap();

        assert!(image
            .url
            .starts_with(&format!("memory://sketches/{id}/")));
        assert!(image.url.ends_with("-1.png"));
        assert_eq!(image.prompt.as_deref(), Some("a lake at dawn"));
        assert!(blobs.contains(&image.url));

        assert!(lifecycle.remove_background_image(id, image.id).await.unwrap());
        assert!(!lifecycle.remove_background_image(id, image.id).await.unwrap());
        assert!(!blobs.contains(&image.url));
    }

    #[tokio::test]
    async fn test_attach_background_image_to_deleted_event() {
        let (lifecycle, blobs) = lifecycle().await;

        let err = lifecycle
            .attach_background_image(Uuid::new_v4(), GeneratedKind::Background, 0, &png(), "x")
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::NotFound(_)));
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_update_event_keeps_media() {
        let (lifecycle, _blobs) = lifecycle().await;
        let created = lifecycle
            .create_event(
                EventInput {
                    location: Some("Oslo, Norway".into()),
                    latitude: Some(59.9139),
                    longitude: Some(10.7522),
                    ..input("Fjords", "2015-05-15")
                },
                vec![jpeg("fjord.jpg")],
            )
            .await
            .unwrap();
        let id = created.event.event.id;

        let updated = lifecycle
            .update_event(id, &input("Fjords again", "2015-05-16"))
            .await
            .unwrap();
        assert_eq!(updated.title, "Fjords again");
        assert_eq!(updated.location, None);
        assert_eq!(updated.coordinates, None);

        assert_eq!(lifecycle.get_event(id).await.unwrap().photos.len(), 1);
    }
}
