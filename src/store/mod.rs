//! Persistence and platform seams.
//!
//! The pipeline never talks to a database, bucket, or event bus directly.
//! Each external concern is one async trait, and services receive them as
//! `Arc<dyn Trait>` so a deployment can mix backends (a hosted object store
//! with a relational ingestion store, say) and tests can swap in
//! [`memory::MemoryBackend`] for all of them at once.
//!
//! | Trait | Concern |
//! |-------|---------|
//! | [`AccessControl`] | location lookup and staff-role checks |
//! | [`IngestionStore`] | ingestion records and their staged rows |
//! | [`ObjectStorage`] | uploaded documents, page previews, signed URLs |
//! | [`EventSink`] | lifecycle audit events |
//! | [`CatalogPublisher`] | atomic promotion of staged rows into a menu |
//! | [`Reindexer`] | search refresh after publishing |

pub mod local;
pub mod memory;

use crate::error::IngestError;
use crate::model::{Actor, Ingestion, LifecycleEvent, Location, SignedUrl, StagingRow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type StoreResult<T> = Result<T, IngestError>;

/// Location lookup and role checks.
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn location(&self, location_id: Uuid) -> StoreResult<Option<Location>>;

    /// Whether `actor` holds a staff role allowed to manage menus at `location`.
    async fn is_staff(&self, actor: &Actor, location: &Location) -> StoreResult<bool>;
}

/// Resolve a location and require staff access to it.
pub async fn authorize(
    access: &dyn AccessControl,
    actor: &Actor,
    location_id: Uuid,
) -> StoreResult<Location> {
    let location = access
        .location(location_id)
        .await?
        .ok_or(IngestError::NotFound { entity: "Location" })?;
    if !access.is_staff(actor, &location).await? {
        return Err(IngestError::Forbidden);
    }
    Ok(location)
}

/// Ingestion records and their staged rows.
#[async_trait]
pub trait IngestionStore: Send + Sync {
    async fn insert_ingestion(&self, ingestion: &Ingestion) -> StoreResult<()>;
    async fn load_ingestion(&self, id: Uuid) -> StoreResult<Option<Ingestion>>;
    async fn save_ingestion(&self, ingestion: &Ingestion) -> StoreResult<()>;

    /// Replace every staged row of an ingestion in one step. Readers see either
    /// the previous set or the new one, never a mix or an empty gap.
    async fn replace_staging_rows(&self, ingestion_id: Uuid, rows: &[StagingRow])
        -> StoreResult<()>;

    async fn staging_rows(&self, ingestion_id: Uuid) -> StoreResult<Vec<StagingRow>>;
}

/// Blob storage for uploaded documents and page previews.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn signed_upload_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl>;
    async fn signed_download_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl>;
    async fn get(&self, path: &str) -> StoreResult<Vec<u8>>;
    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> StoreResult<()>;
}

/// Destination for lifecycle audit events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: LifecycleEvent) -> StoreResult<()>;
}

/// Emit an event, logging instead of failing when the sink is unavailable.
pub async fn emit_best_effort(events: &dyn EventSink, event: LifecycleEvent) {
    let kind = event.kind.as_str();
    let id = event.ingestion_id;
    info!("Ingestion {}: event '{}'", id, kind);
    if let Err(e) = events.emit(event).await {
        warn!("Dropping '{}' event for ingestion {}: {}", kind, id, e);
    }
}

/// A published menu as seen by the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Menu {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub location_id: Uuid,
    pub version: u32,
}

/// What one promotion changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishCounts {
    pub items_upserted: usize,
    pub categories_created: usize,
    /// Menu version after the promotion.
    pub version: u32,
    /// Catalog items touched, for reindexing.
    pub item_ids: Vec<Uuid>,
}

/// Promotes staged rows into a live menu.
#[async_trait]
pub trait CatalogPublisher: Send + Sync {
    async fn load_menu(&self, menu_id: Uuid) -> StoreResult<Option<Menu>>;

    /// Atomically: upsert every staged row of `ingestion_id` into `menu_id`
    /// (creating missing categories), bump the menu version, clear the staged
    /// rows, and mark the ingestion `published` with `published_at` and
    /// `published_menu_id` in its metadata. On error nothing has changed.
    ///
    /// A live item is the same item when category, trimmed lowercased name,
    /// price and currency all match; otherwise a new item is created.
    async fn publish_staged(&self, ingestion_id: Uuid, menu_id: Uuid)
        -> StoreResult<PublishCounts>;
}

/// Refreshes search indexes for published items.
#[async_trait]
pub trait Reindexer: Send + Sync {
    async fn reindex(&self, menu_id: Uuid, item_ids: &[Uuid]) -> StoreResult<()>;
}

/// The backends every service needs.
#[derive(Clone)]
pub struct Backends {
    pub access: Arc<dyn AccessControl>,
    pub ingestions: Arc<dyn IngestionStore>,
    pub objects: Arc<dyn ObjectStorage>,
    pub events: Arc<dyn EventSink>,
}

impl Backends {
    /// Load an ingestion the actor manages.
    ///
    /// A missing ingestion, one at a location the actor has no role on, and
    /// one whose location has gone away all come back as the same
    /// `NotFound`, so ingestion ids do not reveal what exists elsewhere.
    pub async fn load_authorized(&self, actor: &Actor, ingestion_id: Uuid) -> StoreResult<Ingestion> {
        let hidden = || IngestError::NotFound { entity: "Ingestion" };
        let ingestion = self
            .ingestions
            .load_ingestion(ingestion_id)
            .await?
            .ok_or_else(hidden)?;
        let location = match authorize(self.access.as_ref(), actor, ingestion.location_id).await {
            Ok(location) => location,
            Err(IngestError::Forbidden | IngestError::NotFound { .. }) => {
                debug!("Actor {} has no access to ingestion {}", actor.user_id, ingestion_id);
                return Err(hidden());
            }
            Err(e) => return Err(e),
        };
        if !ingestion.belongs_to(&location) {
            return Err(hidden());
        }
        Ok(ingestion)
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
