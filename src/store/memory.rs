//! In-process backend implementing every store trait.
//!
//! Used by the CLI for one-shot runs and by tests. All state sits behind one
//! mutex, which gives the atomicity the traits promise for free: staged-row
//! replacement and catalog promotion happen inside a single critical section.

use super::{
    AccessControl, Backends, CatalogPublisher, EventSink, IngestionStore, Menu, ObjectStorage,
    PublishCounts, Reindexer, StoreResult,
};
use crate::error::IngestError;
use crate::merge::UNCATEGORIZED;
use crate::model::{
    Actor, Ingestion, IngestionStatus, LifecycleEvent, Location, SignedUrl, StagingRow,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// A live catalog item created or updated by publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: Uuid,
    pub category: String,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: Option<i64>,
    pub currency: String,
    pub allergens: Vec<String>,
    pub tags: Vec<String>,
    pub is_alcohol: bool,
}

/// Live items are matched on category, lowercased name, price and currency,
/// the same identity merge uses, so price variants stay distinct items.
type CatalogKey = (String, String, Option<i64>, String);

#[derive(Default)]
struct State {
    locations: HashMap<Uuid, Location>,
    staff: HashSet<(Uuid, Uuid)>,
    ingestions: HashMap<Uuid, Ingestion>,
    staging: HashMap<Uuid, Vec<StagingRow>>,
    objects: HashMap<String, (Vec<u8>, String)>,
    events: Vec<LifecycleEvent>,
    menus: HashMap<Uuid, Menu>,
    categories: HashMap<Uuid, BTreeSet<String>>,
    catalog: HashMap<Uuid, BTreeMap<CatalogKey, CatalogItem>>,
    reindex_requests: Vec<(Uuid, Vec<Uuid>)>,
    fail_events: bool,
}

/// Memory-backed implementation of all store traits.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic in another test thread must not cascade.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bundle this backend as every service dependency.
    pub fn backends(self: &Arc<Self>) -> Backends {
        Backends {
            access: self.clone(),
            ingestions: self.clone(),
            objects: self.clone(),
            events: self.clone(),
        }
    }

    // ── Seeding ──

    pub fn add_location(&self, tenant_id: Uuid) -> Location {
        let location = Location {
            id: Uuid::new_v4(),
            tenant_id,
        };
        self.lock().locations.insert(location.id, location);
        location
    }

    pub fn grant_staff(&self, actor: &Actor, location: &Location) {
        self.lock().staff.insert((actor.user_id, location.id));
    }

    pub fn add_menu(&self, location: &Location) -> Menu {
        let menu = Menu {
            id: Uuid::new_v4(),
            tenant_id: location.tenant_id,
            location_id: location.id,
            version: 1,
        };
        self.lock().menus.insert(menu.id, menu.clone());
        menu
    }

    /// Make every subsequent event emission fail.
    pub fn fail_events(&self, fail: bool) {
        self.lock().fail_events = fail;
    }

    // ── Inspection ──

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.lock().events.clone()
    }

    pub fn ingestion(&self, id: Uuid) -> Option<Ingestion> {
        self.lock().ingestions.get(&id).cloned()
    }

    pub fn ingestion_count(&self) -> usize {
        self.lock().ingestions.len()
    }

    pub fn staged(&self, ingestion_id: Uuid) -> Vec<StagingRow> {
        self.lock()
            .staging
            .get(&ingestion_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(path).map(|(b, _)| b.clone())
    }

    pub fn object_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().objects.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn menu(&self, menu_id: Uuid) -> Option<Menu> {
        self.lock().menus.get(&menu_id).cloned()
    }

    pub fn catalog_items(&self, menu_id: Uuid) -> Vec<CatalogItem> {
        self.lock()
            .catalog
            .get(&menu_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reindex_requests(&self) -> Vec<(Uuid, Vec<Uuid>)> {
        self.lock().reindex_requests.clone()
    }
}

fn signed(scheme_path: &str, ttl: Duration) -> SignedUrl {
    let expires_at = Utc::now()
        + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
    SignedUrl {
        url: format!("memory://{}?expires={}", scheme_path, expires_at.timestamp()),
        expires_at,
    }
}

#[async_trait]
impl AccessControl for MemoryBackend {
    async fn location(&self, location_id: Uuid) -> StoreResult<Option<Location>> {
        Ok(self.lock().locations.get(&location_id).copied())
    }

    async fn is_staff(&self, actor: &Actor, location: &Location) -> StoreResult<bool> {
        Ok(self.lock().staff.contains(&(actor.user_id, location.id)))
    }
}

#[async_trait]
impl IngestionStore for MemoryBackend {
    async fn insert_ingestion(&self, ingestion: &Ingestion) -> StoreResult<()> {
        let mut state = self.lock();
        if state.ingestions.contains_key(&ingestion.id) {
            return Err(IngestError::storage(
                "insert_ingestion",
                format!("ingestion {} already exists", ingestion.id),
            ));
        }
        state.ingestions.insert(ingestion.id, ingestion.clone());
        Ok(())
    }

    async fn load_ingestion(&self, id: Uuid) -> StoreResult<Option<Ingestion>> {
        Ok(self.lock().ingestions.get(&id).cloned())
    }

    async fn save_ingestion(&self, ingestion: &Ingestion) -> StoreResult<()> {
        let mut state = self.lock();
        match state.ingestions.get_mut(&ingestion.id) {
            Some(slot) => {
                *slot = ingestion.clone();
                Ok(())
            }
            None => Err(IngestError::NotFound { entity: "Ingestion" }),
        }
    }

    async fn replace_staging_rows(
        &self,
        ingestion_id: Uuid,
        rows: &[StagingRow],
    ) -> StoreResult<()> {
        self.lock().staging.insert(ingestion_id, rows.to_vec());
        Ok(())
    }

    async fn staging_rows(&self, ingestion_id: Uuid) -> StoreResult<Vec<StagingRow>> {
        Ok(self.staged(ingestion_id))
    }
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
    async fn signed_upload_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        Ok(signed(&format!("upload/{path}"), ttl))
    }

    async fn signed_download_url(&self, path: &str, ttl: Duration) -> StoreResult<SignedUrl> {
        if !self.lock().objects.contains_key(path) {
            return Err(IngestError::storage("sign_download", format!("no object at '{path}'")));
        }
        Ok(signed(&format!("download/{path}"), ttl))
    }

    async fn get(&self, path: &str) -> StoreResult<Vec<u8>> {
        self.object(path)
            .ok_or_else(|| IngestError::storage("get_object", format!("no object at '{path}'")))
    }

    async fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> StoreResult<()> {
        self.lock()
            .objects
            .insert(path.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }
}

#[async_trait]
impl EventSink for MemoryBackend {
    async fn emit(&self, event: LifecycleEvent) -> StoreResult<()> {
        let mut state = self.lock();
        if state.fail_events {
            return Err(IngestError::storage("emit_event", "event sink unavailable"));
        }
        state.events.push(event);
        Ok(())
    }
}

#[async_trait]
impl CatalogPublisher for MemoryBackend {
    async fn load_menu(&self, menu_id: Uuid) -> StoreResult<Option<Menu>> {
        Ok(self.menu(menu_id))
    }

    async fn publish_staged(
        &self,
        ingestion_id: Uuid,
        menu_id: Uuid,
    ) -> StoreResult<PublishCounts> {
        let mut state = self.lock();
        let state = &mut *state;

        // Validate everything before the first write.
        let ingestion = state
            .ingestions
            .get_mut(&ingestion_id)
            .ok_or(IngestError::NotFound { entity: "Ingestion" })?;
        if !ingestion.status.can_transition_to(IngestionStatus::Published) {
            return Err(IngestError::InvalidTransition {
                from: ingestion.status.to_string(),
                to: IngestionStatus::Published.to_string(),
            });
        }
        let menu = state
            .menus
            .get_mut(&menu_id)
            .ok_or(IngestError::NotFound { entity: "Menu" })?;
        let rows = state.staging.remove(&ingestion_id).unwrap_or_default();

        let categories = state.categories.entry(menu_id).or_default();
        let catalog = state.catalog.entry(menu_id).or_default();
        let mut counts = PublishCounts::default();

        for row in rows {
            let category = row
                .category
                .clone()
                .unwrap_or_else(|| UNCATEGORIZED.to_string());
            if categories.insert(category.clone()) {
                counts.categories_created += 1;
            }
            let key: CatalogKey = (
                category.clone(),
                row.name.trim().to_lowercase(),
                row.price_cents,
                row.currency.clone(),
            );
            let id = catalog.get(&key).map(|i| i.id).unwrap_or_else(Uuid::new_v4);
            catalog.insert(
                key,
                CatalogItem {
                    id,
                    category,
                    name: row.name,
                    description: row.description,
                    price_cents: row.price_cents,
                    currency: row.currency,
                    allergens: row.allergens,
                    tags: row.tags,
                    is_alcohol: row.is_alcohol,
                },
            );
            counts.items_upserted += 1;
            counts.item_ids.push(id);
        }

        menu.version += 1;
        counts.version = menu.version;

        ingestion.status = IngestionStatus::Published;
        let now = Utc::now();
        ingestion.updated_at = now;
        ingestion.metadata.published_at = Some(now);
        ingestion.metadata.published_menu_id = Some(menu_id);

        Ok(counts)
    }
}

#[async_trait]
impl Reindexer for MemoryBackend {
    async fn reindex(&self, menu_id: Uuid, item_ids: &[Uuid]) -> StoreResult<()> {
        self.lock()
            .reindex_requests
            .push((menu_id, item_ids.to_vec()));
        Ok(())
    }
}
