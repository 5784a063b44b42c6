//! Publishing: promote reviewed staged rows into a live menu.
//!
//! All checks run before anything is written. The promotion itself is one
//! [`CatalogPublisher::publish_staged`] call, which either applies every
//! change (items, categories, version bump, staged-row cleanup, status) or
//! none. Reindexing runs afterwards in the background and never affects the
//! response.

use crate::error::IngestError;
use crate::model::{
    Actor, EventKind, IngestionStatus, LifecycleEvent, PublishRequest, PublishResponse,
};
use crate::store::{emit_best_effort, Backends, CatalogPublisher, Reindexer};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PublishService {
    backends: Backends,
    catalog: Arc<dyn CatalogPublisher>,
    reindexer: Option<Arc<dyn Reindexer>>,
}

impl PublishService {
    pub fn new(backends: Backends, catalog: Arc<dyn CatalogPublisher>) -> Self {
        Self {
            backends,
            catalog,
            reindexer: None,
        }
    }

    pub fn with_reindexer(mut self, reindexer: Arc<dyn Reindexer>) -> Self {
        self.reindexer = Some(reindexer);
        self
    }

    pub async fn publish(
        &self,
        actor: &Actor,
        request: PublishRequest,
    ) -> Result<PublishResponse, IngestError> {
        let ingestion = self.backends.load_authorized(actor, request.ingestion_id).await?;

        let menu = self
            .catalog
            .load_menu(request.menu_id)
            .await?
            .ok_or(IngestError::NotFound { entity: "Menu" })?;
        if menu.tenant_id != ingestion.tenant_id || menu.location_id != ingestion.location_id {
            return Err(IngestError::TenantMismatch);
        }

        match ingestion.status {
            IngestionStatus::AwaitingReview => {}
            IngestionStatus::Published => {
                return Err(IngestError::Validation(format!(
                    "Ingestion {} is already published",
                    ingestion.id
                )))
            }
            other => {
                return Err(IngestError::Validation(format!(
                    "Ingestion is '{other}'; only ingestions awaiting review can be published"
                )))
            }
        }

        let staged = self.backends.ingestions.staging_rows(ingestion.id).await?;
        if staged.is_empty() {
            return Err(IngestError::Validation(
                "Nothing staged to publish; process the ingestion first".into(),
            ));
        }

        let counts = self
            .catalog
            .publish_staged(ingestion.id, menu.id)
            .await
            .map_err(|e| {
                if e.is_caller_error() {
                    e
                } else {
                    IngestError::Publish(e.to_string())
                }
            })?;
        info!(
            "Ingestion {}: published {} items into menu {} (version {})",
            ingestion.id, counts.items_upserted, menu.id, counts.version
        );

        emit_best_effort(
            self.backends.events.as_ref(),
            LifecycleEvent::new(
                &ingestion,
                EventKind::Published,
                Some(actor),
                json!({
                    "menu_id": menu.id,
                    "items_upserted": counts.items_upserted,
                    "categories_created": counts.categories_created,
                    "version": counts.version,
                }),
            ),
        )
        .await;

        if let Some(reindexer) = &self.reindexer {
            let reindexer = Arc::clone(reindexer);
            let menu_id = menu.id;
            let item_ids = counts.item_ids.clone();
            tokio::spawn(async move {
                if let Err(e) = reindexer.reindex(menu_id, &item_ids).await {
                    warn!("Reindex of menu {} failed: {}", menu_id, e);
                }
            });
        }

        Ok(PublishResponse {
            published: true,
            items_upserted: counts.items_upserted,
            categories_created: counts.categories_created,
            version: counts.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DocumentKind, Ingestion, Location, RowFlags, StagingRow};
    use crate::store::memory::MemoryBackend;
    use crate::store::IngestionStore;
    use uuid::Uuid;

    fn row(category: &str, name: &str, cents: i64) -> StagingRow {
        StagingRow {
            category: Some(category.into()),
            name: name.into(),
            description: None,
            price_cents: Some(cents),
            currency: "EUR".into(),
            allergens: vec![],
            tags: vec![],
            is_alcohol: false,
            confidence: Some(0.9),
            flags: RowFlags::default(),
            source_pages: vec![1],
        }
    }

    async fn reviewed(backend: &MemoryBackend, location: &Location, rows: &[StagingRow]) -> Ingestion {
        let mut ingestion = Ingestion::new(
            Uuid::new_v4(),
            location,
            "t/i/menu.png".into(),
            DocumentKind::Png,
            Some("EUR".into()),
        );
        ingestion.status = IngestionStatus::AwaitingReview;
        ingestion.items_count = rows.len();
        backend.insert_ingestion(&ingestion).await.unwrap();
        backend.replace_staging_rows(ingestion.id, rows).await.unwrap();
        ingestion
    }

    fn setup() -> (Arc<MemoryBackend>, Actor, Location) {
        let backend = Arc::new(MemoryBackend::new());
        let location = backend.add_location(Uuid::new_v4());
        let actor = Actor::new(Uuid::new_v4());
        backend.grant_staff(&actor, &location);
        (backend, actor, location)
    }

    #[tokio::test]
    async fn publishes_and_reindexes() {
        let (backend, actor, location) = setup();
        let menu = backend.add_menu(&location);
        let ingestion = reviewed(
            &backend,
            &location,
            &[row("Mains", "Stew", 1400), row("Drinks", "Tea", 300)],
        )
        .await;
        let service = PublishService::new(backend.backends(), backend.clone())
            .with_reindexer(backend.clone());

        let response = service
            .publish(&actor, PublishRequest { ingestion_id: ingestion.id, menu_id: menu.id })
            .await
            .unwrap();
        assert!(response.published);
        assert_eq!(response.items_upserted, 2);
        assert_eq!(response.categories_created, 2);
        assert_eq!(response.version, 2);

        let stored = backend.ingestion(ingestion.id).unwrap();
        assert_eq!(stored.status, IngestionStatus::Published);
        assert_eq!(stored.metadata.published_menu_id, Some(menu.id));
        assert!(backend.staged(ingestion.id).is_empty());
        assert!(backend
            .events()
            .iter()
            .any(|e| e.kind == EventKind::Published));

        for _ in 0..50 {
            if !backend.reindex_requests().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let requests = backend.reindex_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, menu.id);
        assert_eq!(requests[0].1.len(), 2);
    }

    #[tokio::test]
    async fn menu_of_another_location_is_rejected() {
        let (backend, actor, location) = setup();
        let elsewhere = backend.add_location(Uuid::new_v4());
        let menu = backend.add_menu(&elsewhere);
        let ingestion = reviewed(&backend, &location, &[row("Mains", "Stew", 1400)]).await;
        let service = PublishService::new(backend.backends(), backend.clone());

        let err = service
            .publish(&actor, PublishRequest { ingestion_id: ingestion.id, menu_id: menu.id })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tenant_mismatch");
        assert_eq!(backend.menu(menu.id).unwrap().version, 1);
        assert_eq!(backend.staged(ingestion.id).len(), 1);
    }

    #[tokio::test]
    async fn only_reviewed_ingestions_publish() {
        let (backend, actor, location) = setup();
        let menu = backend.add_menu(&location);
        let ingestion = reviewed(&backend, &location, &[row("Mains", "Stew", 1400)]).await;
        let mut failed = ingestion.clone();
        failed.status = IngestionStatus::Failed;
        backend.save_ingestion(&failed).await.unwrap();
        let service = PublishService::new(backend.backends(), backend.clone());

        let err = service
            .publish(&actor, PublishRequest { ingestion_id: ingestion.id, menu_id: menu.id })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
        assert!(backend.catalog_items(menu.id).is_empty());
    }

    #[tokio::test]
    async fn empty_staging_is_rejected() {
        let (backend, actor, location) = setup();
        let menu = backend.add_menu(&location);
        let ingestion = reviewed(&backend, &location, &[]).await;
        let service = PublishService::new(backend.backends(), backend.clone());

        let err = service
            .publish(&actor, PublishRequest { ingestion_id: ingestion.id, menu_id: menu.id })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
        assert_eq!(backend.menu(menu.id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn unknown_menu_is_not_found() {
        let (backend, actor, location) = setup();
        let ingestion = reviewed(&backend, &location, &[row("Mains", "Stew", 1400)]).await;
        let service = PublishService::new(backend.backends(), backend.clone());

        let err = service
            .publish(&actor, PublishRequest { ingestion_id: ingestion.id, menu_id: Uuid::new_v4() })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn stranger_sees_not_found_and_nothing_changes() {
        let (backend, _actor, location) = setup();
        let menu = backend.add_menu(&location);
        let ingestion = reviewed(&backend, &location, &[row("Mains", "Stew", 1400)]).await;
        let service = PublishService::new(backend.backends(), backend.clone());
        let stranger = Actor::new(Uuid::new_v4());

        let err = service
            .publish(&stranger, PublishRequest { ingestion_id: ingestion.id, menu_id: menu.id })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(backend.menu(menu.id).unwrap().version, 1);
        assert_eq!(backend.staged(ingestion.id).len(), 1);
        assert!(backend.events().is_empty());
    }
}
