//! In-memory document store for SPRO.
//!
//! Stands in for the external persistence collaborator. Every compound
//! operation whose consistency matters (conditional assignment, per-cycle
//! offer regeneration, order consolidation) executes under a single write
//! lock, so check-then-write sequences cannot interleave.

use std::collections::HashMap;

use chrono::Utc;
use spro_core::{
    Agreement, CycleStatus, DomainGroup, Offer, OfferStatus, Order, RequestStatus, ServiceRequest,
    WorkflowError, WorkflowResult,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "spro-store";

#[derive(Default)]
struct StoreInner {
    requests: HashMap<Uuid, ServiceRequest>,
    offers: HashMap<Uuid, Offer>,
    orders: HashMap<Uuid, Order>,
    agreements: Vec<Agreement>,
    catalog_details: HashMap<i64, Vec<DomainGroup>>,
}

#[derive(Default)]
pub struct DocumentStore {
    inner: RwLock<StoreInner>,
}

/// Result of an atomic per-cycle regeneration attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Offers for the current cycle already existed; nothing was written.
    Existing(Vec<Offer>),
    /// The candidate batch was inserted.
    Generated(Vec<Offer>),
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- service requests ---

    pub async fn insert_request(&self, request: ServiceRequest) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        if inner.requests.contains_key(&request.id) {
            return Err(WorkflowError::BadRequest(format!(
                "service request {} already exists",
                request.id
            )));
        }
        debug!(request_id = %request.id, "storing service request");
        inner.requests.insert(request.id, request);
        Ok(())
    }

    pub async fn request(&self, id: Uuid) -> WorkflowResult<ServiceRequest> {
        self.inner
            .read()
            .await
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound("service request not found".into()))
    }

    pub async fn requests(&self) -> Vec<ServiceRequest> {
        let mut all: Vec<_> = self.inner.read().await.requests.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    /// Conditional update: the closure runs with the write lock held, so its
    /// guards and its mutation are one atomic step. `updated_at` is bumped on
    /// success.
    pub async fn update_request<F>(&self, id: Uuid, mutate: F) -> WorkflowResult<ServiceRequest>
    where
        F: FnOnce(&mut ServiceRequest) -> WorkflowResult<()>,
    {
        let mut inner = self.inner.write().await;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound("service request not found".into()))?;
        mutate(request)?;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    /// Like [`DocumentStore::update_request`], but the closure also sees the
    /// request's offers as read under the same write lock. Offer-dependent
    /// guards therefore cannot be invalidated by a concurrent offer mutation
    /// between the check and the status flip.
    pub async fn update_request_with_offers<F>(
        &self,
        id: Uuid,
        mutate: F,
    ) -> WorkflowResult<ServiceRequest>
    where
        F: FnOnce(&mut ServiceRequest, &[Offer]) -> WorkflowResult<()>,
    {
        let mut inner = self.inner.write().await;
        let mut offers: Vec<_> = inner
            .offers
            .values()
            .filter(|o| o.service_request_id == id)
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.created_at);
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound("service request not found".into()))?;
        mutate(request, &offers)?;
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    // --- offers ---

    pub async fn offer(&self, id: Uuid) -> WorkflowResult<Offer> {
        self.inner
            .read()
            .await
            .offers
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound("offer not found".into()))
    }

    pub async fn offers_for_request(&self, request_id: Uuid) -> Vec<Offer> {
        let mut offers: Vec<_> = self
            .inner
            .read()
            .await
            .offers
            .values()
            .filter(|o| o.service_request_id == request_id)
            .cloned()
            .collect();
        offers.sort_by_key(|o| o.created_at);
        offers
    }

    pub async fn update_offer<F>(&self, id: Uuid, mutate: F) -> WorkflowResult<Offer>
    where
        F: FnOnce(&mut Offer) -> WorkflowResult<()>,
    {
        let mut inner = self.inner.write().await;
        let offer = inner
            .offers
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound("offer not found".into()))?;
        mutate(offer)?;
        Ok(offer.clone())
    }

    /// Atomic cycle transition for a request's offer set: drops offers of
    /// every other cycle, then inserts `candidates` unless offers for
    /// `cycle` already exist. Concurrent callers for the same (request,
    /// cycle) therefore produce exactly one generated batch.
    pub async fn replace_cycle_offers(
        &self,
        request_id: Uuid,
        cycle: CycleStatus,
        candidates: Vec<Offer>,
    ) -> GenerationOutcome {
        let mut inner = self.inner.write().await;

        let stale: Vec<Uuid> = inner
            .offers
            .values()
            .filter(|o| o.service_request_id == request_id && o.cycle != cycle)
            .map(|o| o.id)
            .collect();
        if !stale.is_empty() {
            debug!(
                request_id = %request_id,
                cycle = %cycle,
                dropped = stale.len(),
                "discarding offers from other cycles"
            );
        }
        for id in stale {
            inner.offers.remove(&id);
        }

        let mut existing: Vec<_> = inner
            .offers
            .values()
            .filter(|o| o.service_request_id == request_id && o.cycle == cycle)
            .cloned()
            .collect();
        if !existing.is_empty() {
            existing.sort_by_key(|o| o.created_at);
            return GenerationOutcome::Existing(existing);
        }

        for offer in &candidates {
            inner.offers.insert(offer.id, offer.clone());
        }
        GenerationOutcome::Generated(candidates)
    }

    // --- orders ---

    /// Transactional order consolidation. Reads the request and its
    /// `Selected` offers, lets `build` produce the snapshot, then persists
    /// the order, marks the request `OrderCreated` and flips the selected
    /// offers to `Approved` — all under one write lock, so a racing offer
    /// mutation cannot slip between pricing and the status flip.
    pub async fn consolidate_order<F>(&self, request_id: Uuid, build: F) -> WorkflowResult<Order>
    where
        F: FnOnce(&ServiceRequest, &[Offer]) -> Order,
    {
        let mut inner = self.inner.write().await;

        let request = inner
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound("service request not found".into()))?;

        let mut selected: Vec<_> = inner
            .offers
            .values()
            .filter(|o| o.service_request_id == request_id && o.status == OfferStatus::Selected)
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(WorkflowError::BadRequest(
                "no selected offers found to create an order".into(),
            ));
        }
        selected.sort_by_key(|o| o.created_at);

        let order = build(&request, &selected);
        if inner.orders.contains_key(&order.id) {
            return Err(WorkflowError::BadRequest(format!(
                "order {} already exists",
                order.id
            )));
        }

        for offer in &selected {
            if let Some(stored) = inner.offers.get_mut(&offer.id) {
                stored.status = OfferStatus::Approved;
            }
        }
        if let Some(stored) = inner.requests.get_mut(&request_id) {
            stored.status = RequestStatus::OrderCreated;
            stored.updated_at = Utc::now();
        }

        debug!(order_id = %order.id, request_id = %request_id, "order consolidated");
        inner.orders.insert(order.id, order.clone());
        Ok(order)
    }

    pub async fn order(&self, id: Uuid) -> WorkflowResult<Order> {
        self.inner
            .read()
            .await
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound("order not found".into()))
    }

    pub async fn orders(&self) -> Vec<Order> {
        let mut all: Vec<_> = self.inner.read().await.orders.values().cloned().collect();
        all.sort_by_key(|o| o.created_at);
        all
    }

    // --- cached catalog reference data ---

    pub async fn store_agreements(&self, agreements: Vec<Agreement>) {
        self.inner.write().await.agreements = agreements;
    }

    pub async fn agreements(&self) -> Vec<Agreement> {
        self.inner.read().await.agreements.clone()
    }

    pub async fn cached_details(&self, agreement_id: i64) -> Option<Vec<DomainGroup>> {
        self.inner
            .read()
            .await
            .catalog_details
            .get(&agreement_id)
            .cloned()
    }

    pub async fn store_details(&self, agreement_id: i64, groups: Vec<DomainGroup>) {
        self.inner
            .write()
            .await
            .catalog_details
            .insert(agreement_id, groups);
    }
}
