//! Core domain model and error taxonomy for SPRO.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "spro-core";

/// Caller-visible failure taxonomy shared by every workflow operation.
///
/// The web layer maps these onto HTTP statuses (404 / 403 / 400 / 502);
/// nothing below the web layer knows about HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    /// Catalog gateway unreachable or returned a malformed payload. The
    /// unmasked cause is logged at the call site; the message here is what
    /// callers are allowed to see.
    #[error("{0}")]
    Upstream(String),
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Verified identity threaded explicitly through every guarded operation.
/// Supplied by the upstream identity proxy; the role is trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    pub fn pm(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Pm,
        }
    }

    pub fn is_pm(&self) -> bool {
        self.role == Role::Pm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "PM")]
    Pm,
}

impl Role {
    pub fn parse(label: &str) -> WorkflowResult<Self> {
        match label {
            "PM" | "pm" => Ok(Role::Pm),
            "user" | "User" => Ok(Role::User),
            other => Err(WorkflowError::BadRequest(format!(
                "unknown principal role `{other}`"
            ))),
        }
    }
}

/// Negotiation cycle. The catalog's own spelling (`Cycle1` / `Cycle2`) is
/// canonical; [`CycleStatus::parse`] also folds the legacy spellings
/// (`cycle_one`, `cycle1`, ...) that older payloads carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleStatus {
    #[serde(rename = "Cycle1")]
    CycleOne,
    #[serde(rename = "Cycle2")]
    CycleTwo,
}

impl CycleStatus {
    pub fn parse(label: &str) -> WorkflowResult<Self> {
        let folded: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "cycle1" | "cycleone" => Ok(CycleStatus::CycleOne),
            "cycle2" | "cycletwo" => Ok(CycleStatus::CycleTwo),
            _ => Err(WorkflowError::BadRequest(format!(
                "unknown cycle label `{label}`"
            ))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleStatus::CycleOne => "Cycle1",
            CycleStatus::CycleTwo => "Cycle2",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "assigned")]
    Assigned,
    PmOfferEvaluation,
    #[serde(rename = "published")]
    Published,
    #[serde(rename = "approved")]
    Approved,
    #[serde(rename = "rejected")]
    Rejected,
    UserOfferReEvaluation,
    OrderCreated,
}

impl RequestStatus {
    pub fn parse(label: &str) -> WorkflowResult<Self> {
        match label.to_ascii_lowercase().as_str() {
            "draft" => Ok(RequestStatus::Draft),
            "submitted" => Ok(RequestStatus::Submitted),
            "assigned" => Ok(RequestStatus::Assigned),
            "pmofferevaluation" => Ok(RequestStatus::PmOfferEvaluation),
            "published" => Ok(RequestStatus::Published),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "userofferreevaluation" => Ok(RequestStatus::UserOfferReEvaluation),
            "ordercreated" => Ok(RequestStatus::OrderCreated),
            other => Err(WorkflowError::BadRequest(format!(
                "unknown service request status `{other}`"
            ))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::Submitted => "submitted",
            RequestStatus::Assigned => "assigned",
            RequestStatus::PmOfferEvaluation => "PmOfferEvaluation",
            RequestStatus::Published => "published",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::UserOfferReEvaluation => "UserOfferReEvaluation",
            RequestStatus::OrderCreated => "OrderCreated",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferStatus {
    Pending,
    Selected,
    Approved,
    Rejected,
    #[serde(rename = "No Offers")]
    NoOffers,
    #[serde(rename = "Revisions Requested")]
    RevisionsRequested,
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OfferStatus::Pending => "Pending",
            OfferStatus::Selected => "Selected",
            OfferStatus::Approved => "Approved",
            OfferStatus::Rejected => "Rejected",
            OfferStatus::NoOffers => "No Offers",
            OfferStatus::RevisionsRequested => "Revisions Requested",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Single,
    Multi,
    Team,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationType {
    Onshore,
    Nearshore,
    Farshore,
}

/// One append-only audit entry on a service request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub message: String,
}

impl Notification {
    pub fn now(actor: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            actor: actor.into(),
            message: message.into(),
        }
    }
}

/// One requested staffing slot, with the role already resolved against the
/// agreement catalog (`role_id` is the concrete catalog role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffingRequirement {
    pub domain_id: i64,
    pub domain_name: String,
    pub role_id: i64,
    pub role: String,
    pub level: String,
    pub technology_level: String,
    pub number_of_profiles_needed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub agreement_id: i64,
    pub agreement_name: String,
    pub task_description: String,
    pub request_type: RequestType,
    pub project: String,
    pub begin: NaiveDate,
    pub end: NaiveDate,
    pub amount_of_man_days: u32,
    pub location: String,
    pub location_type: LocationType,
    pub information_for_provider_manager: Option<String>,
    /// Derived: sum of `number_of_profiles_needed` over `selected_members`.
    pub number_of_specialists: u32,
    pub number_of_offers: u32,
    pub consumer: String,
    pub representatives: Vec<String>,
    pub selected_domains: Vec<i64>,
    pub selected_members: Vec<StaffingRequirement>,
    pub status: RequestStatus,
    pub cycle_status: CycleStatus,
    /// Set exactly once, at assignment.
    pub provider_manager_id: Option<String>,
    pub notifications: Vec<Notification>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pre-validation handoff contract for creating or editing a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequestDraft {
    pub agreement_id: i64,
    pub agreement_name: String,
    pub task_description: String,
    pub request_type: RequestType,
    pub project: String,
    pub begin: NaiveDate,
    pub end: NaiveDate,
    pub amount_of_man_days: u32,
    pub location: String,
    pub location_type: LocationType,
    #[serde(default)]
    pub information_for_provider_manager: Option<String>,
    pub number_of_offers: u32,
    pub consumer: String,
    pub representatives: Vec<String>,
    pub selected_domains: Vec<i64>,
    pub selected_members: Vec<StaffingRequest>,
}

/// A requested slot before role resolution: no `role_id` yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffingRequest {
    pub domain_id: i64,
    pub role: String,
    pub level: String,
    pub technology_level: String,
    pub number_of_profiles_needed: u32,
}

/// Resubmission payload: a mandatory comment plus optional field edits
/// applied before the request goes back to `submitted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResubmissionUpdate {
    pub comment: String,
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub begin: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub location_type: Option<LocationType>,
    #[serde(default)]
    pub number_of_offers: Option<u32>,
    #[serde(default)]
    pub representatives: Option<Vec<String>>,
    #[serde(default)]
    pub information_for_provider_manager: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeProfile {
    pub employee_id: String,
    pub employee_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub service_request_id: Uuid,
    pub domain_id: i64,
    pub domain_name: Option<String>,
    pub role: String,
    pub level: String,
    pub technology_level: String,
    pub provider_id: Option<i64>,
    pub provider_name: Option<String>,
    pub price: Option<f64>,
    pub cycle: CycleStatus,
    pub employee_profiles: Vec<EmployeeProfile>,
    pub status: OfferStatus,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    /// Structural invariant of the `No Offers` placeholder: no provider, no
    /// price, no profiles.
    pub fn is_placeholder(&self) -> bool {
        self.status == OfferStatus::NoOffers
            && self.provider_id.is_none()
            && self.price.is_none()
            && self.employee_profiles.is_empty()
    }
}

/// Immutable priced artifact consolidating the selected offers of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub service_request_id: Uuid,
    pub agreement_id: i64,
    pub agreement_name: String,
    pub task_description: String,
    pub request_type: RequestType,
    pub project: String,
    pub begin: NaiveDate,
    pub end: NaiveDate,
    pub amount_of_man_days: u32,
    pub location: String,
    pub information_for_provider_manager: Option<String>,
    pub number_of_specialists: u32,
    pub consumer: String,
    pub created_by: String,
    /// Denormalized snapshot, not references.
    pub approved_offers: Vec<Offer>,
    pub total_price: f64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

// --- Agreement catalog shapes (external reference data) ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub agreement_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainGroup {
    pub domain_id: i64,
    pub domain_name: String,
    pub role_details: Vec<RoleDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDetail {
    pub role_id: i64,
    pub provider_id: i64,
    pub provider_name: String,
    pub role: String,
    pub level: String,
    pub technology_level: String,
    /// Ceiling price per the agreement; generated offers discount from it.
    pub price: f64,
    pub cycle: CycleStatus,
}

/// Randomness seam for offer synthesis. Generated prices and staffing names
/// are deliberately not reproducible in production, so tests inject a
/// scripted implementation and assert on bounds instead of exact values.
pub trait PriceRandomness: Send + Sync {
    /// Uniform draw from `[0, 0.2)`, the discount applied to ceiling prices.
    fn discount_factor(&self) -> f64;

    /// Index into a candidate pool of length `len` (`len > 0`).
    fn pick_index(&self, len: usize) -> usize;
}

/// Production source backed by the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngRandomness;

impl PriceRandomness for ThreadRngRandomness {
    fn discount_factor(&self) -> f64 {
        use rand::Rng;
        rand::thread_rng().gen_range(0.0..0.2)
    }

    fn pick_index(&self, len: usize) -> usize {
        use rand::Rng;
        rand::thread_rng().gen_range(0..len)
    }
}

/// Round to two decimals, the precision of every price on the wire.
pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
