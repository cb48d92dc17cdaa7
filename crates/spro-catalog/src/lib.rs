//! Agreement catalog gateway: remote source, static seed source, and the
//! cache-through service the workflow core consumes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use spro_core::{Agreement, CycleStatus, DomainGroup, RoleDetail, WorkflowError, WorkflowResult};
use spro_store::DocumentStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "spro-catalog";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("SPRO_CATALOG_URL")
                .unwrap_or_else(|_| "http://localhost:9090/master-agreements".to_string()),
            http_timeout_secs: std::env::var("SPRO_CATALOG_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            scheduler_enabled: std::env::var("SPRO_CATALOG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: std::env::var("SPRO_CATALOG_REFRESH_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

/// Where agreement reference data comes from. Implemented by the remote
/// gateway and by the in-process seed used for demos and tests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn agreements(&self) -> WorkflowResult<Vec<Agreement>>;
    async fn agreement_details(&self, agreement_id: i64) -> WorkflowResult<Vec<DomainGroup>>;
}

// --- remote HTTP source ---

/// The upstream contract is best-effort JSON, so every field that has been
/// observed to drift (string vs numeric prices, cycle label spellings,
/// missing role ids) is absorbed here rather than trusted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAgreement {
    agreement_id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDomain {
    domain_id: i64,
    domain_name: String,
    #[serde(default)]
    role_details: Vec<WireRoleDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRoleDetail {
    #[serde(default)]
    role_id: Option<i64>,
    provider_id: i64,
    provider_name: String,
    role: String,
    level: String,
    technology_level: String,
    #[serde(deserialize_with = "flexible_price")]
    price: f64,
    cycle: String,
}

/// Accepts `"800.00"` and `800.0` alike.
fn flexible_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom),
    }
}

pub fn parse_agreements_payload(body: &[u8]) -> WorkflowResult<Vec<Agreement>> {
    let wire: Vec<WireAgreement> = serde_json::from_slice(body).map_err(|err| {
        warn!(error = %err, "malformed agreements payload from catalog gateway");
        WorkflowError::Upstream("catalog gateway returned a malformed response".into())
    })?;
    Ok(wire
        .into_iter()
        .map(|a| Agreement {
            agreement_id: a.agreement_id,
            name: a.name,
        })
        .collect())
}

/// Normalize one details payload into [`DomainGroup`]s. Role rows with a
/// cycle label that does not normalize are dropped with a warning; a missing
/// `roleId` falls back to the row's position within its domain, which is
/// stable for a given payload.
pub fn parse_details_payload(agreement_id: i64, body: &[u8]) -> WorkflowResult<Vec<DomainGroup>> {
    let wire: Vec<WireDomain> = serde_json::from_slice(body).map_err(|err| {
        warn!(agreement_id, error = %err, "malformed details payload from catalog gateway");
        WorkflowError::Upstream("catalog gateway returned a malformed response".into())
    })?;

    let mut groups = Vec::with_capacity(wire.len());
    for domain in wire {
        let mut role_details = Vec::with_capacity(domain.role_details.len());
        for (position, row) in domain.role_details.into_iter().enumerate() {
            let cycle = match CycleStatus::parse(&row.cycle) {
                Ok(cycle) => cycle,
                Err(_) => {
                    warn!(
                        agreement_id,
                        domain_id = domain.domain_id,
                        cycle = %row.cycle,
                        "dropping catalog role row with unknown cycle label"
                    );
                    continue;
                }
            };
            role_details.push(RoleDetail {
                role_id: row.role_id.unwrap_or(position as i64 + 1),
                provider_id: row.provider_id,
                provider_name: row.provider_name,
                role: row.role,
                level: row.level,
                technology_level: row.technology_level,
                price: row.price,
                cycle,
            });
        }
        groups.push(DomainGroup {
            domain_id: domain.domain_id,
            domain_name: domain.domain_name,
            role_details,
        });
    }
    Ok(groups)
}

pub struct HttpCatalogSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogSource {
    pub fn new(config: &CatalogConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building catalog http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_bytes(&self, url: &str) -> WorkflowResult<Vec<u8>> {
        let response = self.client.get(url).send().await.map_err(|err| {
            warn!(url, error = %err, "catalog gateway request failed");
            WorkflowError::Upstream("catalog gateway is unreachable".into())
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(WorkflowError::NotFound("master agreement not found".into()));
        }
        if !status.is_success() {
            warn!(url, status = status.as_u16(), "catalog gateway returned an error status");
            return Err(WorkflowError::Upstream(
                "catalog gateway returned an error".into(),
            ));
        }

        let body = response.bytes().await.map_err(|err| {
            warn!(url, error = %err, "catalog gateway body read failed");
            WorkflowError::Upstream("catalog gateway is unreachable".into())
        })?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    async fn agreements(&self) -> WorkflowResult<Vec<Agreement>> {
        let url = format!("{}/established-agreements", self.base_url);
        debug!(%url, "fetching established agreements");
        let body = self.get_bytes(&url).await?;
        parse_agreements_payload(&body)
    }

    async fn agreement_details(&self, agreement_id: i64) -> WorkflowResult<Vec<DomainGroup>> {
        let url = format!("{}/established-agreements/{agreement_id}", self.base_url);
        debug!(%url, "fetching agreement details");
        let body = self.get_bytes(&url).await?;
        parse_details_payload(agreement_id, &body)
    }
}

// --- in-process seed source ---

/// Seed catalog mirroring the reference agreements the provider portal
/// exposes. Used in demo mode and by tests.
pub struct StaticCatalogSource {
    agreements: Vec<Agreement>,
    details: HashMap<i64, Vec<DomainGroup>>,
}

impl Default for StaticCatalogSource {
    fn default() -> Self {
        Self::seeded()
    }
}

impl StaticCatalogSource {
    pub fn new(agreements: Vec<Agreement>, details: HashMap<i64, Vec<DomainGroup>>) -> Self {
        Self {
            agreements,
            details,
        }
    }

    pub fn seeded() -> Self {
        fn role(
            role_id: i64,
            provider_id: i64,
            provider_name: &str,
            role: &str,
            level: &str,
            price: f64,
            cycle: CycleStatus,
        ) -> RoleDetail {
            RoleDetail {
                role_id,
                provider_id,
                provider_name: provider_name.into(),
                role: role.into(),
                level: level.into(),
                technology_level: "Common".into(),
                price,
                cycle,
            }
        }

        let agreements = vec![
            Agreement {
                agreement_id: 123,
                name: "Master Agreement A".into(),
            },
            Agreement {
                agreement_id: 124,
                name: "Master Agreement B".into(),
            },
            Agreement {
                agreement_id: 125,
                name: "Master Agreement C".into(),
            },
        ];

        let mut details = HashMap::new();
        details.insert(
            123,
            vec![DomainGroup {
                domain_id: 1,
                domain_name: "IT Security".into(),
                role_details: vec![
                    role(1, 1006, "jonasbecker", "Security Engineer", "Junior", 800.0, CycleStatus::CycleTwo),
                    role(2, 1007, "lukasfischer", "Security Engineer", "Junior", 800.0, CycleStatus::CycleOne),
                    role(3, 1005, "michaelschmidt", "Security Engineer", "Junior", 800.0, CycleStatus::CycleOne),
                    role(4, 1008, "leonwagner", "Security Engineer", "Junior", 800.0, CycleStatus::CycleTwo),
                ],
            }],
        );
        details.insert(
            124,
            vec![DomainGroup {
                domain_id: 1,
                domain_name: "IT Security".into(),
                role_details: vec![
                    role(1, 1005, "michaelschmidt", "Security Engineer", "Junior", 800.0, CycleStatus::CycleOne),
                    role(2, 1005, "michaelschmidt", "Security Engineer", "Intermediate", 900.0, CycleStatus::CycleTwo),
                    role(3, 1005, "michaelschmidt", "Security Engineer", "Senior", 1000.0, CycleStatus::CycleTwo),
                    role(4, 1006, "jonasbecker", "Security Engineer", "Junior", 800.0, CycleStatus::CycleTwo),
                    role(5, 1006, "jonasbecker", "Security Engineer", "Intermediate", 900.0, CycleStatus::CycleTwo),
                    role(6, 1006, "jonasbecker", "Security Engineer", "Senior", 1000.0, CycleStatus::CycleTwo),
                    role(7, 1007, "lukasfischer", "Security Engineer", "Junior", 800.0, CycleStatus::CycleTwo),
                ],
            }],
        );
        details.insert(
            125,
            vec![
                DomainGroup {
                    domain_id: 1,
                    domain_name: "IT Security".into(),
                    role_details: vec![
                        role(1, 1005, "michaelschmidt", "Information Security Management Systems (ISMS) Manager", "Junior", 800.0, CycleStatus::CycleTwo),
                        role(2, 1005, "michaelschmidt", "Information Security Management Systems (ISMS) Manager", "Intermediate", 900.0, CycleStatus::CycleTwo),
                        role(3, 1005, "michaelschmidt", "Information Security Management Systems (ISMS) Manager", "Senior", 1000.0, CycleStatus::CycleOne),
                    ],
                },
                DomainGroup {
                    domain_id: 2,
                    domain_name: "Data".into(),
                    role_details: vec![
                        role(4, 1005, "michaelschmidt", "Data Analyst", "Junior", 1000.0, CycleStatus::CycleTwo),
                        role(5, 1006, "jonasbecker", "Data Analyst", "Intermediate", 1100.0, CycleStatus::CycleTwo),
                    ],
                },
            ],
        );

        Self {
            agreements,
            details,
        }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn agreements(&self) -> WorkflowResult<Vec<Agreement>> {
        Ok(self.agreements.clone())
    }

    async fn agreement_details(&self, agreement_id: i64) -> WorkflowResult<Vec<DomainGroup>> {
        self.details
            .get(&agreement_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound("master agreement not found".into()))
    }
}

// --- cache-through service ---

pub struct CatalogService {
    source: Arc<dyn CatalogSource>,
    store: Arc<DocumentStore>,
}

impl CatalogService {
    pub fn new(source: Arc<dyn CatalogSource>, store: Arc<DocumentStore>) -> Self {
        Self { source, store }
    }

    pub async fn agreements(&self) -> WorkflowResult<Vec<Agreement>> {
        match self.source.agreements().await {
            Ok(agreements) => {
                self.store.store_agreements(agreements.clone()).await;
                Ok(agreements)
            }
            Err(err) => {
                let cached = self.store.agreements().await;
                if cached.is_empty() {
                    Err(err)
                } else {
                    warn!(error = %err, "catalog source unavailable, serving cached agreements");
                    Ok(cached)
                }
            }
        }
    }

    /// Cache-first details lookup. A cold cache falls back to the source;
    /// both paths are regrouped into the same [`DomainGroup`] shape. An
    /// agreement with no usable role rows is a `NotFound`, matching how the
    /// gateway reports unknown agreements.
    pub async fn details(&self, agreement_id: i64) -> WorkflowResult<Vec<DomainGroup>> {
        if let Some(cached) = self.store.cached_details(agreement_id).await {
            if !cached.is_empty() {
                return Ok(regroup_domains(cached));
            }
        }

        let fetched = self.source.agreement_details(agreement_id).await?;
        let grouped = regroup_domains(fetched);
        if grouped.iter().all(|g| g.role_details.is_empty()) {
            return Err(WorkflowError::NotFound(format!(
                "no details found for master agreement {agreement_id}"
            )));
        }

        self.store
            .store_details(agreement_id, grouped.clone())
            .await;
        info!(agreement_id, domains = grouped.len(), "cached agreement details");
        Ok(grouped)
    }

    /// Full re-sync: agreements plus the details of each, replacing the
    /// cache. Individual detail failures are logged and skipped so one bad
    /// agreement cannot wedge the refresh.
    pub async fn refresh_all(&self) -> WorkflowResult<usize> {
        let agreements = self.source.agreements().await?;
        self.store.store_agreements(agreements.clone()).await;

        let mut refreshed = 0usize;
        for agreement in &agreements {
            match self.source.agreement_details(agreement.agreement_id).await {
                Ok(details) => {
                    self.store
                        .store_details(agreement.agreement_id, regroup_domains(details))
                        .await;
                    refreshed += 1;
                }
                Err(err) => {
                    warn!(
                        agreement_id = agreement.agreement_id,
                        error = %err,
                        "skipping agreement during catalog refresh"
                    );
                }
            }
        }
        info!(refreshed, total = agreements.len(), "catalog refresh complete");
        Ok(refreshed)
    }
}

/// Merge duplicate domain ids and keep role rows grouped under one entry per
/// domain, regardless of which path (cache or source) produced them.
pub fn regroup_domains(groups: Vec<DomainGroup>) -> Vec<DomainGroup> {
    let mut merged: Vec<DomainGroup> = Vec::new();
    for group in groups {
        match merged.iter_mut().find(|g| g.domain_id == group.domain_id) {
            Some(existing) => existing.role_details.extend(group.role_details),
            None => merged.push(group),
        }
    }
    merged
}

/// Env-gated periodic refresh, mirroring the upstream portal's sync job.
pub async fn maybe_build_scheduler(
    config: &CatalogConfig,
    service: Arc<CatalogService>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            if let Err(err) = service.refresh_all().await {
                warn!(error = %err, "scheduled catalog refresh failed");
            }
        })
    })
    .with_context(|| format!("creating catalog refresh job for cron {cron}"))?;
    sched.add(job).await.context("adding catalog refresh job")?;
    Ok(Some(sched))
}
