//! Request-scoped context.
//!
//! Every engine call receives a [`RequestContext`] naming the tenant (the posyandu or village
//! whose data is addressed), the worker performing the call, and the instant the request was
//! received. Derived values such as gestational age or a child's age in months are computed from
//! [`RequestContext::today`], so the same context always yields the same answers.

use crate::validation::validate_tenant_id;
use crate::KiaResult;
use chrono::{DateTime, NaiveDate, Utc};
use kia_types::NonEmptyText;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated tenant identifier, safe for use as a directory name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(input: &str) -> KiaResult<Self> {
        let trimmed = input.trim();
        validate_tenant_id(trimmed)?;
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = crate::KiaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// The kader performing a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerRef {
    pub id: NonEmptyText,
    pub name: NonEmptyText,
}

impl WorkerRef {
    pub fn new(id: impl AsRef<str>, name: impl AsRef<str>) -> KiaResult<Self> {
        Ok(Self {
            id: NonEmptyText::new(id)?,
            name: NonEmptyText::new(name)?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    tenant: TenantId,
    worker: WorkerRef,
    received_at: DateTime<Utc>,
}

impl RequestContext {
    /// Context for a request received now.
    pub fn new(tenant: TenantId, worker: WorkerRef) -> Self {
        Self::at(tenant, worker, Utc::now())
    }

    /// Context for a request received at a fixed instant.
    pub fn at(tenant: TenantId, worker: WorkerRef, received_at: DateTime<Utc>) -> Self {
        Self {
            tenant,
            worker,
            received_at,
        }
    }

    /// Context for a request received at midday UTC on `date`.
    pub fn on(tenant: TenantId, worker: WorkerRef, date: NaiveDate) -> Self {
        let noon = date
            .and_hms_opt(12, 0, 0)
            .unwrap_or_default()
            .and_utc();
        Self::at(tenant, worker, noon)
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn worker(&self) -> &WorkerRef {
        &self.worker
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn today(&self) -> NaiveDate {
        self.received_at.date_naive()
    }
}
