use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tracing::{info, warn};

use crate::{
    audit::AuditLog,
    rates::{ExchangeError, RateProvider, RateSnapshot, query_date},
};

/// Largest day offset accepted from chat clients.
pub const MAX_DAY_OFFSET: i64 = 10;

/// Turns `exchange` queries into rate snapshots for the configured currencies.
pub struct ExchangeService {
    provider: Arc<dyn RateProvider>,
    currencies: Vec<String>,
    audit: Option<AuditLog>,
}

impl ExchangeService {
    pub fn new(provider: Arc<dyn RateProvider>, currencies: Vec<String>) -> Self {
        Self {
            provider,
            currencies,
            audit: None,
        }
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Resolves a query relative to the local calendar date.
    pub async fn resolve(&self, day_offset: i64) -> Result<RateSnapshot, ExchangeError> {
        self.resolve_on(Local::now().date_naive(), day_offset).await
    }

    /// Range-checks `day_offset`, fetches rates for `today - day_offset` and
    /// records the execution in the audit log.
    pub async fn resolve_on(
        &self,
        today: NaiveDate,
        day_offset: i64,
    ) -> Result<RateSnapshot, ExchangeError> {
        let days_back = u64::try_from(day_offset)
            .ok()
            .filter(|_| day_offset <= MAX_DAY_OFFSET)
            .ok_or(ExchangeError::InvalidRange { day_offset })?;
        let date = query_date(today, days_back).ok_or(ExchangeError::InvalidRange { day_offset })?;

        let snapshot = self.snapshot_for(&date).await?;

        if let Some(audit) = &self.audit {
            if let Err(err) = audit.record_exchange(&date).await {
                warn!(path = %audit.path().display(), error = ?err, "failed to write audit line");
            }
        }
        info!(%date, "exchange command executed");

        Ok(snapshot)
    }

    /// Fetches and shapes rates for an already formatted date.
    pub async fn snapshot_for(&self, date: &str) -> Result<RateSnapshot, ExchangeError> {
        let response = self.provider.fetch(date).await?;
        let entries = response
            .exchange_rate
            .ok_or_else(|| ExchangeError::NoDataForDate {
                date: date.to_string(),
            })?;

        Ok(RateSnapshot::from_entries(date, &self.currencies, &entries))
    }
}
