//! Exchange-rate data and the upstream provider that serves it.
//!
//! The upstream feed answers `GET <base>?json&date=DD.MM.YYYY` with an
//! `exchangeRate` array. Only `currency`, `saleRateNB` and `purchaseRateNB`
//! are read; everything else in the payload is ignored.

use std::{collections::BTreeMap, fmt, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize, ser::SerializeMap};
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "https://api.privatbank.ua/p24api/exchange_rates";

/// Date layout the upstream API expects and snapshots are keyed by.
pub const DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Shown verbatim to the client that asked.
    #[error(
        "Invalid index for exchange command. Please use 'exchange' or 'exchange <index>' (2-10 days)."
    )]
    InvalidRange { day_offset: i64 },
    #[error("exchange rate service unavailable: {reason}")]
    UpstreamUnavailable { reason: String },
    #[error("no exchange rates found for {date}")]
    NoDataForDate { date: String },
}

/// Raw upstream payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RatesResponse {
    #[serde(rename = "exchangeRate")]
    pub exchange_rate: Option<Vec<RateEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateEntry {
    pub currency: String,
    #[serde(rename = "saleRateNB")]
    pub sale_rate_nb: f64,
    #[serde(rename = "purchaseRateNB")]
    pub purchase_rate_nb: f64,
}

impl RateEntry {
    pub fn new(currency: impl Into<String>, sale: f64, purchase: f64) -> Self {
        Self {
            currency: currency.into(),
            sale_rate_nb: sale,
            purchase_rate_nb: purchase,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CurrencyRate {
    pub sale: f64,
    pub purchase: f64,
}

/// Rates for one date, restricted to the configured currency set.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSnapshot {
    date: String,
    rates: BTreeMap<String, CurrencyRate>,
}

impl RateSnapshot {
    /// Every configured currency starts at zero and is overwritten by the
    /// matching upstream entry, if there is one.
    pub fn from_entries(date: impl Into<String>, currencies: &[String], entries: &[RateEntry]) -> Self {
        let mut rates: BTreeMap<String, CurrencyRate> = currencies
            .iter()
            .map(|code| (code.clone(), CurrencyRate::default()))
            .collect();

        for entry in entries {
            if let Some(rate) = rates.get_mut(&entry.currency) {
                *rate = CurrencyRate {
                    sale: entry.sale_rate_nb,
                    purchase: entry.purchase_rate_nb,
                };
            }
        }

        Self {
            date: date.into(),
            rates,
        }
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn rates(&self) -> &BTreeMap<String, CurrencyRate> {
        &self.rates
    }

    pub fn get(&self, currency: &str) -> Option<CurrencyRate> {
        self.rates.get(currency).copied()
    }
}

/// Serializes as `{"<date>": {"<CUR>": {"sale": .., "purchase": ..}}}`.
impl Serialize for RateSnapshot {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.date, &self.rates)?;
        map.end()
    }
}

/// Compact JSON, the form broadcast to clients.
impl fmt::Display for RateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

/// `today` minus `days_back`, formatted for the upstream API.
///
/// `None` only when the subtraction leaves chrono's supported range.
pub fn query_date(today: NaiveDate, days_back: u64) -> Option<String> {
    today
        .checked_sub_days(Days::new(days_back))
        .map(|date| date.format(DATE_FORMAT).to_string())
}

/// Source of raw exchange-rate data for a date.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn fetch(&self, date: &str) -> Result<RatesResponse, ExchangeError>;
}

/// [`RateProvider`] backed by the PrivatBank public JSON API.
pub struct HttpRateProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRateProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn fetch(&self, date: &str) -> Result<RatesResponse, ExchangeError> {
        let url = format!("{}?json&date={date}", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| ExchangeError::UpstreamUnavailable {
                reason: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExchangeError::UpstreamUnavailable {
                reason: format!("error status {status} for {url}"),
            });
        }

        response
            .json::<RatesResponse>()
            .await
            .map_err(|err| ExchangeError::UpstreamUnavailable {
                reason: format!("undecodable response from {url}: {err}"),
            })
    }
}
