//! Deterministic provider serving records from a JSON document.
//!
//! ```json
//! {
//!   "provider": "fixture",
//!   "records": [
//!     {"entity_id": "AAPL", "occurred_on": "2024-03-01", "kind": "close_price", "price": 180.5, "currency": "USD"}
//!   ],
//!   "failures": [
//!     {"entity_id": "MSFT", "kind": "unavailable", "times": 2}
//!   ]
//! }
//! ```
//!
//! A failure without `times` fails every call for that entity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;

use crate::provider::{
    MarketDataProvider, OperationClass, ProviderError, ProviderErrorKind, ProviderFuture,
};
use crate::{CoreError, EntityId, Item, Payload, Record};

#[derive(Debug, Deserialize)]
struct FixtureDocument {
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    failures: Vec<FailureEntry>,
}

#[derive(Debug, Deserialize)]
struct FailureEntry {
    entity_id: EntityId,
    kind: ProviderErrorKind,
    #[serde(default)]
    times: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct ScriptedFailure {
    kind: ProviderErrorKind,
    /// `None` fails forever.
    remaining: Option<u32>,
}

pub struct FixtureProvider {
    id: String,
    records: BTreeMap<EntityId, Vec<Record>>,
    failures: Mutex<HashMap<EntityId, ScriptedFailure>>,
    calls: Mutex<HashMap<EntityId, u32>>,
    latency: Duration,
}

impl FixtureProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            records: BTreeMap::new(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
        }
    }

    pub fn from_json(input: &str) -> Result<Self, CoreError> {
        let document: FixtureDocument = serde_json::from_str(input)?;
        let mut provider = Self::new(document.provider.unwrap_or_else(|| String::from("fixture")))
            .with_records(document.records);
        for failure in document.failures {
            provider = match failure.times {
                Some(times) => provider.fail_times(failure.entity_id, failure.kind, times),
                None => provider.fail_always(failure.entity_id, failure.kind),
            };
        }
        Ok(provider)
    }

    #[must_use]
    pub fn with_records(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        for record in records {
            self.records
                .entry(record.entity_id.clone())
                .or_default()
                .push(record);
        }
        self
    }

    /// Registers an entity the provider knows but has no records for.
    #[must_use]
    pub fn with_empty(mut self, entity_id: EntityId) -> Self {
        self.records.entry(entity_id).or_default();
        self
    }

    /// The next `times` calls for `entity_id` fail with `kind`.
    #[must_use]
    pub fn fail_times(self, entity_id: EntityId, kind: ProviderErrorKind, times: u32) -> Self {
        self.script(entity_id, kind, Some(times))
    }

    #[must_use]
    pub fn fail_always(self, entity_id: EntityId, kind: ProviderErrorKind) -> Self {
        self.script(entity_id, kind, None)
    }

    fn script(self, entity_id: EntityId, kind: ProviderErrorKind, remaining: Option<u32>) -> Self {
        self.failures
            .lock()
            .expect("fixture failures mutex poisoned")
            .insert(entity_id, ScriptedFailure { kind, remaining });
        self
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Entities with records or scripted failures, sorted.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self.records.keys().cloned().collect();
        let failures = self.failures.lock().expect("fixture failures mutex poisoned");
        for entity_id in failures.keys() {
            if !self.records.contains_key(entity_id) {
                entities.push(entity_id.clone());
            }
        }
        entities.sort();
        entities
    }

    pub fn calls(&self, entity_id: &EntityId) -> u32 {
        self.calls
            .lock()
            .expect("fixture calls mutex poisoned")
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls
            .lock()
            .expect("fixture calls mutex poisoned")
            .values()
            .sum()
    }

    fn next_failure(&self, entity_id: &EntityId) -> Option<ProviderError> {
        let mut failures = self.failures.lock().expect("fixture failures mutex poisoned");
        let failure = failures.get_mut(entity_id)?;
        match failure.remaining.as_mut() {
            Some(0) => None,
            Some(remaining) => {
                *remaining -= 1;
                Some(scripted_error(failure.kind, entity_id))
            }
            None => Some(scripted_error(failure.kind, entity_id)),
        }
    }

    fn answer(&self, operation: OperationClass, item: &Item) -> Vec<Record> {
        self.records
            .get(&item.entity_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| serves(operation, &record.payload))
                    .filter(|record| record.occurred_on <= item.scope)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn serves(operation: OperationClass, payload: &Payload) -> bool {
    match operation {
        OperationClass::ClosePrices => matches!(payload, Payload::ClosePrice { .. }),
        OperationClass::DailyCandles | OperationClass::MinuteCandles => {
            matches!(payload, Payload::Candle { .. })
        }
        OperationClass::LastTrades => matches!(payload, Payload::Trade { .. }),
    }
}

fn scripted_error(kind: ProviderErrorKind, entity_id: &EntityId) -> ProviderError {
    ProviderError::new(kind, format!("scripted failure for {entity_id}"))
}

impl MarketDataProvider for FixtureProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch<'a>(&'a self, operation: OperationClass, item: &'a Item) -> ProviderFuture<'a> {
        Box::pin(async move {
            *self
                .calls
                .lock()
                .expect("fixture calls mutex poisoned")
                .entry(item.entity_id.clone())
                .or_insert(0) += 1;

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            if let Some(error) = self.next_failure(&item.entity_id) {
                return Err(error);
            }
            Ok(self.answer(operation, item))
        })
    }
}
