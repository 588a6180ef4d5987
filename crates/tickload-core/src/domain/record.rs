use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{EntityId, TradingDate};
use crate::ValidationError;

/// One unit of ingestion work: an instrument and the day to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Item {
    pub entity_id: EntityId,
    pub scope: TradingDate,
}

impl Item {
    pub fn new(entity_id: EntityId, scope: TradingDate) -> Self {
        Self { entity_id, scope }
    }
}

/// Natural key of a persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub entity_id: EntityId,
    pub occurred_on: TradingDate,
}

impl Display for RecordKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.occurred_on)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Buy,
    Sell,
}

/// Record body as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    ClosePrice {
        price: f64,
        currency: String,
    },
    Candle {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
        #[serde(default = "default_complete")]
        is_complete: bool,
    },
    Trade {
        price: f64,
        quantity: u64,
        direction: TradeDirection,
    },
}

fn default_complete() -> bool {
    true
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClosePrice { .. } => "close_price",
            Self::Candle { .. } => "candle",
            Self::Trade { .. } => "trade",
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::ClosePrice { price, currency } => {
                validate_non_negative("price", *price)?;
                validate_currency_code(currency)?;
            }
            Self::Candle {
                open,
                high,
                low,
                close,
                ..
            } => {
                validate_non_negative("open", *open)?;
                validate_non_negative("high", *high)?;
                validate_non_negative("low", *low)?;
                validate_non_negative("close", *close)?;
                if high < low {
                    return Err(ValidationError::InvalidCandleRange);
                }
                if *open > *high || *open < *low || *close > *high || *close < *low {
                    return Err(ValidationError::InvalidCandleBounds);
                }
            }
            Self::Trade { price, .. } => validate_non_negative("price", *price)?,
        }
        Ok(())
    }
}

/// A market data point keyed by `(entity_id, occurred_on)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_id: EntityId,
    pub occurred_on: TradingDate,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Why a record was filtered out instead of persisted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    #[error("provider returned the epoch sentinel date")]
    SentinelDate,
    #[error("candle is not complete yet")]
    IncompleteCandle,
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] ValidationError),
}

impl Record {
    pub fn new(entity_id: EntityId, occurred_on: TradingDate, payload: Payload) -> Self {
        Self {
            entity_id,
            occurred_on,
            payload,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            entity_id: self.entity_id.clone(),
            occurred_on: self.occurred_on,
        }
    }

    /// Checks the record is real data worth persisting.
    ///
    /// The sentinel check runs first so "no data" answers are never reported
    /// as malformed.
    pub fn validate(&self) -> Result<(), InvalidReason> {
        if self.occurred_on.is_epoch() {
            return Err(InvalidReason::SentinelDate);
        }
        if let Payload::Candle {
            is_complete: false, ..
        } = self.payload
        {
            return Err(InvalidReason::IncompleteCandle);
        }
        self.payload.validate()?;
        Ok(())
    }
}

pub fn validate_currency_code(input: &str) -> Result<String, ValidationError> {
    let normalized = input.trim().to_ascii_uppercase();
    let is_valid = normalized.len() == 3 && normalized.chars().all(|ch| ch.is_ascii_alphabetic());

    if !is_valid {
        return Err(ValidationError::InvalidCurrency {
            value: input.to_owned(),
        });
    }

    Ok(normalized)
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}
