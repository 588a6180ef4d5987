//! # Domain Models
//!
//! | Type | Description |
//! |------|-------------|
//! | [`EntityId`] | Validated instrument identifier |
//! | [`TradingDate`] | Calendar day, with the epoch "no data" sentinel |
//! | [`Item`] | Unit of ingestion work |
//! | [`Record`] | Market data point keyed by [`RecordKey`] |
//! | [`Payload`] | Close price, candle or trade body |
//!
//! [`Record::validate`] decides whether a record is persisted; anything it
//! rejects is counted as invalid and never reaches a store.

mod entity;
mod record;
mod trading_date;

pub use entity::EntityId;
pub use record::{
    validate_currency_code, InvalidReason, Item, Payload, Record, RecordKey, TradeDirection,
};
pub use trading_date::TradingDate;
