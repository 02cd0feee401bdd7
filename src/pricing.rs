//! Option-chain pricing rows
//!
//! The column list below is the bulk-insert contract with the `raw_pricing`
//! table: order and names must not change.

use crate::store::{CopyRow, CopyValue};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const PRICING_TABLE: &str = "raw_pricing";

pub const PRICING_COLUMNS: [&str; 35] = [
    "time",
    "fund",
    "expiry_date",
    "expiry_time",
    "expiry_cycle",
    "strike",
    "price",
    "volatility",
    "delta",
    "skew_delta",
    "gamma",
    "skew_gamma",
    "theta",
    "additional_event_variance",
    "forward",
    "base_price",
    "rho",
    "moving_skew",
    "moving_smile",
    "underlying_delta",
    "underlying_skew_delta",
    "vega",
    "tw_vega",
    "time_to_expiry",
    "vola_time_to_expiry",
    "strike_moneyness",
    "base_volatility",
    "basevol_moneyness",
    "market_width",
    "vanna",
    "charm",
    "price_error",
    "vola_error",
    "contract_type",
    "option_kind",
];

pub const EXPIRY_CYCLE_WEEKLY: &str = "WEEKLY";
pub const CONTRACT_TYPE_OPTION: &str = "Option";

/// SQLite DDL for the pricing table, applied on every connect.
pub const PRICING_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS raw_pricing (
    time TEXT NOT NULL,
    fund TEXT NOT NULL,
    expiry_date TEXT NOT NULL,
    expiry_time TEXT NOT NULL,
    expiry_cycle TEXT NOT NULL,
    strike REAL NOT NULL,
    price REAL,
    volatility REAL,
    delta REAL,
    skew_delta REAL,
    gamma REAL,
    skew_gamma REAL,
    theta REAL,
    additional_event_variance REAL,
    forward REAL,
    base_price REAL,
    rho REAL,
    moving_skew REAL,
    moving_smile REAL,
    underlying_delta REAL,
    underlying_skew_delta REAL,
    vega REAL,
    tw_vega REAL,
    time_to_expiry REAL,
    vola_time_to_expiry REAL,
    strike_moneyness REAL,
    base_volatility REAL,
    basevol_moneyness REAL,
    market_width REAL,
    vanna REAL,
    charm REAL,
    price_error REAL,
    vola_error REAL,
    contract_type TEXT NOT NULL,
    option_kind TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_raw_pricing_fund_time
    ON raw_pricing(fund, time);
"#;

/// Owned column names, as the loader takes them.
pub fn pricing_columns() -> Vec<String> {
    PRICING_COLUMNS.iter().map(|c| c.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    pub const ALL: [OptionKind; 2] = [OptionKind::Call, OptionKind::Put];

    pub fn as_str(self) -> &'static str {
        match self {
            OptionKind::Call => "call",
            OptionKind::Put => "put",
        }
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One option quote snapshot. Field order follows [`PRICING_COLUMNS`].
#[derive(Debug, Clone, PartialEq)]
pub struct PricingRow {
    pub time: DateTime<Tz>,
    pub fund: String,
    pub expiry_date: NaiveDate,
    pub expiry_time: NaiveTime,
    pub expiry_cycle: &'static str,
    pub strike: f64,
    pub price: f64,
    pub volatility: f64,
    pub delta: f64,
    pub skew_delta: f64,
    pub gamma: f64,
    pub skew_gamma: f64,
    pub theta: f64,
    pub additional_event_variance: f64,
    pub forward: f64,
    pub base_price: f64,
    pub rho: f64,
    pub moving_skew: f64,
    pub moving_smile: f64,
    pub underlying_delta: f64,
    pub underlying_skew_delta: f64,
    pub vega: f64,
    pub tw_vega: f64,
    pub time_to_expiry: f64,
    pub vola_time_to_expiry: f64,
    pub strike_moneyness: f64,
    pub base_volatility: f64,
    pub basevol_moneyness: f64,
    pub market_width: f64,
    pub vanna: f64,
    pub charm: f64,
    pub price_error: f64,
    pub vola_error: f64,
    pub contract_type: &'static str,
    pub option_kind: OptionKind,
}

impl CopyRow for PricingRow {
    fn copy_values(&self) -> Vec<CopyValue> {
        use CopyValue::{Date, Real, Text, Time, Timestamp};

        vec![
            Timestamp(self.time.with_timezone(&Utc)),
            Text(self.fund.clone()),
            Date(self.expiry_date),
            Time(self.expiry_time),
            Text(self.expiry_cycle.to_string()),
            Real(self.strike),
            Real(self.price),
            Real(self.volatility),
            Real(self.delta),
            Real(self.skew_delta),
            Real(self.gamma),
            Real(self.skew_gamma),
            Real(self.theta),
            Real(self.additional_event_variance),
            Real(self.forward),
            Real(self.base_price),
            Real(self.rho),
            Real(self.moving_skew),
            Real(self.moving_smile),
            Real(self.underlying_delta),
            Real(self.underlying_skew_delta),
            Real(self.vega),
            Real(self.tw_vega),
            Real(self.time_to_expiry),
            Real(self.vola_time_to_expiry),
            Real(self.strike_moneyness),
            Real(self.base_volatility),
            Real(self.basevol_moneyness),
            Real(self.market_width),
            Real(self.vanna),
            Real(self.charm),
            Real(self.price_error),
            Real(self.vola_error),
            Text(self.contract_type.to_string()),
            Text(self.option_kind.as_str().to_string()),
        ]
    }
}
