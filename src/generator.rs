//! Synthetic Option-Chain Generator
//!
//! Produces one snapshot of a weekly option chain per timestamp: every
//! expiry × strike × {call, put}. Values are pseudo-random within realistic
//! ranges, except the fields downstream consumers derive from each other:
//!
//! - `forward = base_price * (1 + i * 0.1)` for the i-th expiry
//! - `time_to_expiry` in calendar years (365d), `vola_time_to_expiry` in
//!   business years (252d) scaled by a jitter in [0.9, 1.2]
//! - `strike_moneyness = ln(forward / strike) / sqrt(max(vtexp, MIN_VTEXP))`
//! - `basevol_moneyness = strike_moneyness / base_volatility`
//!
//! The RNG is injected so tests can pin a seed.

use crate::pricing::{OptionKind, PricingRow, CONTRACT_TYPE_OPTION, EXPIRY_CYCLE_WEEKLY};
use crate::session::localize;
use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use rand::Rng;

/// Wall-clock expiry time on the expiry date, in the session's zone.
pub const EXPIRY_TIME: NaiveTime = match NaiveTime::from_hms_opt(15, 30, 0) {
    Some(t) => t,
    None => panic!("invalid expiry time"),
};
/// Floor for the volatility time-to-expiry inside the moneyness sqrt.
pub const MIN_VTEXP: f64 = 0.001;
pub const SECONDS_IN_A_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;
pub const BUSINESS_SECONDS_IN_A_YEAR: f64 = 252.0 * 24.0 * 60.0 * 60.0;

pub const FIRST_STRIKE: f64 = 100.0;
pub const STRIKE_STEP: f64 = 5.0;

#[inline]
pub fn strike_at(index: usize) -> f64 {
    FIRST_STRIKE + STRIKE_STEP * index as f64
}

/// Log-moneyness normalised by sqrt of business time. Finite for any
/// positive strike and forward, including expired contracts.
#[inline]
pub fn strike_moneyness(forward: f64, strike: f64, vola_time_to_expiry: f64) -> f64 {
    (forward / strike).ln() / vola_time_to_expiry.max(MIN_VTEXP).sqrt()
}

/// Per-expiry draws shared by every row of that expiry.
#[derive(Debug, Clone, Copy)]
struct ExpiryLeg {
    expiry: NaiveDate,
    forward: f64,
    base_volatility: f64,
    time_to_expiry: f64,
    vola_time_to_expiry: f64,
    additional_event_variance: f64,
    rho: f64,
}

#[derive(Debug, Clone, Copy)]
struct StrikePoint {
    strike: f64,
    moneyness: f64,
    basevol_moneyness: f64,
}

/// Lazy, single-pass row stream for one timestamp. Calling
/// [`generate_for_ts`] again yields a fresh random realisation.
pub struct ChainSnapshot<'a, R: Rng> {
    rng: &'a mut R,
    time: DateTime<Tz>,
    fund: &'a str,
    expiries: &'a [NaiveDate],
    num_strikes: usize,
    base_price: f64,
    next_expiry: usize,
    next_strike: usize,
    next_kind: usize,
    leg: Option<ExpiryLeg>,
    point: Option<StrikePoint>,
}

pub fn generate_for_ts<'a, R: Rng>(
    rng: &'a mut R,
    time: DateTime<Tz>,
    fund: &'a str,
    expiries: &'a [NaiveDate],
    num_strikes: usize,
) -> ChainSnapshot<'a, R> {
    let base_price = rng.gen_range(3000.0..3500.0);
    ChainSnapshot {
        rng,
        time,
        fund,
        expiries,
        num_strikes,
        base_price,
        next_expiry: 0,
        next_strike: 0,
        next_kind: 0,
        leg: None,
        point: None,
    }
}

impl<'a, R: Rng> ChainSnapshot<'a, R> {
    /// Rows this snapshot yields in total.
    pub fn row_count(&self) -> usize {
        self.expiries.len() * self.num_strikes * OptionKind::ALL.len()
    }

    fn seconds_to_expiry(&self, expiry: NaiveDate) -> f64 {
        let at = expiry.and_time(EXPIRY_TIME);
        match localize(at, self.time.timezone()) {
            Ok(instant) => (instant - self.time).num_milliseconds() as f64 / 1000.0,
            Err(_) => (at - self.time.naive_local()).num_milliseconds() as f64 / 1000.0,
        }
    }

    fn open_leg(&mut self, index: usize) -> ExpiryLeg {
        let expiry = self.expiries[index];
        let forward = self.base_price * (1.0 + index as f64 * 0.1);
        let base_volatility = self.rng.gen_range(10.0..100.0);
        let seconds = self.seconds_to_expiry(expiry);
        let time_to_expiry = seconds / SECONDS_IN_A_YEAR;
        let vola_time_to_expiry =
            seconds / BUSINESS_SECONDS_IN_A_YEAR * self.rng.gen_range(0.9..=1.2);

        ExpiryLeg {
            expiry,
            forward,
            base_volatility,
            time_to_expiry,
            vola_time_to_expiry,
            additional_event_variance: self.rng.gen_range(0.0..1.0),
            rho: self.rng.gen::<f64>(),
        }
    }

    fn row(&mut self, leg: ExpiryLeg, point: StrikePoint, kind: OptionKind) -> PricingRow {
        let rng = &mut *self.rng;
        let mut unit = || rng.gen_range(0.0..1.0);

        PricingRow {
            time: self.time,
            fund: self.fund.to_string(),
            expiry_date: leg.expiry,
            expiry_time: EXPIRY_TIME,
            expiry_cycle: EXPIRY_CYCLE_WEEKLY,
            strike: point.strike,
            price: 50.0 + unit() * 200.0,
            volatility: leg.base_volatility - 5.0 + unit() * 50.0,
            delta: unit(),
            skew_delta: unit(),
            gamma: unit(),
            skew_gamma: unit(),
            theta: unit(),
            additional_event_variance: leg.additional_event_variance,
            forward: leg.forward,
            base_price: self.base_price,
            rho: leg.rho,
            moving_skew: unit(),
            moving_smile: unit(),
            underlying_delta: unit(),
            underlying_skew_delta: unit(),
            vega: unit(),
            tw_vega: unit(),
            time_to_expiry: leg.time_to_expiry,
            vola_time_to_expiry: leg.vola_time_to_expiry,
            strike_moneyness: point.moneyness,
            base_volatility: leg.base_volatility,
            basevol_moneyness: point.basevol_moneyness,
            market_width: unit() * 10.0,
            vanna: unit(),
            charm: unit(),
            price_error: unit() * 0.2,
            vola_error: unit() * 0.2,
            contract_type: CONTRACT_TYPE_OPTION,
            option_kind: kind,
        }
    }
}

impl<'a, R: Rng> Iterator for ChainSnapshot<'a, R> {
    type Item = PricingRow;

    fn next(&mut self) -> Option<PricingRow> {
        if self.num_strikes == 0 {
            return None;
        }

        loop {
            let leg = match self.leg {
                Some(leg) => leg,
                None => {
                    if self.next_expiry >= self.expiries.len() {
                        return None;
                    }
                    let leg = self.open_leg(self.next_expiry);
                    self.next_expiry += 1;
                    self.next_strike = 0;
                    self.leg = Some(leg);
                    leg
                }
            };

            let point = match self.point {
                Some(point) => point,
                None => {
                    if self.next_strike >= self.num_strikes {
                        self.leg = None;
                        continue;
                    }
                    let strike = strike_at(self.next_strike);
                    let moneyness =
                        strike_moneyness(leg.forward, strike, leg.vola_time_to_expiry);
                    let point = StrikePoint {
                        strike,
                        moneyness,
                        basevol_moneyness: moneyness / leg.base_volatility,
                    };
                    self.next_strike += 1;
                    self.next_kind = 0;
                    self.point = Some(point);
                    point
                }
            };

            let kind = OptionKind::ALL[self.next_kind];
            self.next_kind += 1;
            if self.next_kind == OptionKind::ALL.len() {
                self.point = None;
            }
            return Some(self.row(leg, point, kind));
        }
    }
}
