// ===============================
// src/session.rs
// ===============================
//
// KRX trading-day phases. The gateway gates order entry and picks division
// codes off this clock; the feed uses it to filter the rotation window during
// extended sessions.

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketSession {
    PreMarket,  // 08:00 - 08:50 extended-hours single price
    PreClose,   // 08:50 - 09:00 opening auction
    Regular,    // 09:00 - 15:20
    Closing,    // 15:20 - 15:30 closing auction
    Break,      // 15:30 - 15:40
    NextMarket, // 15:40 - 20:00 after-hours single price
    Closed,
}

impl MarketSession {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketSession::PreMarket => "pre_market",
            MarketSession::PreClose => "pre_close",
            MarketSession::Regular => "regular",
            MarketSession::Closing => "closing",
            MarketSession::Break => "break",
            MarketSession::NextMarket => "next_market",
            MarketSession::Closed => "closed",
        }
    }

    /// Orders may be submitted at all (stop at close and during the break).
    pub fn accepts_orders(&self) -> bool {
        !matches!(self, MarketSession::Closed | MarketSession::Break)
    }

    /// Market orders are rejected during the auctions; limit only.
    pub fn allows_market_orders(&self) -> bool {
        !matches!(self, MarketSession::PreClose | MarketSession::Closing)
    }

    /// Extended sessions trade via the single-price book and only for
    /// symbols on the extended-session list.
    pub fn is_extended(&self) -> bool {
        matches!(self, MarketSession::PreMarket | MarketSession::NextMarket)
    }
}

#[derive(Debug, Clone)]
pub struct SessionClock {
    holidays: Vec<NaiveDate>,
    enable_pre_market: bool,
    enable_next_market: bool,
}

impl SessionClock {
    pub fn new(holidays: Vec<NaiveDate>, enable_pre_market: bool, enable_next_market: bool) -> Self {
        Self { holidays, enable_pre_market, enable_next_market }
    }

    pub fn now(&self) -> MarketSession {
        self.at(Local::now())
    }

    pub fn at(&self, dt: DateTime<Local>) -> MarketSession {
        let date = dt.date_naive();
        if matches!(dt.weekday(), Weekday::Sat | Weekday::Sun) || self.holidays.contains(&date) {
            return MarketSession::Closed;
        }
        let t = dt.hour() * 100 + dt.minute();
        match t {
            800..=849 => {
                if self.enable_pre_market { MarketSession::PreMarket } else { MarketSession::Closed }
            }
            850..=859 => MarketSession::PreClose,
            900..=1519 => MarketSession::Regular,
            1520..=1529 => MarketSession::Closing,
            1530..=1539 => MarketSession::Break,
            1540..=1959 => {
                if self.enable_next_market { MarketSession::NextMarket } else { MarketSession::Closed }
            }
            _ => MarketSession::Closed,
        }
    }
}
