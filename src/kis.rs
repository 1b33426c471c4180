// ===============================
// src/kis.rs
// ===============================
//
// REST client for the KIS open-api broker. Everything that touches the wire
// funnels through `call`: one shared rate limiter, bearer-token injection,
// and a bounded retry loop that distinguishes auth failures (re-issue the
// token and go again) from throttling and transient server errors (back off
// and go again). Order bodies are hash-signed with the server-issued hashkey.
//
// The access token is cached on disk next to a fingerprint of the
// credentials so a restart reuses it, but switching apps or hosts does not.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::domain::{BrokerFill, OrderRequest, OrderType, Side};
use crate::metrics;

const MAX_ATTEMPTS: u32 = 3;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

const ORDER_CASH: &str = "/uapi/domestic-stock/v1/trading/order-cash";
const ORDER_RVSECNCL: &str = "/uapi/domestic-stock/v1/trading/order-rvsecncl";
const INQUIRE_DAILY_CCLD: &str = "/uapi/domestic-stock/v1/trading/inquire-daily-ccld";
const INQUIRE_BALANCE: &str = "/uapi/domestic-stock/v1/trading/inquire-balance";
const INQUIRE_PSBL_RVSECNCL: &str = "/uapi/domestic-stock/v1/trading/inquire-psbl-rvsecncl";
const INQUIRE_PRICE: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";

#[derive(Debug, Error)]
pub enum KisError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker rejected [{code}] {message}")]
    Api { code: String, message: String },
    #[error("auth: {0}")]
    Auth(String),
    #[error("unexpected payload: {0}")]
    Payload(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct KisCfg {
    pub base_url: String,
    pub ws_url: String,
    pub app_key: String,
    pub app_secret: String,
    /// 8-digit account number (CANO).
    pub account_no: String,
    /// 2-digit product code (ACNT_PRDT_CD).
    pub account_product: String,
    pub token_cache: Option<PathBuf>,
    pub http_timeout: Duration,
    pub max_rps: usize,
}

/// Sliding one-second window over request timestamps. The lock is held across
/// the sleep on purpose: a caller that must wait also holds back everyone
/// behind it, which keeps the window exact.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    times: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            window: Duration::from_secs(1),
            times: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        let mut times = self.times.lock().await;
        loop {
            let now = Instant::now();
            while times.front().map(|t| now.duration_since(*t) >= self.window).unwrap_or(false) {
                times.pop_front();
            }
            if times.len() < self.max {
                times.push_back(now);
                return;
            }
            let oldest = *times.front().unwrap_or(&now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Local>,
    fingerprint: String,
}

struct TokenState {
    access_token: String,
    expires_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_no: String,
    pub branch_no: String,
    pub order_time: String,
}

#[derive(Debug, Clone)]
pub struct Quote {
    pub price: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone)]
pub struct HoldingRow {
    pub symbol: String,
    pub name: String,
    pub qty: i64,
    pub avg_price: f64,
    pub current_price: f64,
}

#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub cash: f64,
    pub holdings: Vec<HoldingRow>,
}

#[derive(Debug, Clone)]
pub struct OpenOrderRow {
    pub order_no: String,
    pub branch_no: String,
    pub symbol: String,
    pub side: Side,
    pub remaining_qty: i64,
    pub price: f64,
}

/// Per-day execution rows come back with lowercase keys on paper accounts
/// and uppercase on some live gateways; aliases accept both.
#[derive(Debug, Clone, Deserialize)]
pub struct FillRow {
    #[serde(alias = "ODNO", default)]
    pub odno: String,
    #[serde(alias = "PDNO", default)]
    pub pdno: String,
    #[serde(alias = "SLL_BUY_DVSN_CD", default)]
    pub sll_buy_dvsn_cd: String,
    #[serde(alias = "TOT_CCLD_QTY", default)]
    pub tot_ccld_qty: String,
    #[serde(alias = "TOT_CCLD_AMT", default)]
    pub tot_ccld_amt: String,
    #[serde(alias = "ORD_TMD", default)]
    pub ord_tmd: String,
}

pub struct KisClient {
    cfg: KisCfg,
    http: reqwest::Client,
    limiter: RateLimiter,
    token: Mutex<Option<TokenState>>,
    approval: Mutex<Option<String>>,
}

impl KisClient {
    pub fn new(cfg: KisCfg) -> Result<Self, KisError> {
        let http = reqwest::Client::builder().timeout(cfg.http_timeout).build()?;
        let limiter = RateLimiter::new(cfg.max_rps);
        let cached = cfg
            .token_cache
            .as_deref()
            .and_then(|p| load_cached_token(p, &credentials_fingerprint(&cfg)));
        if cached.is_some() {
            info!("access token restored from cache");
        }
        Ok(Self {
            cfg,
            http,
            limiter,
            token: Mutex::new(cached.map(|c| TokenState {
                access_token: c.access_token,
                expires_at: c.expires_at,
            })),
            approval: Mutex::new(None),
        })
    }

    pub fn cfg(&self) -> &KisCfg {
        &self.cfg
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    // ---- auth ----

    pub async fn ensure_token(&self) -> Result<String, KisError> {
        let mut guard = self.token.lock().await;
        if let Some(t) = guard.as_ref() {
            let left = t.expires_at.signed_duration_since(Local::now()).num_seconds();
            if left > TOKEN_REFRESH_MARGIN_SECS {
                return Ok(t.access_token.clone());
            }
        }

        self.limiter.acquire().await;
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.cfg.app_key,
            "appsecret": self.cfg.app_secret,
        });
        let resp = self.http.post(self.url("/oauth2/tokenP")).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(KisError::Auth(format!("token endpoint {status}: {text}")));
        }
        #[derive(Deserialize)]
        struct TokenResp {
            access_token: String,
            expires_in: i64,
        }
        let tr: TokenResp = resp.json().await?;
        let state = TokenState {
            access_token: tr.access_token,
            expires_at: Local::now() + chrono::Duration::seconds(tr.expires_in),
        };
        info!(expires_at = %state.expires_at, "access token issued");
        if let Some(path) = self.cfg.token_cache.as_deref() {
            let cached = CachedToken {
                access_token: state.access_token.clone(),
                expires_at: state.expires_at,
                fingerprint: credentials_fingerprint(&self.cfg),
            };
            if let Err(e) = write_cached_token(path, &cached) {
                warn!(err = %e, "token cache write failed");
            }
        }
        let token = state.access_token.clone();
        *guard = Some(state);
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
        if let Some(path) = self.cfg.token_cache.as_deref() {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Websocket approval key; cached for the life of the process.
    pub async fn approval_key(&self) -> Result<String, KisError> {
        let mut guard = self.approval.lock().await;
        if let Some(k) = guard.as_ref() {
            return Ok(k.clone());
        }
        self.limiter.acquire().await;
        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.cfg.app_key,
            "secretkey": self.cfg.app_secret,
        });
        let v: Value = self
            .http
            .post(self.url("/oauth2/Approval"))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let key = v["approval_key"]
            .as_str()
            .ok_or_else(|| KisError::Payload("approval response without approval_key".into()))?
            .to_string();
        *guard = Some(key.clone());
        Ok(key)
    }

    async fn hashkey(&self, body: &Value) -> Result<String, KisError> {
        self.limiter.acquire().await;
        let v: Value = self
            .http
            .post(self.url("/uapi/hashkey"))
            .header("appkey", &self.cfg.app_key)
            .header("appsecret", &self.cfg.app_secret)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        v["HASH"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| KisError::Payload("hashkey response without HASH".into()))
    }

    // ---- request plumbing ----

    async fn call(
        &self,
        method: Method,
        path: &str,
        tr_id: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        sign: bool,
    ) -> Result<Value, KisError> {
        let mut last = KisError::Payload("retries exhausted".into());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1u64 << (attempt - 1))).await;
            }
            self.limiter.acquire().await;
            let token = self.ensure_token().await?;

            let mut rb = self
                .http
                .request(method.clone(), self.url(path))
                .header("authorization", format!("Bearer {token}"))
                .header("appkey", &self.cfg.app_key)
                .header("appsecret", &self.cfg.app_secret)
                .header("tr_id", tr_id)
                .header("custtype", "P");
            if !query.is_empty() {
                rb = rb.query(query);
            }
            if let Some(b) = body {
                if sign {
                    rb = rb.header("hashkey", self.hashkey(b).await?);
                }
                rb = rb.json(b);
            }

            let resp = match rb.send().await {
                Ok(r) => r,
                Err(e) => {
                    metrics::API_RETRIES.with_label_values(&["network"]).inc();
                    warn!(%tr_id, attempt, err = %e, "request failed");
                    last = e.into();
                    continue;
                }
            };
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED {
                metrics::API_RETRIES.with_label_values(&["auth"]).inc();
                warn!(%tr_id, attempt, "401 from broker, re-issuing token");
                self.invalidate_token().await;
                last = KisError::Auth("401 unauthorized".into());
                continue;
            }
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let reason = if status == StatusCode::TOO_MANY_REQUESTS { "throttle" } else { "server" };
                metrics::API_RETRIES.with_label_values(&[reason]).inc();
                warn!(%tr_id, attempt, %status, "broker busy");
                last = KisError::Api {
                    code: status.as_str().to_string(),
                    message: "transient http status".into(),
                };
                continue;
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(KisError::Api { code: status.as_str().to_string(), message: text });
            }

            let v: Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    metrics::API_RETRIES.with_label_values(&["network"]).inc();
                    last = e.into();
                    continue;
                }
            };
            let rt = v["rt_cd"].as_str().unwrap_or("0");
            if rt != "0" {
                let code = v["msg_cd"].as_str().unwrap_or("").to_string();
                let message = v["msg1"].as_str().unwrap_or("").trim().to_string();
                // gateway-level token expiry comes back as a business error
                if code == "EGW00123" || code == "EGW00121" {
                    metrics::API_RETRIES.with_label_values(&["token"]).inc();
                    warn!(%tr_id, %code, "token rejected, re-issuing");
                    self.invalidate_token().await;
                    last = KisError::Auth(message);
                    continue;
                }
                return Err(KisError::Api { code, message });
            }
            return Ok(v);
        }
        Err(last)
    }

    // ---- orders ----

    pub async fn place_order(&self, req: &OrderRequest, extended: bool) -> Result<OrderAck, KisError> {
        let tr_id = match req.side {
            Side::Buy => "TTTC0802U",
            Side::Sell => "TTTC0801U",
        };
        let ord_dvsn = if extended {
            "05"
        } else {
            match req.order_type {
                OrderType::Market => "01",
                OrderType::Limit => "00",
            }
        };
        let unit_price = if ord_dvsn == "01" {
            0.0
        } else {
            round_to_tick(req.price.unwrap_or(0.0))
        };
        let mut body = json!({
            "CANO": self.cfg.account_no,
            "ACNT_PRDT_CD": self.cfg.account_product,
            "PDNO": req.symbol,
            "ORD_DVSN": ord_dvsn,
            "ORD_QTY": req.qty.to_string(),
            "ORD_UNPR": format!("{unit_price:.0}"),
        });
        if extended {
            body["AFHR_FLPR_YN"] = json!("Y");
        }
        let v = self.call(Method::POST, ORDER_CASH, tr_id, &[], Some(&body), true).await?;
        let out = &v["output"];
        let ack = OrderAck {
            order_no: json_str(out, "ODNO"),
            branch_no: json_str(out, "KRX_FWDG_ORD_ORGNO"),
            order_time: json_str(out, "ORD_TMD"),
        };
        if ack.order_no.is_empty() {
            return Err(KisError::Payload("order accepted without ODNO".into()));
        }
        Ok(ack)
    }

    pub async fn cancel_order(&self, branch_no: &str, order_no: &str) -> Result<(), KisError> {
        let body = json!({
            "CANO": self.cfg.account_no,
            "ACNT_PRDT_CD": self.cfg.account_product,
            "KRX_FWDG_ORD_ORGNO": branch_no,
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });
        self.call(Method::POST, ORDER_RVSECNCL, "TTTC0803U", &[], Some(&body), true).await?;
        Ok(())
    }

    /// Re-price the full remaining quantity of a resting order.
    pub async fn modify_order(
        &self,
        branch_no: &str,
        order_no: &str,
        new_price: f64,
    ) -> Result<OrderAck, KisError> {
        let body = json!({
            "CANO": self.cfg.account_no,
            "ACNT_PRDT_CD": self.cfg.account_product,
            "KRX_FWDG_ORD_ORGNO": branch_no,
            "ORGN_ODNO": order_no,
            "ORD_DVSN": "00",
            "RVSE_CNCL_DVSN_CD": "01",
            "ORD_QTY": "0",
            "ORD_UNPR": format!("{:.0}", round_to_tick(new_price)),
            "QTY_ALL_ORD_YN": "Y",
        });
        let v = self.call(Method::POST, ORDER_RVSECNCL, "TTTC0803U", &[], Some(&body), true).await?;
        let out = &v["output"];
        Ok(OrderAck {
            order_no: json_str(out, "ODNO"),
            branch_no: json_str(out, "KRX_FWDG_ORD_ORGNO"),
            order_time: json_str(out, "ORD_TMD"),
        })
    }

    // ---- inquiries ----

    /// Every execution for `date`, paged until the continuation key runs dry.
    pub async fn daily_fills(&self, date: NaiveDate) -> Result<Vec<BrokerFill>, KisError> {
        let ymd = date.format("%Y%m%d").to_string();
        let mut fills = Vec::new();
        let mut fk = String::new();
        let mut nk = String::new();
        loop {
            let query = [
                ("CANO", self.cfg.account_no.clone()),
                ("ACNT_PRDT_CD", self.cfg.account_product.clone()),
                ("INQR_STRT_DT", ymd.clone()),
                ("INQR_END_DT", ymd.clone()),
                ("SLL_BUY_DVSN_CD", "00".to_string()),
                ("INQR_DVSN", "00".to_string()),
                ("PDNO", String::new()),
                ("CCLD_DVSN", "01".to_string()),
                ("ORD_GNO_BRNO", String::new()),
                ("ODNO", String::new()),
                ("INQR_DVSN_3", "00".to_string()),
                ("INQR_DVSN_1", String::new()),
                ("CTX_AREA_FK100", fk.clone()),
                ("CTX_AREA_NK100", nk.clone()),
            ];
            let v = self
                .call(Method::GET, INQUIRE_DAILY_CCLD, "TTTC8001R", &query, None, false)
                .await?;
            let rows: Vec<FillRow> =
                serde_json::from_value(v["output1"].clone()).unwrap_or_default();
            for row in rows {
                let qty = parse_i64(&row.tot_ccld_qty);
                if qty <= 0 {
                    continue;
                }
                let amount = parse_f64(&row.tot_ccld_amt);
                fills.push(BrokerFill {
                    order_no: row.odno,
                    symbol: row.pdno,
                    side: if row.sll_buy_dvsn_cd == "01" { Side::Sell } else { Side::Buy },
                    qty,
                    price: round2(amount / qty as f64),
                    ts: fill_ts(date, &row.ord_tmd),
                });
            }
            fk = json_str(&v, "ctx_area_fk100");
            nk = json_str(&v, "ctx_area_nk100");
            if nk.trim().is_empty() {
                break;
            }
        }
        Ok(fills)
    }

    pub async fn balance(&self) -> Result<AccountSnapshot, KisError> {
        let query = [
            ("CANO", self.cfg.account_no.clone()),
            ("ACNT_PRDT_CD", self.cfg.account_product.clone()),
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", String::new()),
            ("INQR_DVSN", "02".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "00".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];
        let v = self.call(Method::GET, INQUIRE_BALANCE, "TTTC8434R", &query, None, false).await?;

        let mut holdings = Vec::new();
        if let Some(rows) = v["output1"].as_array() {
            for row in rows {
                let qty = parse_i64(&json_str(row, "hldg_qty"));
                if qty <= 0 {
                    continue;
                }
                holdings.push(HoldingRow {
                    symbol: json_str(row, "pdno"),
                    name: json_str(row, "prdt_name"),
                    qty,
                    avg_price: parse_f64(&json_str(row, "pchs_avg_pric")),
                    current_price: parse_f64(&json_str(row, "prpr")),
                });
            }
        }
        let cash = v["output2"]
            .as_array()
            .and_then(|a| a.first())
            .map(|row| parse_f64(&json_str(row, "dnca_tot_amt")))
            .unwrap_or(0.0);
        Ok(AccountSnapshot { cash, holdings })
    }

    /// Resting orders that can still be canceled; used by the startup sweep.
    pub async fn open_orders(&self) -> Result<Vec<OpenOrderRow>, KisError> {
        let query = [
            ("CANO", self.cfg.account_no.clone()),
            ("ACNT_PRDT_CD", self.cfg.account_product.clone()),
            ("INQR_DVSN_1", "0".to_string()),
            ("INQR_DVSN_2", "0".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];
        let v = self
            .call(Method::GET, INQUIRE_PSBL_RVSECNCL, "TTTC8036R", &query, None, false)
            .await?;
        let mut orders = Vec::new();
        if let Some(rows) = v["output"].as_array() {
            for row in rows {
                orders.push(OpenOrderRow {
                    order_no: json_str(row, "odno"),
                    branch_no: json_str(row, "ord_gno_brno"),
                    symbol: json_str(row, "pdno"),
                    side: if json_str(row, "sll_buy_dvsn_cd") == "01" {
                        Side::Sell
                    } else {
                        Side::Buy
                    },
                    remaining_qty: parse_i64(&json_str(row, "psbl_qty")),
                    price: parse_f64(&json_str(row, "ord_unpr")),
                });
            }
        }
        Ok(orders)
    }

    pub async fn get_quote(&self, symbol: &str) -> Result<Quote, KisError> {
        let query = [
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", symbol.to_string()),
        ];
        let v = self.call(Method::GET, INQUIRE_PRICE, "FHKST01010100", &query, None, false).await?;
        let out = &v["output"];
        let price = parse_f64(&json_str(out, "stck_prpr"));
        if price <= 0.0 {
            return Err(KisError::Payload(format!("no price for {symbol}")));
        }
        Ok(Quote { price, change_pct: parse_f64(&json_str(out, "prdy_ctrt")) })
    }
}

// ---- KRX price grid ----

pub fn krx_tick(price: f64) -> f64 {
    if price < 2_000.0 {
        1.0
    } else if price < 5_000.0 {
        5.0
    } else if price < 20_000.0 {
        10.0
    } else if price < 50_000.0 {
        50.0
    } else if price < 200_000.0 {
        100.0
    } else if price < 500_000.0 {
        500.0
    } else {
        1_000.0
    }
}

/// Snap a computed price down onto the exchange grid.
pub fn round_to_tick(price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let tick = krx_tick(price);
    (price / tick).floor() * tick
}

// ---- parsing helpers ----

fn json_str(v: &Value, key: &str) -> String {
    v[key].as_str().unwrap_or_default().trim().to_string()
}

fn parse_f64(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

fn parse_i64(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn fill_ts(date: NaiveDate, hhmmss: &str) -> DateTime<Local> {
    let time = NaiveTime::parse_from_str(hhmmss, "%H%M%S").unwrap_or(NaiveTime::MIN);
    Local
        .from_local_datetime(&date.and_time(time))
        .single()
        .unwrap_or_else(Local::now)
}

fn credentials_fingerprint(cfg: &KisCfg) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cfg.base_url.as_bytes());
    hasher.update(b"|");
    hasher.update(cfg.app_key.as_bytes());
    hasher.update(b"|");
    hasher.update(cfg.app_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn load_cached_token(path: &Path, fingerprint: &str) -> Option<CachedToken> {
    let raw = std::fs::read_to_string(path).ok()?;
    let cached: CachedToken = serde_json::from_str(&raw).ok()?;
    if cached.fingerprint != fingerprint {
        return None;
    }
    let left = cached.expires_at.signed_duration_since(Local::now()).num_seconds();
    if left <= TOKEN_REFRESH_MARGIN_SECS {
        return None;
    }
    Some(cached)
}

fn write_cached_token(path: &Path, cached: &CachedToken) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(cached).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_bursts() {
        let limiter = RateLimiter::new(18);
        let start = Instant::now();
        for _ in 0..30 {
            limiter.acquire().await;
        }
        // 30 calls through an 18/s window cannot finish in under ~2/3 s
        let min = Duration::from_millis(1000 * (30 - 18) / 18);
        assert!(start.elapsed() >= min, "elapsed {:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_burst_under_the_cap_is_instant() {
        let limiter = RateLimiter::new(18);
        let start = Instant::now();
        for _ in 0..18 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_krx_tick_table() {
        assert_eq!(krx_tick(1_999.0), 1.0);
        assert_eq!(krx_tick(2_000.0), 5.0);
        assert_eq!(krx_tick(19_999.0), 10.0);
        assert_eq!(krx_tick(49_999.0), 50.0);
        assert_eq!(krx_tick(199_999.0), 100.0);
        assert_eq!(krx_tick(499_999.0), 500.0);
        assert_eq!(krx_tick(1_000_000.0), 1_000.0);
    }

    #[test]
    fn test_round_to_tick_snaps_down() {
        assert_eq!(round_to_tick(2_003.0), 2_000.0);
        assert_eq!(round_to_tick(19_995.0), 19_990.0);
        assert_eq!(round_to_tick(87_654.0), 87_600.0);
        assert_eq!(round_to_tick(1_234_567.0), 1_234_000.0);
        assert_eq!(round_to_tick(1_500.0), 1_500.0);
    }

    #[test]
    fn test_fill_row_accepts_both_cases() {
        let lower: FillRow = serde_json::from_value(serde_json::json!({
            "odno": "0001", "pdno": "005930", "sll_buy_dvsn_cd": "02",
            "tot_ccld_qty": "10", "tot_ccld_amt": "700000", "ord_tmd": "093015"
        }))
        .unwrap();
        assert_eq!(lower.pdno, "005930");
        assert_eq!(lower.tot_ccld_qty, "10");

        let upper: FillRow = serde_json::from_value(serde_json::json!({
            "ODNO": "0002", "PDNO": "000660", "SLL_BUY_DVSN_CD": "01",
            "TOT_CCLD_QTY": "5", "TOT_CCLD_AMT": "600000", "ORD_TMD": "101500"
        }))
        .unwrap();
        assert_eq!(upper.odno, "0002");
        assert_eq!(upper.sll_buy_dvsn_cd, "01");
    }

    #[test]
    fn test_token_cache_rejects_foreign_fingerprint() {
        let dir = std::env::temp_dir().join(format!("kis-token-{}", std::process::id()));
        let path = dir.join("token.json");
        let cached = CachedToken {
            access_token: "abc".into(),
            expires_at: Local::now() + chrono::Duration::hours(12),
            fingerprint: "fp-a".into(),
        };
        write_cached_token(&path, &cached).unwrap();

        assert!(load_cached_token(&path, "fp-a").is_some());
        assert!(load_cached_token(&path, "fp-b").is_none());

        // an expiring token is not worth restoring
        let stale = CachedToken {
            expires_at: Local::now() + chrono::Duration::seconds(60),
            ..cached
        };
        write_cached_token(&path, &stale).unwrap();
        assert!(load_cached_token(&path, "fp-a").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_parse_helpers_tolerate_blanks() {
        assert_eq!(parse_f64(" 70000.50 "), 70000.5);
        assert_eq!(parse_f64(""), 0.0);
        assert_eq!(parse_i64("15"), 15);
        assert_eq!(parse_i64("bad"), 0);
        assert_eq!(round2(1234.567), 1234.57);
    }
}
