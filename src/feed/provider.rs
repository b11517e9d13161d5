// =============================================================================
// Feed Provider — wire protocol, request signing, reference-data REST client
// =============================================================================
//
// The upstream market-data provider speaks JSON over a WebSocket:
//
//   {"type":"mapping","instrument_id":421,"symbol":"BYND","previous_close":"0.50"}
//   {"type":"trade","instrument_id":421,"ts_event":1700000000000,"price":"0.55","size":"100"}
//   {"type":"quote","instrument_id":421,"ts_event":1700000000000,"bid":"0.54","ask":"0.56"}
//   {"type":"status","code":"ok","message":"..."}
//
// Numeric fields arrive as JSON strings (decimal-exact on the wire), so every
// price parse goes through `parse_string_f64`.
//
// Subscriptions are signed: HMAC-SHA256 over `{ts}:{universe}:{schema}` with
// the account secret, hex-encoded.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::debug;

use crate::types::FeedSchema;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Errors
// =============================================================================

/// Gateway failure classification. Transient errors are retried internally;
/// fatal errors stop the component and surface to the supervisor task.
#[derive(Debug)]
pub enum FeedError {
    ConnectionRefused(String),
    AuthInvalid,
    QuotaExceeded,
    Transport(anyhow::Error),
}

impl FeedError {
    /// Fatal errors must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthInvalid | Self::QuotaExceeded)
    }
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionRefused(detail) => write!(f, "connection refused: {detail}"),
            Self::AuthInvalid => write!(f, "authentication rejected"),
            Self::QuotaExceeded => write!(f, "subscription quota exceeded"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

impl std::error::Error for FeedError {}

// =============================================================================
// Inbound messages
// =============================================================================

/// A parsed upstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Mapping {
        instrument_id: u64,
        symbol: String,
        previous_close: Option<f64>,
    },
    Trade {
        instrument_id: u64,
        ts_event: i64,
        price: f64,
        size: f64,
    },
    Quote {
        instrument_id: u64,
        ts_event: i64,
        bid: f64,
        ask: f64,
    },
    Status {
        code: String,
        message: String,
    },
}

/// Provider sends numeric values as JSON strings; accept plain numbers too.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse one upstream JSON message.
pub fn parse_feed_message(text: &str) -> Result<FeedMessage> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed JSON")?;

    let msg_type = root["type"].as_str().context("missing field type")?;

    match msg_type {
        "mapping" => {
            let instrument_id = root["instrument_id"]
                .as_u64()
                .context("missing field instrument_id")?;
            let symbol = root["symbol"]
                .as_str()
                .context("missing field symbol")?
                .to_uppercase();
            let previous_close = match root.get("previous_close") {
                Some(serde_json::Value::Null) | None => None,
                Some(v) => Some(parse_string_f64(v, "previous_close")?),
            };
            Ok(FeedMessage::Mapping {
                instrument_id,
                symbol,
                previous_close,
            })
        }
        "trade" => Ok(FeedMessage::Trade {
            instrument_id: root["instrument_id"]
                .as_u64()
                .context("missing field instrument_id")?,
            ts_event: root["ts_event"].as_i64().context("missing field ts_event")?,
            price: parse_string_f64(&root["price"], "price")?,
            size: parse_string_f64(&root["size"], "size")?,
        }),
        "quote" => Ok(FeedMessage::Quote {
            instrument_id: root["instrument_id"]
                .as_u64()
                .context("missing field instrument_id")?,
            ts_event: root["ts_event"].as_i64().context("missing field ts_event")?,
            bid: parse_string_f64(&root["bid"], "bid")?,
            ask: parse_string_f64(&root["ask"], "ask")?,
        }),
        "status" => Ok(FeedMessage::Status {
            code: root["code"].as_str().unwrap_or("unknown").to_string(),
            message: root["message"].as_str().unwrap_or_default().to_string(),
        }),
        other => anyhow::bail!("unknown feed message type: {other}"),
    }
}

// =============================================================================
// Subscription request
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SubscribeRequest {
    pub action: &'static str,
    pub universe: String,
    pub schema: String,
    pub key: String,
    pub ts: i64,
    pub sig: String,
}

/// HMAC-SHA256 hex signature over `{ts}:{universe}:{schema}`.
pub fn sign_subscription(secret: &str, ts: i64, universe: &str, schema: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{ts}:{universe}:{schema}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the signed subscription message sent immediately after connect.
pub fn build_subscribe(
    api_key: &str,
    api_secret: &str,
    universe: &str,
    schema: FeedSchema,
    ts: i64,
) -> SubscribeRequest {
    let schema_str = schema.to_string();
    let sig = sign_subscription(api_secret, ts, universe, &schema_str);
    SubscribeRequest {
        action: "subscribe",
        universe: universe.to_string(),
        schema: schema_str,
        key: api_key.to_string(),
        ts,
        sig,
    }
}

// =============================================================================
// Reference-data REST client
// =============================================================================

/// Thin REST client for the provider's reference-data side. Used once at
/// startup to bootstrap previous closes for an explicit symbol list.
pub struct RefDataClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RefDataClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// GET /previous-close?symbols=A,B,C → `{"AAPL":"123.45", ...}`.
    pub async fn previous_closes(
        &self,
        symbols: &[String],
    ) -> Result<Vec<(String, f64)>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/previous-close?symbols={}",
            self.base_url,
            symbols.join(",")
        );
        let resp = self
            .client
            .get(&url)
            .header("X-PULSE-KEY", &self.api_key)
            .send()
            .await
            .context("previous-close request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse previous-close response")?;

        if !status.is_success() {
            anyhow::bail!("previous-close returned {status}: {body}");
        }

        let mut out = Vec::new();
        if let Some(map) = body.as_object() {
            for (symbol, value) in map {
                if let Ok(close) = parse_string_f64(value, symbol) {
                    out.push((symbol.to_uppercase(), close));
                }
            }
        }
        debug!(count = out.len(), "previous closes fetched");
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mapping_message() {
        let msg = parse_feed_message(
            r#"{"type":"mapping","instrument_id":421,"symbol":"bynd","previous_close":"0.50"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            FeedMessage::Mapping {
                instrument_id: 421,
                symbol: "BYND".into(),
                previous_close: Some(0.50),
            }
        );
    }

    #[test]
    fn parse_mapping_without_previous_close() {
        let msg = parse_feed_message(
            r#"{"type":"mapping","instrument_id":7,"symbol":"NEWIPO"}"#,
        )
        .unwrap();
        match msg {
            FeedMessage::Mapping { previous_close, .. } => assert!(previous_close.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parse_trade_message() {
        let msg = parse_feed_message(
            r#"{"type":"trade","instrument_id":421,"ts_event":1700000000000,"price":"0.55","size":"100"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            FeedMessage::Trade {
                instrument_id: 421,
                ts_event: 1_700_000_000_000,
                price: 0.55,
                size: 100.0,
            }
        );
    }

    #[test]
    fn parse_quote_message_numeric_fields() {
        // Plain JSON numbers are accepted alongside string-encoded ones.
        let msg = parse_feed_message(
            r#"{"type":"quote","instrument_id":2,"ts_event":5,"bid":1.5,"ask":1.6}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            FeedMessage::Quote {
                instrument_id: 2,
                ts_event: 5,
                bid: 1.5,
                ask: 1.6,
            }
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_feed_message("not json").is_err());
        assert!(parse_feed_message(r#"{"type":"wat"}"#).is_err());
        assert!(parse_feed_message(r#"{"type":"trade","instrument_id":1}"#).is_err());
    }

    #[test]
    fn signature_is_deterministic_and_keyed() {
        let a = sign_subscription("secret", 1000, "ALL_US_EQUITIES", "trades");
        let b = sign_subscription("secret", 1000, "ALL_US_EQUITIES", "trades");
        let c = sign_subscription("other", 1000, "ALL_US_EQUITIES", "trades");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // SHA-256 hex
    }

    #[test]
    fn subscribe_request_shape() {
        let req = build_subscribe("key", "secret", "AAPL,BYND", FeedSchema::Trades, 42);
        assert_eq!(req.action, "subscribe");
        assert_eq!(req.schema, "trades");
        assert_eq!(req.sig, sign_subscription("secret", 42, "AAPL,BYND", "trades"));
    }

    #[test]
    fn fatal_classification() {
        assert!(FeedError::AuthInvalid.is_fatal());
        assert!(FeedError::QuotaExceeded.is_fatal());
        assert!(!FeedError::ConnectionRefused("x".into()).is_fatal());
        assert!(!FeedError::Transport(anyhow::anyhow!("io")).is_fatal());
    }
}
