//! Remote identity lookup.
//!
//! Requests are signed with an MD5 over the sorted `key=value` pairs followed by
//! the shared secret, and every call goes through the shared `RateLimiter`.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

/// Message fragment the remote service uses for unknown identifiers.
const NOT_FOUND_MARKER: &str = "role not exist";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// `None` disables remote lookups entirely
    pub endpoint: Option<String>,
    /// Overridden by `LEADERBOARD_LOOKUP_SECRET` when set
    pub secret: Option<String>,
    pub timeout_secs: u64,
    /// Minimum spacing between two calls (the service allows ~30 per minute)
    pub min_interval_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            secret: None,
            timeout_secs: 10,
            min_interval_ms: 2100,
            retry: RetryPolicy::new(2, 3000, 1.0),
        }
    }
}

/// Profile fields returned for a known identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityProfile {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub region_id: Option<i64>,
    pub level: Option<i64>,
    pub level_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(IdentityProfile),
    /// Authoritative: the identifier does not exist.
    NotFound,
}

pub trait IdentityLookup: Send + Sync {
    /// `None` is a transient failure and may be retried.
    fn fetch(&self, identifier: &str) -> Option<LookupResult>;
}

pub struct HttpIdentityLookup {
    client: reqwest::blocking::Client,
    endpoint: String,
    secret: String,
    limiter: Arc<RateLimiter>,
}

/// `md5("k1=v1&k2=v2" + secret)` over the keys in sorted order.
pub fn sign_payload(fields: &[(&str, String)], secret: &str) -> String {
    let mut sorted: Vec<_> = fields.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let encoded = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{:x}", md5::compute(format!("{}{}", encoded, secret)))
}

fn string_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts both JSON numbers and numeric strings.
fn int_field(data: &Value, key: &str) -> Option<i64> {
    match data.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Maps an HTTP status and decoded body to a lookup result.
pub fn interpret_response(status: u16, body: &Value) -> Option<LookupResult> {
    let msg = body.get("msg").and_then(Value::as_str).unwrap_or_default();
    if msg.to_lowercase().contains(NOT_FOUND_MARKER) {
        return Some(LookupResult::NotFound);
    }
    if status != 200 {
        warn!("Lookup returned HTTP {}", status);
        return None;
    }

    match body.get("code").and_then(Value::as_i64) {
        Some(0) => {
            let data = body.get("data").cloned().unwrap_or(Value::Null);
            Some(LookupResult::Found(IdentityProfile {
                display_name: string_field(&data, "nickname"),
                avatar_url: string_field(&data, "avatar_image"),
                region_id: int_field(&data, "kid"),
                level: int_field(&data, "stove_lv"),
                level_label: string_field(&data, "stove_lv_content"),
            }))
        }
        code => {
            warn!("Lookup failure code {:?}: {}", code, msg);
            None
        }
    }
}

impl HttpIdentityLookup {
    pub fn new(config: &LookupConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow!("no lookup endpoint configured"))?;
        let secret = config
            .secret
            .clone()
            .ok_or_else(|| anyhow!("no lookup secret configured"))?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            secret,
            limiter,
        })
    }

    fn request(&self, identifier: &str) -> Result<(u16, Value)> {
        let time = Utc::now().timestamp_millis();
        let fid = identifier.trim().to_string();
        let sign = sign_payload(&[("fid", fid.clone()), ("time", time.to_string())], &self.secret);

        let response = self
            .client
            .post(&self.endpoint)
            .header("User-Agent", "leaderboard-scan")
            .json(&json!({ "fid": fid, "time": time, "sign": sign }))
            .send()
            .context("lookup request failed")?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().unwrap_or(Value::Null);
        Ok((status, body))
    }
}

impl IdentityLookup for HttpIdentityLookup {
    fn fetch(&self, identifier: &str) -> Option<LookupResult> {
        self.limiter.acquire();
        match self.request(identifier) {
            Ok((status, body)) => {
                let result = interpret_response(status, &body);
                debug!("Lookup {} -> {:?}", identifier, result);
                result
            }
            Err(e) => {
                warn!("Lookup error for {}: {:#}", identifier, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_payload_sorts_keys() {
        let forward = sign_payload(&[("fid", "123".into()), ("time", "99".into())], "s3cret");
        let reversed = sign_payload(&[("time", "99".into()), ("fid", "123".into())], "s3cret");
        assert_eq!(forward, reversed);
        assert_eq!(forward, format!("{:x}", md5::compute("fid=123&time=99s3cret")));
    }

    #[test]
    fn test_found_profile() {
        let body = json!({
            "code": 0,
            "msg": "success",
            "data": {
                "fid": 111629384,
                "nickname": "Warden",
                "kid": "241",
                "stove_lv": 30,
                "stove_lv_content": "",
                "avatar_image": "https://cdn.example/a.png"
            }
        });
        assert_eq!(
            interpret_response(200, &body),
            Some(LookupResult::Found(IdentityProfile {
                display_name: Some("Warden".to_string()),
                avatar_url: Some("https://cdn.example/a.png".to_string()),
                region_id: Some(241),
                level: Some(30),
                level_label: None,
            }))
        );
    }

    #[test]
    fn test_role_not_exist_is_authoritative() {
        let body = json!({ "code": 1, "msg": "ROLE NOT EXIST.", "data": [] });
        assert_eq!(interpret_response(200, &body), Some(LookupResult::NotFound));
    }

    #[test]
    fn test_transient_failures() {
        assert_eq!(interpret_response(429, &Value::Null), None);
        assert_eq!(interpret_response(500, &json!({ "code": 0 })), None);
        assert_eq!(interpret_response(200, &json!({ "code": 7, "msg": "busy" })), None);
    }

    #[test]
    fn test_http_lookup_requires_endpoint_and_secret() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(1)));
        assert!(HttpIdentityLookup::new(&LookupConfig::default(), limiter.clone()).is_err());

        let config = LookupConfig {
            endpoint: Some("http://127.0.0.1:9/api/player".to_string()),
            secret: Some("x".to_string()),
            ..LookupConfig::default()
        };
        assert!(HttpIdentityLookup::new(&config, limiter).is_ok());
    }
}
