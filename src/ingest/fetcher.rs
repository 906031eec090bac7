use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.mfapi.in/mf";

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Retry budget for one upstream call: `attempts` tries total, sleeping
/// `base_sleep * attempt` between failures (linear backoff).
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub base_sleep: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_sleep: Duration::from_millis(500),
        }
    }
}

/// One NAV observation exactly as the upstream sent it. Fields stay
/// optional: a malformed entry is the cleaner's problem, not a fetch error.
#[derive(Debug, Clone, Default)]
pub struct RawNavEntry {
    pub date: Option<String>,
    pub nav: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemeMeta {
    pub scheme_name: Option<String>,
    pub scheme_category: Option<String>,
    pub aum: Option<String>,
}

/// History + metadata for one scheme, in upstream native order
/// (typically newest-first; never assume more than that).
#[derive(Debug, Clone, Default)]
pub struct SchemeFetch {
    pub entries: Vec<RawNavEntry>,
    pub meta: SchemeMeta,
}

#[derive(Debug, Clone)]
pub struct CatalogScheme {
    pub code: String,
    pub name: Option<String>,
}

/// Client for the mfapi-style NAV source. Holds the one shared HTTP client
/// for the whole run; construct it once and clone cheaply.
#[derive(Debug, Clone)]
pub struct MfapiClient {
    base_url: String,
    http: Client,
    policy: FetchPolicy,
}

impl MfapiClient {
    pub fn new(base_url: Option<&str>, timeout_secs: u64, policy: FetchPolicy) -> Result<Self> {
        let base_url = base_url
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let http = Client::builder()
            .user_agent(concat!("fundnav/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            base_url,
            http,
            policy,
        })
    }

    /// NAV history + metadata for one scheme. 404 means the scheme does not
    /// exist upstream and yields an empty result immediately — no retries,
    /// no error. Every other failure is retried per the policy; exhaustion
    /// surfaces the last error to the caller, which logs it and moves on.
    pub async fn fetch_nav_history(&self, scheme_id: &str) -> Result<SchemeFetch> {
        let url = format!("{}/{}", self.base_url, scheme_id);
        match self.get_json_with_retries(&url, true).await? {
            Some(payload) => Ok(parse_nav_payload(&payload)),
            None => {
                debug!(scheme = scheme_id, "scheme not found upstream (404)");
                Ok(SchemeFetch::default())
            }
        }
    }

    /// The full scheme catalog (`GET {base_url}` returns every scheme the
    /// upstream knows about). Same retry policy; a 404 here is a real error.
    pub async fn list_schemes(&self) -> Result<Vec<CatalogScheme>> {
        let payload = self
            .get_json_with_retries(&self.base_url, false)
            .await?
            .ok_or_else(|| anyhow!("scheme catalog unavailable at {}", self.base_url))?;
        Ok(parse_catalog(&payload))
    }

    async fn get_json_with_retries(
        &self,
        url: &str,
        not_found_is_empty: bool,
    ) -> Result<Option<Value>> {
        let attempts = self.policy.attempts.max(1);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=attempts {
            match self
                .http
                .get(url)
                .header("Accept", "application/json")
                .send()
                .await
            {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND && not_found_is_empty => {
                    return Ok(None);
                }
                Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                    Ok(payload) => return Ok(Some(payload)),
                    Err(e) => last_err = Some(anyhow::Error::new(e)),
                },
                Ok(resp) => {
                    let status = resp.status();
                    let body = truncate_for_log(resp.text().await.unwrap_or_default(), 500);
                    last_err = Some(anyhow!("request to {url} failed: {status} body={body}"));
                }
                Err(e) => last_err = Some(anyhow::Error::new(e)),
            }

            if attempt < attempts {
                sleep(self.policy.base_sleep * attempt).await;
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("request to {url} failed"))
            .context(format!("exhausted {attempts} attempts for {url}")))
    }
}

/// Short classifier for error-log records.
pub fn error_kind(e: &anyhow::Error) -> &'static str {
    match e.downcast_ref::<reqwest::Error>() {
        Some(re) if re.is_timeout() => "timeout",
        Some(re) if re.is_connect() => "connect",
        Some(re) if re.is_decode() => "decode",
        Some(_) => "request",
        None => "http",
    }
}

/// Defensive extraction: upstream payload shapes drift, so pull fields out
/// of the raw JSON rather than failing the whole scheme on one odd value.
pub fn parse_nav_payload(payload: &Value) -> SchemeFetch {
    let meta_node = payload.get("meta");
    let meta = SchemeMeta {
        scheme_name: str_field(meta_node, "scheme_name"),
        scheme_category: str_field(meta_node, "scheme_category"),
        aum: meta_node
            .and_then(|m| m.get("aum"))
            .and_then(value_as_string),
    };

    let entries = payload
        .get("data")
        .and_then(|d| d.as_array())
        .map(|arr| {
            arr.iter()
                .map(|item| RawNavEntry {
                    date: item.get("date").and_then(value_as_string),
                    nav: item.get("nav").and_then(value_as_string),
                })
                .collect()
        })
        .unwrap_or_default();

    SchemeFetch { entries, meta }
}

pub fn parse_catalog(payload: &Value) -> Vec<CatalogScheme> {
    let Some(items) = payload.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let code = item.get("schemeCode").and_then(value_as_string)?;
            let name = item
                .get("schemeName")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Some(CatalogScheme { code, name })
        })
        .collect()
}

fn str_field(node: Option<&Value>, key: &str) -> Option<String> {
    node.and_then(|m| m.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn value_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_nav_payload() {
        let payload = json!({
            "meta": {
                "scheme_name": "Axis Bluechip Fund",
                "scheme_category": "Large Cap",
                "aum": 12345.67
            },
            "data": [
                {"date": "02-01-2023", "nav": "41.23"},
                {"date": "01-01-2023", "nav": "41.10"},
                {"nav": "40.00"},
                "garbage"
            ]
        });

        let fetch = parse_nav_payload(&payload);
        assert_eq!(fetch.meta.scheme_name.as_deref(), Some("Axis Bluechip Fund"));
        assert_eq!(fetch.meta.aum.as_deref(), Some("12345.67"));
        assert_eq!(fetch.entries.len(), 4);
        assert_eq!(fetch.entries[0].date.as_deref(), Some("02-01-2023"));
        assert_eq!(fetch.entries[2].date, None);
        assert_eq!(fetch.entries[3].date, None);
        assert_eq!(fetch.entries[3].nav, None);
    }

    #[test]
    fn missing_sections_parse_to_empty() {
        let fetch = parse_nav_payload(&json!({"status": "SUCCESS"}));
        assert!(fetch.entries.is_empty());
        assert!(fetch.meta.scheme_name.is_none());
        assert!(fetch.meta.aum.is_none());
    }

    #[test]
    fn catalog_accepts_numeric_and_string_codes() {
        let payload = json!([
            {"schemeCode": 100027, "schemeName": "Grindlays Super Saver"},
            {"schemeCode": "100028"},
            {"schemeName": "no code, skipped"}
        ]);
        let catalog = parse_catalog(&payload);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].code, "100027");
        assert_eq!(catalog[0].name.as_deref(), Some("Grindlays Super Saver"));
        assert_eq!(catalog[1].code, "100028");
        assert!(catalog[1].name.is_none());
    }

    #[test]
    fn log_truncation_respects_char_boundaries() {
        let s = "é".repeat(400);
        let out = truncate_for_log(s, 501);
        assert!(out.ends_with('…'));
        assert!(out.len() <= 504);
    }

    /// Tiny canned-response HTTP listener: serves the given
    /// (status, body) pairs to successive connections, then stops.
    async fn serve_responses(responses: Vec<(u16, String)>) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    _ => "Internal Server Error",
                };
                let resp = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        addr
    }

    fn quick_policy(attempts: u32) -> FetchPolicy {
        FetchPolicy {
            attempts,
            base_sleep: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn not_found_is_an_empty_result_not_an_error() {
        let addr = serve_responses(vec![(404, String::new())]).await;
        let client = MfapiClient::new(
            Some(&format!("http://{addr}")),
            5,
            quick_policy(3),
        )
        .unwrap();

        let fetch = client.fetch_nav_history("999999").await.unwrap();
        assert!(fetch.entries.is_empty());
        assert!(fetch.meta.scheme_name.is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let payload =
            r#"{"meta":{"scheme_name":"Fund"},"data":[{"date":"01-01-2023","nav":"10.5"}]}"#;
        let addr = serve_responses(vec![
            (500, String::new()),
            (200, payload.to_string()),
        ])
        .await;
        let client = MfapiClient::new(
            Some(&format!("http://{addr}")),
            5,
            quick_policy(3),
        )
        .unwrap();

        let fetch = client.fetch_nav_history("100001").await.unwrap();
        assert_eq!(fetch.entries.len(), 1);
        assert_eq!(fetch.meta.scheme_name.as_deref(), Some("Fund"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let addr = serve_responses(vec![
            (500, String::new()),
            (500, String::new()),
        ])
        .await;
        let client = MfapiClient::new(
            Some(&format!("http://{addr}")),
            5,
            quick_policy(2),
        )
        .unwrap();

        let err = client.fetch_nav_history("100001").await.unwrap_err();
        assert!(err.to_string().contains("exhausted 2 attempts"));
    }
}
