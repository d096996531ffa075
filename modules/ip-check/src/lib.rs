//! Public IP detection by majority vote across independent echo providers,
//! and ASN/ISP/geo identity enrichment with a TTL cache in front of it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use netpulse_core::ProbeError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One IP-echo endpoint returning the caller's address as plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub url: String,
}

pub fn default_providers() -> Vec<Provider> {
    vec![
        Provider {
            name: "ipify".into(),
            url: "https://api.ipify.org".into(),
        },
        Provider {
            name: "ifconfig.me".into(),
            url: "https://ifconfig.me/ip".into(),
        },
        Provider {
            name: "icanhazip".into(),
            url: "https://icanhazip.com".into(),
        },
    ]
}

fn user_agent() -> String {
    format!("netpulse/{}", env!("CARGO_PKG_VERSION"))
}

/// Resolves the public address by querying every provider concurrently and
/// keeping the answer most of them agree on.
#[derive(Debug)]
pub struct IpCheck {
    providers: Vec<Provider>,
    client: Client,
    overall_timeout: Duration,
}

impl IpCheck {
    pub fn new(providers: Vec<Provider>, overall_timeout: Duration) -> Result<Self, ProbeError> {
        if providers.is_empty() {
            return Err(ProbeError::Config(
                "at least one IP provider is required".into(),
            ));
        }
        let overall_timeout = if overall_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            overall_timeout
        };
        let client = Client::builder()
            .timeout(overall_timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|err| ProbeError::Config(err.to_string()))?;
        Ok(IpCheck {
            providers,
            client,
            overall_timeout,
        })
    }

    /// Query all providers and return the majority address. Collection stops
    /// when every provider replied, the overall timeout elapses, or the
    /// token fires (which returns [`ProbeError::Cancelled`] at once). A
    /// malformed or failing provider is skipped, never fatal; only zero
    /// usable answers produce [`ProbeError::NoConsensus`].
    pub async fn public_ip(&self, cancel: &CancellationToken) -> Result<String, ProbeError> {
        let mut set = JoinSet::new();
        for provider in self.providers.clone() {
            let client = self.client.clone();
            set.spawn(async move {
                let res = fetch_ip(&client, &provider).await;
                (provider.name, res)
            });
        }

        let deadline = tokio::time::sleep(self.overall_timeout);
        tokio::pin!(deadline);

        let mut answers: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
                _ = &mut deadline => break,
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((name, Ok(ip)))) => {
                        debug!(provider = %name, ip = %ip, "provider answered");
                        answers.push(ip);
                    }
                    Some(Ok((name, Err(err)))) => {
                        debug!(provider = %name, error = %err, "provider failed");
                    }
                    Some(Err(_)) => {}
                },
            }
        }

        consensus(&answers).ok_or(ProbeError::NoConsensus)
    }
}

async fn fetch_ip(client: &Client, provider: &Provider) -> Result<String, ProbeError> {
    let resp = client
        .get(&provider.url)
        .send()
        .await
        .map_err(|err| ProbeError::Other(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProbeError::Other(format!("status {}", resp.status())));
    }
    let body = resp
        .text()
        .await
        .map_err(|err| ProbeError::Other(err.to_string()))?;
    let ip = body.trim().to_string();
    if !plausible_ip(&ip) {
        return Err(ProbeError::Other(format!("implausible address {ip:?}")));
    }
    Ok(ip)
}

/// Minimal shape check: something address-sized containing a dot or colon.
fn plausible_ip(s: &str) -> bool {
    (7..=45).contains(&s.len()) && (s.contains('.') || s.contains(':'))
}

/// Majority vote over provider answers. Ties go to the answer seen first in
/// this run's collection order, which keeps the choice deterministic per
/// run without caring which provider it came from.
fn consensus(answers: &[String]) -> Option<String> {
    let mut tally: HashMap<&str, (usize, usize)> = HashMap::new();
    for (idx, ip) in answers.iter().enumerate() {
        let entry = tally.entry(ip.as_str()).or_insert((0, idx));
        entry.0 += 1;
    }
    tally
        .into_iter()
        .max_by(|a, b| (a.1 .0).cmp(&b.1 .0).then((b.1 .1).cmp(&a.1 .1)))
        .map(|(ip, _)| ip.to_string())
}

/// Identity metadata for an address, as returned by ip-api.com.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsnInfo {
    #[serde(rename = "query", default)]
    pub ip: String,
    #[serde(rename = "as", default)]
    pub asn: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
}

const IDENTITY_URL: &str = "http://ip-api.com/json";

/// Default freshness window for cached identity lookups.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Resolves ASN/ISP/geo metadata for an address, remembering answers for a
/// day so repeated enrichment of a stable address stays local.
pub struct Enricher {
    client: Client,
    cache: RwLock<HashMap<String, (AsnInfo, Instant)>>,
    ttl: Duration,
}

impl Enricher {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let timeout = if timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            timeout
        };
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|err| ProbeError::Config(err.to_string()))?;
        Ok(Enricher {
            client,
            cache: RwLock::new(HashMap::new()),
            ttl: CACHE_TTL,
        })
    }

    pub async fn enrich(
        &self,
        cancel: &CancellationToken,
        ip: &str,
    ) -> Result<AsnInfo, ProbeError> {
        if let Some(hit) = self.cached(ip) {
            return Ok(hit);
        }

        let url = format!("{IDENTITY_URL}/{ip}?fields=query,as,isp,org,country,city");
        let info: AsnInfo = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            res = fetch_identity(&self.client, &url) => res?,
        };

        let mut cache = self.cache.write().unwrap();
        let ttl = self.ttl;
        cache.retain(|_, (_, at)| at.elapsed() < ttl);
        cache.insert(ip.to_string(), (info.clone(), Instant::now()));
        Ok(info)
    }

    fn cached(&self, ip: &str) -> Option<AsnInfo> {
        let cache = self.cache.read().unwrap();
        let (info, at) = cache.get(ip)?;
        (at.elapsed() < self.ttl).then(|| info.clone())
    }
}

async fn fetch_identity(client: &Client, url: &str) -> Result<AsnInfo, ProbeError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|err| ProbeError::Other(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ProbeError::Other(format!(
            "identity api status {}",
            resp.status()
        )));
    }
    resp.json::<AsnInfo>()
        .await
        .map_err(|err| ProbeError::Other(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn majority_wins() {
        let got = consensus(&answers(&["203.0.113.7", "203.0.113.7", "198.51.100.2"]));
        assert_eq!(got.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn ties_break_to_first_seen() {
        let got = consensus(&answers(&["198.51.100.2", "203.0.113.7"]));
        assert_eq!(got.as_deref(), Some("198.51.100.2"));
        let got = consensus(&answers(&["203.0.113.7", "198.51.100.2"]));
        assert_eq!(got.as_deref(), Some("203.0.113.7"));
    }

    #[test]
    fn no_answers_means_no_consensus() {
        assert!(consensus(&[]).is_none());
    }

    #[test]
    fn shape_check_accepts_addresses_and_rejects_noise() {
        assert!(plausible_ip("203.0.113.7"));
        assert!(plausible_ip("2001:db8::1"));
        assert!(!plausible_ip("::1")); // too short for the shape check
        assert!(!plausible_ip("localhost"));
        assert!(!plausible_ip(""));
        assert!(!plausible_ip(&"x".repeat(60)));
    }

    #[test]
    fn construction_requires_a_provider() {
        let err = IpCheck::new(Vec::new(), Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }

    #[test]
    fn identity_json_decodes_with_missing_fields() {
        let info: AsnInfo = serde_json::from_str(
            r#"{"query":"203.0.113.7","as":"AS64500 Example","country":"NL"}"#,
        )
        .unwrap();
        assert_eq!(info.ip, "203.0.113.7");
        assert_eq!(info.asn, "AS64500 Example");
        assert_eq!(info.country, "NL");
        assert_eq!(info.isp, "");
    }

    #[tokio::test]
    async fn enricher_serves_cached_identity() {
        let enricher = Enricher::new(Duration::from_secs(1)).unwrap();
        enricher.cache.write().unwrap().insert(
            "203.0.113.7".into(),
            (
                AsnInfo {
                    ip: "203.0.113.7".into(),
                    asn: "AS64500".into(),
                    ..AsnInfo::default()
                },
                Instant::now(),
            ),
        );
        let cancel = CancellationToken::new();
        let info = enricher.enrich(&cancel, "203.0.113.7").await.unwrap();
        assert_eq!(info.asn, "AS64500");
    }

    #[tokio::test]
    async fn cancelled_resolution_fails_fast() {
        let check = IpCheck::new(default_providers(), Duration::from_secs(30)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = check.public_ip(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
