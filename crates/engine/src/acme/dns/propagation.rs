//! DNS visibility checking for DNS-01 challenges
//!
//! Answers, once per reconciliation tick, whether the challenge TXT record
//! can be resolved through public resolvers. There is no waiting here: the
//! state machine counts the attempts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use tracing::trace;

use super::provider::{challenge_record_fqdn, DnsProviderError, DnsResult, RecordVisibility};

/// Resolver settings for visibility checks
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Per-query timeout
    pub timeout: Duration,
    /// Nameservers to query (empty = system defaults)
    pub nameservers: Vec<IpAddr>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            nameservers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
            ],
        }
    }
}

/// TXT record visibility checker backed by hickory
#[derive(Debug)]
pub struct PropagationChecker {
    config: PropagationConfig,
    resolver: TokioAsyncResolver,
}

impl PropagationChecker {
    /// Create a checker with the default public resolvers
    pub fn new() -> Self {
        Self::with_config(PropagationConfig::default())
    }

    pub fn with_config(config: PropagationConfig) -> Self {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config
                    .add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout;
        opts.attempts = 2;
        // Every check must see the current answer
        opts.cache_size = 0;

        let resolver = TokioAsyncResolver::tokio(resolver_config, opts);
        Self { config, resolver }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    async fn check_record(&self, record_name: &str, expected_value: &str) -> DnsResult<bool> {
        match self.resolver.txt_lookup(record_name).await {
            Ok(records) => {
                for record in records.iter() {
                    // TXT records can have multiple strings, join them
                    let value: String = record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect();

                    trace!(
                        record = %record_name,
                        found_value = %value,
                        expected_value = %expected_value,
                        "Checking TXT record"
                    );

                    if value == expected_value {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(false),
                _ => Err(DnsProviderError::Lookup {
                    record_name: record_name.to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

impl Default for PropagationChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordVisibility for PropagationChecker {
    async fn is_visible(&self, domain: &str, digest: &str) -> DnsResult<bool> {
        let record_name = challenge_record_fqdn(domain);
        self.check_record(&record_name, digest).await
    }
}
