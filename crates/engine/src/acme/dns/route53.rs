//! AWS Route53 DNS provider
//!
//! Talks to the Route53 REST API directly: hosted zones are looked up by name
//! and challenge records are changed through `ChangeResourceRecordSets`.
//! Requests are signed with AWS Signature Version 4.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace};
use url::Url;

use certfleet_config::Route53Config;

use super::provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsProviderError, DnsResult,
    CHALLENGE_TTL,
};

type HmacSha256 = Hmac<Sha256>;

/// Public Route53 API endpoint
const ROUTE53_ENDPOINT: &str = "https://route53.amazonaws.com";

/// Route53 API version path prefix
const API_VERSION: &str = "2013-04-01";

/// Route53 is a global service signed in us-east-1
const SIGNING_SERVICE: &str = "route53";

const XML_NAMESPACE: &str = "https://route53.amazonaws.com/doc/2013-04-01/";

/// Route53 DNS provider
#[derive(Debug)]
pub struct Route53Provider {
    client: Client,
    endpoint: Url,
    region: String,
    access_key: String,
    secret_key: String,
    /// Cache of domain -> hosted zone id
    zone_cache: RwLock<HashMap<String, String>>,
}

impl Route53Provider {
    /// Create a provider from configuration
    pub fn new(config: &Route53Config, timeout: Duration) -> DnsResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        let endpoint = config.endpoint.as_deref().unwrap_or(ROUTE53_ENDPOINT);
        let endpoint = Url::parse(endpoint).map_err(|e| {
            DnsProviderError::Configuration(format!("Invalid Route53 endpoint '{}': {}", endpoint, e))
        })?;

        Ok(Self {
            client,
            endpoint,
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            zone_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Find the hosted zone serving a domain, walking up parent domains
    async fn get_zone_id(&self, domain: &str) -> DnsResult<String> {
        let normalized = normalize_domain(domain);

        if let Some(zone_id) = self.zone_cache.read().get(normalized) {
            trace!(domain = %domain, zone_id = %zone_id, "Zone ID found in cache");
            return Ok(zone_id.clone());
        }

        let mut candidate = normalized;
        loop {
            if let Some(zone) = self.find_zone_by_name(candidate).await? {
                let zone_id = zone
                    .id
                    .strip_prefix("/hostedzone/")
                    .unwrap_or(&zone.id)
                    .to_string();
                self.zone_cache
                    .write()
                    .insert(normalized.to_string(), zone_id.clone());
                debug!(domain = %domain, zone_id = %zone_id, zone_name = %zone.name, "Found hosted zone for domain");
                return Ok(zone_id);
            }

            match candidate.find('.') {
                Some(pos) if candidate[pos + 1..].contains('.') => {
                    candidate = &candidate[pos + 1..];
                }
                _ => {
                    return Err(DnsProviderError::ZoneNotFound {
                        domain: domain.to_string(),
                    })
                }
            }
        }
    }

    async fn find_zone_by_name(&self, name: &str) -> DnsResult<Option<HostedZone>> {
        let path = format!("/{}/hostedzonesbyname", API_VERSION);
        let query = vec![
            ("dnsname".to_string(), name.to_string()),
            ("maxitems".to_string(), "1".to_string()),
        ];

        let body = self
            .send(Method::GET, &path, &query, String::new())
            .await
            .map_err(|e| match e {
                RequestFailure::Status(status, body) => DnsProviderError::ApiRequest(format!(
                    "Failed to list hosted zones: HTTP {} - {}",
                    status, body
                )),
                RequestFailure::Provider(e) => e,
            })?;

        let response: ListHostedZonesByNameResponse = quick_xml::de::from_str(&body)
            .map_err(|e| {
                DnsProviderError::ApiRequest(format!("Failed to parse hosted zones response: {}", e))
            })?;

        let wanted = format!("{}.", name.trim_end_matches('.'));
        Ok(response
            .hosted_zones
            .hosted_zone
            .into_iter()
            .find(|zone| zone.name.eq_ignore_ascii_case(&wanted)))
    }

    async fn change_record(&self, action: ChangeAction, domain: &str, digest: &str) -> Result<(), RequestFailure> {
        let zone_id = self.get_zone_id(domain).await.map_err(RequestFailure::Provider)?;
        let record_name = format!("{}.", challenge_record_fqdn(domain));

        let request = ChangeResourceRecordSetsRequest {
            xmlns: XML_NAMESPACE,
            change_batch: ChangeBatch {
                changes: Changes {
                    change: vec![Change {
                        action,
                        resource_record_set: ResourceRecordSet {
                            name: record_name.clone(),
                            record_type: "TXT",
                            ttl: CHALLENGE_TTL,
                            resource_records: ResourceRecords {
                                resource_record: vec![ResourceRecord {
                                    value: format!("\"{}\"", digest),
                                }],
                            },
                        },
                    }],
                },
            },
        };

        let body = quick_xml::se::to_string_with_root("ChangeResourceRecordSetsRequest", &request)
            .map_err(|e| {
                RequestFailure::Provider(DnsProviderError::Configuration(format!(
                    "Failed to serialize change batch: {}",
                    e
                )))
            })?;
        let body = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}", body);

        debug!(
            domain = %domain,
            zone_id = %zone_id,
            record = %record_name,
            action = ?action,
            "Submitting Route53 change batch"
        );

        let path = format!("/{}/hostedzone/{}/rrset", API_VERSION, zone_id);
        self.send(Method::POST, &path, &[], body).await?;
        Ok(())
    }

    /// Sign and send a request, returning the response body on success
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: String,
    ) -> Result<String, RequestFailure> {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }

        let host = host_header(&url);
        let signed = sign_request(
            &SigningInput {
                method: method.as_str(),
                host: &host,
                path,
                query,
                payload: body.as_bytes(),
                region: &self.region,
                access_key: &self.access_key,
                secret_key: &self.secret_key,
            },
            Utc::now(),
        )
        .map_err(RequestFailure::Provider)?;

        let response = self
            .client
            .request(method, url)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .header("content-type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                RequestFailure::Provider(DnsProviderError::ApiRequest(format!(
                    "Route53 request failed: {}",
                    e
                )))
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            return Err(RequestFailure::Provider(DnsProviderError::Authentication(
                format!("Route53 rejected credentials: HTTP {}", status),
            )));
        }
        if !status.is_success() {
            return Err(RequestFailure::Status(status, text));
        }

        Ok(text)
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    fn name(&self) -> &'static str {
        "route53"
    }

    async fn create_txt_record(&self, domain: &str, digest: &str) -> DnsResult<()> {
        let record_name = challenge_record_fqdn(domain);
        self.change_record(ChangeAction::Upsert, domain, digest)
            .await
            .map_err(|e| e.into_provider_error(|message| DnsProviderError::RecordCreation {
                record_name: record_name.clone(),
                message,
            }))?;

        info!(domain = %domain, record = %record_name, "Created DNS challenge record");
        Ok(())
    }

    async fn delete_txt_record(&self, domain: &str, digest: &str) -> DnsResult<()> {
        let record_name = challenge_record_fqdn(domain);
        match self.change_record(ChangeAction::Delete, domain, digest).await {
            Ok(()) => {
                info!(domain = %domain, record = %record_name, "Deleted DNS challenge record");
                Ok(())
            }
            // Route53 rejects deleting a record set that does not exist
            Err(RequestFailure::Status(status, body))
                if status == StatusCode::BAD_REQUEST && body.contains("not found") =>
            {
                debug!(domain = %domain, record = %record_name, "DNS challenge record already absent");
                Ok(())
            }
            Err(e) => Err(e.into_provider_error(|message| DnsProviderError::RecordDeletion {
                record_name: record_name.clone(),
                message,
            })),
        }
    }
}

/// Failure of a single signed request
#[derive(Debug)]
enum RequestFailure {
    /// Non-success HTTP status with the response body
    Status(StatusCode, String),
    Provider(DnsProviderError),
}

impl RequestFailure {
    fn into_provider_error(self, on_status: impl FnOnce(String) -> DnsProviderError) -> DnsProviderError {
        match self {
            RequestFailure::Status(status, body) => on_status(format!("HTTP {} - {}", status, body)),
            RequestFailure::Provider(e) => e,
        }
    }
}

/// `Host` header value as reqwest will send it
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

// =============================================================================
// AWS Signature Version 4
// =============================================================================

struct SigningInput<'a> {
    method: &'a str,
    host: &'a str,
    path: &'a str,
    query: &'a [(String, String)],
    payload: &'a [u8],
    region: &'a str,
    access_key: &'a str,
    secret_key: &'a str,
}

#[derive(Debug)]
struct SignedHeaders {
    amz_date: String,
    authorization: String,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> DnsResult<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| DnsProviderError::Configuration(format!("Invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the SigV4 signing key for a date, region and service
fn signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> DnsResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign_request(input: &SigningInput<'_>, now: DateTime<Utc>) -> DnsResult<SignedHeaders> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\nx-amz-date:{}\n\nhost;x-amz-date\n{}",
        input.method,
        input.path,
        canonical_query(input.query),
        input.host,
        amz_date,
        hex::encode(Sha256::digest(input.payload)),
    );

    let scope = format!("{}/{}/{}/aws4_request", date_stamp, input.region, SIGNING_SERVICE);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes())),
    );

    let key = signing_key(input.secret_key, &date_stamp, input.region, SIGNING_SERVICE)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(SignedHeaders {
        amz_date,
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders=host;x-amz-date, Signature={}",
            input.access_key, scope, signature
        ),
    })
}

// =============================================================================
// Route53 XML Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListHostedZonesByNameResponse {
    #[serde(default)]
    hosted_zones: HostedZones,
}

#[derive(Debug, Default, Deserialize)]
struct HostedZones {
    #[serde(rename = "HostedZone", default)]
    hosted_zone: Vec<HostedZone>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostedZone {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum ChangeAction {
    Upsert,
    Delete,
}

#[derive(Debug, Serialize)]
struct ChangeResourceRecordSetsRequest {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "ChangeBatch")]
    change_batch: ChangeBatch,
}

#[derive(Debug, Serialize)]
struct ChangeBatch {
    #[serde(rename = "Changes")]
    changes: Changes,
}

#[derive(Debug, Serialize)]
struct Changes {
    #[serde(rename = "Change")]
    change: Vec<Change>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Change {
    action: ChangeAction,
    resource_record_set: ResourceRecordSet,
}

#[derive(Debug, Serialize)]
struct ResourceRecordSet {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Type")]
    record_type: &'static str,
    #[serde(rename = "TTL")]
    ttl: u32,
    #[serde(rename = "ResourceRecords")]
    resource_records: ResourceRecords,
}

#[derive(Debug, Serialize)]
struct ResourceRecords {
    #[serde(rename = "ResourceRecord")]
    resource_record: Vec<ResourceRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceRecord {
    value: String,
}
