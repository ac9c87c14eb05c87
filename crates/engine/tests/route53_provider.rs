//! Integration tests for the Route53 DNS provider
//!
//! The Route53 API is mocked with wiremock through the endpoint override.

use std::time::Duration;

use wiremock::matchers::{body_string_contains, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use certfleet_config::Route53Config;
use certfleet_engine::acme::dns::{DnsProvider, DnsProviderError, Route53Provider};

const ZONES_PATH: &str = "/2013-04-01/hostedzonesbyname";

fn provider(server: &MockServer) -> Route53Provider {
    let config = Route53Config {
        access_key: "AKIDEXAMPLE".to_string(),
        secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some(server.uri()),
    };
    Route53Provider::new(&config, Duration::from_secs(5)).unwrap()
}

fn zones_response(zones: &[(&str, &str)]) -> String {
    let zones: String = zones
        .iter()
        .map(|(id, name)| {
            format!(
                "<HostedZone><Id>/hostedzone/{}</Id><Name>{}</Name>\
                 <CallerReference>ref</CallerReference></HostedZone>",
                id, name
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ListHostedZonesByNameResponse xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
  <HostedZones>{}</HostedZones>
  <IsTruncated>false</IsTruncated>
  <MaxItems>1</MaxItems>
</ListHostedZonesByNameResponse>"#,
        zones
    )
}

const CHANGE_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ChangeResourceRecordSetsResponse xmlns="https://route53.amazonaws.com/doc/2013-04-01/">
  <ChangeInfo><Id>/change/C1</Id><Status>PENDING</Status></ChangeInfo>
</ChangeResourceRecordSetsResponse>"#;

async fn mount_zone(server: &MockServer, dns_name: &str, zones: &[(&str, &str)], times: u64) {
    Mock::given(method("GET"))
        .and(path(ZONES_PATH))
        .and(query_param("dnsname", dns_name))
        .respond_with(ResponseTemplate::new(200).set_body_string(zones_response(zones)))
        .expect(times)
        .mount(server)
        .await;
}

// ============================================================================
// Record changes
// ============================================================================

#[tokio::test]
async fn test_create_record_upserts_signed_change() {
    let server = MockServer::start().await;
    mount_zone(&server, "example.com", &[("Z1EXAMPLE", "example.com.")], 1).await;

    Mock::given(method("POST"))
        .and(path("/2013-04-01/hostedzone/Z1EXAMPLE/rrset"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(body_string_contains("<Action>UPSERT</Action>"))
        .and(body_string_contains("<Name>_acme-challenge.example.com.</Name>"))
        .and(body_string_contains("<Type>TXT</Type>"))
        .and(body_string_contains("digest-value"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHANGE_RESPONSE))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .create_txt_record("*.example.com", "digest-value")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_zone_found_on_parent_domain() {
    let server = MockServer::start().await;
    // Route53 answers with the next zone in order when there is no exact match
    mount_zone(&server, "www.example.com", &[("ZOTHER", "example.net.")], 1).await;
    mount_zone(&server, "example.com", &[("Z1EXAMPLE", "example.com.")], 1).await;

    Mock::given(method("POST"))
        .and(path("/2013-04-01/hostedzone/Z1EXAMPLE/rrset"))
        .and(body_string_contains("<Name>_acme-challenge.www.example.com.</Name>"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHANGE_RESPONSE))
        .expect(1)
        .mount(&server)
        .await;

    provider(&server)
        .create_txt_record("*.www.example.com", "digest-value")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_zone_lookup_is_cached() {
    let server = MockServer::start().await;
    mount_zone(&server, "example.com", &[("Z1EXAMPLE", "example.com.")], 1).await;

    Mock::given(method("POST"))
        .and(path("/2013-04-01/hostedzone/Z1EXAMPLE/rrset"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHANGE_RESPONSE))
        .expect(2)
        .mount(&server)
        .await;

    let provider = provider(&server);
    provider
        .create_txt_record("*.example.com", "digest-value")
        .await
        .unwrap();
    provider
        .delete_txt_record("*.example.com", "digest-value")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_missing_record_is_ok() {
    let server = MockServer::start().await;
    mount_zone(&server, "example.com", &[("Z1EXAMPLE", "example.com.")], 1).await;

    Mock::given(method("POST"))
        .and(path("/2013-04-01/hostedzone/Z1EXAMPLE/rrset"))
        .and(body_string_contains("<Action>DELETE</Action>"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<ErrorResponse><Error><Code>InvalidChangeBatch</Code><Message>Tried to delete \
             resource record set [name='_acme-challenge.example.com.', type='TXT'] but it was \
             not found</Message></Error></ErrorResponse>",
        ))
        .mount(&server)
        .await;

    let result = provider(&server)
        .delete_txt_record("*.example.com", "digest-value")
        .await;
    assert!(result.is_ok());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_zone_not_found() {
    let server = MockServer::start().await;
    mount_zone(&server, "example.com", &[("ZOTHER", "example.net.")], 1).await;

    let err = provider(&server)
        .create_txt_record("*.example.com", "digest-value")
        .await
        .unwrap_err();
    assert!(matches!(err, DnsProviderError::ZoneNotFound { .. }));
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ZONES_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string("SignatureDoesNotMatch"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_txt_record("*.example.com", "digest-value")
        .await
        .unwrap_err();
    assert!(matches!(err, DnsProviderError::Authentication(_)));
}

#[tokio::test]
async fn test_change_rejected() {
    let server = MockServer::start().await;
    mount_zone(&server, "example.com", &[("Z1EXAMPLE", "example.com.")], 1).await;

    Mock::given(method("POST"))
        .and(path("/2013-04-01/hostedzone/Z1EXAMPLE/rrset"))
        .respond_with(ResponseTemplate::new(400).set_body_string("InvalidInput"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .create_txt_record("*.example.com", "digest-value")
        .await
        .unwrap_err();
    match err {
        DnsProviderError::RecordCreation { record_name, message } => {
            assert_eq!(record_name, "_acme-challenge.example.com");
            assert!(message.contains("InvalidInput"));
        }
        other => panic!("unexpected error: {}", other),
    }
}
