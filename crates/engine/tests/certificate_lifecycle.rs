//! Integration tests for the certificate state machine.
//!
//! The ACME server and DNS provider are replaced by scripted mocks; the
//! in-memory store counts saves so that the "no write while AVAILABLE" rule
//! can be checked tick by tick.

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use certfleet_common::PeerId;
use certfleet_config::{CertificateConfig, CertificateMode, CertificatesConfig};
use certfleet_engine::acme::dns::{DnsResult, RecordVisibility};
use certfleet_engine::acme::{
    AcmeDriver, AcmeError, AcmeStatus, CertificateData, CertificateStateMachine, CertificateStore,
    ChallengeKind, ChallengeManager, ChangeOrigin, Dns01Provisioner, DnsProvider,
    DnsProviderError, DomainKeyPair, DynamicCertificateState, Http01Responder,
    MemoryCertificateStore, PendingChallenge, ReconciliationLoop,
};
use certfleet_engine::cluster::SingleNodeCoordinator;

use DynamicCertificateState::*;

// ============================================================================
// Mock ACME server
// ============================================================================

struct MockAcme {
    challenge: Option<PendingChallenge>,
    challenge_status: AcmeStatus,
    order_status: AcmeStatus,
    chain: String,
    orders: AtomicUsize,
    triggers: AtomicUsize,
    fail_orders: Mutex<bool>,
}

impl MockAcme {
    fn new(challenge: Option<PendingChallenge>, chain: String) -> Self {
        Self {
            challenge,
            challenge_status: AcmeStatus::Valid,
            order_status: AcmeStatus::Valid,
            chain,
            orders: AtomicUsize::new(0),
            triggers: AtomicUsize::new(0),
            fail_orders: Mutex::new(false),
        }
    }
}

#[async_trait]
impl AcmeDriver for MockAcme {
    async fn login(&self) -> Result<(), AcmeError> {
        Ok(())
    }

    async fn create_order(&self, _domain: &str) -> Result<String, AcmeError> {
        if *self.fail_orders.lock() {
            return Err(AcmeError::Protocol("connection refused".to_string()));
        }
        let n = self.orders.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(format!("https://acme.test/order/{}", n))
    }

    async fn challenge_for_order(
        &self,
        _order_url: &str,
        _kind: ChallengeKind,
    ) -> Result<Option<PendingChallenge>, AcmeError> {
        Ok(self.challenge.clone())
    }

    async fn trigger_challenge(
        &self,
        _order_url: &str,
        _challenge: &PendingChallenge,
    ) -> Result<(), AcmeError> {
        self.triggers.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn check_challenge(
        &self,
        _order_url: &str,
        _challenge: &PendingChallenge,
    ) -> Result<AcmeStatus, AcmeError> {
        Ok(self.challenge_status)
    }

    async fn order_certificate(
        &self,
        _order_url: &str,
        _domain: &str,
        _key_pair: &DomainKeyPair,
    ) -> Result<(), AcmeError> {
        Ok(())
    }

    async fn check_order(&self, _order_url: &str) -> Result<AcmeStatus, AcmeError> {
        Ok(self.order_status)
    }

    async fn fetch_certificate(&self, _order_url: &str) -> Result<String, AcmeError> {
        Ok(self.chain.clone())
    }
}

// ============================================================================
// Mock DNS provider
// ============================================================================

#[derive(Debug)]
struct MockDns {
    create_succeeds: bool,
    visible: bool,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl MockDns {
    fn new(create_succeeds: bool, visible: bool) -> Self {
        Self {
            create_succeeds,
            visible,
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DnsProvider for MockDns {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_txt_record(&self, domain: &str, _digest: &str) -> DnsResult<()> {
        self.creates.fetch_add(1, AtomicOrdering::SeqCst);
        if self.create_succeeds {
            Ok(())
        } else {
            Err(DnsProviderError::RecordCreation {
                record_name: domain.to_string(),
                message: "throttled".to_string(),
            })
        }
    }

    async fn delete_txt_record(&self, _domain: &str, _digest: &str) -> DnsResult<()> {
        self.deletes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RecordVisibility for MockDns {
    async fn is_visible(&self, _domain: &str, _digest: &str) -> DnsResult<bool> {
        Ok(self.visible)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Self-signed PEM chain valid until 2040, or already expired
fn sample_chain(domain: &str, expired: bool) -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    if expired {
        params.not_before = rcgen::date_time_ymd(2019, 1, 1);
        params.not_after = rcgen::date_time_ymd(2020, 1, 1);
    } else {
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2040, 1, 1);
    }
    params.self_signed(&key).unwrap().pem()
}

fn http_challenge() -> PendingChallenge {
    PendingChallenge::Http01 {
        url: "https://acme.test/chall/1".to_string(),
        token: "mytoken".to_string(),
        key_authorization: "mytoken.thumbprint".to_string(),
    }
}

fn dns_challenge() -> PendingChallenge {
    PendingChallenge::Dns01 {
        url: "https://acme.test/chall/2".to_string(),
        digest: "digest".to_string(),
    }
}

fn certificates(entries: &[(&str, CertificateMode)], limit: u32) -> CertificatesConfig {
    CertificatesConfig {
        period_secs: 1,
        dns_challenge_reachability_limit: limit,
        certificates: entries
            .iter()
            .map(|(hostname, mode)| CertificateConfig::new(*hostname, *mode, 0))
            .collect(),
    }
}

fn state_machine(
    driver: Arc<MockAcme>,
    store: Arc<MemoryCertificateStore>,
    dns: Option<Arc<MockDns>>,
) -> CertificateStateMachine {
    let dns = dns.map(|d| Dns01Provisioner::new(d.clone(), d));
    CertificateStateMachine::new(driver, store, dns, ChallengeManager::new())
}

/// Advance every configured domain once, like a reconciliation tick
async fn tick(man: &CertificateStateMachine) {
    for domain in man.domains() {
        man.advance(&domain).await.unwrap();
    }
}

// ============================================================================
// HTTP-01 lifecycle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpCase {
    ChallengeNull,
    ChallengeStatusInvalid,
    OrderResponseError,
    AvailableToExpired,
    AllOk,
}

async fn run_http_case(case: HttpCase) {
    let mut driver = MockAcme::new(
        (case != HttpCase::ChallengeNull).then(http_challenge),
        sample_chain("localhost1", case == HttpCase::AvailableToExpired),
    );
    if case == HttpCase::ChallengeStatusInvalid {
        driver.challenge_status = AcmeStatus::Invalid;
    }
    if case == HttpCase::OrderResponseError {
        driver.order_status = AcmeStatus::Invalid;
    }
    let driver = Arc::new(driver);

    let store = Arc::new(MemoryCertificateStore::new());
    let d0 = "localhost0";
    let d1 = "localhost1";
    let d2 = "notacme";

    let mut available = CertificateData::new(d0, Available, String::new(), false, 0);
    available.set_chain_pem(&sample_chain(d0, false));
    store.insert(available);
    store.insert(CertificateData::waiting(d1, 0));
    store.insert(CertificateData::new(d2, Available, String::new(), true, 0));

    let man = state_machine(driver.clone(), store.clone(), None);
    man.reload_configuration(&certificates(
        &[
            (d0, CertificateMode::Acme),
            (d1, CertificateMode::Acme),
            (d2, CertificateMode::Manual),
        ],
        10,
    ))
    .unwrap();

    assert_eq!(man.state_of_certificate(d0).unwrap(), Available);
    assert_eq!(man.state_of_certificate(d2).unwrap(), Available);
    // Operator override of a manual certificate is saved but never acted upon
    man.set_state_of_certificate(d2, Waiting).unwrap();
    assert_eq!(man.state_of_certificate(d2).unwrap(), Waiting);
    let mut saves = 1;
    assert_eq!(store.save_count(), saves);

    // WAITING
    assert_eq!(man.state_of_certificate(d1).unwrap(), Waiting);
    tick(&man).await;
    let expected = if case == HttpCase::ChallengeNull {
        Verified
    } else {
        Verifying
    };
    assert_eq!(man.state_of_certificate(d1).unwrap(), expected);
    saves += 1;
    assert_eq!(store.save_count(), saves);

    tick(&man).await;
    if case == HttpCase::ChallengeNull {
        assert_eq!(man.state_of_certificate(d1).unwrap(), Ordering);
        saves += 1;
        assert_eq!(store.save_count(), saves);
    } else {
        let expected = if case == HttpCase::ChallengeStatusInvalid {
            RequestFailed
        } else {
            Verified
        };
        assert_eq!(man.state_of_certificate(d1).unwrap(), expected);
        saves += 1;
        assert_eq!(store.save_count(), saves);

        tick(&man).await;
        let expected = if case == HttpCase::ChallengeStatusInvalid {
            Waiting
        } else {
            Ordering
        };
        assert_eq!(man.state_of_certificate(d1).unwrap(), expected);
        saves += 1;
        assert_eq!(store.save_count(), saves);
    }

    if case != HttpCase::ChallengeStatusInvalid {
        // ORDERING
        tick(&man).await;
        let expected = if case == HttpCase::OrderResponseError {
            RequestFailed
        } else {
            Available
        };
        assert_eq!(man.state_of_certificate(d1).unwrap(), expected);
        saves += 1;
        assert_eq!(store.save_count(), saves);

        tick(&man).await;
        if case == HttpCase::OrderResponseError {
            assert_eq!(man.state_of_certificate(d1).unwrap(), Waiting);
            saves += 1;
            assert_eq!(store.save_count(), saves);
        } else {
            let state = man.state_of_certificate(d1).unwrap();
            let expected = if case == HttpCase::AvailableToExpired {
                Expired
            } else {
                Available
            };
            assert_eq!(state, expected);
            if state != Available {
                saves += 1;
            }
            assert_eq!(store.save_count(), saves);

            tick(&man).await;
            let state = man.state_of_certificate(d1).unwrap();
            let expected = if case == HttpCase::AvailableToExpired {
                Waiting
            } else {
                Available
            };
            assert_eq!(state, expected);
            if state != Available {
                saves += 1;
            }
            assert_eq!(store.save_count(), saves);
        }
    }

    // Untouched throughout
    assert_eq!(man.state_of_certificate(d0).unwrap(), Available);
    assert_eq!(man.state_of_certificate(d2).unwrap(), Waiting);
}

#[tokio::test]
async fn test_challenge_null() {
    run_http_case(HttpCase::ChallengeNull).await;
}

#[tokio::test]
async fn test_challenge_status_invalid() {
    run_http_case(HttpCase::ChallengeStatusInvalid).await;
}

#[tokio::test]
async fn test_order_response_error() {
    run_http_case(HttpCase::OrderResponseError).await;
}

#[tokio::test]
async fn test_available_to_expired() {
    run_http_case(HttpCase::AvailableToExpired).await;
}

#[tokio::test]
async fn test_all_ok() {
    run_http_case(HttpCase::AllOk).await;
}

#[tokio::test]
async fn test_issued_certificate_is_served() {
    let chain = sample_chain("example.com", false);
    let driver = Arc::new(MockAcme::new(Some(http_challenge()), chain.clone()));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = state_machine(driver, store.clone(), None);
    man.reload_configuration(&certificates(&[("example.com", CertificateMode::Acme)], 10))
        .unwrap();

    assert_eq!(man.certificate_for_domain("example.com").unwrap(), None);

    let mut seen = vec![man.state_of_certificate("example.com").unwrap()];
    for _ in 0..4 {
        man.advance("example.com").await.unwrap();
        seen.push(man.state_of_certificate("example.com").unwrap());
    }
    assert_eq!(seen, vec![Waiting, Verifying, Verified, Ordering, Available]);

    let certificate = man.certificate_for_domain("example.com").unwrap().unwrap();
    assert_eq!(certificate.chain_pem, chain);
    let key = store.load_key_pair_for_domain("example.com").unwrap().unwrap();
    assert_eq!(certificate.key_pem, key.pem());

    let data = man.certificate_data("example.com").unwrap();
    assert!(data.order_location.is_empty());
    assert!(data.pending_challenge_data.is_empty());
    assert!(data.certificate_info().unwrap().is_some());
}

#[tokio::test]
async fn test_key_pair_reused_across_renewals() {
    let driver = Arc::new(MockAcme::new(None, sample_chain("example.com", false)));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = state_machine(driver, store.clone(), None);
    man.reload_configuration(&certificates(&[("example.com", CertificateMode::Acme)], 10))
        .unwrap();

    for _ in 0..3 {
        man.advance("example.com").await.unwrap();
    }
    assert_eq!(man.state_of_certificate("example.com").unwrap(), Available);
    let first = store.load_key_pair_for_domain("example.com").unwrap().unwrap();

    man.set_state_of_certificate("example.com", Expired).unwrap();
    for _ in 0..4 {
        man.advance("example.com").await.unwrap();
    }
    assert_eq!(man.state_of_certificate("example.com").unwrap(), Available);
    let second = store.load_key_pair_for_domain("example.com").unwrap().unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_protocol_error_is_no_progress() {
    let driver = Arc::new(MockAcme::new(Some(http_challenge()), String::new()));
    *driver.fail_orders.lock() = true;
    let store = Arc::new(MemoryCertificateStore::new());
    let man = state_machine(driver.clone(), store.clone(), None);
    man.reload_configuration(&certificates(&[("example.com", CertificateMode::Acme)], 10))
        .unwrap();

    let err = man.advance("example.com").await.unwrap_err();
    assert!(matches!(err, AcmeError::Protocol(_)));
    assert!(err.is_transient());
    assert_eq!(man.state_of_certificate("example.com").unwrap(), Waiting);
    assert_eq!(store.save_count(), 0);

    *driver.fail_orders.lock() = false;
    assert!(man.advance("example.com").await.unwrap());
    assert_eq!(man.state_of_certificate("example.com").unwrap(), Verifying);
}

#[tokio::test]
async fn test_pending_challenge_answered_by_any_node() {
    let driver = Arc::new(MockAcme::new(Some(http_challenge()), String::new()));
    let store = Arc::new(MemoryCertificateStore::new());
    let challenges = ChallengeManager::new();
    let man = CertificateStateMachine::new(
        driver.clone(),
        store.clone(),
        None,
        challenges.clone(),
    );
    man.reload_configuration(&certificates(&[("example.com", CertificateMode::Acme)], 10))
        .unwrap();

    man.advance("example.com").await.unwrap();
    assert_eq!(driver.triggers.load(AtomicOrdering::SeqCst), 1);
    assert_eq!(challenges.pending_count(), 1);

    // A node that never saw the challenge answers from the shared store
    let other_node = Http01Responder::new(ChallengeManager::new(), store.clone());
    assert_eq!(
        other_node.response_for("example.com", "/.well-known/acme-challenge/mytoken"),
        Some("mytoken.thumbprint".to_string())
    );

    man.advance("example.com").await.unwrap();
    assert_eq!(man.state_of_certificate("example.com").unwrap(), Verified);
    assert_eq!(challenges.pending_count(), 0);
    assert_eq!(
        other_node.response_for("example.com", "/.well-known/acme-challenge/mytoken"),
        None
    );
}

#[tokio::test]
async fn test_manual_certificate_never_changes() {
    let driver = Arc::new(MockAcme::new(Some(http_challenge()), String::new()));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = state_machine(driver.clone(), store.clone(), None);
    man.reload_configuration(&certificates(&[("manual.example.com", CertificateMode::Manual)], 10))
        .unwrap();

    for _ in 0..10 {
        assert!(!man.advance("manual.example.com").await.unwrap());
    }
    assert_eq!(man.state_of_certificate("manual.example.com").unwrap(), Available);
    assert_eq!(store.save_count(), 0);
    assert_eq!(driver.orders.load(AtomicOrdering::SeqCst), 0);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_invalid_reload_keeps_previous_table() {
    let driver = Arc::new(MockAcme::new(None, String::new()));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = state_machine(driver, store, None);
    man.reload_configuration(&certificates(&[("example.com", CertificateMode::Acme)], 10))
        .unwrap();

    let duplicate = certificates(
        &[
            ("a.example.com", CertificateMode::Acme),
            ("a.example.com", CertificateMode::Acme),
        ],
        10,
    );
    assert!(matches!(
        man.reload_configuration(&duplicate),
        Err(AcmeError::Configuration(_))
    ));

    // Wildcard without a DNS provider
    let wildcard = certificates(&[("*.example.com", CertificateMode::Acme)], 10);
    assert!(matches!(
        man.reload_configuration(&wildcard),
        Err(AcmeError::Configuration(_))
    ));

    assert_eq!(man.domains(), vec!["example.com".to_string()]);
    assert!(matches!(
        man.advance("a.example.com").await,
        Err(AcmeError::UnknownDomain(_))
    ));
}

// ============================================================================
// DNS-01 lifecycle (wildcard)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnsCase {
    ChallengeCreationFailed,
    ChallengeCheckLimitExpired,
    ChallengeReady,
    ChallengeVerified,
    ChallengeFailed,
}

async fn run_dns_case(case: DnsCase) {
    let mut driver = MockAcme::new(Some(dns_challenge()), sample_chain("*.localhost", false));
    if case == DnsCase::ChallengeFailed {
        driver.challenge_status = AcmeStatus::Invalid;
    }
    let driver = Arc::new(driver);
    let dns = Arc::new(MockDns::new(
        case != DnsCase::ChallengeCreationFailed,
        case != DnsCase::ChallengeCheckLimitExpired,
    ));

    let store = Arc::new(MemoryCertificateStore::new());
    let domain = "*.localhost";
    store.insert(CertificateData::waiting(domain, 0));

    let man = state_machine(driver.clone(), store.clone(), Some(dns.clone()));
    man.reload_configuration(&certificates(&[(domain, CertificateMode::Acme)], 2))
        .unwrap();
    assert!(man.certificate_data(domain).unwrap().is_wildcard());

    let mut saves = 0;

    assert_eq!(man.state_of_certificate(domain).unwrap(), Waiting);
    man.advance(domain).await.unwrap();
    saves += 1;
    assert_eq!(store.save_count(), saves);

    if case == DnsCase::ChallengeCreationFailed {
        assert_eq!(man.state_of_certificate(domain).unwrap(), Waiting);
        assert_eq!(driver.triggers.load(AtomicOrdering::SeqCst), 0);
        return;
    }

    assert_eq!(man.state_of_certificate(domain).unwrap(), DnsChallengeWait);
    man.advance(domain).await.unwrap();
    saves += 1;
    assert_eq!(store.save_count(), saves);

    if case == DnsCase::ChallengeCheckLimitExpired {
        assert_eq!(man.state_of_certificate(domain).unwrap(), DnsChallengeWait);
        man.advance(domain).await.unwrap();
        saves += 1;
        assert_eq!(store.save_count(), saves);
        assert_eq!(man.state_of_certificate(domain).unwrap(), RequestFailed);
        assert_eq!(dns.deletes.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(driver.triggers.load(AtomicOrdering::SeqCst), 0);
        return;
    }

    assert_eq!(man.state_of_certificate(domain).unwrap(), Verifying);
    assert_eq!(driver.triggers.load(AtomicOrdering::SeqCst), 1);
    if case == DnsCase::ChallengeReady {
        assert_eq!(dns.deletes.load(AtomicOrdering::SeqCst), 0);
        return;
    }

    man.advance(domain).await.unwrap();
    saves += 1;
    assert_eq!(store.save_count(), saves);
    let expected = if case == DnsCase::ChallengeFailed {
        RequestFailed
    } else {
        Verified
    };
    assert_eq!(man.state_of_certificate(domain).unwrap(), expected);
    assert_eq!(dns.deletes.load(AtomicOrdering::SeqCst), 1);
}

#[tokio::test]
async fn test_dns_challenge_creation_failed() {
    run_dns_case(DnsCase::ChallengeCreationFailed).await;
}

#[tokio::test]
async fn test_dns_challenge_check_limit_expired() {
    run_dns_case(DnsCase::ChallengeCheckLimitExpired).await;
}

#[tokio::test]
async fn test_dns_challenge_ready() {
    run_dns_case(DnsCase::ChallengeReady).await;
}

#[tokio::test]
async fn test_dns_challenge_verified() {
    run_dns_case(DnsCase::ChallengeVerified).await;
}

#[tokio::test]
async fn test_dns_challenge_failed() {
    run_dns_case(DnsCase::ChallengeFailed).await;
}

#[tokio::test]
async fn test_dns_creation_failure_retries_forever() {
    let driver = Arc::new(MockAcme::new(Some(dns_challenge()), String::new()));
    let dns = Arc::new(MockDns::new(false, true));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = state_machine(driver, store.clone(), Some(dns.clone()));
    man.reload_configuration(&certificates(&[("*.example.com", CertificateMode::Acme)], 2))
        .unwrap();

    for _ in 0..5 {
        assert!(!man.advance("*.example.com").await.unwrap());
        assert_eq!(man.state_of_certificate("*.example.com").unwrap(), Waiting);
    }
    assert_eq!(dns.creates.load(AtomicOrdering::SeqCst), 5);
    assert_eq!(store.save_count(), 5);
    assert_eq!(dns.deletes.load(AtomicOrdering::SeqCst), 0);
}

// ============================================================================
// Reconciliation loop
// ============================================================================

#[tokio::test]
async fn test_reconciliation_tick_reports_changes() {
    let driver = Arc::new(MockAcme::new(Some(http_challenge()), sample_chain("a.example.com", false)));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = Arc::new(state_machine(driver, store.clone(), None));
    man.reload_configuration(&certificates(
        &[
            ("a.example.com", CertificateMode::Acme),
            ("manual.example.com", CertificateMode::Manual),
        ],
        10,
    ))
    .unwrap();

    let reconciler = ReconciliationLoop::new(
        man.clone(),
        Arc::new(SingleNodeCoordinator::new(PeerId::new("solo"))),
    );
    let mut changes = reconciler.subscribe();

    let report = reconciler.run_once().await;
    assert_eq!(report.advanced, 2);
    assert_eq!(report.changed, vec!["a.example.com".to_string()]);
    assert!(report.failed.is_empty());

    let event = changes.try_recv().unwrap();
    assert_eq!(event.origin, ChangeOrigin::Local);
    assert_eq!(event.domains, vec!["a.example.com".to_string()]);

    for _ in 0..3 {
        reconciler.run_once().await;
    }
    assert_eq!(man.state_of_certificate("a.example.com").unwrap(), Available);

    // Nothing left to do: no change, no notification, no save
    while changes.try_recv().is_ok() {}
    let saves = store.save_count();
    let report = reconciler.run_once().await;
    assert!(report.changed.is_empty());
    assert!(changes.try_recv().is_err());
    assert_eq!(store.save_count(), saves);
}

#[tokio::test]
async fn test_reconciliation_contains_domain_failures() {
    let driver = Arc::new(MockAcme::new(Some(http_challenge()), String::new()));
    *driver.fail_orders.lock() = true;
    let store = Arc::new(MemoryCertificateStore::new());
    let mut ready = CertificateData::new("b.example.com", Expired, String::new(), false, 0);
    ready.order_location = "https://acme.test/order/old".to_string();
    store.insert(ready);

    let man = Arc::new(state_machine(driver, store, None));
    man.reload_configuration(&certificates(
        &[
            ("a.example.com", CertificateMode::Acme),
            ("b.example.com", CertificateMode::Acme),
        ],
        10,
    ))
    .unwrap();

    let reconciler = ReconciliationLoop::new(
        man.clone(),
        Arc::new(SingleNodeCoordinator::new(PeerId::new("solo"))),
    );
    let report = reconciler.run_once().await;
    assert_eq!(report.failed, vec!["a.example.com".to_string()]);
    assert_eq!(report.changed, vec!["b.example.com".to_string()]);

    let data = man.certificate_data("b.example.com").unwrap();
    assert_eq!(data.state, Waiting);
    assert!(data.order_location.is_empty());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let driver = Arc::new(MockAcme::new(None, sample_chain("a.example.com", false)));
    let store = Arc::new(MemoryCertificateStore::new());
    let man = Arc::new(state_machine(driver, store, None));
    man.reload_configuration(&certificates(&[("a.example.com", CertificateMode::Acme)], 10))
        .unwrap();

    let reconciler = Arc::new(ReconciliationLoop::new(
        man.clone(),
        Arc::new(SingleNodeCoordinator::new(PeerId::new("solo"))),
    ));
    let mut changes = reconciler.subscribe();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run(shutdown_rx).await })
    };

    // First tick runs immediately
    let event = tokio::time::timeout(std::time::Duration::from_secs(5), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.origin, ChangeOrigin::Local);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
