//! Certificate, ACME, DNS provider, storage and cluster KDL parsing.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::trace;

use crate::certificates::*;

use super::helpers::{
    child, children_named, get_bool_entry, get_first_arg_string, get_int_entry, get_string_entry,
};

fn non_negative(value: i128, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("'{}' must be a non-negative integer, got {}", field, value))
}

fn small_non_negative(value: i128, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("'{}' must be between 0 and {}, got {}", field, u32::MAX, value))
}

/// Parse the `acme` block
pub fn parse_acme_config(node: &kdl::KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");

    Ok(AcmeConfig {
        email: get_string_entry(node, "email"),
        staging: get_bool_entry(node, "staging").unwrap_or(false),
        directory_url: get_string_entry(node, "directory-url"),
    })
}

/// Parse the `certificates` block
pub fn parse_certificates(node: &kdl::KdlNode) -> Result<CertificatesConfig> {
    trace!("Parsing certificates configuration block");

    let period_secs = match get_int_entry(node, "period-secs") {
        Some(v) => non_negative(v, "period-secs")?,
        None => default_period_secs(),
    };
    let dns_challenge_reachability_limit = match get_int_entry(node, "dns-challenge-reachability-limit") {
        Some(v) => small_non_negative(v, "dns-challenge-reachability-limit")?,
        None => default_reachability_limit(),
    };

    let mut certificates = Vec::new();
    for cert_node in children_named(node, "certificate") {
        // Host names are case-insensitive; the store and challenge lookups use lowercase
        let hostname = get_first_arg_string(cert_node)
            .ok_or_else(|| {
                anyhow!(
                    "Certificate requires a hostname argument, e.g., certificate \"example.com\" {{ ... }}"
                )
            })?
            .to_ascii_lowercase();

        let mode_str = get_string_entry(cert_node, "mode").unwrap_or_else(|| "acme".to_string());
        let mode = CertificateMode::parse(&mode_str).ok_or_else(|| {
            anyhow!(
                "Invalid mode '{}' for certificate '{}'. Valid modes: acme, manual",
                mode_str,
                hostname
            )
        })?;

        let days_before_renewal = match get_int_entry(cert_node, "days-before-renewal") {
            Some(v) => small_non_negative(v, "days-before-renewal")?,
            None => default_days_before_renewal(),
        };

        trace!(
            hostname = %hostname,
            mode = %mode,
            days_before_renewal = days_before_renewal,
            "Parsed certificate"
        );

        certificates.push(CertificateConfig {
            hostname,
            mode,
            days_before_renewal,
        });
    }

    Ok(CertificatesConfig {
        period_secs,
        dns_challenge_reachability_limit,
        certificates,
    })
}

/// Parse the `route53` block
pub fn parse_route53_config(node: &kdl::KdlNode) -> Result<Route53Config> {
    trace!("Parsing route53 configuration block");

    let access_key = get_string_entry(node, "access-key")
        .ok_or_else(|| anyhow!("route53 block requires an 'access-key' field"))?;
    let secret_key = get_string_entry(node, "secret-key")
        .ok_or_else(|| anyhow!("route53 block requires a 'secret-key' field"))?;

    Ok(Route53Config {
        access_key,
        secret_key,
        region: get_string_entry(node, "region").unwrap_or_else(default_route53_region),
        endpoint: get_string_entry(node, "endpoint"),
    })
}

/// Parse the `storage` block
pub fn parse_storage_config(node: &kdl::KdlNode) -> Result<StorageConfig> {
    Ok(StorageConfig {
        path: get_string_entry(node, "path")
            .map(PathBuf::from)
            .unwrap_or_else(default_storage_path),
    })
}

/// Parse the `cluster` block
pub fn parse_cluster_config(node: &kdl::KdlNode) -> Result<ClusterConfig> {
    trace!("Parsing cluster configuration block");

    let mut metadata = BTreeMap::new();
    if let Some(meta_node) = child(node, "metadata") {
        if let Some(doc) = meta_node.children() {
            for entry in doc.nodes() {
                let key = entry.name().value().to_string();
                let value = get_first_arg_string(entry)
                    .ok_or_else(|| anyhow!("Cluster metadata '{}' requires a string value", key))?;
                metadata.insert(key, value);
            }
        }
    }

    let connect_string = get_string_entry(node, "connect-string").ok_or_else(|| {
        anyhow!("Cluster block requires 'connect-string', e.g., connect-string \"coord-1:2281,coord-2:2281\"")
    })?;
    let request_timeout_secs = match get_int_entry(node, "request-timeout-secs") {
        Some(v) => non_negative(v, "request-timeout-secs")?,
        None => default_cluster_request_timeout_secs(),
    };

    Ok(ClusterConfig {
        connect_string,
        request_timeout_secs,
        peer_id: get_string_entry(node, "peer-id"),
        root: get_string_entry(node, "root").unwrap_or_else(default_cluster_root),
        metadata,
    })
}
