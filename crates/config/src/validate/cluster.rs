//! Cluster block validation

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::Config;

/// Validate the coordination server addresses of the `cluster` block
pub fn validate_cluster(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let Some(cluster) = &config.cluster else {
        return result;
    };

    let servers = cluster.servers();
    if servers.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Cluster,
            "Cluster 'connect-string' lists no coordination servers",
        ));
    }
    for server in servers {
        if let Err(message) = check_server_address(server) {
            result.add_error(ValidationError::new(ErrorCategory::Cluster, message));
        }
    }

    if !cluster.root.starts_with('/') || cluster.root.ends_with('/') {
        result.add_error(ValidationError::new(
            ErrorCategory::Cluster,
            format!(
                "Cluster root '{}' must be an absolute path without a trailing '/'",
                cluster.root
            ),
        ));
    }

    result
}

fn check_server_address(server: &str) -> Result<(), String> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| format!("Coordination server '{}' must be host:port", server))?;
    if host.is_empty() {
        return Err(format!("Coordination server '{}' has an empty host", server));
    }
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(()),
        _ => Err(format!(
            "Coordination server '{}' has an invalid port '{}'",
            server, port
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::ClusterConfig;
    use std::collections::BTreeMap;

    fn with_cluster(connect_string: &str, root: &str) -> Config {
        Config {
            cluster: Some(ClusterConfig {
                connect_string: connect_string.to_string(),
                request_timeout_secs: 10,
                peer_id: None,
                root: root.to_string(),
                metadata: BTreeMap::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_connect_string() {
        let config = with_cluster("coord-1:2281, coord-2:2281,10.0.0.3:2281", "/certfleet");
        assert!(validate_cluster(&config).is_ok());
        assert_eq!(
            config.cluster.as_ref().map(|c| c.servers()),
            Some(vec!["coord-1:2281", "coord-2:2281", "10.0.0.3:2281"])
        );
    }

    #[test]
    fn test_bad_addresses_rejected() {
        for connect_string in [",", "coord-1", ":2281", "coord-1:0", "coord-1:http"] {
            let result = validate_cluster(&with_cluster(connect_string, "/certfleet"));
            assert!(!result.is_ok(), "accepted '{}'", connect_string);
            assert!(result.errors.iter().all(|e| e.category == ErrorCategory::Cluster));
        }
    }

    #[test]
    fn test_root_must_be_absolute() {
        assert!(!validate_cluster(&with_cluster("coord-1:2281", "certfleet")).is_ok());
        assert!(!validate_cluster(&with_cluster("coord-1:2281", "/certfleet/")).is_ok());
    }

    #[test]
    fn test_no_cluster_is_valid() {
        assert!(validate_cluster(&Config::default()).is_ok());
    }
}
