//! KDL configuration parsing.

mod certificates;
mod helpers;

use anyhow::{Context, Result};
use tracing::{debug, trace, warn};

use crate::Config;

pub use certificates::{
    parse_acme_config, parse_certificates, parse_cluster_config, parse_route53_config,
    parse_storage_config,
};

/// Parse a full KDL document into a [`Config`]
///
/// Unknown top-level blocks are ignored with a warning so the same file can
/// carry settings for other components.
pub fn parse_document(source: &str) -> Result<Config> {
    let doc: kdl::KdlDocument = source.parse().context("Invalid KDL document")?;
    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(block = %name, "Parsing top-level block");
        match name {
            "acme" => config.acme = parse_acme_config(node)?,
            "certificates" => config.certificates = parse_certificates(node)?,
            "route53" => config.route53 = Some(parse_route53_config(node)?),
            "storage" => config.storage = parse_storage_config(node)?,
            "cluster" => config.cluster = Some(parse_cluster_config(node)?),
            other => warn!(block = %other, "Ignoring unknown configuration block"),
        }
    }

    debug!(
        certificate_count = config.certificates.certificates.len(),
        clustered = config.cluster.is_some(),
        "Parsed configuration document"
    );
    Ok(config)
}
