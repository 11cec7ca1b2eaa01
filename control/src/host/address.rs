//! Secondary address management via `ip addr`

use super::command::{command_line, CommandRunner};
use crate::egress::{AddressManager, EgressLink};
use crate::error::{EgressError, HostError};
use ipnet::Ipv4Net;
use std::sync::Arc;
use tracing::debug;

/// `ip addr add` failure meaning the address is already present
const ADDRESS_EXISTS: &str = "File exists";
/// `ip addr del` failure meaning the address is already gone
const ADDRESS_MISSING: &str = "Cannot assign requested address";

/// Adds and removes egress IPs on the egress link
pub struct IpAddressManager {
    runner: Arc<dyn CommandRunner>,
}

impl IpAddressManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn ip_addr(
        &self,
        op: &str,
        link: &EgressLink,
        address: Ipv4Net,
        tolerated: &str,
    ) -> Result<(), EgressError> {
        let args = vec![
            "addr".to_string(),
            op.to_string(),
            address.to_string(),
            "dev".to_string(),
            link.name.clone(),
        ];
        let output = self.runner.run("ip", &args)?;
        if output.success {
            return Ok(());
        }
        if output.stderr.contains(tolerated) {
            debug!(%address, link = %link.name, op = op, "Address already in desired state");
            return Ok(());
        }
        Err(HostError::CommandFailed {
            command: command_line("ip", &args),
            stderr: output.stderr,
        }
        .into())
    }
}

impl AddressManager for IpAddressManager {
    fn add_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError> {
        self.ip_addr("add", link, address, ADDRESS_EXISTS)
    }

    fn delete_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError> {
        self.ip_addr("del", link, address, ADDRESS_MISSING)
    }
}
