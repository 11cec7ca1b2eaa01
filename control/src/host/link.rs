//! Egress link discovery via `ip -o -4 addr show`

use super::command::{args, run_checked, CommandRunner};
use crate::egress::{EgressLink, LinkResolver};
use crate::error::{EgressError, HostError};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Finds the link carrying the node IP by listing IPv4 addresses
pub struct IpLinkResolver {
    runner: Arc<dyn CommandRunner>,
}

impl IpLinkResolver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl LinkResolver for IpLinkResolver {
    fn resolve(&self, node_ip: Ipv4Addr) -> Result<EgressLink, EgressError> {
        let stdout = run_checked(
            self.runner.as_ref(),
            "ip",
            &args(["-o", "-4", "addr", "show"]),
        )?;
        find_link(&stdout, node_ip)?.ok_or(EgressError::NoEgressLink)
    }
}

/// Scan `ip -o -4 addr show` output for the line carrying `node_ip`
///
/// Lines look like:
/// `2: eth0    inet 172.17.0.3/16 brd 172.17.255.255 scope global eth0\ ...`
fn find_link(output: &str, node_ip: Ipv4Addr) -> Result<Option<EgressLink>, HostError> {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let (Some(_index), Some(name)) = (fields.next(), fields.next()) else {
            return Err(unexpected(format!("short line {:?}", line)));
        };
        let Some(cidr) = fields.skip_while(|f| *f != "inet").nth(1) else {
            continue;
        };
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|e| unexpected(format!("bad address {:?}: {}", cidr, e)))?;

        if net.addr() == node_ip {
            // veth-style names carry the peer after '@'
            let name = name.trim_end_matches(':');
            let name = name.split('@').next().unwrap_or(name);
            return Ok(Some(EgressLink::new(name, net.trunc())));
        }
    }
    Ok(None)
}

fn unexpected(reason: String) -> HostError {
    HostError::UnexpectedOutput {
        command: "ip -o -4 addr show".to_string(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::host::command::testing::ScriptedRunner;
    use crate::host::command::CommandOutput;

    const IP_ADDR_OUTPUT: &str = "\
1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 172.17.0.3/16 brd 172.17.255.255 scope global eth0\\       valid_lft forever preferred_lft forever
5: tun0    inet 10.129.0.1/23 brd 10.129.1.255 scope global tun0\\       valid_lft forever preferred_lft forever
";

    #[test]
    fn test_find_link_for_node_ip() {
        let link = find_link(IP_ADDR_OUTPUT, Ipv4Addr::new(172, 17, 0, 3))
            .unwrap()
            .expect("eth0 should match");

        assert_eq!(link.name, "eth0");
        assert_eq!(link.network.to_string(), "172.17.0.0/16");
    }

    #[test]
    fn test_find_link_strips_peer_suffix() {
        let output = "7: veth1@if6    inet 192.168.10.2/24 scope global veth1\\";
        let link = find_link(output, Ipv4Addr::new(192, 168, 10, 2))
            .unwrap()
            .unwrap();
        assert_eq!(link.name, "veth1");
    }

    #[test]
    fn test_find_link_no_match() {
        assert!(find_link(IP_ADDR_OUTPUT, Ipv4Addr::new(172, 17, 0, 9))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_find_link_rejects_garbage_address() {
        let err = find_link("2: eth0 inet not-a-cidr", Ipv4Addr::new(172, 17, 0, 3))
            .expect_err("Bad address must fail");
        assert!(matches!(err, HostError::UnexpectedOutput { .. }));
    }

    #[test]
    fn test_resolver_runs_ip_and_reports_missing_link() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("ip -o -4 addr show", CommandOutput::ok(IP_ADDR_OUTPUT));
        let resolver = IpLinkResolver::new(runner.clone());

        let link = resolver.resolve(Ipv4Addr::new(10, 129, 0, 1)).unwrap();
        assert_eq!(link.to_string(), "tun0 (10.129.0.0/23)");

        assert!(matches!(
            resolver.resolve(Ipv4Addr::new(10, 0, 0, 1)),
            Err(EgressError::NoEgressLink)
        ));
        assert_eq!(runner.calls().len(), 2);
    }
}
