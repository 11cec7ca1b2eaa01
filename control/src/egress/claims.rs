//! Local claim and release of egress IPs
//!
//! Only the node an egress IP is assigned to claims it: the address goes onto
//! the egress link and the SNAT rules for the tenant's mark are installed.

use super::adapters::{AddressManager, ClaimEvent, EgressLink, MarkRuleManager};
use crate::error::EgressError;
use common::EgressMark;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// How local claims are carried out
pub enum LocalClaims {
    /// Program the host through the address and rule managers
    Kernel {
        link: EgressLink,
        addresses: Arc<dyn AddressManager>,
        rules: Arc<dyn MarkRuleManager>,
    },
    /// Emit `claim <ip>` / `release <ip>` events instead of touching the host
    Recording(UnboundedSender<ClaimEvent>),
    /// No egress link could be resolved: every claim fails
    Unavailable,
}

impl LocalClaims {
    pub fn kernel(
        link: EgressLink,
        addresses: Arc<dyn AddressManager>,
        rules: Arc<dyn MarkRuleManager>,
    ) -> Self {
        LocalClaims::Kernel {
            link,
            addresses,
            rules,
        }
    }

    /// Claim `egress_ip` on this node for traffic tagged with `mark`
    pub fn claim(
        &self,
        node_ip: Ipv4Addr,
        egress_ip: Ipv4Addr,
        mark: EgressMark,
    ) -> Result<(), EgressError> {
        if egress_ip == node_ip {
            return Err(EgressError::EgressIpIsNodeIp(egress_ip));
        }

        match self {
            LocalClaims::Recording(events) => {
                record(events, ClaimEvent::Claim(egress_ip));
                Ok(())
            }
            LocalClaims::Kernel {
                link,
                addresses,
                rules,
            } => {
                let address = link_address(link, egress_ip)?;
                addresses.add_address(link, address)?;
                if let Err(e) = rules.add_egress_ip_rules(egress_ip, mark) {
                    // Don't keep answering for an IP we failed to claim
                    if let Err(undo) = addresses.delete_address(link, address) {
                        warn!(
                            egress_ip = %egress_ip,
                            error = %undo,
                            "Failed to remove egress address after rule error"
                        );
                    }
                    return Err(e);
                }
                Ok(())
            }
            LocalClaims::Unavailable => Err(EgressError::NoEgressLink),
        }
    }

    /// Undo a previous claim
    pub fn release(
        &self,
        node_ip: Ipv4Addr,
        egress_ip: Ipv4Addr,
        mark: EgressMark,
    ) -> Result<(), EgressError> {
        if egress_ip == node_ip {
            return Ok(());
        }

        match self {
            LocalClaims::Recording(events) => {
                record(events, ClaimEvent::Release(egress_ip));
                Ok(())
            }
            LocalClaims::Kernel {
                link,
                addresses,
                rules,
            } => {
                let address = link_address(link, egress_ip)?;
                // Both halves are attempted; nothing retries a release
                let address_result = addresses.delete_address(link, address);
                let rules_result = rules.delete_egress_ip_rules(egress_ip, mark);
                address_result.and(rules_result)
            }
            LocalClaims::Unavailable => Err(EgressError::NoEgressLink),
        }
    }
}

/// The egress IP with the local subnet's prefix length
fn link_address(link: &EgressLink, egress_ip: Ipv4Addr) -> Result<Ipv4Net, EgressError> {
    if !link.network.contains(&egress_ip) {
        return Err(EgressError::NotInLocalNetwork {
            ip: egress_ip,
            network: link.network,
            link: link.name.clone(),
        });
    }
    Ipv4Net::new(egress_ip, link.network.prefix_len()).map_err(|e| {
        EgressError::MalformedResource {
            what: "egress address",
            value: format!("{}/{}: {}", egress_ip, link.network.prefix_len(), e),
        }
    })
}

fn record(events: &UnboundedSender<ClaimEvent>, event: ClaimEvent) {
    if events.send(event).is_err() {
        debug!(%event, "Claim event receiver dropped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Journal {
        calls: Mutex<Vec<String>>,
        fail_rules_add: bool,
        fail_address_delete: bool,
    }

    fn injected_failure(what: &str) -> EgressError {
        HostError::CommandFailed {
            command: what.to_string(),
            stderr: "injected failure".to_string(),
        }
        .into()
    }

    impl Journal {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AddressManager for Journal {
        fn add_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("addr add {} dev {}", address, link.name));
            Ok(())
        }

        fn delete_address(&self, link: &EgressLink, address: Ipv4Net) -> Result<(), EgressError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("addr del {} dev {}", address, link.name));
            if self.fail_address_delete {
                return Err(injected_failure("ip addr del"));
            }
            Ok(())
        }
    }

    impl MarkRuleManager for Journal {
        fn add_egress_ip_rules(&self, ip: Ipv4Addr, mark: EgressMark) -> Result<(), EgressError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("rules add {} {}", ip, mark));
            if self.fail_rules_add {
                return Err(injected_failure("iptables -I"));
            }
            Ok(())
        }

        fn delete_egress_ip_rules(
            &self,
            ip: Ipv4Addr,
            mark: EgressMark,
        ) -> Result<(), EgressError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("rules del {} {}", ip, mark));
            Ok(())
        }
    }

    fn kernel_claims(journal: &Arc<Journal>) -> LocalClaims {
        LocalClaims::kernel(
            EgressLink::new("eth0", "172.17.0.0/16".parse().unwrap()),
            journal.clone(),
            journal.clone(),
        )
    }

    const NODE_IP: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 3);

    #[test]
    fn test_kernel_claim_adds_address_then_rules() {
        let journal = Arc::new(Journal::default());
        let claims = kernel_claims(&journal);
        let mark = EgressMark::for_vnid(42, 1);

        claims
            .claim(NODE_IP, Ipv4Addr::new(172, 17, 0, 100), mark)
            .expect("Claim should succeed");
        claims
            .release(NODE_IP, Ipv4Addr::new(172, 17, 0, 100), mark)
            .expect("Release should succeed");

        assert_eq!(
            journal.calls(),
            vec![
                "addr add 172.17.0.100/16 dev eth0",
                "rules add 172.17.0.100 0x0000002a",
                "addr del 172.17.0.100/16 dev eth0",
                "rules del 172.17.0.100 0x0000002a",
            ]
        );
    }

    #[test]
    fn test_failed_rules_remove_claimed_address() {
        let journal = Arc::new(Journal {
            fail_rules_add: true,
            ..Default::default()
        });
        let claims = kernel_claims(&journal);

        let err = claims
            .claim(NODE_IP, Ipv4Addr::new(172, 17, 0, 100), EgressMark::for_vnid(42, 1))
            .expect_err("Rule failure fails the claim");

        assert!(err.to_string().contains("iptables -I"), "Rule error is reported: {}", err);
        assert_eq!(
            journal.calls(),
            vec![
                "addr add 172.17.0.100/16 dev eth0",
                "rules add 172.17.0.100 0x0000002a",
                "addr del 172.17.0.100/16 dev eth0",
            ],
            "Address must come back off the link"
        );
    }

    #[test]
    fn test_release_removes_rules_when_address_delete_fails() {
        let journal = Arc::new(Journal {
            fail_address_delete: true,
            ..Default::default()
        });
        let claims = kernel_claims(&journal);

        let err = claims
            .release(NODE_IP, Ipv4Addr::new(172, 17, 0, 100), EgressMark::for_vnid(42, 1))
            .expect_err("Address failure is reported");

        assert!(err.to_string().contains("ip addr del"));
        assert_eq!(
            journal.calls(),
            vec![
                "addr del 172.17.0.100/16 dev eth0",
                "rules del 172.17.0.100 0x0000002a",
            ],
            "SNAT rules must not outlive the release"
        );
    }

    #[test]
    fn test_claim_outside_local_network_rejected() {
        let journal = Arc::new(Journal::default());
        let claims = kernel_claims(&journal);

        let err = claims
            .claim(NODE_IP, Ipv4Addr::new(10, 1, 0, 5), EgressMark::for_vnid(42, 1))
            .expect_err("Off-subnet IP must be rejected");

        assert!(matches!(err, EgressError::NotInLocalNetwork { .. }));
        assert!(journal.calls().is_empty(), "Nothing should be programmed");
    }

    #[test]
    fn test_claiming_node_ip_rejected_release_ignored() {
        let journal = Arc::new(Journal::default());
        let claims = kernel_claims(&journal);
        let mark = EgressMark::for_vnid(42, 1);

        assert!(matches!(
            claims.claim(NODE_IP, NODE_IP, mark),
            Err(EgressError::EgressIpIsNodeIp(_))
        ));
        assert!(claims.release(NODE_IP, NODE_IP, mark).is_ok());
        assert!(journal.calls().is_empty());
    }

    #[test]
    fn test_recording_claims_emit_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let claims = LocalClaims::Recording(tx);
        let ip = Ipv4Addr::new(172, 17, 0, 100);
        let mark = EgressMark::for_vnid(42, 1);

        claims.claim(NODE_IP, ip, mark).unwrap();
        claims.release(NODE_IP, ip, mark).unwrap();

        assert_eq!(rx.try_recv().unwrap().to_string(), "claim 172.17.0.100");
        assert_eq!(rx.try_recv().unwrap().to_string(), "release 172.17.0.100");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unavailable_claims_fail() {
        let claims = LocalClaims::Unavailable;
        assert!(matches!(
            claims.claim(NODE_IP, Ipv4Addr::new(172, 17, 0, 100), EgressMark::for_vnid(1, 1)),
            Err(EgressError::NoEgressLink)
        ));
    }
}
