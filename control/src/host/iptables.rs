//! SNAT and firewall rules for claimed egress IPs
//!
//! For each claimed IP:
//!
//! - `nat` / `OPENSHIFT-MASQUERADE`: traffic from the cluster network carrying
//!   the tenant's mark is SNATed to the egress IP.
//! - `filter` / `OPENSHIFT-FIREWALL-ALLOW`: new inbound connections to the
//!   egress IP are rejected; it exists for outbound traffic only.
//!
//! Every insert and delete is preceded by an `iptables -C` check so both
//! directions are idempotent.

use super::command::{args, command_line, run_checked, CommandRunner};
use crate::egress::MarkRuleManager;
use crate::error::{EgressError, HostError};
use common::EgressMark;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

pub const MASQUERADE_CHAIN: &str = "OPENSHIFT-MASQUERADE";
pub const FIREWALL_CHAIN: &str = "OPENSHIFT-FIREWALL-ALLOW";

/// One rule: table, chain and match/target arguments
#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    table: &'static str,
    chain: &'static str,
    spec: Vec<String>,
}

impl Rule {
    fn command(&self, op: &str) -> Vec<String> {
        let mut argv = args(["-w", "-t", self.table, op, self.chain]);
        argv.extend(self.spec.iter().cloned());
        argv
    }
}

/// Manages egress IP rules with the `iptables` binary
pub struct IptablesMarkRules {
    runner: Arc<dyn CommandRunner>,
    cluster_networks: Vec<Ipv4Net>,
}

impl IptablesMarkRules {
    /// `cluster_networks` restricts SNAT to pod traffic; empty means any source
    pub fn new(runner: Arc<dyn CommandRunner>, cluster_networks: Vec<Ipv4Net>) -> Self {
        Self {
            runner,
            cluster_networks,
        }
    }

    fn rules(&self, egress_ip: Ipv4Addr, mark: EgressMark) -> Vec<Rule> {
        let snat = |source: Option<&Ipv4Net>| {
            let mut spec = Vec::new();
            if let Some(cidr) = source {
                spec.extend(args(["-s".to_string(), cidr.to_string()]));
            }
            spec.extend(args([
                "-m".to_string(),
                "mark".to_string(),
                "--mark".to_string(),
                mark.to_string(),
                "-j".to_string(),
                "SNAT".to_string(),
                "--to-source".to_string(),
                egress_ip.to_string(),
            ]));
            Rule {
                table: "nat",
                chain: MASQUERADE_CHAIN,
                spec,
            }
        };

        let mut rules: Vec<Rule> = if self.cluster_networks.is_empty() {
            vec![snat(None)]
        } else {
            self.cluster_networks.iter().map(|c| snat(Some(c))).collect()
        };
        rules.push(Rule {
            table: "filter",
            chain: FIREWALL_CHAIN,
            spec: args([
                "-d".to_string(),
                egress_ip.to_string(),
                "-m".to_string(),
                "conntrack".to_string(),
                "--ctstate".to_string(),
                "NEW".to_string(),
                "-j".to_string(),
                "REJECT".to_string(),
            ]),
        });
        rules
    }

    fn exists(&self, check: &[String]) -> Result<bool, HostError> {
        Ok(self.runner.run("iptables", check)?.success)
    }

    fn ensure_rule(&self, rule: &Rule) -> Result<(), HostError> {
        let check = rule.command("-C");
        if self.exists(&check)? {
            debug!(rule = %command_line("iptables", &check), "Rule already present");
            return Ok(());
        }
        run_checked(self.runner.as_ref(), "iptables", &rule.command("-I")).map(|_| ())
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), HostError> {
        if !self.exists(&rule.command("-C"))? {
            return Ok(());
        }
        run_checked(self.runner.as_ref(), "iptables", &rule.command("-D")).map(|_| ())
    }
}

impl MarkRuleManager for IptablesMarkRules {
    fn add_egress_ip_rules(&self, egress_ip: Ipv4Addr, mark: EgressMark) -> Result<(), EgressError> {
        for rule in self.rules(egress_ip, mark) {
            self.ensure_rule(&rule)?;
        }
        Ok(())
    }

    fn delete_egress_ip_rules(
        &self,
        egress_ip: Ipv4Addr,
        mark: EgressMark,
    ) -> Result<(), EgressError> {
        // Keep going so one stuck rule doesn't strand the rest
        let mut first_err = None;
        for rule in self.rules(egress_ip, mark) {
            if let Err(e) = self.delete_rule(&rule) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
