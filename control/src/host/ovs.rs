//! Namespace egress forwarding in OVS table 100
//!
//! Table 100 is where pod traffic leaving the cluster lands, with the source
//! tenant's VNID in `reg0`. Per tenant:
//!
//! ```text
//! Normal       no flow (falls through to the default egress path)
//! Dropped      reg0=VNID              → drop
//! Via (local)  reg0=VNID, ip          → pkt_mark=MARK, continue to SNAT
//! Via (remote) reg0=VNID, ip          → VXLAN to the owning node
//! ```

use super::command::{args, run_checked, CommandRunner};
use crate::egress::ForwardingProgrammer;
use crate::error::EgressError;
use common::{EgressMode, Vnid};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

const EGRESS_TABLE: u8 = 100;
const EGRESS_PRIORITY: u16 = 100;

/// Programs table-100 flows with `ovs-ofctl`
pub struct OvsFlowProgrammer {
    runner: Arc<dyn CommandRunner>,
    bridge: String,
    local_ip: Ipv4Addr,
}

impl OvsFlowProgrammer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bridge: impl Into<String>,
        local_ip: Ipv4Addr,
    ) -> Self {
        Self {
            runner,
            bridge: bridge.into(),
            local_ip,
        }
    }

    fn ofctl(&self, op: &str, flow: String) -> Result<(), EgressError> {
        let argv = args([
            "-O".to_string(),
            "OpenFlow13".to_string(),
            op.to_string(),
            self.bridge.clone(),
            flow,
        ]);
        run_checked(self.runner.as_ref(), "ovs-ofctl", &argv)?;
        Ok(())
    }

    /// Flow to install for a mode, if any
    fn flow_for(&self, vnid: Vnid, mode: &EgressMode) -> Option<String> {
        let head = format!("table={},priority={},reg0={}", EGRESS_TABLE, EGRESS_PRIORITY, vnid);
        match mode {
            EgressMode::Normal => None,
            EgressMode::Dropped => Some(format!("{},actions=drop", head)),
            EgressMode::ViaEgressIp { node_ip, mark } if *node_ip == self.local_ip => Some(format!(
                "{},ip,actions=set_field:{}->pkt_mark,goto_table:101",
                head, mark
            )),
            EgressMode::ViaEgressIp { node_ip, .. } => Some(format!(
                "{},ip,actions=move:NXM_NX_REG0[]->NXM_NX_TUN_ID[0..31],set_field:{}->tun_dst,output:1",
                head, node_ip
            )),
        }
    }
}

impl ForwardingProgrammer for OvsFlowProgrammer {
    fn set_namespace_egress(&self, vnid: Vnid, mode: &EgressMode) -> Result<(), EgressError> {
        self.ofctl("del-flows", format!("table={},reg0={}", EGRESS_TABLE, vnid))?;
        if let Some(flow) = self.flow_for(vnid, mode) {
            self.ofctl("add-flow", flow)?;
        }
        Ok(())
    }
}

/// Logs forwarding changes instead of programming the switch
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingProgrammer;

impl ForwardingProgrammer for LoggingProgrammer {
    fn set_namespace_egress(&self, vnid: Vnid, mode: &EgressMode) -> Result<(), EgressError> {
        info!(vnid = vnid, mode = %mode, "Namespace egress (dry run)");
        Ok(())
    }
}
