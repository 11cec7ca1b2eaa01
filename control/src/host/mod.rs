//! Host networking adapters
//!
//! Implementations of the egress adapter traits on top of `ip`, `iptables`
//! and `ovs-ofctl`.

pub mod address;
pub mod command;
pub mod iptables;
pub mod link;
pub mod ovs;

pub use address::IpAddressManager;
pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use iptables::IptablesMarkRules;
pub use link::IpLinkResolver;
pub use ovs::{LoggingProgrammer, OvsFlowProgrammer};
