#![no_std]

//! Egress Common Types
//!
//! Core data types shared between the egress IP coordinator and its adapters.
//! All types are no_std compatible and `Copy` so they can travel freely between
//! the reconciliation pass and the programmers that act on its results.

use core::fmt;
use core::net::Ipv4Addr;

/// Tenant (namespace) network ID
///
/// VNIDs are 24-bit values; 0 is the global/admin tenant.
pub type Vnid = u32;

/// VNID of the global (admin) tenant
pub const GLOBAL_VNID: Vnid = 0;

/// Largest valid VNID (24-bit)
pub const MAX_VNID: Vnid = 0x00ff_ffff;

/// Mark used for the global tenant, which cannot use 0 (0 means "no tenant")
pub const GLOBAL_VNID_MARK: u32 = 0xff00_0000;

/// Bit folded in when a VNID collides with the masquerade bit
pub const MASQUERADE_COLLISION_BIT: u32 = 0x0100_0000;

/// Firewall mark tagging a tenant's egress traffic
///
/// Derived deterministically from the VNID so every node computes the same
/// value for the same tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EgressMark(u32);

impl EgressMark {
    /// Convert a VNID into a mark that is not 0, does not have the masquerade
    /// bit set, and differs from the mark of every other valid VNID.
    ///
    /// `masquerade_bit` is the bit mask (e.g. `1 << 0`), or 0 when the
    /// masquerade bit is not in use.
    pub const fn for_vnid(vnid: Vnid, masquerade_bit: u32) -> Self {
        let mut value = if vnid == GLOBAL_VNID {
            GLOBAL_VNID_MARK
        } else {
            vnid
        };
        if value & masquerade_bit != 0 {
            value = (value | MASQUERADE_COLLISION_BIT) ^ masquerade_bit;
        }
        Self(value)
    }

    /// Raw mark value
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EgressMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Convert a masquerade bit index (0-31) into its mask
///
/// Returns `None` for out-of-range indices.
pub const fn masquerade_bit_mask(bit: u8) -> Option<u32> {
    if bit < 32 {
        Some(1u32 << bit)
    } else {
        None
    }
}

/// How a tenant's outbound traffic leaves the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EgressMode {
    /// No egress IP requested: traffic leaves via the node's own address
    Normal,
    /// Egress IP requested but none usable: traffic is blackholed
    Dropped,
    /// Traffic is forwarded to the owning node and tagged with the mark
    ViaEgressIp { node_ip: Ipv4Addr, mark: EgressMark },
}

impl EgressMode {
    /// Short label for logs and metrics
    pub const fn as_str(&self) -> &'static str {
        match self {
            EgressMode::Normal => "normal",
            EgressMode::Dropped => "dropped",
            EgressMode::ViaEgressIp { .. } => "via_egress_ip",
        }
    }

    /// True when traffic uses an egress IP
    #[inline]
    pub const fn is_via_egress_ip(&self) -> bool {
        matches!(self, EgressMode::ViaEgressIp { .. })
    }
}

impl fmt::Display for EgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressMode::Normal => write!(f, "normal"),
            EgressMode::Dropped => write!(f, "dropped"),
            EgressMode::ViaEgressIp { node_ip, mark } => {
                write!(f, "via {} (mark {})", node_ip, mark)
            }
        }
    }
}
