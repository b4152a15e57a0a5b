use std::{fmt, net::Ipv4Addr};

use getset::Getters;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::{config::SLOT_COUNT, SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Name of the namespace-side end of the veth pair.
pub const VPEER_NAME: &str = "eth0";

/// Name of the TAP device inside the namespace.
pub const TAP_NAME: &str = "tap0";

/// Address of the TAP device inside the namespace.
pub const TAP_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 22);

/// Address the guest presents itself at.
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 0, 21);

/// Prefix length of the veth and TAP links.
pub const LINK_PREFIX: u8 = 30;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A reserved network slot and every name and address derived from it.
///
/// All derived values are a pure function of `idx`, so two slots with different indices never
/// share a namespace, veth name or host-visible IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Slot {
    /// The node id prefix the slot key lives under.
    node_short_id: String,

    /// The slot index in `[0, 65535]`.
    idx: u32,

    /// The sandbox owning the slot.
    sandbox_id: String,

    /// Host-side veth address, `10.a.b.1/30`.
    veth_cidr: Ipv4Network,

    /// Namespace-side veth address, `10.a.b.2/30`.
    vpeer_cidr: Ipv4Network,

    /// TAP address inside the namespace.
    tap_cidr: Ipv4Network,

    /// Host-visible sandbox address, `192.168.a.b/32`.
    host_snapshot_cidr: Ipv4Network,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Slot {
    /// Creates a slot and derives its addresses.
    pub fn new(
        node_short_id: impl Into<String>,
        idx: u32,
        sandbox_id: impl Into<String>,
    ) -> SandhiveResult<Self> {
        if idx >= SLOT_COUNT {
            return Err(SandhiveError::custom(anyhow::anyhow!(
                "slot index {idx} is out of range"
            )));
        }

        let (a, b) = Self::octets_of(idx);
        Ok(Self {
            node_short_id: node_short_id.into(),
            idx,
            sandbox_id: sandbox_id.into(),
            veth_cidr: network(Ipv4Addr::new(10, a, b, 1), LINK_PREFIX)?,
            vpeer_cidr: network(Ipv4Addr::new(10, a, b, 2), LINK_PREFIX)?,
            tap_cidr: network(TAP_IP, LINK_PREFIX)?,
            host_snapshot_cidr: network(Ipv4Addr::new(192, 168, a, b), 32)?,
        })
    }

    /// Splits a slot index into the two octets used in its addresses.
    pub fn octets_of(idx: u32) -> (u8, u8) {
        ((idx / 256) as u8, (idx % 256) as u8)
    }

    /// The KV key recording slot ownership.
    pub fn key_for(node_short_id: &str, idx: u32) -> String {
        format!("{node_short_id}/{idx}")
    }

    /// The namespace name of a slot index.
    pub fn namespace_name_of(idx: u32) -> String {
        format!("ns-{idx}")
    }

    /// The KV key of this slot.
    pub fn kv_key(&self) -> String {
        Self::key_for(&self.node_short_id, self.idx)
    }

    /// The network namespace name.
    pub fn namespace_name(&self) -> String {
        Self::namespace_name_of(self.idx)
    }

    /// The host-side veth name.
    pub fn veth_name(&self) -> String {
        format!("veth-{}", self.idx)
    }

    /// The namespace-side veth name.
    pub fn vpeer_name(&self) -> &'static str {
        VPEER_NAME
    }

    /// The TAP device name.
    pub fn tap_name(&self) -> &'static str {
        TAP_NAME
    }

    /// Host-side veth address.
    pub fn veth_ip(&self) -> Ipv4Addr {
        self.veth_cidr.ip()
    }

    /// Namespace-side veth address.
    pub fn vpeer_ip(&self) -> Ipv4Addr {
        self.vpeer_cidr.ip()
    }

    /// Guest address behind the TAP device.
    pub fn guest_ip(&self) -> Ipv4Addr {
        GUEST_IP
    }

    /// Host-visible sandbox address.
    pub fn host_snapshot_ip(&self) -> Ipv4Addr {
        self.host_snapshot_cidr.ip()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn network(ip: Ipv4Addr, prefix: u8) -> SandhiveResult<Ipv4Network> {
    Ipv4Network::new(ip, prefix).map_err(SandhiveError::custom)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "slot:              {}", self.idx)?;
        writeln!(f, "kv key:            {}", self.kv_key())?;
        writeln!(f, "namespace:         {}", self.namespace_name())?;
        writeln!(f, "veth:              {} {}", self.veth_name(), self.veth_cidr)?;
        writeln!(f, "vpeer:             {} {}", VPEER_NAME, self.vpeer_cidr)?;
        writeln!(f, "tap:               {} {}", TAP_NAME, self.tap_cidr)?;
        writeln!(f, "guest:             {}", GUEST_IP)?;
        write!(f, "host snapshot ip:  {}", self.host_snapshot_cidr)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_derives_addresses() -> anyhow::Result<()> {
        let slot = Slot::new("abcdefgh", 258, "sbx")?;
        assert_eq!(slot.kv_key(), "abcdefgh/258");
        assert_eq!(slot.namespace_name(), "ns-258");
        assert_eq!(slot.veth_name(), "veth-258");
        assert_eq!(slot.veth_ip(), Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(slot.vpeer_ip(), Ipv4Addr::new(10, 1, 2, 2));
        assert_eq!(slot.get_veth_cidr().prefix(), 30);
        assert_eq!(slot.host_snapshot_ip(), Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(slot.get_host_snapshot_cidr().prefix(), 32);
        assert_eq!(slot.get_tap_cidr().to_string(), "169.254.0.22/30");
        Ok(())
    }

    #[test]
    fn test_slot_boundaries_are_distinct() -> anyhow::Result<()> {
        let first = Slot::new("n", 0, "a")?;
        let last = Slot::new("n", SLOT_COUNT - 1, "b")?;

        assert_eq!(first.veth_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(first.host_snapshot_ip(), Ipv4Addr::new(192, 168, 0, 0));
        assert_eq!(last.veth_ip(), Ipv4Addr::new(10, 255, 255, 1));
        assert_eq!(last.host_snapshot_ip(), Ipv4Addr::new(192, 168, 255, 255));

        assert_ne!(first.namespace_name(), last.namespace_name());
        assert_ne!(first.veth_name(), last.veth_name());
        assert_ne!(first.host_snapshot_ip(), last.host_snapshot_ip());

        assert!(Slot::new("n", SLOT_COUNT, "c").is_err());
        Ok(())
    }
}
