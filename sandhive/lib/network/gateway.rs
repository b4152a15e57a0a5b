use std::path::Path;

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The kernel's IPv4 routing table.
pub const PROC_NET_ROUTE: &str = "/proc/net/route";

const RTF_UP: u32 = 0x1;
const RTF_GATEWAY: u32 = 0x2;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the interface of the default route in a `/proc/net/route` dump.
pub fn parse_default_gateway(contents: &str) -> Option<String> {
    contents.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (iface, destination, flags) = (fields.first()?, fields.get(1)?, fields.get(3)?);
        let flags = u32::from_str_radix(flags, 16).ok()?;

        (*destination == "00000000" && flags & RTF_UP != 0 && flags & RTF_GATEWAY != 0)
            .then(|| iface.to_string())
    })
}

/// Looks up the interface of the host's default route.
pub fn default_gateway_interface() -> SandhiveResult<String> {
    default_gateway_interface_from(Path::new(PROC_NET_ROUTE))
}

/// Looks up the interface of the default route in the routing table dump at `path`.
pub fn default_gateway_interface_from(path: &Path) -> SandhiveResult<String> {
    let contents = std::fs::read_to_string(path)?;
    parse_default_gateway(&contents).ok_or_else(|| {
        SandhiveError::InvalidConfig(format!("no default route in {}", path.display()))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
veth-3\t0300A8C0\t0200030A\t0007\t0\t0\t0\tFFFFFFFF\t0\t0\t0
ens4\t00000000\t0100800A\t0003\t0\t0\t100\t00000000\t0\t0\t0
ens4\t0000800A\t00000000\t0001\t0\t0\t100\t00F0FFFF\t0\t0\t0
";

    #[test]
    fn test_parse_default_gateway() {
        assert_eq!(parse_default_gateway(ROUTES).as_deref(), Some("ens4"));
        assert_eq!(parse_default_gateway("Iface\tDestination\n"), None);
    }

    #[test]
    fn test_default_gateway_interface_from_file() -> anyhow::Result<()> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), ROUTES)?;
        assert_eq!(default_gateway_interface_from(file.path())?, "ens4");

        std::fs::write(file.path(), "Iface\tDestination\n")?;
        assert!(default_gateway_interface_from(file.path()).is_err());
        Ok(())
    }
}
