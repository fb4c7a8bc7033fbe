//! Common helper functions for Parley.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Public address used only to select the outbound interface; nothing is sent.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Reads a boolean flag from the environment.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Discovers the local IPv4 address peers should dial back.
///
/// Connects a throwaway UDP socket toward a public address and reads the
/// local endpoint the OS picked. Falls back to loopback.
pub fn discover_local_ipv4() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(ROUTE_PROBE_ADDR)?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        Err(e) => {
            tracing::debug!("local address discovery failed, using loopback: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_bool_true_values() {
        std::env::set_var("PARLEY_TEST_ENV_TRUE", "true");
        assert!(env_bool("PARLEY_TEST_ENV_TRUE", false));

        std::env::set_var("PARLEY_TEST_ENV_ON", " ON ");
        assert!(env_bool("PARLEY_TEST_ENV_ON", false));
    }

    #[test]
    fn test_env_bool_false_and_default() {
        std::env::set_var("PARLEY_TEST_ENV_FALSE", "nope");
        assert!(!env_bool("PARLEY_TEST_ENV_FALSE", true));
        assert!(env_bool("PARLEY_TEST_ENV_UNSET_XYZ", true));
    }

    #[test]
    fn test_discovered_address_is_ipv4() {
        let ip = discover_local_ipv4();
        assert!(ip.is_ipv4());
        assert!(!ip.is_unspecified());
    }
}
