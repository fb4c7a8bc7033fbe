use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use parley_common::{Error, Result};
use parley_crypto::{KEY_BITS, MIN_KEY_BITS};

pub const DEFAULT_PORT: u16 = 5555;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(4);
pub const DEFAULT_MAX_WIRE_BYTES: usize = 32 * 1024 * 1024;
pub const MAX_USERNAME_BYTES: usize = 64;
pub const MIN_LISTEN_PORT: u16 = 1024;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Self-asserted name other peers know us by.
    pub username: String,
    /// 0 lets the OS pick a port.
    pub listen_port: u16,
    pub bind_host: IpAddr,
    /// Address advertised in handshakes; discovered when `None`.
    pub advertise_host: Option<IpAddr>,
    /// Reply deadline for every outbound call.
    pub call_timeout: Duration,
    /// How often the serve loop checks the stop flag.
    pub poll_interval: Duration,
    /// How long an inbound request waits for accept/refuse.
    pub decision_timeout: Duration,
    pub key_bits: usize,
    pub max_wire_bytes: usize,
}

impl PeerConfig {
    pub fn new(username: impl Into<String>, listen_port: u16) -> Self {
        Self {
            username: username.into(),
            listen_port,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_host: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            key_bits: KEY_BITS,
            max_wire_bytes: DEFAULT_MAX_WIRE_BYTES,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;

        if self.listen_port != 0 && self.listen_port < MIN_LISTEN_PORT {
            return Err(Error::config(format!(
                "listen port {} is outside {}-65535",
                self.listen_port, MIN_LISTEN_PORT
            )));
        }
        if self.call_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.decision_timeout >= self.call_timeout {
            return Err(Error::config(format!(
                "decision timeout {:?} must be shorter than call timeout {:?}",
                self.decision_timeout, self.call_timeout
            )));
        }
        if self.key_bits < MIN_KEY_BITS {
            return Err(Error::config(format!(
                "key size {} is below {} bits",
                self.key_bits, MIN_KEY_BITS
            )));
        }
        if self.max_wire_bytes == 0 {
            return Err(Error::config("max_wire_bytes must be non-zero"));
        }
        Ok(())
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() {
        return Err(Error::config("username must not be empty"));
    }
    if username.trim() != username {
        return Err(Error::config("username must not start or end with whitespace"));
    }
    if username.len() > MAX_USERNAME_BYTES {
        return Err(Error::config(format!(
            "username exceeds {MAX_USERNAME_BYTES} bytes"
        )));
    }
    if username.chars().any(char::is_control) {
        return Err(Error::config("username must not contain control characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PeerConfig::new("alice", DEFAULT_PORT);
        config.validate().unwrap();
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.key_bits, 2048);
    }

    #[test]
    fn privileged_ports_rejected() {
        assert!(PeerConfig::new("alice", 80).validate().is_err());
        assert!(PeerConfig::new("alice", 1024).validate().is_ok());
        assert!(PeerConfig::new("alice", 65535).validate().is_ok());
        assert!(PeerConfig::new("alice", 0).validate().is_ok());
    }

    #[test]
    fn usernames_are_checked() {
        assert!(validate_username("").is_err());
        assert!(validate_username(" alice").is_err());
        assert!(validate_username("al\nice").is_err());
        assert!(validate_username(&"a".repeat(65)).is_err());
        assert!(validate_username("Alice Smith").is_ok());
    }

    #[test]
    fn decision_must_fit_inside_call_timeout() {
        let mut config = PeerConfig::new("alice", 0);
        config.decision_timeout = config.call_timeout;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
