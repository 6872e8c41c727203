//! Server configuration

use crate::server::GatewayConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Minimum accepted length of the token signing secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Secret for signing session tokens
    pub token_secret: Vec<u8>,
    /// Token lifetime; `None` means tokens only die through version bumps
    pub token_ttl: Option<Duration>,
    /// Close a caller's live sockets on logout and password change
    pub revoke_live_sockets: bool,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, token_secret: Vec<u8>) -> Self {
        Self {
            bind_addr,
            token_secret,
            token_ttl: None,
            revoke_live_sockets: false,
            gateway: GatewayConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token_secret.len() < MIN_SECRET_LEN {
            anyhow::bail!(
                "token secret must be at least {} bytes (got {})",
                MIN_SECRET_LEN,
                self.token_secret.len()
            );
        }
        if self.gateway.outbound_buffer == 0 {
            anyhow::bail!("outbound buffer must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig::new(addr, vec![7u8; 32]);
        assert!(config.validate().is_ok());
        assert!(config.token_ttl.is_none());
        assert!(!config.revoke_live_sockets);
        assert!(!config.gateway.revalidate_membership);

        let short = ServerConfig::new(addr, b"too-short".to_vec());
        assert!(short.validate().is_err());
    }
}
