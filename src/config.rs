use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interface whose hardware address goes into `chaddr` and which a
    /// real link probe would ARP on.
    pub interface_name: String,

    /// BOOTP `htype`; 1 is Ethernet.
    pub hardware_type: u8,

    /// BOOTP `hlen`; 6 for IEEE 802 MAC addresses.
    pub hardware_addr_len: u8,

    /// Explicit hardware address, bypassing interface lookup. Tests use
    /// this; production deployments normally leave it unset.
    pub hardware_addr: Option<[u8; 6]>,

    /// How long to keep collecting competing offers after the first one
    /// arrives.
    pub offer_window_secs: u64,

    /// Hard upper bound on waiting for the first offer.
    pub max_offer_wait_secs: u64,

    /// Delay between REQUEST retries while an offer goes unacknowledged.
    pub retry_request_secs: u64,

    /// Shut the engine down instead of looping back to DISCOVER when
    /// acquisition fails.
    pub stop_on_lease_acquisition_failure: bool,

    /// Upper bound of the RFC 2131 random startup delay (1..=max seconds);
    /// 0 disables the jitter entirely.
    pub startup_jitter_max_secs: u64,

    /// Port the client binds; 68 everywhere but tests.
    pub client_port: u16,

    /// Port server-bound datagrams target; 67 everywhere but tests.
    pub server_port: u16,

    /// Substitute 224.0.0.1 for the broadcast address so test servers on
    /// the loopback interface can hear the client.
    pub use_multicast: bool,

    /// Persisted lease to restore on startup, if any.
    pub lease_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            interface_name: "en0".to_string(),
            hardware_type: 1,
            hardware_addr_len: 6,
            hardware_addr: None,
            offer_window_secs: 1,
            max_offer_wait_secs: 10,
            retry_request_secs: 3,
            stop_on_lease_acquisition_failure: false,
            startup_jitter_max_secs: 10,
            client_port: DHCP_CLIENT_PORT,
            server_port: DHCP_SERVER_PORT,
            use_multicast: false,
            lease_file: None,
        }
    }
}

impl ClientConfig {
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: ClientConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(ClientConfig::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface_name.is_empty() && self.hardware_addr.is_none() {
            return Err(Error::InvalidConfig(
                "either interface_name or hardware_addr must be set".to_string(),
            ));
        }

        if self.hardware_addr_len == 0 || usize::from(self.hardware_addr_len) > 16 {
            return Err(Error::InvalidConfig(format!(
                "hardware_addr_len must be within 1..=16, got {}",
                self.hardware_addr_len
            )));
        }

        if self.max_offer_wait_secs == 0 {
            return Err(Error::InvalidConfig(
                "max_offer_wait_secs must be greater than 0".to_string(),
            ));
        }

        if self.offer_window_secs > self.max_offer_wait_secs {
            return Err(Error::InvalidConfig(format!(
                "offer_window_secs ({}) must not exceed max_offer_wait_secs ({})",
                self.offer_window_secs, self.max_offer_wait_secs
            )));
        }

        if self.client_port == 0 || self.server_port == 0 {
            return Err(Error::InvalidConfig(
                "client_port and server_port must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
