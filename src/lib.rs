pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod lease;
pub mod options;
pub mod packet;
pub mod probe;
pub mod testing;
pub mod timer;
pub mod transport;

pub use config::ClientConfig;
pub use engine::{DhcpClient, LeaseListener};
pub use error::{Error, Result};
pub use lease::{Lease, LeaseState};
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use probe::LinkProbe;
