//! Engine configuration supplied by the host.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::protocol::DEFAULT_PORT;
use crate::refuse::RefuseRule;
use crate::registry::DEFAULT_DISPOSAL_GRACE;
use crate::retry::{DEFAULT_RETRY_CEILING, DEFAULT_RETRY_INTERVAL};

#[derive(Debug, Clone)]
pub struct CenterConfig {
    pub login_name: String,
    pub host_name: String,
    /// Display name announced to peers.
    pub user_name: String,
    pub group_name: String,
    pub port: u16,
    pub broadcast_addresses: Vec<IpAddr>,
    /// Announce ourselves as a dial-up peer so others unicast their broadcasts to us.
    pub dialup: bool,
    pub refuse: Vec<RefuseRule>,
    pub retry_interval: Duration,
    pub retry_ceiling: u32,
    pub disposal_grace: Duration,
    /// Default auto-reply text while absent.
    pub absence_message: String,
    /// Answered to GETINFO.
    pub version: String,
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            login_name: "ipmsg".into(),
            host_name: "localhost".into(),
            user_name: String::new(),
            group_name: String::new(),
            port: DEFAULT_PORT,
            broadcast_addresses: vec![IpAddr::V4(Ipv4Addr::BROADCAST)],
            dialup: false,
            refuse: Vec::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            disposal_grace: DEFAULT_DISPOSAL_GRACE,
            absence_message: "I am away from my desk.".into(),
            version: format!("ipmsg-core {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl CenterConfig {
    /// Header fields may not carry the field separator or NUL.
    pub(crate) fn sanitized(mut self) -> Self {
        for field in [&mut self.login_name, &mut self.host_name] {
            *field = field.replace([':', '\0'], "_");
        }
        for field in [&mut self.user_name, &mut self.group_name] {
            *field = field.replace('\0', "");
        }
        self
    }
}
