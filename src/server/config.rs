use std::net::SocketAddr;
use std::time::Duration;

/// Configuration of the server's discovery endpoint. Loading these values from the environment
///  or from files is a concern of the embedding application.
#[derive(Debug)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,

    /// beacon cadence while the server is new; values below one second are raised to it
    pub beacon_period: Duration,
    /// how many beacons go out at the fast cadence before dropping to the slow one
    pub beacon_count: u16,

    /// requested SO_RCVBUF for the discovery socket; `None` keeps the platform default
    pub receive_buffer_size: Option<usize>,

    /// fan-out destinations for broadcasts (beacons, search responses without a recipient)
    pub send_addresses: Vec<SocketAddr>,
    /// source addresses whose datagrams are dropped, typically the server's own broadcast echo
    pub ignored_addresses: Vec<SocketAddr>,
}

impl ServerConfig {
    pub fn new(bind_address: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_address,
            beacon_period: Duration::from_secs(15),
            beacon_count: 10,
            receive_buffer_size: None,
            send_addresses: Vec::new(),
            ignored_addresses: Vec::new(),
        }
    }
}
