pub mod beacon;
pub mod config;
pub mod handlers;

use std::sync::Arc;

use crate::remote::transport::ResponseHandler;
use crate::remote::udp::UdpTransport;
use crate::server::config::ServerConfig;

/// Binds and configures the server's discovery UDP transport: socket buffer sizing, fan-out
///  destinations and the loopback-suppression list all come from the configuration. The
///  transport is not started - the caller decides when the receive task begins.
pub async fn create_discovery_transport(
    config: &ServerConfig,
    response_handler: Arc<dyn ResponseHandler>,
) -> anyhow::Result<Arc<UdpTransport>> {
    let transport = UdpTransport::bind(config.bind_address, response_handler).await?;

    if let Some(size) = config.receive_buffer_size {
        transport.set_mutable_socket_receive_buffer_size(size);
    }
    transport.set_send_addresses(config.send_addresses.clone());
    transport.set_ignored_addresses(config.ignored_addresses.clone());

    Ok(transport)
}
