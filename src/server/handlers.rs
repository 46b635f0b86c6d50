//! Server-side response dispatch: one handler per command code, everything reserved or unknown
//!  funneled into a shared bad-response path.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::remote::buffer::WireBuf;
use crate::remote::transport::{ResponseHandler, SendControl, Transport, TransportSender};
use crate::remote::wire::{CMD_BEACON, CMD_CONNECTION_VALIDATION, CMD_ECHO, HANDLER_TABLE_LENGTH};
use crate::util::hex_dump::hex_dump;

/// Per-handler diagnostics: an optional hex dump of the message, preceded by a prologue line
///  with command, version and the stringified source address.
struct HandlerSupport {
    description: &'static str,
    debug: bool,
}

impl HandlerSupport {
    fn new(description: &'static str, debug: bool) -> HandlerSupport {
        HandlerSupport {
            description,
            debug,
        }
    }

    fn debug_dump(&self, from: SocketAddr, version: u8, command: u8, payload: &[u8]) {
        if self.debug {
            debug!(
                "Message [0x{:02x}, v0x{:02x}] received from {} ({})\n{}",
                command, version, from, self.description, hex_dump(payload)
            );
        }
    }
}

/// The command-indexed dispatch table of the server's discovery endpoint.
///
/// Valid commands are `[0, HANDLER_TABLE_LENGTH)`; the defined ones are beacon (a no-op on the
///  server side - beacons are sent, not consumed here), connection validation and echo. All
///  reserved slots share the single bad-response handler.
pub struct ServerResponseHandler {
    beacon: HandlerSupport,
    validation: HandlerSupport,
    echo: HandlerSupport,
    bad_response: HandlerSupport,
}

impl ServerResponseHandler {
    pub fn new() -> ServerResponseHandler {
        ServerResponseHandler::with_debug(false)
    }

    pub fn with_debug(debug: bool) -> ServerResponseHandler {
        ServerResponseHandler {
            beacon: HandlerSupport::new("Beacon", debug),
            validation: HandlerSupport::new("Connection validation", debug),
            echo: HandlerSupport::new("Echo", debug),
            bad_response: HandlerSupport::new("Bad response", debug),
        }
    }

    fn handle_validation(&self, transport: &Arc<dyn Transport>, version: u8, buf: &mut WireBuf) -> anyhow::Result<()> {
        buf.ensure_remaining(2 * 4 + 2)?;
        let receive_buffer_size = buf.try_get_i32()?;
        let socket_receive_buffer_size = buf.try_get_i32()?;
        let priority = buf.try_get_u16()?;

        transport.set_remote_transport_receive_buffer_size(receive_buffer_size);
        transport.set_remote_transport_socket_receive_buffer_size(socket_receive_buffer_size);
        transport.set_remote_priority(priority);
        transport.set_remote_minor_revision(version);
        Ok(())
    }

    async fn handle_echo(&self, from: SocketAddr, transport: &Arc<dyn Transport>) {
        let reply = Arc::new(EchoReplySender {
            echo_from: from,
        });
        if !transport.enqueue_send_request(reply).await {
            debug!("echo reply to {} could not be sent", from);
        }
    }
}

impl Default for ServerResponseHandler {
    fn default() -> Self {
        ServerResponseHandler::new()
    }
}

#[async_trait]
impl ResponseHandler for ServerResponseHandler {
    async fn handle_response(
        &self,
        from: SocketAddr,
        transport: &Arc<dyn Transport>,
        version: u8,
        command: u8,
        payload_size: u32,
        buf: &mut WireBuf,
    ) -> anyhow::Result<()> {
        if command >= HANDLER_TABLE_LENGTH {
            warn!("invalid (or unsupported) command 0x{:02x} from {}", command, from);
            debug!("its payload:\n{}", hex_dump(payload_of(buf, payload_size)));
            return Ok(());
        }

        match command {
            CMD_BEACON => {
                self.beacon.debug_dump(from, version, command, payload_of(buf, payload_size));
            }
            CMD_CONNECTION_VALIDATION => {
                self.validation.debug_dump(from, version, command, payload_of(buf, payload_size));
                self.handle_validation(transport, version, buf)?;
            }
            CMD_ECHO => {
                self.echo.debug_dump(from, version, command, payload_of(buf, payload_size));
                self.handle_echo(from, transport).await;
            }
            _ => {
                self.bad_response.debug_dump(from, version, command, payload_of(buf, payload_size));
                info!("undecipherable message (bad response type {}) from {}", command, from);
            }
        }
        Ok(())
    }
}

/// the message's payload bytes as declared by its header, clamped to what is actually there
fn payload_of(buf: &WireBuf, payload_size: u32) -> &[u8] {
    let n = (payload_size as usize).min(buf.remaining());
    &buf.remaining_slice()[..n]
}

/// One-shot reply to an echo request: an empty echo message addressed back to where the
///  request came from.
struct EchoReplySender {
    echo_from: SocketAddr,
}

impl TransportSender for EchoReplySender {
    fn send(&self, control: &mut SendControl<'_>) -> anyhow::Result<()> {
        control.start_message(CMD_ECHO, 0);
        control.set_recipient(self.echo_from);
        Ok(())
    }
}
