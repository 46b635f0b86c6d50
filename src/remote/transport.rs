//! The seams between the transport machinery and its collaborators: the handler that decodes
//!  incoming messages, the sender that marshals outgoing ones, and the narrow send-control
//!  surface a sender is given while the transport's send buffer is locked.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::remote::buffer::WireBuf;
use crate::remote::wire;

/// A bidirectional message-oriented endpoint. The server core only implements the UDP flavor;
///  stream transports share this seam so that the registry and the handlers stay agnostic.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// the canonical copy of the peer's address, also the registry key
    fn remote_address(&self) -> SocketAddr;

    fn priority(&self) -> u16;

    fn set_remote_transport_receive_buffer_size(&self, size: i32);

    fn set_remote_transport_socket_receive_buffer_size(&self, size: i32);

    fn set_remote_priority(&self, priority: u16);

    fn set_remote_minor_revision(&self, revision: u8);

    /// Synchronously marshals and transmits one message: the sender is invoked while the
    ///  transport's send buffer is locked, then the framed buffer goes out to the sender's
    ///  chosen recipient or to the configured fan-out list. Returns whether every send
    ///  succeeded.
    async fn enqueue_send_request(&self, sender: Arc<dyn TransportSender>) -> bool;
}

/// Decodes one incoming message. Invoked on the transport's receive task, strictly in arrival
///  order, and only after the full header was parsed and the declared payload is known to fit
///  the datagram.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// An error return is diagnostic only: the receive path logs it and carries on with the
    ///  next message.
    async fn handle_response(
        &self,
        from: SocketAddr,
        transport: &Arc<dyn Transport>,
        version: u8,
        command: u8,
        payload_size: u32,
        buf: &mut WireBuf,
    ) -> anyhow::Result<()>;
}

/// A sender marshals exactly one send request into the buffer handed to it via [SendControl].
///
/// `lock` / `unlock` bracket the `send` call; the transport guarantees `unlock` on every exit
///  path, including a failed `send`. One-shot senders simply rely on their `Arc` being dropped
///  after `unlock`.
pub trait TransportSender: Send + Sync {
    fn lock(&self) {}

    fn unlock(&self) {}

    fn send(&self, control: &mut SendControl<'_>) -> anyhow::Result<()>;
}

/// The view of the transport's send buffer a sender gets while holding the send lock: message
///  framing, recipient selection, and raw buffer access for the payload.
pub struct SendControl<'a> {
    buf: &'a mut WireBuf,
    last_message_start: Option<usize>,
    recipient: Option<SocketAddr>,
}

impl <'a> SendControl<'a> {
    pub fn new(buf: &'a mut WireBuf) -> SendControl<'a> {
        SendControl {
            buf,
            last_message_start: None,
            recipient: None,
        }
    }

    /// The capacity hint is advisory - the underlying buffer is fixed-size and sized for the
    ///  largest datagram anyway.
    pub fn start_message(&mut self, command: u8, _capacity_hint: usize) {
        self.last_message_start = Some(wire::start_message(self.buf, command));
    }

    /// Patches the started message's length field. Without a started message this is a no-op,
    ///  so the transport can call it unconditionally after the sender returns.
    pub fn end_message(&mut self) {
        if let Some(message_start) = self.last_message_start.take() {
            wire::end_message(self.buf, message_start);
        }
    }

    /// Address the message to a single recipient instead of the transport's fan-out list.
    pub fn set_recipient(&mut self, recipient: SocketAddr) {
        self.recipient = Some(recipient);
    }

    pub fn recipient(&self) -> Option<SocketAddr> {
        self.recipient
    }

    /// Datagram transports transmit whole packets after the sender returns, so there is
    ///  nothing to flush eagerly.
    pub fn flush(&mut self, _last_message: bool) {
    }

    pub fn buffer(&mut self) -> &mut WireBuf {
        self.buf
    }
}
