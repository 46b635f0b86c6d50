//! Shared helpers for unit tests.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::remote::buffer::WireBuf;
use crate::remote::transport::{SendControl, Transport, TransportSender};
use crate::remote::wire::{CA_DEFAULT_PRIORITY, MAX_UDP_PACKET};

#[derive(Clone)]
pub struct SentMessage {
    pub at: Instant,
    pub recipient: Option<SocketAddr>,
    pub bytes: Vec<u8>,
}

/// A transport that runs senders through the real framing sequence but records the resulting
///  datagrams instead of transmitting them.
pub struct RecordingTransport {
    address: SocketAddr,
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingTransport {
    pub fn new(address: &str) -> RecordingTransport {
        RecordingTransport {
            address: SocketAddr::from_str(address).unwrap(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn remote_address(&self) -> SocketAddr {
        self.address
    }

    fn priority(&self) -> u16 {
        CA_DEFAULT_PRIORITY
    }

    fn set_remote_transport_receive_buffer_size(&self, _size: i32) {}

    fn set_remote_transport_socket_receive_buffer_size(&self, _size: i32) {}

    fn set_remote_priority(&self, _priority: u16) {}

    fn set_remote_minor_revision(&self, _revision: u8) {}

    async fn enqueue_send_request(&self, sender: Arc<dyn TransportSender>) -> bool {
        let mut buf = WireBuf::new(MAX_UDP_PACKET);
        let mut control = SendControl::new(&mut buf);

        sender.lock();
        let marshalled = sender.send(&mut control);
        sender.unlock();
        if marshalled.is_err() {
            return false;
        }

        control.end_message();
        let recipient = control.recipient();
        drop(control);

        buf.flip();
        self.sent.lock().unwrap().push(SentMessage {
            at: Instant::now(),
            recipient,
            bytes: buf.remaining_slice().to_vec(),
        });
        true
    }
}
