//! The bound, bidirectional UDP endpoint of the server: one receive task per transport, sends
//!  from arbitrary tasks serialized on the send buffer's lock.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::remote::buffer::WireBuf;
use crate::remote::transport::{ResponseHandler, SendControl, Transport, TransportSender};
use crate::remote::wire::{PvaHeader, CA_DEFAULT_PRIORITY, CA_MESSAGE_HEADER_SIZE, MAX_UDP_PACKET};

/// how long a close is willing to wait for the receive task to wind down
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// A datagram transport bound to a local address.
///
/// The transport owns its socket exclusively. Exactly one receive task (spawned by
///  [UdpTransport::start]) reads from it and dispatches every parsed message to the response
///  handler; sends may come from any task and are serialized on an internal lock. [UdpTransport::close]
///  is idempotent - the first call flips the monotonic closed flag and wakes the receive task.
pub struct UdpTransport {
    socket: UdpSocket,
    bind_address: SocketAddr,
    response_handler: Arc<dyn ResponseHandler>,
    send_buffer: Mutex<WireBuf>,
    send_addresses: StdMutex<Vec<SocketAddr>>,
    ignored_addresses: StdMutex<Vec<SocketAddr>>,
    closed: AtomicBool,
    started: AtomicBool,
    shutdown_requested: Notify,
    receive_task: StdMutex<Option<JoinHandle<()>>>,

    // session state pushed by the peer's connection validation message
    remote_receive_buffer_size: AtomicI32,
    remote_socket_receive_buffer_size: AtomicI32,
    remote_priority: AtomicU16,
    remote_minor_revision: AtomicU8,
}

impl UdpTransport {
    /// Binds a fresh datagram socket to `requested_address` (port 0 picks an ephemeral port).
    pub async fn bind(
        requested_address: SocketAddr,
        response_handler: Arc<dyn ResponseHandler>,
    ) -> anyhow::Result<Arc<UdpTransport>> {
        let socket = UdpSocket::bind(requested_address).await?;
        let bind_address = socket.local_addr()?;

        Ok(Arc::new(UdpTransport {
            socket,
            bind_address,
            response_handler,
            send_buffer: Mutex::new(WireBuf::new(MAX_UDP_PACKET)),
            send_addresses: StdMutex::new(Vec::new()),
            ignored_addresses: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            shutdown_requested: Notify::new(),
            receive_task: StdMutex::new(None),
            remote_receive_buffer_size: AtomicI32::new(-1),
            remote_socket_receive_buffer_size: AtomicI32::new(-1),
            remote_priority: AtomicU16::new(CA_DEFAULT_PRIORITY),
            remote_minor_revision: AtomicU8::new(0),
        }))
    }

    pub fn bind_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// the fan-out destinations used when a sender does not pick a recipient
    pub fn set_send_addresses(&self, addresses: Vec<SocketAddr>) {
        *self.send_addresses.lock().unwrap() = addresses;
    }

    /// Datagrams whose source IP matches an entry are dropped without dispatching. This is how
    ///  a broadcasting server suppresses its own loopback echoes.
    pub fn set_ignored_addresses(&self, addresses: Vec<SocketAddr>) {
        *self.ignored_addresses.lock().unwrap() = addresses;
    }

    /// Spawns the receive task. Calling this a second time is an error.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("UDP transport {} already started", self.bind_address);
        }

        let transport = self.clone();
        let handle = tokio::spawn(async move {
            transport.receive_loop().await;
        });
        *self.receive_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Idempotent: the first call flips the closed flag and wakes the receive task, any later
    ///  call is a no-op. The `forced` flag only matters for diagnostics.
    pub fn close(&self, forced: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("UDP socket {} closed (forced: {})", self.bind_address, forced);
        // notify_one leaves a permit behind, so the receive task sees the shutdown even if it
        //  is not parked in select at this very moment
        self.shutdown_requested.notify_one();
    }

    /// [UdpTransport::close] plus waiting for the receive task to actually exit, bounded by a
    ///  timeout. Exceeding the timeout is logged but not fatal.
    pub async fn close_and_wait(&self, forced: bool) {
        self.close(forced);

        let handle = self.receive_task.lock().unwrap().take();
        if let Some(handle) = handle {
            match time::timeout(SHUTDOWN_WAIT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("receive task for UDP socket {} failed: {}", self.bind_address, e),
                Err(_) => error!("receive task for UDP socket {} has not exited", self.bind_address),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// the platform's SO_RCVBUF for this socket, or -1 if it cannot be determined
    pub fn socket_receive_buffer_size(&self) -> i32 {
        match SockRef::from(&self.socket).recv_buffer_size() {
            Ok(size) => size as i32,
            Err(e) => {
                error!("getsockopt SO_RCVBUF failed for {}: {}", self.bind_address, e);
                -1
            }
        }
    }

    /// Best effort: a failure to resize the socket's receive buffer is logged and ignored.
    pub fn set_mutable_socket_receive_buffer_size(&self, size: usize) {
        if let Err(e) = SockRef::from(&self.socket).set_recv_buffer_size(size) {
            warn!("unable to set SO_RCVBUF to {} for {}: {}", size, self.bind_address, e);
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let task_name = format!("UDP-receive {}", self.bind_address);
        debug!("starting receive task '{}'", task_name);

        let mut receive_buffer = WireBuf::new(MAX_UDP_PACKET);
        let self_transport: Arc<dyn Transport> = self.clone();

        while !self.is_closed() {
            receive_buffer.clear();

            let received = select! {
                _ = self.shutdown_requested.notified() => break,
                r = self.socket.recv_from(receive_buffer.raw_mut()) => r,
            };

            match received {
                Ok((bytes_read, from)) if bytes_read > 0 => {
                    if self.is_ignored(from) {
                        trace!("ignoring datagram from {}", from);
                        continue;
                    }

                    receive_buffer.set_position(bytes_read);
                    receive_buffer.flip();

                    if let Err(e) = self.process_buffer(&self_transport, from, &mut receive_buffer).await {
                        debug!("discarding rest of datagram from {}: {}", from, e);
                    }
                }
                Ok(_) => {
                    // zero-length datagrams carry nothing to parse
                }
                Err(e) if is_transient_recv_error(&e) => {}
                Err(e) => {
                    if !self.is_closed() {
                        error!("socket recv error on {}: {}", self.bind_address, e);
                    }
                    self.close(true);
                    break;
                }
            }
        }

        debug!("receive task '{}' exiting", task_name);
    }

    fn is_ignored(&self, from: SocketAddr) -> bool {
        self.ignored_addresses.lock().unwrap().iter()
            .any(|ignored| ignored.ip() == from.ip())
    }

    /// Parses and dispatches every message in the buffer. Fewer than a header's worth of
    ///  trailing bytes end the loop normally; a framing error (bad magic, payload overrunning
    ///  the datagram) abandons whatever follows.
    async fn process_buffer(
        &self,
        self_transport: &Arc<dyn Transport>,
        from: SocketAddr,
        buf: &mut WireBuf,
    ) -> anyhow::Result<()> {
        while buf.remaining() >= CA_MESSAGE_HEADER_SIZE {
            let header = PvaHeader::try_read(buf)?;

            let next_message_position = buf.position() + header.payload_size as usize;
            if next_message_position > buf.limit() {
                bail!(
                    "message from {} declares {} payload bytes but only {} remain",
                    from, header.payload_size, buf.remaining()
                );
            }

            if let Err(e) = self.response_handler
                .handle_response(from, self_transport, header.version, header.command, header.payload_size, buf)
                .await
            {
                warn!("handler for command {} from {} failed: {}", header.command, from, e);
            }

            // re-seek to the message boundary - a handler under-read is tolerated
            buf.set_position(next_message_position);
        }
        Ok(())
    }

    async fn send_buffer_to(&self, buf: &WireBuf, to: SocketAddr) -> bool {
        match self.socket.send_to(buf.remaining_slice(), to).await {
            Ok(_) => true,
            Err(e) => {
                debug!("socket send error to {}: {}", to, e);
                false
            }
        }
    }

    /// one send per configured destination; an individual failure does not stop the fan-out
    async fn fan_out(&self, buf: &WireBuf) -> bool {
        let addresses = self.send_addresses.lock().unwrap().clone();
        if addresses.is_empty() {
            return false;
        }

        let mut all_ok = true;
        for to in addresses {
            all_ok &= self.send_buffer_to(buf, to).await;
        }
        all_ok
    }

    pub fn remote_receive_buffer_size(&self) -> i32 {
        self.remote_receive_buffer_size.load(Ordering::SeqCst)
    }

    pub fn remote_socket_receive_buffer_size(&self) -> i32 {
        self.remote_socket_receive_buffer_size.load(Ordering::SeqCst)
    }

    pub fn remote_priority(&self) -> u16 {
        self.remote_priority.load(Ordering::SeqCst)
    }

    pub fn remote_minor_revision(&self) -> u8 {
        self.remote_minor_revision.load(Ordering::SeqCst)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close(true);
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn remote_address(&self) -> SocketAddr {
        self.bind_address
    }

    fn priority(&self) -> u16 {
        CA_DEFAULT_PRIORITY
    }

    fn set_remote_transport_receive_buffer_size(&self, size: i32) {
        self.remote_receive_buffer_size.store(size, Ordering::SeqCst);
    }

    fn set_remote_transport_socket_receive_buffer_size(&self, size: i32) {
        self.remote_socket_receive_buffer_size.store(size, Ordering::SeqCst);
    }

    fn set_remote_priority(&self, priority: u16) {
        self.remote_priority.store(priority, Ordering::SeqCst);
    }

    fn set_remote_minor_revision(&self, revision: u8) {
        self.remote_minor_revision.store(revision, Ordering::SeqCst);
    }

    async fn enqueue_send_request(&self, sender: Arc<dyn TransportSender>) -> bool {
        let mut send_buffer = self.send_buffer.lock().await;
        send_buffer.clear();

        let mut control = SendControl::new(&mut send_buffer);
        let marshalled = {
            let _guard = SenderLockGuard::hold(sender.as_ref());
            sender.send(&mut control)
        };

        if let Err(e) = marshalled {
            warn!("send request on {} failed: {}", self.bind_address, e);
            return false;
        }

        control.end_message();
        let recipient = control.recipient();
        drop(control);

        send_buffer.flip();
        match recipient {
            Some(to) => self.send_buffer_to(&send_buffer, to).await,
            None => self.fan_out(&send_buffer).await,
        }
    }
}

/// scoped sender lock: `unlock` runs on every exit path, marshalling errors included
struct SenderLockGuard<'a> {
    sender: &'a dyn TransportSender,
}
impl <'a> SenderLockGuard<'a> {
    fn hold(sender: &'a dyn TransportSender) -> SenderLockGuard<'a> {
        sender.lock();
        SenderLockGuard { sender }
    }
}
impl Drop for SenderLockGuard<'_> {
    fn drop(&mut self) {
        self.sender.unlock();
    }
}

fn is_transient_recv_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
    )
}
