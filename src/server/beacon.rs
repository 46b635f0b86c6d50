//! Periodic announcement of the server's presence on the discovery transport.
//!
//! A freshly started server beacons quickly so clients notice it right away; once it has been
//!  announced often enough the cadence drops to a slow steady-state rhythm.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::remote::introspection::{serialize_null_field, BeaconServerStatusProvider, SerializableStatus};
use crate::remote::transport::{SendControl, Transport, TransportSender};
use crate::remote::wire::{encode_as_ipv6, CMD_BEACON};
use crate::server::config::ServerConfig;
use crate::util::safe_converter::PrecheckedCast;

const MIN_BEACON_PERIOD: Duration = Duration::from_secs(1);
const MIN_SLOW_BEACON_PERIOD: Duration = Duration::from_secs(180);
const MIN_BEACON_COUNT_LIMIT: u16 = 3;

/// Emits beacon messages on its transport: immediately on [BeaconEmitter::start], then at
///  `fast_period` until `count_limit` beacons went out, then at `slow_period` indefinitely.
///
/// The scheduling task holds only a weak reference to the emitter's state - dropping the
///  emitter (or calling [BeaconEmitter::destroy]) stops the announcements without the
///  transport keeping them alive.
pub struct BeaconEmitter {
    state: Arc<BeaconState>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

struct BeaconState {
    transport: Arc<dyn Transport>,
    sequence_id: AtomicU16,
    startup_seconds: i64,
    startup_nanos: i32,
    fast_period: Duration,
    slow_period: Duration,
    count_limit: u16,
    server_address: SocketAddr,
    status_provider: Option<Arc<dyn BeaconServerStatusProvider>>,
}

impl BeaconEmitter {
    pub fn new(
        transport: Arc<dyn Transport>,
        server_address: SocketAddr,
        config: &ServerConfig,
        status_provider: Option<Arc<dyn BeaconServerStatusProvider>>,
    ) -> anyhow::Result<BeaconEmitter> {
        let startup = SystemTime::now().duration_since(UNIX_EPOCH)?;

        let fast_period = config.beacon_period.max(MIN_BEACON_PERIOD);
        Ok(BeaconEmitter {
            state: Arc::new(BeaconState {
                transport,
                sequence_id: AtomicU16::new(0),
                startup_seconds: startup.as_secs().prechecked_cast(),
                startup_nanos: startup.subsec_nanos().prechecked_cast(),
                fast_period,
                slow_period: MIN_SLOW_BEACON_PERIOD.max(fast_period),
                count_limit: config.beacon_count.max(MIN_BEACON_COUNT_LIMIT),
                server_address,
                status_provider,
            }),
            task: StdMutex::new(None),
        })
    }

    /// Schedules the first beacon at delay zero. Starting an already started emitter is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            debug!("beacon emitter for {} already started", self.state.server_address);
            return;
        }
        *task = Some(tokio::spawn(emitter_loop(Arc::downgrade(&self.state))));
    }

    /// Cancels the schedule; no further beacons are sent.
    pub fn destroy(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn sequence_id(&self) -> u16 {
        self.state.sequence_id.load(Ordering::SeqCst)
    }
}

impl Drop for BeaconEmitter {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn emitter_loop(state: Weak<BeaconState>) {
    loop {
        let period = {
            // hold a strong reference only while sending - an emitter that was dropped in the
            //  meantime must not be revived by its own schedule
            let Some(state) = state.upgrade() else {
                return;
            };

            let sender: Arc<dyn TransportSender> = state.clone();
            if !state.transport.enqueue_send_request(sender).await {
                debug!("beacon for {} could not be sent", state.server_address);
            }
            state.next_period()
        };

        if period.is_zero() {
            return;
        }
        sleep(period).await;
    }
}

impl BeaconState {
    fn period_after(&self, sequence_id: u16) -> Duration {
        if sequence_id >= self.count_limit {
            self.slow_period
        }
        else {
            self.fast_period
        }
    }

    fn next_period(&self) -> Duration {
        self.period_after(self.sequence_id.load(Ordering::SeqCst))
    }

    fn server_status(&self) -> Option<Arc<dyn SerializableStatus>> {
        let provider = self.status_provider.as_ref()?;
        match provider.server_status_data() {
            Ok(status) => status,
            Err(e) => {
                // external implementations must not break the schedule
                warn!("beacon server status provider failed: {}", e);
                None
            }
        }
    }
}

impl TransportSender for BeaconState {
    fn send(&self, control: &mut SendControl<'_>) -> anyhow::Result<()> {
        let server_status = self.server_status();

        control.start_message(CMD_BEACON, 2 + 8 + 4 + 16 + 2 + 128);
        let buf = control.buffer();
        buf.put_u16(self.sequence_id.load(Ordering::SeqCst));
        buf.put_i64(self.startup_seconds);
        buf.put_i32(self.startup_nanos);
        encode_as_ipv6(buf, &self.server_address);
        buf.put_u16(self.server_address.port());

        match server_status {
            Some(status) => {
                status.serialize_descriptor(buf);
                status.serialize_value(buf);
            }
            None => serialize_null_field(buf),
        }
        control.flush(true);

        self.sequence_id.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
