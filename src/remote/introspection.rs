//! The seam towards the external introspection codec.
//!
//! The core never interprets typed field descriptors or their values - it only asks an opaque
//!  codec to serialize them into an outgoing message (the beacon's optional server status).

use std::sync::Arc;

use crate::remote::buffer::WireBuf;

/// wire encoding of "no descriptor follows"
pub const NULL_TYPE_CODE: u8 = 0xFF;

/// A typed field plus value that knows how to serialize itself through the external
///  introspection machinery. The descriptor must always precede the value on the wire.
pub trait SerializableStatus: Send + Sync {
    fn serialize_descriptor(&self, buf: &mut WireBuf);

    fn serialize_value(&self, buf: &mut WireBuf);
}

/// the null-descriptor encoding used when no status data is available
pub fn serialize_null_field(buf: &mut WireBuf) {
    buf.put_u8(NULL_TYPE_CODE);
}

/// Supplies the optional server-status field carried in beacons. Implementations live outside
///  the core; any error they raise is logged and treated as "no status".
pub trait BeaconServerStatusProvider: Send + Sync {
    fn server_status_data(&self) -> anyhow::Result<Option<Arc<dyn SerializableStatus>>>;
}
