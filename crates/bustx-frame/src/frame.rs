//! Frame headers and codec

use crate::error::{FrameError, FrameResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command identifier carried in the application header
pub type Command = u16;

/// Transaction identifier carried in the application header, 0 for new requests
pub type TransactionId = u32;

/// Service identifier
pub type ServiceId = u16;

/// Encoded size of [`BusHeader`]
pub const BUS_HEADER_LEN: usize = 20;

/// Encoded size of [`AppHeader`]
pub const APP_HEADER_LEN: usize = 22;

/// Size of both headers
pub const FRAME_HEADER_LEN: usize = BUS_HEADER_LEN + APP_HEADER_LEN;

/// Bus routing header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusHeader {
    /// Source bus address
    pub src_id: u32,
    /// Destination bus address
    pub dest_id: u32,
    /// Router that forwarded the frame
    pub router_id: u32,
    /// Remaining hops
    pub ttl: u32,
    /// Client connection slot on the access layer
    pub client_pos: u32,
}

impl BusHeader {
    /// Header for a frame travelling back along this route
    pub fn reversed(&self) -> Self {
        Self {
            src_id: self.dest_id,
            dest_id: self.src_id,
            ..*self
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.src_id);
        buf.put_u32(self.dest_id);
        buf.put_u32(self.router_id);
        buf.put_u32(self.ttl);
        buf.put_u32(self.client_pos);
    }

    fn get(buf: &mut Bytes) -> Self {
        Self {
            src_id: buf.get_u32(),
            dest_id: buf.get_u32(),
            router_id: buf.get_u32(),
            ttl: buf.get_u32(),
            client_pos: buf.get_u32(),
        }
    }
}

/// Application header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHeader {
    /// Total frame length in bytes, headers included
    pub length: u32,
    /// Logical user or session the request belongs to
    pub requester_id: u32,
    /// Numeric client IP
    pub ip: u32,
    /// Command identifier
    pub cmd: Command,
    /// Sending service
    pub src_service: ServiceId,
    /// Receiving service
    pub dest_service: ServiceId,
    /// Transaction the frame belongs to, 0 for a new request
    pub transaction_id: TransactionId,
}

impl AppHeader {
    /// Header for a new request
    pub fn new(cmd: Command, requester_id: u32) -> Self {
        Self {
            cmd,
            requester_id,
            ..Default::default()
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
        buf.put_u32(self.requester_id);
        buf.put_u32(self.ip);
        buf.put_u16(self.cmd);
        buf.put_u16(self.src_service);
        buf.put_u16(self.dest_service);
        buf.put_u32(self.transaction_id);
    }

    fn get(buf: &mut Bytes) -> Self {
        Self {
            length: buf.get_u32(),
            requester_id: buf.get_u32(),
            ip: buf.get_u32(),
            cmd: buf.get_u16(),
            src_service: buf.get_u16(),
            dest_service: buf.get_u16(),
            transaction_id: buf.get_u32(),
        }
    }
}

/// A bus frame
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Routing header
    pub bus_header: BusHeader,
    /// Application header
    pub app_header: AppHeader,
    /// Payload after both headers
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame, filling in the length field
    pub fn new(bus_header: BusHeader, mut app_header: AppHeader, payload: Bytes) -> Self {
        app_header.length = (FRAME_HEADER_LEN + payload.len()) as u32;
        Self {
            bus_header,
            app_header,
            payload,
        }
    }

    /// Create a new-request frame with default routing
    pub fn request(cmd: Command, requester_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(
            BusHeader::default(),
            AppHeader::new(cmd, requester_id),
            payload.into(),
        )
    }

    /// Set the transaction id
    pub fn with_transaction_id(mut self, transaction_id: TransactionId) -> Self {
        self.app_header.transaction_id = transaction_id;
        self
    }

    /// Set the source and destination services
    pub fn with_services(mut self, src: ServiceId, dest: ServiceId) -> Self {
        self.app_header.src_service = src;
        self.app_header.dest_service = dest;
        self
    }

    /// Set the bus routing header
    pub fn with_bus_header(mut self, bus_header: BusHeader) -> Self {
        self.bus_header = bus_header;
        self
    }

    /// Command identifier
    pub fn cmd(&self) -> Command {
        self.app_header.cmd
    }

    /// Requester identifier
    pub fn requester_id(&self) -> u32 {
        self.app_header.requester_id
    }

    /// Transaction identifier
    pub fn transaction_id(&self) -> TransactionId {
        self.app_header.transaction_id
    }

    /// Check that the declared length matches headers plus payload
    pub fn is_valid(&self) -> bool {
        self.app_header.length as usize == FRAME_HEADER_LEN + self.payload.len()
    }

    /// Build a reply travelling back to the sender of this frame
    ///
    /// Routing and services are swapped, requester and transaction id are kept.
    pub fn reply(&self, cmd: Command, payload: impl Into<Bytes>) -> Self {
        let app_header = AppHeader {
            length: 0,
            requester_id: self.app_header.requester_id,
            ip: self.app_header.ip,
            cmd,
            src_service: self.app_header.dest_service,
            dest_service: self.app_header.src_service,
            transaction_id: self.app_header.transaction_id,
        };
        Self::new(self.bus_header.reversed(), app_header, payload.into())
    }

    /// Encode to bytes
    /// Format: [bus header: 20 bytes][app header: 22 bytes][payload: N bytes]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.bus_header.put(&mut buf);
        self.app_header.put(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode from bytes
    ///
    /// The payload is taken as `length - 42` bytes. Trailing bytes past the
    /// declared length are ignored.
    pub fn decode(mut data: Bytes) -> FrameResult<Self> {
        let available = data.len();
        if available < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: FRAME_HEADER_LEN,
                available,
            });
        }

        let bus_header = BusHeader::get(&mut data);
        let app_header = AppHeader::get(&mut data);

        let declared = app_header.length as usize;
        if declared < FRAME_HEADER_LEN {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: available,
            });
        }
        if declared > available {
            return Err(FrameError::Truncated {
                needed: declared,
                available,
            });
        }

        let payload = data.split_to(declared - FRAME_HEADER_LEN);
        Ok(Self {
            bus_header,
            app_header,
            payload,
        })
    }

    /// Log both headers at debug level
    pub fn dump(&self) {
        let b = &self.bus_header;
        let a = &self.app_header;
        tracing::debug!(
            "BusHeader|{}|{}|{}|{}|{}",
            b.src_id, b.dest_id, b.router_id, b.ttl, b.client_pos
        );
        tracing::debug!(
            "AppHeader|{}|{}|{}|0x{:04X}|{}|{}|{}",
            a.length, a.requester_id, a.ip, a.cmd, a.src_service, a.dest_service, a.transaction_id
        );
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview = &self.payload[..self.payload.len().min(16)];
        let payload = format!("{} bytes {}", self.payload.len(), hex::encode(preview));
        f.debug_struct("Frame")
            .field("bus_header", &self.bus_header)
            .field("app_header", &self.app_header)
            .field("payload", &payload)
            .finish()
    }
}
