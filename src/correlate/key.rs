use std::fmt;

/// Composite identity joining the events of one logical flow.
///
/// Field meaning depends on the pipeline: for RDS and congestion flows the
/// ids are IPv4 addresses and `class` is the type of service, for block I/O
/// they are the device and sector, for network transmit the buffer address.
/// Equality and hashing are field-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_id: u64,
    pub dst_id: u64,
    pub class: u32,
    pub src_port: u32,
    pub dst_port: u32,
}

impl FlowKey {
    pub const fn new(src_id: u64, dst_id: u64, class: u32, src_port: u32, dst_port: u32) -> Self {
        Self {
            src_id,
            dst_id,
            class,
            src_port,
            dst_port,
        }
    }

    /// Build the logical key from physical event fields.
    ///
    /// A response travels from the responder back to the initiator, so its
    /// physical source is the logical destination. Swapping here lets both
    /// directions of one exchange share a key.
    pub const fn oriented(
        role: Role,
        src_id: u64,
        dst_id: u64,
        class: u32,
        src_port: u32,
        dst_port: u32,
    ) -> Self {
        match role {
            Role::Request => Self::new(src_id, dst_id, class, src_port, dst_port),
            Role::Response => Self::new(dst_id, src_id, class, dst_port, src_port),
        }
    }

    /// Key identifying a single object such as a request or buffer address.
    pub const fn object(id: u64, discriminator: u64, class: u32) -> Self {
        Self::new(id, discriminator, class, 0, 0)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} class {}",
            self.src_id, self.src_port, self.dst_id, self.dst_port, self.class
        )
    }
}

/// Which side of a request/response exchange an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Request,
    Response,
}

impl Role {
    /// Decode the role marker carried in the event payload.
    /// Zero marks a request, anything else a response.
    pub const fn from_marker(marker: u64) -> Self {
        if marker == 0 {
            Self::Request
        } else {
            Self::Response
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}
