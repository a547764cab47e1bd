use std::fmt;

/// A point in a flow's lifecycle at which a timestamp is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    Queued = 0,
    Issued = 1,
    Sent = 2,
    Transmitted = 3,
    Completed = 4,
    ReceivedIncoming = 5,
    DeliveredToConsumer = 6,
    Congested = 7,
    Uncongested = 8,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Issued => "issued",
            Self::Sent => "sent",
            Self::Transmitted => "transmitted",
            Self::Completed => "completed",
            Self::ReceivedIncoming => "recv_incoming",
            Self::DeliveredToConsumer => "delivered",
            Self::Congested => "congested",
            Self::Uncongested => "uncongested",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bound on stages in any protocol, used for fixed-size storage.
pub const MAX_STAGES: usize = 5;

/// How a protocol's key ids should be read back when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoints {
    /// Ids are IPv4 addresses, ports are transport ports.
    Inet,
    /// `src_id` is a device number, `dst_id` a sector, `class` the direction.
    Device,
    /// `src_id` is a buffer address.
    Buffer,
}

/// A strictly ordered stage sequence. The last stage is terminal.
#[derive(Debug, PartialEq, Eq)]
pub struct Protocol {
    pub name: &'static str,
    pub stages: &'static [Stage],
    pub endpoints: Endpoints,
}

impl Protocol {
    /// Build a protocol. Panics at compile time when `stages` is empty or
    /// longer than [`MAX_STAGES`].
    pub const fn new(name: &'static str, stages: &'static [Stage], endpoints: Endpoints) -> Self {
        assert!(!stages.is_empty() && stages.len() <= MAX_STAGES);
        Self {
            name,
            stages,
            endpoints,
        }
    }

    pub fn first(&self) -> Stage {
        self.stages[0]
    }

    pub fn terminal(&self) -> Stage {
        self.stages[self.stages.len() - 1]
    }

    pub fn is_terminal(&self, stage: Stage) -> bool {
        self.terminal() == stage
    }

    /// Position of `stage` in this protocol's order.
    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }

    /// Adjacent stage pairs in order.
    pub fn segments(&self) -> impl Iterator<Item = (Stage, Stage)> + '_ {
        self.stages.windows(2).map(|w| (w[0], w[1]))
    }
}

/// Send, transmit, send completion, receive, delivery to the consumer.
pub static RDS_REQUEST: Protocol = Protocol::new(
    "rds_request",
    &[
        Stage::Sent,
        Stage::Transmitted,
        Stage::Completed,
        Stage::ReceivedIncoming,
        Stage::DeliveredToConsumer,
    ],
    Endpoints::Inet,
);

/// The reply direction of an RDS exchange, tracked in its own table.
pub static RDS_RESPONSE: Protocol = Protocol::new(
    "rds_response",
    &[
        Stage::Sent,
        Stage::Transmitted,
        Stage::Completed,
        Stage::ReceivedIncoming,
        Stage::DeliveredToConsumer,
    ],
    Endpoints::Inet,
);

pub static BLOCK_IO: Protocol = Protocol::new(
    "block_io",
    &[Stage::Issued, Stage::Completed],
    Endpoints::Device,
);

pub static NET_XMIT: Protocol = Protocol::new(
    "net_xmit",
    &[Stage::Queued, Stage::Transmitted],
    Endpoints::Buffer,
);

pub static CONGESTION: Protocol = Protocol::new(
    "congestion",
    &[Stage::Congested, Stage::Uncongested],
    Endpoints::Inet,
);

/// The correlated pipelines this crate tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Pipeline {
    RdsRequest = 0,
    RdsResponse = 1,
    BlockIo = 2,
    NetXmit = 3,
    Congestion = 4,
}

/// Number of [`Pipeline`] variants.
pub const PIPELINE_COUNT: usize = 5;

impl Pipeline {
    pub fn protocol(self) -> &'static Protocol {
        match self {
            Self::RdsRequest => &RDS_REQUEST,
            Self::RdsResponse => &RDS_RESPONSE,
            Self::BlockIo => &BLOCK_IO,
            Self::NetXmit => &NET_XMIT,
            Self::Congestion => &CONGESTION,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.protocol().name
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::RdsRequest,
            Self::RdsResponse,
            Self::BlockIo,
            Self::NetXmit,
            Self::Congestion,
        ]
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
