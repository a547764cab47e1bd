//! Kernel-version dependent field naming.
//!
//! Probe payloads name and encode the same fields differently across kernel
//! releases. A [`FieldAccessor`] is picked once at startup from the running
//! (or configured) release and used for every record.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};

use super::parse::{ParseError, RawRecord};
use crate::correlate::interval::ScopeKind;

/// Path exposing the running kernel release.
pub const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// First release using the current field layout.
pub const CURRENT_LAYOUT_SINCE: KernelRelease = KernelRelease::new(4, 14, 0);

/// Numeric `major.minor.patch` prefix of a kernel release string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelRelease {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelRelease {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    fn as_tuple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl PartialOrd for KernelRelease {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelRelease {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_tuple().cmp(&other.as_tuple())
    }
}

impl FromStr for KernelRelease {
    type Err = anyhow::Error;

    /// Parses strings such as `5.15.0-105-generic` or `4.14.35-2047.el7uek`.
    /// Missing minor or patch components default to zero.
    fn from_str(s: &str) -> Result<Self> {
        let version = s.trim().split(['-', '+', '_']).next().unwrap_or_default();
        let mut parts = version.split('.').map(|p| {
            p.parse::<u32>()
                .with_context(|| format!("invalid kernel release component {p:?} in {s:?}"))
        });

        let major = parts
            .next()
            .with_context(|| format!("empty kernel release {s:?}"))??;
        let minor = parts.next().transpose()?.unwrap_or(0);
        let patch = parts.next().transpose()?.unwrap_or(0);

        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for KernelRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Read the running kernel release.
pub fn detect_kernel_release() -> Result<KernelRelease> {
    let raw = std::fs::read_to_string(OSRELEASE_PATH)
        .with_context(|| format!("reading {OSRELEASE_PATH}"))?;
    raw.parse()
}

/// Connection fields of an RDS or congestion record, as physically reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub src: u64,
    pub dst: u64,
    pub class: u32,
    pub src_port: u32,
    pub dst_port: u32,
}

/// Block request identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub dev: u64,
    pub sector: u64,
    pub write: bool,
}

/// Reads probe fields for one kernel layout.
pub trait FieldAccessor: Send + Sync {
    /// Layout name for logs.
    fn name(&self) -> &'static str;

    fn connection(&self, rec: &RawRecord<'_>) -> Result<Connection, ParseError>;

    /// Request/response marker. Absent means request.
    fn role_marker(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError>;

    fn block_request(&self, rec: &RawRecord<'_>) -> Result<BlockRequest, ParseError>;

    /// Socket buffer address of a network transmit record.
    fn buffer(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError>;

    fn scope(&self, rec: &RawRecord<'_>) -> Result<ScopeKind, ParseError>;

    /// `(anon, file)` pages reclaimed by an LRU shrink pass.
    fn lru_reclaimed(&self, rec: &RawRecord<'_>) -> Result<(u64, u64), ParseError>;

    /// Cumulative progress reading of a nested reclaim probe.
    fn progress(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError>;
}

/// Field layout of kernels from [`CURRENT_LAYOUT_SINCE`] on.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentLayout;

impl FieldAccessor for CurrentLayout {
    fn name(&self) -> &'static str {
        "current"
    }

    fn connection(&self, rec: &RawRecord<'_>) -> Result<Connection, ParseError> {
        Ok(Connection {
            src: rec.u64_field("saddr")?,
            dst: rec.u64_field("daddr")?,
            class: rec.u32_field_or("tos", 0)?,
            src_port: rec.u32_field("sport")?,
            dst_port: rec.u32_field("dport")?,
        })
    }

    fn role_marker(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError> {
        rec.u64_field_or("reply", 0)
    }

    fn block_request(&self, rec: &RawRecord<'_>) -> Result<BlockRequest, ParseError> {
        let rwbs = rec.str_field("rwbs")?;
        Ok(BlockRequest {
            dev: rec.u64_field("dev")?,
            sector: rec.u64_field("sector")?,
            write: rwbs.contains('W'),
        })
    }

    fn buffer(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError> {
        rec.u64_field("skb")
    }

    fn scope(&self, rec: &RawRecord<'_>) -> Result<ScopeKind, ParseError> {
        let raw = rec.str_field("scope")?;
        ScopeKind::from_name(raw)
            .or_else(|| raw.parse().ok().and_then(ScopeKind::from_code))
            .ok_or_else(|| ParseError::InvalidValue {
                field: "scope",
                value: raw.to_string(),
            })
    }

    fn lru_reclaimed(&self, rec: &RawRecord<'_>) -> Result<(u64, u64), ParseError> {
        Ok((rec.u64_field_or("anon", 0)?, rec.u64_field_or("file", 0)?))
    }

    fn progress(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError> {
        rec.u64_field("progress")
    }
}

/// Field layout of kernels older than [`CURRENT_LAYOUT_SINCE`].
///
/// Connections use local/foreign naming with ports in network byte order,
/// block requests carry a numeric `rw` flag word, scopes are numeric codes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyLayout;

/// Write bit in the legacy block `rw` flags.
const LEGACY_RW_WRITE: u64 = 1;

impl FieldAccessor for LegacyLayout {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn connection(&self, rec: &RawRecord<'_>) -> Result<Connection, ParseError> {
        Ok(Connection {
            src: rec.u64_field("laddr")?,
            dst: rec.u64_field("faddr")?,
            class: rec.u32_field_or("tos", 0)?,
            src_port: net_port(rec, "lport")?,
            dst_port: net_port(rec, "fport")?,
        })
    }

    fn role_marker(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError> {
        rec.u64_field_or("reply", 0)
    }

    fn block_request(&self, rec: &RawRecord<'_>) -> Result<BlockRequest, ParseError> {
        Ok(BlockRequest {
            dev: rec.u64_field("devno")?,
            sector: rec.u64_field("sector")?,
            write: rec.u64_field("rw")? & LEGACY_RW_WRITE != 0,
        })
    }

    fn buffer(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError> {
        rec.u64_field("skbaddr")
    }

    fn scope(&self, rec: &RawRecord<'_>) -> Result<ScopeKind, ParseError> {
        let code = rec.u64_field("scope")?;
        ScopeKind::from_code(code).ok_or_else(|| ParseError::InvalidValue {
            field: "scope",
            value: code.to_string(),
        })
    }

    fn lru_reclaimed(&self, rec: &RawRecord<'_>) -> Result<(u64, u64), ParseError> {
        Ok((
            rec.u64_field_or("nr_anon", 0)?,
            rec.u64_field_or("nr_file", 0)?,
        ))
    }

    fn progress(&self, rec: &RawRecord<'_>) -> Result<u64, ParseError> {
        rec.u64_field("nr")
    }
}

/// Port stored big-endian in a 16-bit field.
fn net_port(rec: &RawRecord<'_>, field: &'static str) -> Result<u32, ParseError> {
    let raw = rec.u64_field(field)?;
    let port = u16::try_from(raw).map_err(|_| ParseError::InvalidValue {
        field,
        value: raw.to_string(),
    })?;
    Ok(u32::from(u16::from_be(port)))
}

/// Pick the accessor for `release`.
pub fn select_accessor(release: KernelRelease) -> Box<dyn FieldAccessor> {
    if release < CURRENT_LAYOUT_SINCE {
        Box::new(LegacyLayout)
    } else {
        Box::new(CurrentLayout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::parse::parse_line;

    fn record(line: &str) -> RawRecord<'_> {
        parse_line(line).expect("parse").expect("record")
    }

    #[test]
    fn test_release_parsing() {
        let r: KernelRelease = "5.15.0-105-generic".parse().expect("release");
        assert_eq!(r, KernelRelease::new(5, 15, 0));

        let r: KernelRelease = "4.14.35-2047.510.5.el7uek.x86_64".parse().expect("release");
        assert_eq!(r, KernelRelease::new(4, 14, 35));

        let r: KernelRelease = "6.1".parse().expect("release");
        assert_eq!(r, KernelRelease::new(6, 1, 0));

        assert!("".parse::<KernelRelease>().is_err());
        assert!("abc.def".parse::<KernelRelease>().is_err());
    }

    #[test]
    fn test_release_ordering() {
        assert!(KernelRelease::new(4, 9, 200) < KernelRelease::new(4, 14, 0));
        assert!(KernelRelease::new(5, 0, 0) > KernelRelease::new(4, 20, 17));
    }

    #[test]
    fn test_selection_by_release() {
        assert_eq!(select_accessor(KernelRelease::new(4, 1, 12)).name(), "legacy");
        assert_eq!(select_accessor(KernelRelease::new(4, 14, 0)).name(), "current");
        assert_eq!(select_accessor(KernelRelease::new(6, 8, 0)).name(), "current");
    }

    #[test]
    fn test_current_connection() {
        let rec = record("1 7 rds_send saddr=10.0.0.1 daddr=10.0.0.2 tos=3 sport=4000 dport=18634");
        let c = CurrentLayout.connection(&rec).expect("connection");
        assert_eq!(c.src, 0x0a00_0001);
        assert_eq!(c.dst, 0x0a00_0002);
        assert_eq!(c.class, 3);
        assert_eq!(c.src_port, 4000);
        assert_eq!(c.dst_port, 18634);
        assert_eq!(CurrentLayout.role_marker(&rec).expect("marker"), 0);
    }

    #[test]
    fn test_legacy_ports_are_network_order() {
        // 4000 = 0x0fa0, byte-swapped 0xa00f.
        let rec = record(
            "1 7 rds_send laddr=10.0.0.1 faddr=10.0.0.2 lport=0xa00f fport=0xcaf0 reply=1",
        );
        let c = LegacyLayout.connection(&rec).expect("connection");
        assert_eq!(c.src_port, 4000);
        assert_eq!(c.dst_port, 0xf0ca);
        assert_eq!(c.class, 0);
        assert_eq!(LegacyLayout.role_marker(&rec).expect("marker"), 1);
        assert!(CurrentLayout.connection(&rec).is_err());
    }

    #[test]
    fn test_block_layouts() {
        let rec = record("1 7 block_issue dev=0x800010 sector=2048 rwbs=WS");
        let b = CurrentLayout.block_request(&rec).expect("block");
        assert_eq!(b.dev, 0x80_0010);
        assert!(b.write);

        let rec = record("1 7 block_issue devno=8388624 sector=2048 rw=0");
        let b = LegacyLayout.block_request(&rec).expect("block");
        assert_eq!(b.dev, 0x80_0010);
        assert!(!b.write);
    }

    #[test]
    fn test_scope_decoding() {
        let rec = record("1 7 reclaim_begin scope=memcg");
        assert_eq!(CurrentLayout.scope(&rec).expect("scope"), ScopeKind::Memcg);
        assert!(LegacyLayout.scope(&rec).is_err());

        let rec = record("1 7 reclaim_begin scope=1");
        assert_eq!(CurrentLayout.scope(&rec).expect("scope"), ScopeKind::Node);
        assert_eq!(LegacyLayout.scope(&rec).expect("scope"), ScopeKind::Node);

        let rec = record("1 7 reclaim_begin scope=7");
        assert!(LegacyLayout.scope(&rec).is_err());
    }
}
