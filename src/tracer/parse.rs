//! Event parsing for line-oriented probe output.
//!
//! Each record is one line: `<timestamp_ns> <ctx_id> <probe> key=value ...`.
//! Values are decimal, `0x` hex, dotted IPv4 or bare words. Blank lines and
//! `#` comments are skipped. Field access is lazy; the per-probe decoding
//! goes through a [`FieldAccessor`] chosen for the kernel layout.

use std::net::Ipv4Addr;

use thiserror::Error;

use super::event::{Event, EventType, FlowEvent, ParsedEvent, TypedEvent};
use super::fields::FieldAccessor;
use crate::correlate::interval::ExecutionContextId;
use crate::correlate::key::{FlowKey, Role};
use crate::correlate::stage::Pipeline;

/// Errors that can occur during event parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("record too short: {tokens} header fields, need 3")]
    Truncated { tokens: usize },

    #[error("invalid timestamp {raw:?}")]
    InvalidTimestamp { raw: String },

    #[error("invalid execution context {raw:?}")]
    InvalidContext { raw: String },

    #[error("unknown probe {name:?}")]
    UnknownProbe { name: String },

    #[error("malformed field {token:?}, expected key=value")]
    MalformedField { token: String },

    #[error("{probe}: missing field {field}")]
    MissingField {
        probe: &'static str,
        field: &'static str,
    },

    #[error("invalid value {value:?} for field {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("record is not valid UTF-8 past byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("record longer than {limit} bytes")]
    LineTooLong { limit: usize },
}

impl ParseError {
    /// Short label for metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::InvalidTimestamp { .. } => "invalid_timestamp",
            Self::InvalidContext { .. } => "invalid_context",
            Self::UnknownProbe { .. } => "unknown_probe",
            Self::MalformedField { .. } => "malformed_field",
            Self::MissingField { .. } => "missing_field",
            Self::InvalidValue { .. } => "invalid_value",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::LineTooLong { .. } => "line_too_long",
        }
    }
}

/// Tokenized record before field decoding.
#[derive(Debug, Clone)]
pub struct RawRecord<'a> {
    pub header: Event,
    fields: Vec<(&'a str, &'a str)>,
}

impl<'a> RawRecord<'a> {
    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    /// Raw text of `name`, if present. The last occurrence wins.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
    }

    pub fn str_field(&self, name: &'static str) -> Result<&'a str, ParseError> {
        self.get(name).ok_or(ParseError::MissingField {
            probe: self.header.event_type.as_str(),
            field: name,
        })
    }

    pub fn u64_field(&self, name: &'static str) -> Result<u64, ParseError> {
        let raw = self.str_field(name)?;
        parse_value(raw).ok_or_else(|| ParseError::InvalidValue {
            field: name,
            value: raw.to_string(),
        })
    }

    pub fn u64_field_or(&self, name: &'static str, default: u64) -> Result<u64, ParseError> {
        match self.get(name) {
            Some(_) => self.u64_field(name),
            None => Ok(default),
        }
    }

    pub fn u32_field(&self, name: &'static str) -> Result<u32, ParseError> {
        narrow(name, self.u64_field(name)?)
    }

    pub fn u32_field_or(&self, name: &'static str, default: u32) -> Result<u32, ParseError> {
        narrow(name, self.u64_field_or(name, u64::from(default))?)
    }
}

fn narrow(field: &'static str, v: u64) -> Result<u32, ParseError> {
    u32::try_from(v).map_err(|_| ParseError::InvalidValue {
        field,
        value: v.to_string(),
    })
}

/// Parse a numeric field value: decimal, `0x` hex or dotted IPv4.
pub fn parse_value(raw: &str) -> Option<u64> {
    if let Some(hex) = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok();
    }

    if raw.contains('.') {
        return raw
            .parse::<Ipv4Addr>()
            .ok()
            .map(|a| u64::from(u32::from(a)));
    }

    raw.parse().ok()
}

/// Tokenize one line. Returns `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> Result<Option<RawRecord<'_>>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split_ascii_whitespace();
    let (Some(ts), Some(ctx), Some(probe)) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(ParseError::Truncated {
            tokens: line.split_ascii_whitespace().count(),
        });
    };

    let timestamp_ns = ts.parse().map_err(|_| ParseError::InvalidTimestamp {
        raw: ts.to_string(),
    })?;
    let ctx = parse_value(ctx).ok_or_else(|| ParseError::InvalidContext {
        raw: ctx.to_string(),
    })?;
    let event_type = EventType::from_name(probe).ok_or_else(|| ParseError::UnknownProbe {
        name: probe.to_string(),
    })?;

    let fields = tokens
        .map(|token| {
            token
                .split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| ParseError::MalformedField {
                    token: token.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RawRecord {
        header: Event {
            timestamp_ns,
            ctx: ExecutionContextId(ctx),
            event_type,
        },
        fields,
    }))
}

/// Decode a tokenized record into a [`ParsedEvent`].
pub fn decode(rec: &RawRecord<'_>, fields: &dyn FieldAccessor) -> Result<ParsedEvent, ParseError> {
    let event_type = rec.event_type();

    let typed = match event_type {
        EventType::RdsSend
        | EventType::RdsXmit
        | EventType::RdsComplete
        | EventType::RdsRecv
        | EventType::RdsDeliver => {
            let conn = fields.connection(rec)?;
            let role = Role::from_marker(fields.role_marker(rec)?);
            let pipeline = match role {
                Role::Request => Pipeline::RdsRequest,
                Role::Response => Pipeline::RdsResponse,
            };
            flow(
                event_type,
                pipeline,
                FlowKey::oriented(
                    role,
                    conn.src,
                    conn.dst,
                    conn.class,
                    conn.src_port,
                    conn.dst_port,
                ),
            )?
        }

        EventType::CongSet | EventType::CongClear => {
            let conn = fields.connection(rec)?;
            flow(
                event_type,
                Pipeline::Congestion,
                FlowKey::new(
                    conn.src,
                    conn.dst,
                    conn.class,
                    conn.src_port,
                    conn.dst_port,
                ),
            )?
        }

        EventType::BlockIssue | EventType::BlockComplete => {
            let req = fields.block_request(rec)?;
            flow(
                event_type,
                Pipeline::BlockIo,
                FlowKey::object(req.dev, req.sector, u32::from(req.write)),
            )?
        }

        EventType::NetQueue | EventType::NetXmit => flow(
            event_type,
            Pipeline::NetXmit,
            FlowKey::object(fields.buffer(rec)?, 0, 0),
        )?,

        EventType::ReclaimBegin => TypedEvent::ReclaimBegin {
            scope: fields.scope(rec)?,
        },

        EventType::ReclaimEnd => TypedEvent::ReclaimEnd,

        EventType::LruShrink => {
            let (anon, file) = fields.lru_reclaimed(rec)?;
            TypedEvent::LruShrink { anon, file }
        }

        EventType::SlabShrinkBegin | EventType::InodePruneBegin | EventType::BufferFreeBegin => {
            nested(event_type, fields.progress(rec)?, true)?
        }

        EventType::SlabShrinkEnd | EventType::InodePruneEnd | EventType::BufferFreeEnd => {
            nested(event_type, fields.progress(rec)?, false)?
        }
    };

    Ok(ParsedEvent {
        raw: rec.header,
        typed,
    })
}

/// Tokenize and decode one line.
pub fn parse_event(
    line: &str,
    fields: &dyn FieldAccessor,
) -> Result<Option<ParsedEvent>, ParseError> {
    match parse_line(line)? {
        Some(rec) => decode(&rec, fields).map(Some),
        None => Ok(None),
    }
}

fn flow(event_type: EventType, pipeline: Pipeline, key: FlowKey) -> Result<TypedEvent, ParseError> {
    let stage = event_type.stage().ok_or_else(|| not_for(event_type))?;
    Ok(TypedEvent::Flow(FlowEvent {
        pipeline,
        stage,
        key,
    }))
}

fn nested(event_type: EventType, reading: u64, begin: bool) -> Result<TypedEvent, ParseError> {
    let metric = event_type
        .nested_metric()
        .ok_or_else(|| not_for(event_type))?;
    Ok(if begin {
        TypedEvent::NestedBegin { metric, reading }
    } else {
        TypedEvent::NestedEnd { metric, reading }
    })
}

fn not_for(event_type: EventType) -> ParseError {
    ParseError::UnknownProbe {
        name: event_type.as_str().to_string(),
    }
}
