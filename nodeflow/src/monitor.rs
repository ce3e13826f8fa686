//! The monitor wire format shared with the datapath agent.
//!
//! Every event starts with a one-byte message type followed by a
//! fixed-layout header in the agent's native byte order. Trace, drop,
//! policy verdict and capture events carry the captured L2 frame after
//! the header.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Error, Result};

pub const MESSAGE_TYPE_DROP: u8 = 1;
pub const MESSAGE_TYPE_DEBUG: u8 = 2;
pub const MESSAGE_TYPE_CAPTURE: u8 = 3;
pub const MESSAGE_TYPE_TRACE: u8 = 4;
pub const MESSAGE_TYPE_ACCESS_LOG: u8 = 5;
pub const MESSAGE_TYPE_AGENT: u8 = 6;
pub const MESSAGE_TYPE_POLICY_VERDICT: u8 = 7;

pub const TRACE_NOTIFY_VERSION_0: u8 = 0;
pub const TRACE_NOTIFY_VERSION_1: u8 = 1;

// Observation points carried in the trace sub-type.
pub const TRACE_TO_LXC: u8 = 0;
pub const TRACE_TO_PROXY: u8 = 1;
pub const TRACE_TO_HOST: u8 = 2;
pub const TRACE_TO_STACK: u8 = 3;
pub const TRACE_TO_OVERLAY: u8 = 4;
pub const TRACE_FROM_LXC: u8 = 5;
pub const TRACE_FROM_PROXY: u8 = 6;
pub const TRACE_FROM_HOST: u8 = 7;
pub const TRACE_FROM_STACK: u8 = 8;
pub const TRACE_FROM_OVERLAY: u8 = 9;
pub const TRACE_FROM_NETWORK: u8 = 10;

// Connection tracking state on trace events.
pub const TRACE_REASON_UNKNOWN: u8 = 0;
pub const TRACE_REASON_CT_ESTABLISHED: u8 = 1;
pub const TRACE_REASON_CT_REPLY: u8 = 2;
pub const TRACE_REASON_CT_RELATED: u8 = 3;

/// Policy verdict values below zero are denials carrying the negated
/// drop reason.
pub const POLICY_VERDICT_FLAG_DIRECTION_MASK: u8 = 0b11;

pub fn kind_str(message_type: u8) -> &'static str {
    match message_type {
        MESSAGE_TYPE_DROP => "drop",
        MESSAGE_TYPE_DEBUG => "debug",
        MESSAGE_TYPE_CAPTURE => "capture",
        MESSAGE_TYPE_TRACE => "trace",
        MESSAGE_TYPE_ACCESS_LOG => "access-log",
        MESSAGE_TYPE_AGENT => "agent",
        MESSAGE_TYPE_POLICY_VERDICT => "policy-verdict",
        _ => "unknown",
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TraceNotifyV0 {
    pub msg_type: u8,
    pub obs_point: u8,
    pub source: u16,
    pub hash: u32,
    pub orig_len: u32,
    pub cap_len: u32,
    pub src_label: u32,
    pub dst_label: u32,
    pub dst_id: u16,
    pub reason: u8,
    pub version: u8,
    pub ifindex: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TraceNotifyV1 {
    pub v0: TraceNotifyV0,
    /// Source address before any datapath translation. Zero-filled when
    /// not known; an IPv4 address occupies the first four bytes.
    pub orig_ip: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DropNotify {
    pub msg_type: u8,
    /// The drop reason.
    pub sub_type: u8,
    pub source: u16,
    pub hash: u32,
    pub orig_len: u32,
    pub cap_len: u32,
    pub src_label: u32,
    pub dst_label: u32,
    pub dst_id: u32,
    pub unused: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PolicyVerdictNotify {
    pub msg_type: u8,
    pub sub_type: u8,
    pub source: u16,
    pub hash: u32,
    pub orig_len: u32,
    pub cap_len: u32,
    pub remote_label: u32,
    /// Zero when allowed, negative drop reason when denied.
    pub verdict: i32,
    pub dst_port: u16,
    pub proto: u8,
    pub flags: u8,
    pub auth_type: u8,
    pub pad1: u8,
    pub pad2: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DebugCapture {
    pub msg_type: u8,
    pub sub_type: u8,
    pub source: u16,
    pub hash: u32,
    pub len: u32,
    pub orig_len: u32,
    pub arg1: u32,
    pub arg2: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DebugEvent {
    pub msg_type: u8,
    pub sub_type: u8,
    pub source: u16,
    pub hash: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
}

/// Reads one fixed-layout header off the front of `data`, returning it
/// together with the remaining bytes.
pub fn read_header<'a, T: FromBytes>(data: &'a [u8], what: &'static str) -> Result<(T, &'a [u8])> {
    T::read_from_prefix(data).map_err(|_| Error::TruncatedHeader(what))
}
