//! SNTP packet encoding and the offset/round-trip math
//!
//! Only the fields a unicast client needs are read. Everything is
//! bounds-checked: a response that is not exactly one packet long is rejected.

use thiserror_no_std::Error;

use crate::clock::Timestamp;

pub const NTP_PACKET_LEN: usize = 48;

/// LI = 3 (clock unsynchronised), VN = 4, mode = 3 (client).
const REQUEST_FLAGS: u8 = 0xE3;
const REQUEST_POLL: u8 = 6;
const REQUEST_PRECISION: u8 = 0xEC;

const MODE_SERVER: u8 = 4;
const MAX_STRATUM: u8 = 15;

const ORIGIN_AT: usize = 24;
const RECEIVE_AT: usize = 32;
const TRANSMIT_AT: usize = 40;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("response is {0} bytes, expected 48")]
    Length(usize),
    #[error("unexpected mode {0}")]
    Mode(u8),
    #[error("unusable stratum {0}")]
    Stratum(u8),
    #[error("origin timestamp does not echo the request")]
    OriginMismatch,
    #[error("server transmit timestamp missing")]
    NoTransmitTime,
}

/// Server-side timestamps from a validated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimes {
    pub stratum: u8,
    /// When the server received the request.
    pub receive: Timestamp,
    /// When the server sent the reply.
    pub transmit: Timestamp,
}

fn read_raw(bytes: &[u8], at: usize) -> [u8; 8] {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    raw
}

fn raw_to_timestamp(raw: [u8; 8]) -> Timestamp {
    let secs = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let frac = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    Timestamp::from_ntp(secs, frac)
}

fn timestamp_to_raw(t: Timestamp) -> [u8; 8] {
    let (secs, frac) = t.to_ntp();
    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(&secs.to_be_bytes());
    raw[4..].copy_from_slice(&frac.to_be_bytes());
    raw
}

/// Build a client request carrying `t1` in the transmit field.
pub fn encode_request(t1: Timestamp) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = REQUEST_FLAGS;
    packet[1] = 0;
    packet[2] = REQUEST_POLL;
    packet[3] = REQUEST_PRECISION;
    packet[TRANSMIT_AT..TRANSMIT_AT + 8].copy_from_slice(&timestamp_to_raw(t1));
    packet
}

/// Validate a response to the request stamped with `t1`.
pub fn decode_response(bytes: &[u8], t1: Timestamp) -> Result<ServerTimes, PacketError> {
    if bytes.len() != NTP_PACKET_LEN {
        return Err(PacketError::Length(bytes.len()));
    }
    let mode = bytes[0] & 0x07;
    if mode != MODE_SERVER {
        return Err(PacketError::Mode(mode));
    }
    let stratum = bytes[1];
    if stratum == 0 || stratum > MAX_STRATUM {
        return Err(PacketError::Stratum(stratum));
    }
    if read_raw(bytes, ORIGIN_AT) != timestamp_to_raw(t1) {
        return Err(PacketError::OriginMismatch);
    }
    let transmit_raw = read_raw(bytes, TRANSMIT_AT);
    if transmit_raw == [0u8; 8] {
        return Err(PacketError::NoTransmitTime);
    }
    Ok(ServerTimes {
        stratum,
        receive: raw_to_timestamp(read_raw(bytes, RECEIVE_AT)),
        transmit: raw_to_timestamp(transmit_raw),
    })
}

/// Clock offset `((t2 - t1) + (t3 - t4)) / 2` in microseconds.
///
/// Positive means the local clock is behind the server.
pub fn clock_offset_us(t1: Timestamp, t2: Timestamp, t3: Timestamp, t4: Timestamp) -> i64 {
    (t2.micros_since(&t1) + t3.micros_since(&t4)) / 2
}

/// Network round trip `(t4 - t1) - (t3 - t2)` in microseconds.
pub fn round_trip_us(t1: Timestamp, t2: Timestamp, t3: Timestamp, t4: Timestamp) -> i64 {
    t4.micros_since(&t1) - t3.micros_since(&t2)
}
