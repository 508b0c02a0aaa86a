//! Stateless cluster helpers.
//!
//! Key to slot hashing, MOVED/ASK redirect decoding and `CLUSTER SLOTS`
//! topology decoding. Routing state lives in the client.

use crate::Value;

// ============================================================================
// CRC16-XMODEM
// ============================================================================

/// CRC16-XMODEM lookup table (same polynomial as Redis `src/crc16.c`).
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50A5, 0x60C6, 0x70E7,
    0x8108, 0x9129, 0xA14A, 0xB16B, 0xC18C, 0xD1AD, 0xE1CE, 0xF1EF,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52B5, 0x4294, 0x72F7, 0x62D6,
    0x9339, 0x8318, 0xB37B, 0xA35A, 0xD3BD, 0xC39C, 0xF3FF, 0xE3DE,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64E6, 0x74C7, 0x44A4, 0x5485,
    0xA56A, 0xB54B, 0x8528, 0x9509, 0xE5EE, 0xF5CF, 0xC5AC, 0xD58D,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76D7, 0x66F6, 0x5695, 0x46B4,
    0xB75B, 0xA77A, 0x9719, 0x8738, 0xF7DF, 0xE7FE, 0xD79D, 0xC7BC,
    0x48C4, 0x58E5, 0x6886, 0x78A7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xC9CC, 0xD9ED, 0xE98E, 0xF9AF, 0x8948, 0x9969, 0xA90A, 0xB92B,
    0x5AF5, 0x4AD4, 0x7AB7, 0x6A96, 0x1A71, 0x0A50, 0x3A33, 0x2A12,
    0xDBFD, 0xCBDC, 0xFBBF, 0xEB9E, 0x9B79, 0x8B58, 0xBB3B, 0xAB1A,
    0x6CA6, 0x7C87, 0x4CE4, 0x5CC5, 0x2C22, 0x3C03, 0x0C60, 0x1C41,
    0xEDAE, 0xFD8F, 0xCDEC, 0xDDCD, 0xAD2A, 0xBD0B, 0x8D68, 0x9D49,
    0x7E97, 0x6EB6, 0x5ED5, 0x4EF4, 0x3E13, 0x2E32, 0x1E51, 0x0E70,
    0xFF9F, 0xEFBE, 0xDFDD, 0xCFFC, 0xBF1B, 0xAF3A, 0x9F59, 0x8F78,
    0x9188, 0x81A9, 0xB1CA, 0xA1EB, 0xD10C, 0xC12D, 0xF14E, 0xE16F,
    0x1080, 0x00A1, 0x30C2, 0x20E3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83B9, 0x9398, 0xA3FB, 0xB3DA, 0xC33D, 0xD31C, 0xE37F, 0xF35E,
    0x02B1, 0x1290, 0x22F3, 0x32D2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xB5EA, 0xA5CB, 0x95A8, 0x8589, 0xF56E, 0xE54F, 0xD52C, 0xC50D,
    0x34E2, 0x24C3, 0x14A0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xA7DB, 0xB7FA, 0x8799, 0x97B8, 0xE75F, 0xF77E, 0xC71D, 0xD73C,
    0x26D3, 0x36F2, 0x0691, 0x16B0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xD94C, 0xC96D, 0xF90E, 0xE92F, 0x99C8, 0x89E9, 0xB98A, 0xA9AB,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18C0, 0x08E1, 0x3882, 0x28A3,
    0xCB7D, 0xDB5C, 0xEB3F, 0xFB1E, 0x8BF9, 0x9BD8, 0xABBB, 0xBB9A,
    0x4A75, 0x5A54, 0x6A37, 0x7A16, 0x0AF1, 0x1AD0, 0x2AB3, 0x3A92,
    0xFD2E, 0xED0F, 0xDD6C, 0xCD4D, 0xBDAA, 0xAD8B, 0x9DE8, 0x8DC9,
    0x7C26, 0x6C07, 0x5C64, 0x4C45, 0x3CA2, 0x2C83, 0x1CE0, 0x0CC1,
    0xEF1F, 0xFF3E, 0xCF5D, 0xDF7C, 0xAF9B, 0xBFBA, 0x8FD9, 0x9FF8,
    0x6E17, 0x7E36, 0x4E55, 0x5E74, 0x2E93, 0x3EB2, 0x0ED1, 0x1EF0,
];

/// Compute CRC16-XMODEM checksum (same algorithm as Redis).
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let index = ((crc >> 8) ^ byte as u16) as u8;
        crc = (crc << 8) ^ CRC16_TABLE[index as usize];
    }
    crc
}

// ============================================================================
// Hash Slot
// ============================================================================

/// Total number of hash slots in a Redis Cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Returns the part of `key` that is hashed.
///
/// The hash tag is the content between the first `{` and the next `}`. An
/// empty tag or a missing `}` means the whole key is hashed.
#[inline]
pub fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = memchr::memchr(b'{', key) else {
        return key;
    };
    let rest = &key[open + 1..];
    match memchr::memchr(b'}', rest) {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

/// Compute the hash slot for a key.
#[inline]
pub fn hash_slot(key: &[u8]) -> u16 {
    // SLOT_COUNT is a power of two, so masking keeps the low 14 bits.
    crc16(hash_tag(key)) & (SLOT_COUNT - 1)
}

// ============================================================================
// Redirects
// ============================================================================

/// The kind of cluster redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectKind {
    /// The slot now belongs to another node; the routing table is stale.
    Moved,
    /// The slot is migrating; retry once on the target after `ASKING`.
    Ask,
}

impl std::fmt::Display for RedirectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectKind::Moved => f.write_str("MOVED"),
            RedirectKind::Ask => f.write_str("ASK"),
        }
    }
}

/// A decoded `-MOVED <slot> <host:port>` or `-ASK <slot> <host:port>` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    /// Target as `host:port`; hostnames are kept verbatim.
    pub endpoint: String,
}

/// Decode a redirect from an error reply.
///
/// Returns `None` for non-error values, other error codes, and malformed
/// redirects (bad slot number, missing endpoint).
pub fn parse_redirect(value: &Value) -> Option<Redirect> {
    let kind = match value.error_code()? {
        "MOVED" => RedirectKind::Moved,
        "ASK" => RedirectKind::Ask,
        _ => return None,
    };

    let message = std::str::from_utf8(value.error_message()?).ok()?;
    let (slot, endpoint) = message.split_once(' ')?;
    let slot: u16 = slot.parse().ok()?;
    if slot >= SLOT_COUNT {
        return None;
    }
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return None;
    }

    Some(Redirect {
        kind,
        slot,
        endpoint: endpoint.to_string(),
    })
}

// ============================================================================
// CLUSTER SLOTS
// ============================================================================

/// A node entry from `CLUSTER SLOTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Address as `host:port`.
    pub endpoint: String,
    /// Node ID, when the server reports one.
    pub node_id: Option<String>,
}

/// A contiguous, inclusive range of slots with its primary and replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: NodeInfo,
    pub replicas: Vec<NodeInfo>,
}

impl SlotRange {
    /// Returns true if `slot` falls inside this range.
    #[inline]
    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }
}

/// Decode a `CLUSTER SLOTS` reply, sorted by start slot.
///
/// Returns `None` if the reply is not shaped like a slot table or a range is
/// out of bounds.
pub fn parse_cluster_slots(value: &Value) -> Option<Vec<SlotRange>> {
    let entries = value.as_array()?;
    let mut ranges = Vec::with_capacity(entries.len());

    for entry in entries {
        let items = entry.as_array()?;

        // [start, end, primary, replica...]
        if items.len() < 3 {
            return None;
        }

        let start = slot_value(&items[0])?;
        let end = slot_value(&items[1])?;
        if start > end {
            return None;
        }
        let primary = parse_node_info(&items[2])?;
        let replicas = items[3..]
            .iter()
            .map(parse_node_info)
            .collect::<Option<Vec<_>>>()?;

        ranges.push(SlotRange {
            start,
            end,
            primary,
            replicas,
        });
    }

    ranges.sort_by_key(|r| r.start);
    Some(ranges)
}

/// Extract a slot number from an Integer or numeric BulkString.
fn slot_value(value: &Value) -> Option<u16> {
    let n = int_value(value)?;
    u16::try_from(n).ok().filter(|&slot| slot < SLOT_COUNT)
}

fn int_value(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(n) => Some(*n),
        Value::BulkString(s) => std::str::from_utf8(s).ok()?.parse().ok(),
        _ => None,
    }
}

/// `[host, port]` or `[host, port, node_id, ...]`.
fn parse_node_info(value: &Value) -> Option<NodeInfo> {
    let items = value.as_array()?;
    if items.len() < 2 {
        return None;
    }

    let host = match &items[0] {
        Value::BulkString(s) | Value::SimpleString(s) => std::str::from_utf8(s).ok()?,
        _ => return None,
    };
    let port = u16::try_from(int_value(&items[1])?).ok()?;

    let node_id = items
        .get(2)
        .and_then(|v| match v {
            Value::BulkString(s) => std::str::from_utf8(s).ok(),
            _ => None,
        })
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    Some(NodeInfo {
        endpoint: format!("{host}:{port}"),
        node_id,
    })
}
