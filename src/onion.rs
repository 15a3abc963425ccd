//! Onion-blob rewriting for rerouted forwards.
//!
//! When an HTLC is redirected through a just-opened channel, the hop
//! instruction the downstream node will act on has to describe the new
//! channel, amount, and timelock. The sphinx layers destined for the
//! recipient are carried through unchanged; this module only replaces the
//! top hop instruction with a fresh TLV payload (amt_to_forward,
//! outgoing_cltv_value, short_channel_id) in front of the inner onion.
//!
//! The output is a pure function of its inputs, so a replayed HTLC yields
//! byte-identical instructions.

use thiserror::Error;

use crate::scid::ShortChannelId;

const ONION_VERSION: u8 = 0;

const TLV_AMT_TO_FORWARD: u64 = 2;
const TLV_OUTGOING_CLTV_VALUE: u64 = 4;
const TLV_SHORT_CHANNEL_ID: u64 = 6;

#[derive(Debug, Error)]
pub enum Error {
    #[error("onion blob too short: {0} bytes")]
    TooShort(usize),
}

/// Replace the top hop of `incoming` with an instruction to forward
/// `amount_msat` over `scid` with CLTV `outgoing_expiry`.
pub fn rewrite(
    incoming: &[u8],
    scid: ShortChannelId,
    amount_msat: u64,
    outgoing_expiry: u32,
) -> Result<Vec<u8>, Error> {
    if incoming.len() < 2 {
        return Err(Error::TooShort(incoming.len()));
    }

    let payload = hop_payload(scid, amount_msat, outgoing_expiry);
    let mut out = Vec::with_capacity(1 + 9 + payload.len() + incoming.len());
    out.push(ONION_VERSION);
    write_bigsize(&mut out, payload.len() as u64);
    out.extend_from_slice(&payload);
    // inner onion, minus the version byte we just re-emitted
    out.extend_from_slice(&incoming[1..]);
    Ok(out)
}

/// TLV stream for a non-final hop, records in ascending type order.
fn hop_payload(scid: ShortChannelId, amount_msat: u64, outgoing_expiry: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32);
    write_tlv(&mut payload, TLV_AMT_TO_FORWARD, &tu64_bytes(amount_msat));
    write_tlv(&mut payload, TLV_OUTGOING_CLTV_VALUE, &tu64_bytes(outgoing_expiry as u64));
    write_tlv(&mut payload, TLV_SHORT_CHANNEL_ID, &scid.0.to_be_bytes());
    payload
}

fn write_tlv(buf: &mut Vec<u8>, typ: u64, value: &[u8]) {
    write_bigsize(buf, typ);
    write_bigsize(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

// BOLT-01 BigSize
fn write_bigsize(buf: &mut Vec<u8>, v: u64) {
    match v {
        0..=0xFC => buf.push(v as u8),
        0xFD..=0xFFFF => {
            buf.push(0xFD);
            buf.extend_from_slice(&(v as u16).to_be_bytes());
        }
        0x10000..=0xFFFFFFFF => {
            buf.push(0xFE);
            buf.extend_from_slice(&(v as u32).to_be_bytes());
        }
        _ => {
            buf.push(0xFF);
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }
}

// truncated u64: minimal big-endian encoding
fn tu64_bytes(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_bigsize(buf: &[u8]) -> (u64, usize) {
        match buf[0] {
            0xFD => (u16::from_be_bytes([buf[1], buf[2]]) as u64, 3),
            0xFE => (u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as u64, 5),
            0xFF => (u64::from_be_bytes(buf[1..9].try_into().unwrap()), 9),
            b => (b as u64, 1),
        }
    }

    #[test]
    fn test_rewrite_describes_new_hop() {
        let incoming = vec![0u8; 1366];
        let scid = ShortChannelId(0x0000010000010001);
        let blob = rewrite(&incoming, scid, 50_000, 144).unwrap();

        assert_eq!(blob[0], 0);
        let (payload_len, off) = read_bigsize(&blob[1..]);
        let payload = &blob[1 + off..1 + off + payload_len as usize];

        // amt_to_forward
        assert_eq!(payload[0], 2);
        let alen = payload[1] as usize;
        let mut amt = 0u64;
        for b in &payload[2..2 + alen] {
            amt = (amt << 8) | *b as u64;
        }
        assert_eq!(amt, 50_000);

        // short_channel_id is the last record, 8 raw bytes
        assert_eq!(&payload[payload_len as usize - 8..], &scid.0.to_be_bytes());

        // inner onion carried through
        assert_eq!(blob.len(), 1 + off + payload_len as usize + incoming.len() - 1);
    }

    #[test]
    fn test_rewrite_is_deterministic() {
        let incoming: Vec<u8> = (0..=255u8).cycle().take(1366).collect();
        let a = rewrite(&incoming, ShortChannelId(42), 1000, 100).unwrap();
        let b = rewrite(&incoming, ShortChannelId(42), 1000, 100).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rewrite_rejects_garbage() {
        assert!(rewrite(&[0], ShortChannelId(1), 1, 1).is_err());
    }

    #[test]
    fn test_bigsize_boundaries() {
        let mut buf = Vec::new();
        write_bigsize(&mut buf, 0xFC);
        write_bigsize(&mut buf, 0xFD);
        write_bigsize(&mut buf, 0x10000);
        assert_eq!(buf[0], 0xFC);
        assert_eq!(buf[1], 0xFD);
        assert_eq!(&buf[2..4], &[0x00, 0xFD]);
        assert_eq!(buf[4], 0xFE);
    }
}
