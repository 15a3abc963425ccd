use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 64-bit short channel id.
///
/// Treated as opaque almost everywhere; the conventional block:tx:out
/// decomposition only matters when talking to CLN (string form) and when
/// reconciling closed channels (output-index mask).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortChannelId(pub u64);

#[derive(Debug, Error)]
#[error("malformed short channel id: {0}")]
pub struct ParseScidError(String);

impl ShortChannelId {
    pub fn new(block: u32, tx_index: u32, output_index: u16) -> Self {
        ShortChannelId(
            ((block as u64 & 0xFFFFFF) << 40)
                | ((tx_index as u64 & 0xFFFFFF) << 16)
                | output_index as u64,
        )
    }

    pub fn block(&self) -> u32 {
        ((self.0 >> 40) & 0xFFFFFF) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xFFFFFF) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The output number used to key channel points during closed-channel
    /// reconciliation: the low 24 bits of the raw scid.
    pub fn outnum(&self) -> u64 {
        self.0 & 0xFFFFFF
    }
}

impl From<u64> for ShortChannelId {
    fn from(v: u64) -> Self {
        ShortChannelId(v)
    }
}

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}x{}x{}", self.block(), self.tx_index(), self.output_index())
    }
}

impl FromStr for ShortChannelId {
    type Err = ParseScidError;

    // CLN renders scids as "<block>x<txindex>x<outnum>"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, 'x');
        let block = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| ParseScidError(s.to_string()))?;
        let tx_index = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| ParseScidError(s.to_string()))?;
        let output_index = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| ParseScidError(s.to_string()))?;
        if block > 0xFFFFFF || tx_index > 0xFFFFFF {
            return Err(ParseScidError(s.to_string()));
        }
        Ok(ShortChannelId::new(block, tx_index, output_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let scid = ShortChannelId::new(600_000, 1234, 1);
        assert_eq!(scid.block(), 600_000);
        assert_eq!(scid.tx_index(), 1234);
        assert_eq!(scid.output_index(), 1);
        assert_eq!(scid.to_string().parse::<ShortChannelId>().unwrap(), scid);
    }

    #[test]
    fn test_parse() {
        let scid: ShortChannelId = "103x2x0".parse().unwrap();
        assert_eq!(scid.0, (103u64 << 40) | (2 << 16));
        assert!("103x2".parse::<ShortChannelId>().is_err());
        assert!("axbxc".parse::<ShortChannelId>().is_err());
        assert!("16777216x0x0".parse::<ShortChannelId>().is_err());
    }

    #[test]
    fn test_outnum_mask() {
        // the reconciliation key masks 24 bits, not the 16-bit output field
        let scid = ShortChannelId(0x0000010000010001);
        assert_eq!(scid.outnum(), 0x010001);
        assert_eq!(ShortChannelId::new(1, 0, 5).outnum(), 5);
    }
}
