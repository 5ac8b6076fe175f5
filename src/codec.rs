//! Compressed spike packets
//!
//! The compressed format is restricted to the fixed-step method and is
//! a sequence of bytes per rank per exchange:
//!
//! ```text
//! nspike = buf[0]*256 + buf[1]
//! followed by nspike entries of (dt, localgid)
//! ```
//!
//! `dt` is the whole number of time steps since the previous exchange,
//! so the minimum delay must be shorter than 256 steps. `localgid` is
//! 1, 2 or 4 bytes wide, little-endian, depending on the largest local
//! output count on any rank; when gid compression is off the raw gid
//! travels in 4 bytes instead. Byte coding is done by hand so the
//! format is machine independent.
//!
//! Each rank's first [`Codec::slot_bytes`] bytes travel in a fixed-size
//! all-gather; whatever does not fit spills into a varying-count
//! all-gather of the tails.

use crate::error::{Error, Result};
use crate::spike::Spike;
use crate::Gid;

/// Fixed parameters of the compressed exchange, agreed by all ranks.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    /// Number of spike entries the fixed all-gather slot can hold.
    pub slot_nspike: usize,
    /// Width of the localgid field in bytes: 1, 2 or 4.
    pub localgid_size: usize,
    /// Whether gids are remapped to short per-rank encodings.
    pub gid_compress: bool,
    /// The fixed integration step, the unit of the `dt` byte.
    pub dt: f64,
}

/// Pick the narrowest localgid width that can hold `max_outputs`
/// distinct values on any rank.
pub fn localgid_width(max_outputs: usize) -> usize {
    if max_outputs <= u8::MAX as usize + 1 {
        1
    } else if max_outputs <= u16::MAX as usize + 1 {
        2
    } else {
        4
    }
}

impl Codec {
    /// Bytes of one entry.
    pub fn entry_bytes(&self) -> usize {
        1 + self.localgid_size
    }

    /// Bytes of the fixed all-gather slot: two-byte count plus the
    /// inline entries.
    pub fn slot_bytes(&self) -> usize {
        2 + self.slot_nspike * self.entry_bytes()
    }

    /// Encode one rank's spikes for the interval ending at `t_exchange`
    /// that started at `t_prev`. `out` is cleared and filled with the
    /// complete packet, fixed part first; bytes past
    /// [`Codec::slot_bytes`] are the overflow tail.
    ///
    /// `localgid` maps a gid to its short encoding; with gid
    /// compression off it is ignored and the raw gid is written.
    pub fn encode(
        &self,
        spikes: &[Spike],
        t_prev: f64,
        out: &mut Vec<u8>,
        localgid: impl Fn(Gid) -> u32,
    ) -> Result<()> {
        out.clear();
        let n = spikes.len();
        if n > u16::MAX as usize {
            return Err(Error::capacity(format!(
                "{n} spikes in one interval exceeds the 16-bit packet count"
            )));
        }
        out.push((n >> 8) as u8);
        out.push((n & 0xff) as u8);
        for spk in spikes {
            let steps = ((spk.spiketime - t_prev) / self.dt).round();
            if !(0.0..256.0).contains(&steps) {
                return Err(Error::capacity(format!(
                    "spike at t={} is {steps} steps past the exchange at t={t_prev}; \
                     the exchange interval must stay under 256 steps",
                    spk.spiketime
                )));
            }
            out.push(steps as u8);
            let code = if self.gid_compress {
                localgid(spk.gid)
            } else {
                spk.gid as u32
            };
            let bytes = code.to_le_bytes();
            out.extend_from_slice(&bytes[..self.localgid_size]);
        }
        // Pad short packets to the fixed slot so the all-gather slot
        // boundaries stay aligned.
        if out.len() < self.slot_bytes() {
            out.resize(self.slot_bytes(), 0);
        }
        Ok(())
    }

    /// Number of spike entries recorded in a packet header.
    pub fn packet_count(&self, slot: &[u8]) -> usize {
        (slot[0] as usize) * 256 + slot[1] as usize
    }

    /// Overflow bytes a packet with `n` entries needs past the fixed
    /// slot.
    pub fn overflow_bytes(&self, n: usize) -> usize {
        if n > self.slot_nspike {
            2 + n * self.entry_bytes() - self.slot_bytes()
        } else {
            0
        }
    }

    /// Decode every entry of one source rank's packet, fixed slot plus
    /// overflow tail, invoking `emit(code, spiketime)` per entry.
    pub fn decode(
        &self,
        slot: &[u8],
        overflow: &[u8],
        t_prev: f64,
        mut emit: impl FnMut(u32, f64),
    ) {
        let n = self.packet_count(slot);
        let eb = self.entry_bytes();
        let inline = n.min(self.slot_nspike);
        let read = |bytes: &[u8], i: usize| {
            let e = &bytes[i * eb..(i + 1) * eb];
            let mut code = [0u8; 4];
            code[..self.localgid_size].copy_from_slice(&e[1..]);
            let t = t_prev + e[0] as f64 * self.dt;
            (u32::from_le_bytes(code), t)
        };
        for i in 0..inline {
            let (code, t) = read(&slot[2..], i);
            emit(code, t);
        }
        for i in 0..n - inline {
            let (code, t) = read(overflow, i);
            emit(code, t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec {
            slot_nspike: 3,
            localgid_size: 2,
            gid_compress: true,
            dt: 0.025,
        }
    }

    fn spikes(ts: &[(Gid, f64)]) -> Vec<Spike> {
        ts.iter()
            .map(|&(gid, spiketime)| Spike { gid, spiketime })
            .collect()
    }

    #[test]
    fn round_trip_within_slot() {
        let c = codec();
        let mut buf = Vec::new();
        c.encode(&spikes(&[(5, 0.05), (9, 0.125)]), 0.0, &mut buf, |g| g as u32 * 2)
            .unwrap();
        assert_eq!(buf.len(), c.slot_bytes());
        assert_eq!(c.packet_count(&buf), 2);
        let mut got = Vec::new();
        c.decode(&buf, &[], 0.0, |code, t| got.push((code, t)));
        assert_eq!(got, vec![(10, 0.05), (18, 0.125)]);
    }

    #[test]
    fn overflow_spills_past_fixed_slot() {
        let c = codec();
        let s = spikes(&[(0, 0.0), (1, 0.025), (2, 0.05), (3, 0.075), (4, 0.1)]);
        let mut buf = Vec::new();
        c.encode(&s, 0.0, &mut buf, |g| g as u32).unwrap();
        assert_eq!(c.packet_count(&buf), 5);
        assert_eq!(c.overflow_bytes(5), buf.len() - c.slot_bytes());
        let (slot, ovfl) = buf.split_at(c.slot_bytes());
        let mut got = Vec::new();
        c.decode(slot, ovfl, 0.0, |code, t| got.push((code, t)));
        assert_eq!(got.len(), 5);
        assert_eq!(got[4], (4, 0.1));
    }

    #[test]
    fn interval_longer_than_255_steps_is_rejected() {
        let c = codec();
        let err = c
            .encode(&spikes(&[(0, 10.0)]), 0.0, &mut Vec::new(), |g| g as u32)
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[test]
    fn width_selection() {
        assert_eq!(localgid_width(200), 1);
        assert_eq!(localgid_width(256), 1);
        assert_eq!(localgid_width(257), 2);
        assert_eq!(localgid_width(70_000), 4);
    }

    #[test]
    fn uncompressed_gids_travel_raw() {
        let c = Codec {
            localgid_size: 4,
            gid_compress: false,
            ..codec()
        };
        let mut buf = Vec::new();
        c.encode(&spikes(&[(100_000, 0.05)]), 0.0, &mut buf, |_| unreachable!())
            .unwrap();
        let mut got = Vec::new();
        c.decode(&buf, &[], 0.0, |code, t| got.push((code, t)));
        assert_eq!(got, vec![(100_000, 0.05)]);
    }
}
