//! LWMAC frame encoding and decoding
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use byteorder::{ByteOrder, LittleEndian};

use crate::mac::LinkAddr;
use crate::packet::Packet;

/// LWMAC frame decoding errors
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    NotEnoughBytes,
    UnknownType(u8),
    PayloadTooLong,
}

const FRAME_TYPE_WR: u8 = 0x01;
const FRAME_TYPE_WA: u8 = 0x02;
const FRAME_TYPE_DATA: u8 = 0x03;
const FRAME_TYPE_BROADCAST: u8 = 0x04;

bitflags::bitflags! {
    /// Frame header flags
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct FrameFlags: u8 {
        /// Destination address is extended
        const DST_EXTENDED = 0b0000_0001;
        /// Source address is extended
        const SRC_EXTENDED = 0b0000_0010;
        /// Sender has further frames queued for the destination
        const PENDING      = 0b0000_0100;
    }
}

/// LWMAC frame kinds and their type-specific fields
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameKind {
    /// Wake-Request
    WakeRequest,
    /// Wake-Ack carrying the sender's current phase in microseconds
    WakeAck { phase: u32 },
    /// Unicast data
    Data,
    /// Broadcast data with sequence number for de-duplication
    Broadcast { seq: u8 },
}

/// LWMAC frame header
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    pub kind: FrameKind,
    pub dst: LinkAddr,
    pub src: LinkAddr,
    pub pending: bool,
}

impl Header {
    pub fn new(kind: FrameKind, dst: LinkAddr, src: LinkAddr) -> Self {
        Self { kind, dst, src, pending: false }
    }

    fn flags(&self) -> FrameFlags {
        let mut f = FrameFlags::empty();
        f.set(FrameFlags::DST_EXTENDED, self.dst.is_extended());
        f.set(FrameFlags::SRC_EXTENDED, self.src.is_extended());
        f.set(FrameFlags::PENDING, self.pending);
        f
    }

    /// Encoded header length
    pub fn encoded_len(&self) -> usize {
        let extra = match self.kind {
            FrameKind::WakeAck{..} => 4,
            FrameKind::Broadcast{..} => 1,
            _ => 0,
        };
        2 + self.dst.encoded_len() + self.src.encoded_len() + extra
    }

    /// Encode the header into the provided buffer, returning the encoded length
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        if buf.len() < self.encoded_len() {
            return Err(FrameError::NotEnoughBytes);
        }

        buf[0] = match self.kind {
            FrameKind::WakeRequest => FRAME_TYPE_WR,
            FrameKind::WakeAck{..} => FRAME_TYPE_WA,
            FrameKind::Data => FRAME_TYPE_DATA,
            FrameKind::Broadcast{..} => FRAME_TYPE_BROADCAST,
        };
        buf[1] = self.flags().bits();

        let mut n = 2;
        n += self.dst.encode(&mut buf[n..]);
        n += self.src.encode(&mut buf[n..]);

        match self.kind {
            FrameKind::WakeAck{ phase } => {
                LittleEndian::write_u32(&mut buf[n..n+4], phase);
                n += 4;
            },
            FrameKind::Broadcast{ seq } => {
                buf[n] = seq;
                n += 1;
            },
            _ => (),
        }

        Ok(n)
    }

    /// Decode a header from the provided buffer, returning the header and consumed length
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        if buf.len() < 2 {
            return Err(FrameError::NotEnoughBytes);
        }

        let frame_type = buf[0];
        let flags = FrameFlags::from_bits_truncate(buf[1]);
        let mut n = 2;

        let (dst, l) = LinkAddr::decode(&buf[n..], flags.contains(FrameFlags::DST_EXTENDED))
            .ok_or(FrameError::NotEnoughBytes)?;
        n += l;

        let (src, l) = LinkAddr::decode(&buf[n..], flags.contains(FrameFlags::SRC_EXTENDED))
            .ok_or(FrameError::NotEnoughBytes)?;
        n += l;

        let kind = match frame_type {
            FRAME_TYPE_WR => FrameKind::WakeRequest,
            FRAME_TYPE_WA => {
                if buf.len() < n + 4 {
                    return Err(FrameError::NotEnoughBytes);
                }
                let phase = LittleEndian::read_u32(&buf[n..n+4]);
                n += 4;
                FrameKind::WakeAck{ phase }
            },
            FRAME_TYPE_DATA => FrameKind::Data,
            FRAME_TYPE_BROADCAST => {
                if buf.len() < n + 1 {
                    return Err(FrameError::NotEnoughBytes);
                }
                let seq = buf[n];
                n += 1;
                FrameKind::Broadcast{ seq }
            },
            _ => return Err(FrameError::UnknownType(frame_type)),
        };

        let h = Header { kind, dst, src, pending: flags.contains(FrameFlags::PENDING) };

        Ok((h, n))
    }
}

/// Decoded LWMAC frame with owned payload
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    pub header: Header,
    pub payload: Packet,
}

impl Frame {
    /// Create a control frame (WR / WA) with no payload
    pub fn control(kind: FrameKind, dst: LinkAddr, src: LinkAddr) -> Self {
        Self { header: Header::new(kind, dst, src), payload: Packet::default() }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let (header, n) = Header::decode(buf)?;

        let payload = Packet::from_slice(&buf[n..]).ok_or(FrameError::PayloadTooLong)?;

        Ok(Self { header, payload })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, FrameError> {
        encode_with(&self.header, self.payload.payload(), buf)
    }
}

/// Encode a header followed by a borrowed payload
pub fn encode_with(header: &Header, payload: &[u8], buf: &mut [u8]) -> Result<usize, FrameError> {
    let n = header.encode(buf)?;

    if buf.len() < n + payload.len() {
        return Err(FrameError::NotEnoughBytes);
    }

    buf[n..n+payload.len()].copy_from_slice(payload);

    Ok(n + payload.len())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wake_ack_mixed_addresses() {
        let h = Header::new(FrameKind::WakeAck{ phase: 0x0001_2345 }, LinkAddr::short(0x0102), LinkAddr::extended(0xaabb_ccdd_eeff_0011));

        let mut buff = [0u8; 64];
        let n = h.encode(&mut buff).unwrap();
        assert_eq!(n, h.encoded_len());
        assert_eq!(n, 2 + 2 + 8 + 4);
        assert_eq!(&buff[..2], &[FRAME_TYPE_WA, 0b0000_0010]);

        let (d, m) = Header::decode(&buff[..n]).unwrap();
        assert_eq!(d, h);
        assert_eq!(m, n);
    }

    #[test]
    fn data_with_pending_flag() {
        let mut f = Frame {
            header: Header::new(FrameKind::Data, LinkAddr::short(2), LinkAddr::short(1)),
            payload: Packet::from_slice(&[1, 2, 3, 4]).unwrap(),
        };
        f.header.pending = true;

        let mut buff = [0u8; 64];
        let n = f.encode(&mut buff).unwrap();
        assert_eq!(&buff[n-4..n], &[1, 2, 3, 4]);

        let d = Frame::decode(&buff[..n]).unwrap();
        assert!(d.header.pending);
        assert_eq!(d, f);
    }

    #[test]
    fn decode_errors() {
        assert_eq!(Frame::decode(&[FRAME_TYPE_WR]), Err(FrameError::NotEnoughBytes));
        assert_eq!(Frame::decode(&[0x7f, 0x00, 1, 0, 2, 0]), Err(FrameError::UnknownType(0x7f)));
        // WA truncated inside the phase field
        assert_eq!(Frame::decode(&[FRAME_TYPE_WA, 0x00, 1, 0, 2, 0, 0x10]), Err(FrameError::NotEnoughBytes));
        // Broadcast missing its sequence number
        assert_eq!(Frame::decode(&[FRAME_TYPE_BROADCAST, 0x00, 0xff, 0xff, 2, 0]), Err(FrameError::NotEnoughBytes));
    }

    #[test]
    fn encode_into_short_buffer() {
        let h = Header::new(FrameKind::WakeRequest, LinkAddr::extended(1), LinkAddr::extended(2));
        let mut buff = [0u8; 8];
        assert_eq!(h.encode(&mut buff), Err(FrameError::NotEnoughBytes));
    }
}
