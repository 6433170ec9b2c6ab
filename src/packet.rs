// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

use strum_macros::EnumIter;

use self::PacketType::*;
use crate::codec::Decoder;
use crate::codec::Encoder;
use crate::ChunkHash;
use crate::Error;
use crate::Result;
use crate::HASH_LEN;
use crate::HEADER_LEN;
use crate::MAGIC;

/// Packet type carried in the fourth byte of the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
pub enum PacketType {
    /// Asks every peer which of the listed chunks it holds.
    WhoHas = 0,

    /// Answers WHOHAS with the listed chunks held by the sender.
    IHave = 1,

    /// Requests one chunk from a peer that announced it.
    Get = 2,

    /// Carries one segment of the requested chunk.
    Data = 3,

    /// Cumulatively acknowledges DATA segments.
    Ack = 4,

    /// Refuses a request because the sender is busy or lacks the chunk.
    Denied = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(WhoHas),
            1 => Ok(IHave),
            2 => Ok(Get),
            3 => Ok(Data),
            4 => Ok(Ack),
            5 => Ok(Denied),
            _ => Err(Error::InvalidPacket),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            WhoHas => "WHOHAS",
            IHave => "IHAVE",
            Get => "GET",
            Data => "DATA",
            Ack => "ACK",
            Denied => "DENIED",
        };
        f.write_str(name)
    }
}

/// The fixed 16-byte packet header.
///
/// ```text
/// Packet Header {
///   Magic (16),
///   Source Id (8),
///   Type (8),
///   Header Length (16),
///   Total Length (16),
///   Sequence (32),
///   Ack (32),
/// }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// The type of the packet.
    pub pkt_type: PacketType,

    /// Identity tag of the sender.
    pub source_id: u8,

    /// Header plus payload length in bytes.
    pub total_len: u16,

    /// Segment sequence number of DATA packets, zero otherwise.
    pub seq: u32,

    /// Cumulative ack of ACK packets, zero otherwise.
    pub ack: u32,
}

impl PacketHeader {
    /// Encode the header to the given buffer.
    pub fn to_bytes(&self, mut buf: &mut [u8]) -> Result<usize> {
        let mut len = 0;
        len += buf.write_u16(MAGIC)?;
        len += buf.write_u8(self.source_id)?;
        len += buf.write_u8(self.pkt_type as u8)?;
        len += buf.write_u16(HEADER_LEN as u16)?;
        len += buf.write_u16(self.total_len)?;
        len += buf.write_u32(self.seq)?;
        len += buf.write_u32(self.ack)?;
        Ok(len)
    }

    /// Decode a header from the given buffer.
    ///
    /// Return the header and the advertised header length, which is where the
    /// payload starts.
    pub fn from_bytes(mut buf: &[u8]) -> Result<(PacketHeader, usize)> {
        let buf_len = buf.len();

        if buf.read_u16()? != MAGIC {
            return Err(Error::InvalidPacket);
        }
        let source_id = buf.read_u8()?;
        let pkt_type = PacketType::try_from(buf.read_u8()?)?;
        let header_len = buf.read_u16()? as usize;
        let total_len = buf.read_u16()?;
        let seq = buf.read_u32()?;
        let ack = buf.read_u32()?;

        if header_len < HEADER_LEN || header_len > total_len as usize {
            return Err(Error::InvalidPacket);
        }
        if total_len as usize > buf_len {
            return Err(Error::BufferTooShort);
        }

        let hdr = PacketHeader {
            pkt_type,
            source_id,
            total_len,
            seq,
            ack,
        };
        Ok((hdr, header_len))
    }
}

/// Parse a datagram into its header and payload.
///
/// Bytes beyond the advertised total length are ignored.
pub fn parse(buf: &[u8]) -> Result<(PacketHeader, &[u8])> {
    let (hdr, header_len) = PacketHeader::from_bytes(buf)?;
    Ok((hdr, &buf[header_len..hdr.total_len as usize]))
}

/// Build a datagram carrying the given payload.
pub fn encode(
    pkt_type: PacketType,
    source_id: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let total_len = HEADER_LEN + payload.len();
    if total_len > u16::MAX as usize {
        return Err(Error::BufferTooShort);
    }

    let hdr = PacketHeader {
        pkt_type,
        source_id,
        total_len: total_len as u16,
        seq,
        ack,
    };

    let mut out = vec![0; total_len];
    let len = hdr.to_bytes(&mut out[..])?;
    (&mut out[len..]).write(payload)?;
    Ok(out)
}

/// Concatenate digests into a WHOHAS/IHAVE/GET payload.
pub fn encode_hashes(hashes: &[ChunkHash]) -> Vec<u8> {
    let mut out = Vec::with_capacity(hashes.len() * HASH_LEN);
    for hash in hashes {
        out.extend_from_slice(hash.as_bytes());
    }
    out
}

/// Split a WHOHAS/IHAVE/GET payload into digests.
pub fn decode_hashes(mut payload: &[u8]) -> Result<Vec<ChunkHash>> {
    if payload.len() % HASH_LEN != 0 {
        return Err(Error::InvalidPacket);
    }

    let mut hashes = Vec::with_capacity(payload.len() / HASH_LEN);
    while !payload.is_empty() {
        let mut digest = [0_u8; HASH_LEN];
        payload.read_into(&mut digest)?;
        hashes.push(ChunkHash::new(digest));
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn packet_type() {
        for (i, ty) in PacketType::iter().enumerate() {
            assert_eq!(PacketType::try_from(i as u8), Ok(ty));
        }
        assert_eq!(PacketType::try_from(6_u8), Err(Error::InvalidPacket));
        assert_eq!(format!("{}", PacketType::WhoHas), "WHOHAS");
        assert_eq!(format!("{}", PacketType::Denied), "DENIED");
    }

    #[test]
    fn header_wire_format() -> Result<()> {
        let buf = encode(PacketType::Data, 29, 7, 0, &[0xab; 3])?;
        let exp = [
            0xcc, 0x51, // magic 52305
            29,   // source id
            3,    // type
            0x00, 0x10, // header length
            0x00, 0x13, // total length
            0x00, 0x00, 0x00, 0x07, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0xab, 0xab, 0xab,
        ];
        assert_eq!(buf[..], exp[..]);

        let (hdr, payload) = parse(&buf)?;
        assert_eq!(hdr.pkt_type, PacketType::Data);
        assert_eq!(hdr.source_id, 29);
        assert_eq!(hdr.seq, 7);
        assert_eq!(hdr.ack, 0);
        assert_eq!(payload, &[0xab; 3]);
        Ok(())
    }

    #[test]
    fn header_ignores_trailing_bytes() -> Result<()> {
        let mut buf = encode(PacketType::Ack, 1, 0, 42, &[])?;
        buf.extend_from_slice(&[0xff; 8]);

        let (hdr, payload) = parse(&buf)?;
        assert_eq!(hdr.pkt_type, PacketType::Ack);
        assert_eq!(hdr.ack, 42);
        assert!(payload.is_empty());
        Ok(())
    }

    #[test]
    fn malformed_headers() -> Result<()> {
        // Truncated header.
        let buf = encode(PacketType::Ack, 1, 0, 1, &[])?;
        assert_eq!(parse(&buf[..10]).err(), Some(Error::BufferTooShort));

        // Bad magic.
        let mut bad = buf.clone();
        bad[0] = 0;
        assert_eq!(parse(&bad).err(), Some(Error::InvalidPacket));

        // Unknown type.
        let mut bad = buf.clone();
        bad[3] = 9;
        assert_eq!(parse(&bad).err(), Some(Error::InvalidPacket));

        // Header length smaller than the fixed header.
        let mut bad = buf.clone();
        bad[5] = 8;
        assert_eq!(parse(&bad).err(), Some(Error::InvalidPacket));

        // Total length beyond the datagram.
        let buf = encode(PacketType::Data, 1, 1, 0, &[0; 32])?;
        assert_eq!(parse(&buf[..40]).err(), Some(Error::BufferTooShort));
        Ok(())
    }

    #[test]
    fn hashes_payload() -> Result<()> {
        let hashes = vec![ChunkHash::new([1; HASH_LEN]), ChunkHash::new([2; HASH_LEN])];
        let payload = encode_hashes(&hashes);
        assert_eq!(payload.len(), 2 * HASH_LEN);
        assert_eq!(decode_hashes(&payload)?, hashes);

        assert_eq!(decode_hashes(&payload[..25]), Err(Error::InvalidPacket));
        assert!(decode_hashes(&[])?.is_empty());
        Ok(())
    }
}
