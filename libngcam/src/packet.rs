//! Decoding of the raw waveform and spectrum buffers read from a card.
//!
//! Header and trailer blocks arrive as 16-byte little-endian words. Decoding is two steps:
//! [`reverse_block`] flips the whole block, then each field is read big-endian out of the
//! flipped block. Encoding is the same two steps in the opposite order, so decoding an
//! encoded block gives back the same fields and encoding a decoded block gives back the same
//! bytes.
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::constants::*;
use super::error::PacketError;

pub type Block = [u8; BLOCK_SIZE];

/// Reverse the byte order of a whole header/trailer block
pub fn reverse_block(block: &Block) -> Block {
    let mut out = *block;
    out.reverse();
    out
}

fn block_at(buffer: &[u8], start: usize) -> Block {
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(&buffer[start..start + BLOCK_SIZE]);
    block
}

/// Map a 1-based physical camera index to the channel it occupies in a waveform payload
pub fn waveform_channel(camera_index: usize) -> usize {
    camera_index.saturating_sub(1) % NUMBER_OF_CHANNELS
}

/// Map a physical camera index to the channel slice addressed in a spectrum record.
///
/// Note this is not the same mapping as [`waveform_channel`]; both follow the firmware as
/// deployed.
pub fn spectrum_channel(camera_index: usize) -> usize {
    camera_index % NUMBER_OF_CHANNELS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaveformHeader {
    pub magic: u16,
    pub kind: u16,
    pub sequence: u16,
    pub measurement_time: u16,
    pub timestamp: u64,
}

impl WaveformHeader {
    /// Read the fields out of an already reversed block
    pub fn from_fields(fields: &Block) -> Self {
        Self {
            magic: BigEndian::read_u16(&fields[0..2]),
            kind: BigEndian::read_u16(&fields[2..4]),
            sequence: BigEndian::read_u16(&fields[4..6]),
            measurement_time: BigEndian::read_u16(&fields[6..8]),
            timestamp: BigEndian::read_u64(&fields[8..16]),
        }
    }

    pub fn to_fields(&self) -> Block {
        let mut fields = [0u8; BLOCK_SIZE];
        BigEndian::write_u16(&mut fields[0..2], self.magic);
        BigEndian::write_u16(&mut fields[2..4], self.kind);
        BigEndian::write_u16(&mut fields[4..6], self.sequence);
        BigEndian::write_u16(&mut fields[6..8], self.measurement_time);
        BigEndian::write_u64(&mut fields[8..16], self.timestamp);
        fields
    }

    pub fn decode(block: &Block) -> Self {
        Self::from_fields(&reverse_block(block))
    }

    pub fn encode(&self) -> Block {
        reverse_block(&self.to_fields())
    }

    pub fn is_valid(&self) -> bool {
        self.magic == HEADER_MAGIC && self.kind == WAVEFORM_TYPE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaveformTrailer {
    pub timestamp: u64,
    pub reserved: [u8; 6],
    pub magic: u16,
}

impl WaveformTrailer {
    pub fn from_fields(fields: &Block) -> Self {
        let mut reserved = [0u8; 6];
        reserved.copy_from_slice(&fields[8..14]);
        Self {
            timestamp: BigEndian::read_u64(&fields[0..8]),
            reserved,
            magic: BigEndian::read_u16(&fields[14..16]),
        }
    }

    pub fn to_fields(&self) -> Block {
        let mut fields = [0u8; BLOCK_SIZE];
        BigEndian::write_u64(&mut fields[0..8], self.timestamp);
        fields[8..14].copy_from_slice(&self.reserved);
        BigEndian::write_u16(&mut fields[14..16], self.magic);
        fields
    }

    pub fn decode(block: &Block) -> Self {
        Self::from_fields(&reverse_block(block))
    }

    pub fn encode(&self) -> Block {
        reverse_block(&self.to_fields())
    }

    pub fn is_valid(&self) -> bool {
        self.magic == TRAILER_MAGIC
    }
}

/// A decoded raw waveform buffer; the payload still borrows the read buffer
#[derive(Debug, Clone, Copy)]
pub struct WaveformPacket<'a> {
    pub header: WaveformHeader,
    pub trailer: WaveformTrailer,
    pub payload: &'a [u8],
}

/// Decode a raw waveform buffer. Only the header magic/type pair decides validity.
pub fn decode_waveform(buffer: &[u8]) -> Result<WaveformPacket<'_>, PacketError> {
    if buffer.len() < 2 * BLOCK_SIZE {
        return Err(PacketError::TooShort(buffer.len(), 2 * BLOCK_SIZE));
    }
    let header = WaveformHeader::decode(&block_at(buffer, 0));
    if !header.is_valid() {
        return Err(PacketError::BadMagic {
            magic: header.magic,
            kind: header.kind,
            exp_kind: WAVEFORM_TYPE,
        });
    }
    let tail_start = buffer.len() - BLOCK_SIZE;
    let trailer = WaveformTrailer::decode(&block_at(buffer, tail_start));
    Ok(WaveformPacket {
        header,
        trailer,
        payload: &buffer[BLOCK_SIZE..tail_start],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpectrumHeader {
    pub magic: u16,
    pub kind: u16,
    /// 24-bit spectrum serial: high 16 bits select the 50 ms block, low 8 bits the record
    pub serial: u32,
    pub measurement_time: u16,
    pub reserved: [u8; 7],
}

impl SpectrumHeader {
    pub fn from_fields(fields: &Block) -> Self {
        let mut reserved = [0u8; 7];
        reserved.copy_from_slice(&fields[9..16]);
        Self {
            magic: BigEndian::read_u16(&fields[0..2]),
            kind: BigEndian::read_u16(&fields[2..4]),
            serial: BigEndian::read_u24(&fields[4..7]),
            measurement_time: BigEndian::read_u16(&fields[7..9]),
            reserved,
        }
    }

    pub fn to_fields(&self) -> Block {
        let mut fields = [0u8; BLOCK_SIZE];
        BigEndian::write_u16(&mut fields[0..2], self.magic);
        BigEndian::write_u16(&mut fields[2..4], self.kind);
        BigEndian::write_u24(&mut fields[4..7], self.serial & 0x00FF_FFFF);
        BigEndian::write_u16(&mut fields[7..9], self.measurement_time);
        fields[9..16].copy_from_slice(&self.reserved);
        fields
    }

    pub fn decode(block: &Block) -> Self {
        Self::from_fields(&reverse_block(block))
    }

    pub fn encode(&self) -> Block {
        reverse_block(&self.to_fields())
    }

    pub fn is_valid(&self) -> bool {
        self.magic == HEADER_MAGIC && self.kind == SPECTRUM_TYPE
    }

    pub fn block_number(&self) -> u16 {
        (self.serial >> 8) as u16
    }

    pub fn record_index(&self) -> u8 {
        (self.serial & 0xFF) as u8
    }
}

/// One channel's gamma and neutron spectra from a single 1,024-byte sub-record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumRecord {
    pub block: u16,
    pub index: u8,
    pub measurement_time: u16,
    pub channel: usize,
    pub gamma: [u16; SPECTRUM_BINS],
    pub neutron: [u16; SPECTRUM_BINS],
}

fn decode_bins(bytes: &[u8]) -> [u16; SPECTRUM_BINS] {
    let mut bins = [0u16; SPECTRUM_BINS];
    BigEndian::read_u16_into(bytes, &mut bins);
    bins
}

/// Decode one sub-record for the given channel
pub fn decode_spectrum_record(record: &[u8], channel: usize) -> Result<SpectrumRecord, PacketError> {
    if record.len() < SPECTRUM_RECORD_SIZE {
        return Err(PacketError::TooShort(record.len(), SPECTRUM_RECORD_SIZE));
    }
    if channel >= NUMBER_OF_CHANNELS {
        return Err(PacketError::BadChannel(channel));
    }
    let header = SpectrumHeader::decode(&block_at(record, 0));
    if !header.is_valid() {
        return Err(PacketError::BadMagic {
            magic: header.magic,
            kind: header.kind,
            exp_kind: SPECTRUM_TYPE,
        });
    }
    let index = header.record_index();
    if index == 0 || index as usize > SPECTRUM_RECORDS_PER_PACK {
        return Err(PacketError::BadRecordIndex(index));
    }
    let gamma_start = BLOCK_SIZE + channel * SPECTRUM_CHANNEL_BYTES;
    let neutron_start = BLOCK_SIZE + SPECTRUM_BLOCK_SIZE + channel * SPECTRUM_CHANNEL_BYTES;
    Ok(SpectrumRecord {
        block: header.block_number(),
        index,
        measurement_time: header.measurement_time,
        channel,
        gamma: decode_bins(&record[gamma_start..gamma_start + SPECTRUM_CHANNEL_BYTES]),
        neutron: decode_bins(&record[neutron_start..neutron_start + SPECTRUM_CHANNEL_BYTES]),
    })
}

/// The decoded spectrum buffer of one pack
#[derive(Debug, Clone, Default)]
pub struct SpectrumPack {
    pub records: Vec<SpectrumRecord>,
    pub corrupt: usize,
}

/// Decode every sub-record of a spectrum buffer for the camera's channel.
///
/// Sub-records that fail validation are counted, not returned.
pub fn decode_spectrum(buffer: &[u8], camera_index: usize) -> Result<SpectrumPack, PacketError> {
    if buffer.len() < SPECTRUM_BUFFER_SIZE {
        return Err(PacketError::TooShort(buffer.len(), SPECTRUM_BUFFER_SIZE));
    }
    let channel = spectrum_channel(camera_index);
    let mut pack = SpectrumPack::default();
    for record in buffer[..SPECTRUM_BUFFER_SIZE].chunks_exact(SPECTRUM_RECORD_SIZE) {
        match decode_spectrum_record(record, channel) {
            Ok(rec) => pack.records.push(rec),
            Err(e) => {
                spdlog::debug!("Skipping spectrum record: {e}");
                pack.corrupt += 1;
            }
        }
    }
    Ok(pack)
}

/// A raw buffer of `len` bytes holding only a valid header and trailer
pub fn framed_waveform_buffer(len: usize, sequence: u16) -> Vec<u8> {
    let len = len.max(2 * BLOCK_SIZE);
    let mut buf = vec![0u8; len];
    let header = WaveformHeader {
        magic: HEADER_MAGIC,
        kind: WAVEFORM_TYPE,
        sequence,
        measurement_time: PACKING_DURATION_MS as u16,
        timestamp: 0x0102_0304_0506_0708,
    };
    let trailer = WaveformTrailer {
        timestamp: 0x1112_1314_1516_1718,
        reserved: [0; 6],
        magic: TRAILER_MAGIC,
    };
    buf[..BLOCK_SIZE].copy_from_slice(&header.encode());
    buf[len - BLOCK_SIZE..].copy_from_slice(&trailer.encode());
    buf
}

fn spectrum_record_header(block: u16, index: usize) -> SpectrumHeader {
    SpectrumHeader {
        magic: HEADER_MAGIC,
        kind: SPECTRUM_TYPE,
        serial: ((block as u32) << 8) | (index as u32 & 0xFF),
        measurement_time: PACKING_DURATION_MS as u16,
        reserved: [0; 7],
    }
}

/// A spectrum buffer of empty records with valid headers for `block`
pub fn framed_spectrum_buffer(block: u16) -> Vec<u8> {
    let mut buf = vec![0u8; SPECTRUM_BUFFER_SIZE];
    for (i, record) in buf.chunks_exact_mut(SPECTRUM_RECORD_SIZE).enumerate() {
        record[..BLOCK_SIZE].copy_from_slice(&spectrum_record_header(block, i + 1).encode());
    }
    buf
}

/// Splits a raw waveform payload into per-channel sample streams.
///
/// Implementations receive the payload bytes and whether samples are big-endian, and return
/// four equal-length signed sequences indexed by channel.
pub trait Deinterleaver {
    fn deinterleave(&self, payload: &[u8], big_endian: bool) -> [Vec<i16>; NUMBER_OF_CHANNELS];
}

/// Channel order of one 8-sample group in the raw payload
const INTERLEAVE_ORDER: [usize; 8] = [3, 3, 2, 2, 0, 0, 1, 1];

/// The firmware's point-interleaved layout: ch3,ch3,ch2,ch2,ch0,ch0,ch1,ch1,...
#[derive(Debug, Clone, Copy, Default)]
pub struct PointInterleaved;

impl Deinterleaver for PointInterleaved {
    fn deinterleave(&self, payload: &[u8], big_endian: bool) -> [Vec<i16>; NUMBER_OF_CHANNELS] {
        let group_bytes = INTERLEAVE_ORDER.len() * 2;
        let groups = payload.len() / group_bytes;
        let mut channels: [Vec<i16>; NUMBER_OF_CHANNELS] =
            std::array::from_fn(|_| Vec::with_capacity(groups * 2));
        for group in payload.chunks_exact(group_bytes) {
            for (pair, channel) in group.chunks_exact(2).zip(INTERLEAVE_ORDER) {
                let sample = if big_endian {
                    BigEndian::read_i16(pair)
                } else {
                    LittleEndian::read_i16(pair)
                };
                channels[channel].push(sample);
            }
        }
        channels
    }
}
