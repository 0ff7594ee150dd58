use std::io::{Read, Write};

use az::CheckedAs;

use super::{SwapError, CHECKSUM};
use crate::tiles::{TileCoord, TileData, TileError, TileStore};

/// Turns tile payloads into bytes and back.
///
/// Implementors supply the three payload operations. The provided [`TileCompressor::write_tile`] and
/// [`TileCompressor::read_tile`] frame a payload for streams as
/// `col: i32, row: i32, len: u32, payload[len], crc32: u32`, all little endian.
pub trait TileCompressor: Send + Sync {
    fn name(&self) -> &'static str;
    /// Upper bound of the compressed size of `data`.
    fn tile_data_buffer_size(&self, data: &TileData) -> usize;
    /// Compress into `buffer`, which holds at least [`TileCompressor::tile_data_buffer_size`] bytes.
    /// Returns the bytes used.
    fn compress_tile_data(&self, data: &TileData, buffer: &mut [u8]) -> Result<usize, SwapError>;
    /// Decompress into `data`, whose geometry must match what was compressed.
    fn decompress_tile_data(&self, buffer: &[u8], data: &mut TileData) -> Result<(), SwapError>;

    fn write_tile(&self, store: &TileStore, coord: TileCoord, writer: &mut dyn Write) -> Result<(), TileError> {
        let data = store.read(coord)?;
        let mut buffer = vec![0; self.tile_data_buffer_size(&data)];
        let len = self.compress_tile_data(&data, &mut buffer)?;
        let payload = &buffer[..len];
        let len_u32: u32 = len.checked_as().ok_or(SwapError::TooLarge(len))?;

        let mut header = [0u8; 12];
        header[0..4].copy_from_slice(&coord.col.to_le_bytes());
        header[4..8].copy_from_slice(&coord.row.to_le_bytes());
        header[8..12].copy_from_slice(&len_u32.to_le_bytes());
        writer.write_all(&header).map_err(SwapError::from)?;
        writer.write_all(payload).map_err(SwapError::from)?;
        writer
            .write_all(&CHECKSUM.checksum(payload).to_le_bytes())
            .map_err(SwapError::from)?;
        Ok(())
    }
    /// Read one framed tile and write it into `store`, returning where it went.
    fn read_tile(&self, reader: &mut dyn Read, store: &TileStore) -> Result<TileCoord, TileError> {
        let mut header = [0u8; 12];
        reader.read_exact(&mut header).map_err(SwapError::from)?;
        let field = |at: usize| [header[at], header[at + 1], header[at + 2], header[at + 3]];
        let coord = TileCoord::new(i32::from_le_bytes(field(0)), i32::from_le_bytes(field(4)));
        let len = u32::from_le_bytes(field(8)) as usize;

        let mut data = TileData::zeroed(store.tile_size(), store.pixel_size());
        if len > self.tile_data_buffer_size(&data) {
            return Err(SwapError::Malformed("tile payload longer than any valid encoding").into());
        }
        let mut payload = vec![0; len];
        reader.read_exact(&mut payload).map_err(SwapError::from)?;
        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum).map_err(SwapError::from)?;
        let stored = u32::from_le_bytes(checksum);
        let read = CHECKSUM.checksum(&payload);
        if stored != read {
            return Err(SwapError::Checksum { stored, read }.into());
        }

        self.decompress_tile_data(&payload, &mut data)?;
        store.write(coord)?.bytes_mut().copy_from_slice(data.bytes());
        Ok(coord)
    }
}

/// Stores payload bytes verbatim.
#[derive(Copy, Clone, Debug, Default)]
pub struct RawCodec;
impl TileCompressor for RawCodec {
    fn name(&self) -> &'static str {
        "raw"
    }
    fn tile_data_buffer_size(&self, data: &TileData) -> usize {
        data.bytes().len()
    }
    fn compress_tile_data(&self, data: &TileData, buffer: &mut [u8]) -> Result<usize, SwapError> {
        let bytes = data.bytes();
        buffer
            .get_mut(..bytes.len())
            .ok_or(SwapError::TooLarge(bytes.len()))?
            .copy_from_slice(bytes);
        Ok(bytes.len())
    }
    fn decompress_tile_data(&self, buffer: &[u8], data: &mut TileData) -> Result<(), SwapError> {
        if buffer.len() != data.bytes().len() {
            return Err(SwapError::Malformed("raw payload length mismatch"));
        }
        data.bytes_mut().copy_from_slice(buffer);
        Ok(())
    }
}

/// Run length encoding over channel planes.
///
/// Pixels are first split into one plane per channel (all first bytes, then all second bytes...),
/// which turns flat regions of color into long runs, then packed with PackBits. A leading method
/// byte records whether the packing helped; if not, raw bytes follow instead.
#[derive(Copy, Clone, Debug, Default)]
pub struct RleCodec;
impl RleCodec {
    const METHOD_RAW: u8 = 0;
    const METHOD_PACKED: u8 = 1;
}
impl TileCompressor for RleCodec {
    fn name(&self) -> &'static str {
        "rle"
    }
    fn tile_data_buffer_size(&self, data: &TileData) -> usize {
        data.bytes().len() + 1
    }
    fn compress_tile_data(&self, data: &TileData, buffer: &mut [u8]) -> Result<usize, SwapError> {
        let raw = data.bytes();
        if buffer.len() < raw.len() + 1 {
            return Err(SwapError::TooLarge(raw.len() + 1));
        }
        let planar = linearize(raw, data.pixel_size());
        let mut packed = Vec::with_capacity(raw.len() / 4);
        pack_bits(&planar, &mut packed);
        if packed.len() < raw.len() {
            buffer[0] = Self::METHOD_PACKED;
            buffer[1..=packed.len()].copy_from_slice(&packed);
            Ok(packed.len() + 1)
        } else {
            buffer[0] = Self::METHOD_RAW;
            buffer[1..=raw.len()].copy_from_slice(raw);
            Ok(raw.len() + 1)
        }
    }
    fn decompress_tile_data(&self, buffer: &[u8], data: &mut TileData) -> Result<(), SwapError> {
        let Some((&method, body)) = buffer.split_first() else {
            return Err(SwapError::Malformed("empty payload"));
        };
        match method {
            Self::METHOD_RAW => {
                if body.len() != data.bytes().len() {
                    return Err(SwapError::Malformed("raw payload length mismatch"));
                }
                data.bytes_mut().copy_from_slice(body);
            }
            Self::METHOD_PACKED => {
                let mut planar = Vec::with_capacity(data.bytes().len());
                unpack_bits(body, &mut planar, data.bytes().len())?;
                if planar.len() != data.bytes().len() {
                    return Err(SwapError::Malformed("packed payload too short"));
                }
                let pixel_size = data.pixel_size();
                delinearize(&planar, data.bytes_mut(), pixel_size);
            }
            _ => return Err(SwapError::Malformed("unknown compression method")),
        }
        Ok(())
    }
}

/// Interleaved pixels to channel planes.
fn linearize(interleaved: &[u8], pixel_size: usize) -> Vec<u8> {
    let pixels = interleaved.len() / pixel_size;
    let mut planar = vec![0; interleaved.len()];
    for (idx, pixel) in interleaved.chunks_exact(pixel_size).enumerate() {
        for (channel, &byte) in pixel.iter().enumerate() {
            planar[channel * pixels + idx] = byte;
        }
    }
    planar
}
fn delinearize(planar: &[u8], interleaved: &mut [u8], pixel_size: usize) {
    let pixels = planar.len() / pixel_size;
    for (idx, pixel) in interleaved.chunks_exact_mut(pixel_size).enumerate() {
        for (channel, byte) in pixel.iter_mut().enumerate() {
            *byte = planar[channel * pixels + idx];
        }
    }
}

/// PackBits: header `n` in `0..=127` is followed by `n + 1` literal bytes,
/// header `-1..=-127` (as i8) by one byte repeated `1 - n` times.
fn pack_bits(input: &[u8], out: &mut Vec<u8>) {
    let mut idx = 0;
    while idx < input.len() {
        let byte = input[idx];
        let run = input[idx..]
            .iter()
            .take(128)
            .take_while(|&&other| other == byte)
            .count();
        if run >= 2 {
            out.push((1 - run as i16) as i8 as u8);
            out.push(byte);
            idx += run;
            continue;
        }
        let start = idx;
        idx += 1;
        while idx < input.len() && idx - start < 128 {
            if idx + 1 < input.len() && input[idx] == input[idx + 1] {
                break;
            }
            idx += 1;
        }
        out.push((idx - start - 1) as u8);
        out.extend_from_slice(&input[start..idx]);
    }
}
fn unpack_bits(mut input: &[u8], out: &mut Vec<u8>, limit: usize) -> Result<(), SwapError> {
    while let Some((&header, rest)) = input.split_first() {
        let header = header as i8;
        input = rest;
        if header >= 0 {
            let count = header as usize + 1;
            let literal = input
                .get(..count)
                .ok_or(SwapError::Malformed("literal run past end"))?;
            out.extend_from_slice(literal);
            input = &input[count..];
        } else if header != i8::MIN {
            let count = (1 - i16::from(header)) as usize;
            let (&byte, rest) = input
                .split_first()
                .ok_or(SwapError::Malformed("repeat run past end"))?;
            out.resize(out.len() + count, byte);
            input = rest;
        }
        if out.len() > limit {
            return Err(SwapError::Malformed("packed payload too long"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_tile() -> TileData {
        let mut data = TileData::filled(64, &[0, 0, 0, 0xFF]);
        data.pixel_mut(10, 10).copy_from_slice(&[0xFF, 0, 0, 0xFF]);
        for x in 20..40 {
            data.pixel_mut(x, 3).copy_from_slice(&[x as u8, 7, 200, 0xFF]);
        }
        data
    }
    fn round_trip(codec: &dyn TileCompressor, data: &TileData) -> usize {
        let mut buffer = vec![0; codec.tile_data_buffer_size(data)];
        let len = codec.compress_tile_data(data, &mut buffer).unwrap();
        let mut out = TileData::zeroed(data.tile_size(), data.pixel_size());
        codec.decompress_tile_data(&buffer[..len], &mut out).unwrap();
        assert_eq!(&out, data);
        len
    }

    #[test]
    fn rle_compresses_flat_tiles() {
        let data = sample_tile();
        let len = round_trip(&RleCodec, &data);
        assert!(len < data.bytes().len() / 10, "{len} bytes");
    }
    #[test]
    fn rle_falls_back_to_raw() {
        // No two neighbouring bytes are equal in any plane.
        let mut data = TileData::zeroed(16, 1);
        for (idx, byte) in data.bytes_mut().iter_mut().enumerate() {
            *byte = (idx * 7 % 251) as u8;
        }
        let len = round_trip(&RleCodec, &data);
        assert_eq!(len, data.bytes().len() + 1);
    }
    #[test]
    fn raw_round_trip() {
        let data = sample_tile();
        assert_eq!(round_trip(&RawCodec, &data), data.bytes().len());
    }
    #[test]
    fn pack_bits_long_runs() {
        let input: Vec<u8> = std::iter::repeat(5).take(300).chain([1, 2, 3]).collect();
        let mut packed = Vec::new();
        pack_bits(&input, &mut packed);
        let mut unpacked = Vec::new();
        unpack_bits(&packed, &mut unpacked, input.len()).unwrap();
        assert_eq!(unpacked, input);
    }
    #[test]
    fn truncated_input_is_malformed() {
        let mut unpacked = Vec::new();
        assert!(matches!(
            unpack_bits(&[5, 1, 2], &mut unpacked, 64),
            Err(SwapError::Malformed(_))
        ));
    }
    #[test]
    fn framed_tile_round_trip() {
        let source = TileStore::new(64, &[0; 4], None);
        let coord = TileCoord::new(-2, 7);
        source.write(coord).unwrap().pixel_mut(10, 10).copy_from_slice(&[0xFF, 0, 0, 0xFF]);

        let mut stream = Vec::new();
        RleCodec.write_tile(&source, coord, &mut stream).unwrap();

        let target = TileStore::new(64, &[0; 4], None);
        let read = RleCodec.read_tile(&mut stream.as_slice(), &target).unwrap();
        assert_eq!(read, coord);
        assert_eq!(target.read(coord).unwrap().pixel(10, 10), &[0xFF, 0, 0, 0xFF]);
    }
    #[test]
    fn framed_tile_checksum() {
        let source = TileStore::new(8, &[3], None);
        let coord = TileCoord::new(0, 0);
        source.write(coord).unwrap().fill(&[9]);
        let mut stream = Vec::new();
        RawCodec.write_tile(&source, coord, &mut stream).unwrap();
        // Flip a payload byte.
        stream[12] ^= 0xFF;
        let target = TileStore::new(8, &[3], None);
        assert!(matches!(
            RawCodec.read_tile(&mut stream.as_slice(), &target),
            Err(TileError::Swap(SwapError::Checksum { .. }))
        ));
    }
}
