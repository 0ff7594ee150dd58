//! # Device streams
//! Saving and loading one paint device as a byte stream:
//!
//! ```text
//! magic "IMPT", version: u16, codec: u8, tile_size: u32, pixel_size: u32,
//! default_pixel[pixel_size], offset_x: i32, offset_y: i32, tile_count: u32,
//! tiles[tile_count]
//! ```
//!
//! Integers are little endian. Tiles are framed by the codec, see
//! [`crate::swap::TileCompressor::write_tile`]. Tiles holding only the default pixel are skipped.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use az::CheckedAs;

use crate::{
    config::CodecKind,
    device::{DeviceError, PaintDevice},
    swap::{codec_for, Swapper},
    tiles::TileError,
    util::Point,
};

const MAGIC: [u8; 4] = *b"IMPT";
const VERSION: u16 = 1;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not a device stream")]
    BadMagic,
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown codec tag {0}")]
    UnknownCodec(u8),
    #[error("{0} tiles don't fit a stream")]
    TooManyTiles(usize),
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

fn codec_tag(kind: CodecKind) -> u8 {
    match kind {
        CodecKind::Raw => 0,
        CodecKind::Rle => 1,
    }
}
fn codec_from_tag(tag: u8) -> Result<CodecKind, StreamError> {
    match tag {
        0 => Ok(CodecKind::Raw),
        1 => Ok(CodecKind::Rle),
        other => Err(StreamError::UnknownCodec(other)),
    }
}

pub fn write_device(device: &PaintDevice, codec: CodecKind, writer: &mut dyn Write) -> Result<(), StreamError> {
    let store = device.store();
    let default = device.default_pixel();
    let mut coords = Vec::new();
    for coord in store.coords() {
        if !store.read(coord)?.is_filled_with(&default) {
            coords.push(coord);
        }
    }
    let count: u32 = coords
        .len()
        .checked_as()
        .ok_or(StreamError::TooManyTiles(coords.len()))?;
    let pixel_size: u32 = default.len().checked_as().ok_or(DeviceError::Geometry("pixel too large"))?;
    let offset = device.offset();

    writer.write_all(&MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&[codec_tag(codec)])?;
    writer.write_all(&device.tile_size().to_le_bytes())?;
    writer.write_all(&pixel_size.to_le_bytes())?;
    writer.write_all(&default)?;
    writer.write_all(&offset.x.to_le_bytes())?;
    writer.write_all(&offset.y.to_le_bytes())?;
    writer.write_all(&count.to_le_bytes())?;

    let codec = codec_for(codec);
    for coord in coords {
        codec.write_tile(store, coord, writer)?;
    }
    log::debug!("wrote {count} tiles of {:?} with {} codec", device.id(), codec.name());
    Ok(())
}

fn read_array<const N: usize>(reader: &mut dyn Read) -> Result<[u8; N], StreamError> {
    let mut bytes = [0; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Read a device written by [`write_device`]. Its tiles are swapped through `swap`, if given.
pub fn read_device(reader: &mut dyn Read, swap: Option<Arc<Swapper>>) -> Result<PaintDevice, StreamError> {
    if read_array::<4>(reader)? != MAGIC {
        return Err(StreamError::BadMagic);
    }
    let version = u16::from_le_bytes(read_array(reader)?);
    if version != VERSION {
        return Err(StreamError::UnsupportedVersion(version));
    }
    let [tag] = read_array::<1>(reader)?;
    let codec = codec_for(codec_from_tag(tag)?);
    let tile_size = u32::from_le_bytes(read_array(reader)?);
    let pixel_size = u32::from_le_bytes(read_array(reader)?);
    if pixel_size == 0 || pixel_size > 64 {
        return Err(DeviceError::Geometry("pixel size out of range").into());
    }
    let mut default = vec![0; pixel_size as usize];
    reader.read_exact(&mut default)?;
    let offset = Point::new(
        i32::from_le_bytes(read_array(reader)?),
        i32::from_le_bytes(read_array(reader)?),
    );
    let count = u32::from_le_bytes(read_array(reader)?);

    let device = PaintDevice::new(tile_size, &default, swap)?;
    device.set_offset(offset);
    for _ in 0..count {
        codec.read_tile(reader, device.store())?;
    }
    log::debug!("read {count} tiles into {:?}", device.id());
    Ok(device)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::Rect;

    #[test]
    fn device_survives_stream() {
        let device = PaintDevice::new(16, &[1, 2, 3, 4], None).unwrap();
        device.set_offset(Point::new(-7, 3));
        device.fill_rect(Rect::new(0, 0, 40, 5), &[9, 9, 9, 9]).unwrap();
        device.write_pixel(-30, -30, &[5, 6, 7, 8]).unwrap();
        for codec in [CodecKind::Raw, CodecKind::Rle] {
            let mut bytes = Vec::new();
            write_device(&device, codec, &mut bytes).unwrap();
            assert_eq!(&bytes[..4], b"IMPT");
            let read = read_device(&mut bytes.as_slice(), None).unwrap();
            assert_eq!(read.content_hash().unwrap(), device.content_hash().unwrap());
            assert_eq!(read.pixel(-30, -30).unwrap().as_slice(), [5, 6, 7, 8]);
        }
    }
    #[test]
    fn default_tiles_are_skipped() {
        let device = PaintDevice::new(16, &[0], None).unwrap();
        device.fill_rect(Rect::new(0, 0, 16, 16), &[0]).unwrap();
        let mut bytes = Vec::new();
        write_device(&device, CodecKind::Raw, &mut bytes).unwrap();
        // Header only, no tiles.
        assert_eq!(bytes.len(), 4 + 2 + 1 + 4 + 4 + 1 + 4 + 4 + 4);
    }
    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            read_device(&mut b"PNG\0rest".as_slice(), None),
            Err(StreamError::BadMagic)
        ));
        let device = PaintDevice::new(16, &[0], None).unwrap();
        device.write_pixel(0, 0, &[1]).unwrap();
        let mut bytes = Vec::new();
        write_device(&device, CodecKind::Rle, &mut bytes).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            read_device(&mut bytes.as_slice(), None),
            Err(StreamError::Tile(_))
        ));
    }
    #[test]
    fn oversized_tiles_are_rejected() {
        let device = PaintDevice::new(16, &[0], None).unwrap();
        let mut bytes = Vec::new();
        write_device(&device, CodecKind::Raw, &mut bytes).unwrap();
        // Tile size follows magic, version and codec tag.
        for size in [1u32 << 31, 1 << 16, 4, 48] {
            bytes[7..11].copy_from_slice(&size.to_le_bytes());
            assert!(matches!(
                read_device(&mut bytes.as_slice(), None),
                Err(StreamError::Device(DeviceError::Geometry(_)))
            ));
        }
    }
}
