//! Fixed header preceding pixel data on every binary channel

use bytes::{Buf, BufMut, BytesMut};

use crate::core::{Error, Result};

pub const MAX_AXES: usize = 5;

pub const DATA_BYTE: i16 = 8;
pub const DATA_SHORT: i16 = 16;
pub const DATA_LONG: i16 = 32;
pub const DATA_LONGLONG: i16 = 64;
pub const DATA_FLOAT: i16 = -32;
pub const DATA_DOUBLE: i16 = -64;
pub const DATA_SBYTE: i16 = 10;
pub const DATA_USHORT: i16 = 20;
pub const DATA_ULONG: i16 = 40;

pub const SHUTTER_OPEN: u16 = 0x01;
pub const SHUTTER_CLOSED: u16 = 0x02;
pub const SHUTTER_SYNCHRO: u16 = 0x03;

/// Bytes per pixel of a data type code
pub fn pixel_size(data_type: i16) -> Option<usize> {
    match data_type {
        DATA_BYTE | DATA_SBYTE => Some(1),
        DATA_SHORT | DATA_USHORT => Some(2),
        DATA_LONG | DATA_ULONG | DATA_FLOAT => Some(4),
        DATA_LONGLONG | DATA_DOUBLE => Some(8),
        _ => None,
    }
}

/// Image header, encoded big-endian
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    pub data_type: i16,
    /// Number of used entries in `sizes` and `binnings`
    pub naxes: u16,
    pub sizes: [u32; MAX_AXES],
    pub binnings: [u16; MAX_AXES],
    pub filter: u16,
    pub shutter: u16,
    /// Readout window origin in detector coordinates
    pub x: u16,
    pub y: u16,
    /// Sub-exposure length in seconds
    pub subexp: f64,
    /// Number of accumulations
    pub nacc: u16,
    pub channel: u16,
}

impl ImageHeader {
    pub const LEN: usize = 54;

    /// Two dimensional image with unit binning
    pub fn new_2d(data_type: i16, width: u32, height: u32) -> Self {
        ImageHeader {
            data_type,
            naxes: 2,
            sizes: [width, height, 0, 0, 0],
            binnings: [1, 1, 0, 0, 0],
            filter: 0,
            shutter: SHUTTER_OPEN,
            x: 0,
            y: 0,
            subexp: 0.0,
            nacc: 1,
            channel: 0,
        }
    }

    /// Pixel bytes following the header
    pub fn data_len(&self) -> Result<usize> {
        let pixel = pixel_size(self.data_type)
            .ok_or_else(|| Error::protocol(format!("Unknown data type {}", self.data_type)))?;
        let axes = usize::from(self.naxes);
        if axes > MAX_AXES {
            return Err(Error::protocol(format!("Too many axes: {}", axes)));
        }
        Ok(self.sizes[..axes]
            .iter()
            .fold(pixel, |acc, &size| acc * size as usize))
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(Self::LEN);
        dst.put_i16(self.data_type);
        dst.put_u16(self.naxes);
        for size in self.sizes {
            dst.put_u32(size);
        }
        for binning in self.binnings {
            dst.put_u16(binning);
        }
        dst.put_u16(self.filter);
        dst.put_u16(self.shutter);
        dst.put_u16(self.x);
        dst.put_u16(self.y);
        dst.put_f64(self.subexp);
        dst.put_u16(self.nacc);
        dst.put_u16(self.channel);
    }

    pub fn decode<B: Buf>(src: &mut B) -> Result<Self> {
        if src.remaining() < Self::LEN {
            return Err(Error::protocol(format!(
                "Image header needs {} bytes, got {}",
                Self::LEN,
                src.remaining()
            )));
        }
        let data_type = src.get_i16();
        let naxes = src.get_u16();
        let mut sizes = [0u32; MAX_AXES];
        for size in sizes.iter_mut() {
            *size = src.get_u32();
        }
        let mut binnings = [0u16; MAX_AXES];
        for binning in binnings.iter_mut() {
            *binning = src.get_u16();
        }
        Ok(ImageHeader {
            data_type,
            naxes,
            sizes,
            binnings,
            filter: src.get_u16(),
            shutter: src.get_u16(),
            x: src.get_u16(),
            y: src.get_u16(),
            subexp: src.get_f64(),
            nacc: src.get_u16(),
            channel: src.get_u16(),
        })
    }
}
