/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! VLQ (Variable-length quantity) encoding.
//!
//! Encodes unsigned integers using little-endian groups of 7 bits. The
//! most significant bit of every byte indicates whether another byte
//! follows. Signed integers are supported via zig-zag mapping.

use std::io::{self, Read, Write};

/// Write an integer using VLQ encoding.
pub trait VLQEncode<T> {
    /// Encode `value` and append the bytes to the writer.
    fn write_vlq(&mut self, value: T) -> io::Result<()>;
}

/// Read a VLQ encoded integer.
pub trait VLQDecode<T> {
    /// Decode an integer from the current stream position. The stream
    /// is advanced past the encoded bytes.
    fn read_vlq(&mut self) -> io::Result<T>;
}

/// Read a VLQ encoded integer at a given offset without a stream.
pub trait VLQDecodeAt<T> {
    /// Decode an integer starting at `offset`. Returns the value and
    /// the number of bytes consumed.
    fn read_vlq_at(&self, offset: usize) -> io::Result<(T, usize)>;
}

fn overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "vlq value overflows integer")
}

macro_rules! impl_unsigned {
    ($ty: ty) => {
        impl<W: Write + ?Sized> VLQEncode<$ty> for W {
            fn write_vlq(&mut self, value: $ty) -> io::Result<()> {
                let mut value = value;
                loop {
                    let byte = (value & 0x7f) as u8;
                    value >>= 7;
                    if value == 0 {
                        return self.write_all(&[byte]);
                    }
                    self.write_all(&[byte | 0x80])?;
                }
            }
        }

        impl<R: Read + ?Sized> VLQDecode<$ty> for R {
            fn read_vlq(&mut self) -> io::Result<$ty> {
                let mut value: $ty = 0;
                let mut shift = 0u32;
                loop {
                    let mut buf = [0u8; 1];
                    self.read_exact(&mut buf)?;
                    let byte = buf[0];
                    let part = (byte & 0x7f) as $ty;
                    if shift >= <$ty>::BITS || part.checked_shl(shift).is_none() {
                        return Err(overflow());
                    }
                    value |= part << shift;
                    if byte & 0x80 == 0 {
                        return Ok(value);
                    }
                    shift += 7;
                }
            }
        }

        impl VLQDecodeAt<$ty> for [u8] {
            fn read_vlq_at(&self, offset: usize) -> io::Result<($ty, usize)> {
                let mut cur = io::Cursor::new(self.get(offset..).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "vlq offset out of range")
                })?);
                let value = cur.read_vlq()?;
                Ok((value, cur.position() as usize))
            }
        }
    };
}

impl_unsigned!(u16);
impl_unsigned!(u32);
impl_unsigned!(u64);
impl_unsigned!(usize);

macro_rules! impl_signed {
    ($ty: ty, $uty: ty) => {
        impl<W: Write + ?Sized> VLQEncode<$ty> for W {
            fn write_vlq(&mut self, value: $ty) -> io::Result<()> {
                // Zig-zag: map the sign bit to the lowest bit so small
                // negative values stay short.
                let zigzag = ((value << 1) ^ (value >> (<$ty>::BITS - 1))) as $uty;
                self.write_vlq(zigzag)
            }
        }

        impl<R: Read + ?Sized> VLQDecode<$ty> for R {
            fn read_vlq(&mut self) -> io::Result<$ty> {
                let zigzag: $uty = self.read_vlq()?;
                Ok(((zigzag >> 1) as $ty) ^ -((zigzag & 1) as $ty))
            }
        }
    };
}

impl_signed!(i32, u32);
impl_signed!(i64, u64);
