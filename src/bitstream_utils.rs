// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use bytes::Buf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

/// A bit reader for MPEG-2 video bitstreams. The stream carries no
/// emulation-prevention bytes, so this is a plain MSB-first cursor over a
/// caller-owned unit.
///
/// Every read past the end of the data is a hard error, never a silent
/// truncation.
#[derive(Clone)]
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_byte.
    curr_byte: u8,
    /// Number of bits remaining in `curr_byte`.
    num_remaining_bits_in_curr_byte: usize,
    /// How many bits have been read so far.
    position: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            position: 0,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? != 0)
    }

    /// Read up to 32 bits from the stream, MSB first.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= (self.curr_byte as u64) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.move_to_next_byte()?;
        }

        out |= (self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left)) as u64;
        out &= (1u64 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.position += num_bits as u64;

        U::try_from(out as u32).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Read up to 32 bits without advancing the read position.
    pub fn peek_bits<U: TryFrom<u32>>(&self, num_bits: usize) -> Result<U, ReadBitsError> {
        self.clone().read_bits(num_bits)
    }

    /// Read one bit and compare it against the `expected` marker value.
    ///
    /// Used both for ISO marker bits that are mandated to be 1 and for
    /// reserved bits that are mandated to be 0.
    pub fn read_marker(&mut self, expected: bool) -> Result<bool, ReadBitsError> {
        Ok(self.read_bit()? == expected)
    }

    /// Compare the next bit against `expected` without advancing.
    pub fn peek_marker(&self, expected: bool) -> Result<bool, ReadBitsError> {
        Ok(self.peek_bits::<u32>(1)? == u32::from(expected))
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Skip a whole byte, e.g. the unit type byte or an extra-information
    /// byte announced by an escape flag.
    pub fn skip_byte(&mut self) -> Result<(), ReadBitsError> {
        self.skip_bits(8)
    }

    /// Returns the amount of bits left in the stream.
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Return the position of this bitstream in bits.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn move_to_next_byte(&mut self) -> Result<(), GetByteError> {
        let mut buf = [0u8; 1];
        self.data.read_exact(&mut buf).map_err(|_| GetByteError::OutOfBits)?;

        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = buf[0];
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// An MSB-first bit writer, the mirror of [`BitReader`]. Mostly useful to
/// synthesize units in tests.
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { out: writer, curr_byte: 0, nth_bit: 0 }
    }

    /// Writes a fixed-width integer (up to 32 bits), MSB first.
    pub fn write_bits<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u32 << bit;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputted to [`std::io::Write`].
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`], padding the
    /// last byte with zero bits.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bits_msb_first() {
        const DATA: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = BitReader::new(&DATA);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.position(), 42);
    }

    #[test]
    fn read_32_bits() {
        const DATA: [u8; 5] = [0xde, 0xad, 0xbe, 0xef, 0x80];

        let mut reader = BitReader::new(&DATA);
        assert_eq!(reader.read_bits::<u32>(32).unwrap(), 0xdeadbeef);
        assert!(reader.read_bit().unwrap());

        let mut reader = BitReader::new(&DATA);
        assert!(matches!(
            reader.read_bits::<u32>(33),
            Err(ReadBitsError::TooManyBitsRequested(33))
        ));
    }

    #[test]
    fn peek_does_not_advance() {
        const DATA: [u8; 2] = [0xb3, 0x51];

        let mut reader = BitReader::new(&DATA);
        assert_eq!(reader.peek_bits::<u32>(8).unwrap(), 0xb3);
        assert_eq!(reader.peek_bits::<u32>(8).unwrap(), 0xb3);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.num_bits_left(), 16);

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xb3);
        assert_eq!(reader.peek_bits::<u32>(8).unwrap(), 0x51);
        assert_eq!(reader.position(), 8);
    }

    #[test]
    fn markers() {
        const DATA: [u8; 1] = [0b1011_0000];

        let mut reader = BitReader::new(&DATA);
        assert!(reader.peek_marker(true).unwrap());
        assert!(!reader.peek_marker(false).unwrap());
        assert!(reader.read_marker(true).unwrap());
        assert!(reader.read_marker(false).unwrap());
        assert!(reader.read_marker(true).unwrap());
        assert!(!reader.read_marker(false).unwrap());
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn skip_bits_and_bytes() {
        const DATA: [u8; 3] = [0x00, 0x00, 0x2a];

        let mut reader = BitReader::new(&DATA);
        reader.skip_byte().unwrap();
        reader.skip_bits(8).unwrap();
        assert_eq!(reader.position(), 16);
        assert_eq!(reader.read_bits::<u8>(8).unwrap(), 0x2a);
    }

    #[test]
    fn out_of_bounds_read_fails() {
        const DATA: [u8; 1] = [0xff];

        let mut reader = BitReader::new(&DATA);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xff);
        assert!(matches!(
            reader.read_bits::<u32>(1),
            Err(ReadBitsError::GetByte(GetByteError::OutOfBits))
        ));

        let reader = BitReader::new(&DATA);
        assert!(matches!(
            reader.peek_bits::<u32>(9),
            Err(ReadBitsError::GetByte(GetByteError::OutOfBits))
        ));
        // A failed peek leaves the reader usable.
        assert_eq!(reader.peek_bits::<u32>(8).unwrap(), 0xff);
    }

    #[test]
    fn write_bits_3() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_bits(3, 0b100u8).unwrap();
            writer.write_bits(3, 0b101u8).unwrap();
            writer.write_bits(3, 0b011u8).unwrap();
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);
    }

    #[test]
    fn writer_reader_round_trip() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_bits(12, 1920u16).unwrap();
            writer.write_bits(12, 1080u16).unwrap();
            writer.write_bit(true).unwrap();
        }

        let mut reader = BitReader::new(&buf);
        assert_eq!(reader.read_bits::<u16>(12).unwrap(), 1920);
        assert_eq!(reader.read_bits::<u16>(12).unwrap(), 1080);
        assert!(reader.read_bit().unwrap());
    }
}
