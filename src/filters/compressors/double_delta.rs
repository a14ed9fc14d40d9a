// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::{push_scalar, ByteReader, IntScalar};
use crate::datatype::{integral_dispatch, DataType};
use crate::error::{FilterError, Result};
use crate::filters::compressors::Compressor;

/// Double-delta encoding: the second-order differences
/// `dd[i] = (x[i] - x[i-1]) - (x[i-1] - x[i-2])` are bit-packed at the
/// width of the largest magnitude observed, with one separate sign bit per
/// value.
///
/// Layout: `u8 bit_width; u64 count; T x[0]; T x[1]; packed values`.
/// A `bit_width` equal to the full element width is the sentinel for an
/// uncompressed stream: a difference was not representable in `int64`, or
/// packing would not shrink the data, and `x[2..]` follow verbatim.
#[derive(Default)]
pub struct DoubleDeltaCompressor;

/// `a - b` if it is representable as an `int64`.
///
/// The subtraction is first reduced to the non-negative case; the lone
/// irregular value is `-2^63`, which is representable even though its
/// magnitude is not.
pub fn checked_delta_u64(a: u64, b: u64) -> Option<i64> {
    if a >= b {
        let diff = a - b;
        if diff > i64::MAX as u64 {
            None
        } else {
            Some(diff as i64)
        }
    } else {
        let diff = b - a;
        if diff > i64::MAX as u64 {
            if diff == (i64::MAX as u64) + 1 {
                Some(i64::MIN)
            } else {
                None
            }
        } else {
            Some(-(diff as i64))
        }
    }
}

/// `a - b` if it is representable as an `int64`.
pub fn checked_delta_i64(a: i64, b: i64) -> Option<i64> {
    a.checked_sub(b)
}

/// `a - b` in `int64` for any supported element type. Widths below 64
/// bits can never overflow the result.
pub fn checked_delta<T: IntScalar>(a: T, b: T) -> Option<i64> {
    if T::BITS < 64 {
        return Some((a.to_i128() - b.to_i128()) as i64);
    }
    if T::SIGNED {
        checked_delta_i64(a.to_u64_lossy() as i64, b.to_u64_lossy() as i64)
    } else {
        checked_delta_u64(a.to_u64_lossy(), b.to_u64_lossy())
    }
}

impl Compressor for DoubleDeltaCompressor {
    fn compress(&self, datatype: DataType, input: &[u8]) -> Result<Vec<u8>> {
        integral_dispatch!(
            datatype,
            encode(input),
            Err(non_integral(datatype))
        )
    }

    fn decompress(
        &self,
        datatype: DataType,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<()> {
        integral_dispatch!(
            datatype,
            decode(input, output),
            Err(non_integral(datatype))
        )
    }
}

fn non_integral(datatype: DataType) -> FilterError {
    FilterError::codec(
        "double delta",
        format!("cannot reinterpret input as datatype {:?}", datatype),
    )
}

fn encode<T: IntScalar>(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() % T::SIZE != 0 {
        return Err(FilterError::codec(
            "double delta",
            format!(
                "input of {} bytes is not a multiple of element size {}",
                input.len(),
                T::SIZE
            ),
        ));
    }
    let values: Vec<T> =
        input.chunks_exact(T::SIZE).map(T::read_le).collect();
    let count = values.len() as u64;

    let mut output = Vec::new();
    if values.len() <= 2 {
        push_scalar(&mut output, 0u8);
        push_scalar(&mut output, count);
        for value in &values {
            push_scalar(&mut output, *value);
        }
        return Ok(output);
    }

    // Second-order differences, or the uncompressed fallback when one is
    // not representable.
    let mut diffs = Vec::with_capacity(values.len() - 2);
    let mut max_magnitude = 0u64;
    let mut representable = true;
    'diffing: for window in values.windows(3) {
        let head = checked_delta(window[1], window[0]);
        let tail = checked_delta(window[2], window[1]);
        let (Some(head), Some(tail)) = (head, tail) else {
            representable = false;
            break 'diffing;
        };
        let Some(diff) = tail.checked_sub(head) else {
            representable = false;
            break 'diffing;
        };
        max_magnitude = max_magnitude.max(diff.unsigned_abs());
        diffs.push(diff);
    }

    let bit_width = (64 - max_magnitude.leading_zeros()).max(1);
    if !representable || bit_width >= T::BITS {
        push_scalar(&mut output, T::BITS as u8);
        push_scalar(&mut output, count);
        push_scalar(&mut output, values[0]);
        push_scalar(&mut output, values[1]);
        output.extend_from_slice(&input[2 * T::SIZE..]);
        return Ok(output);
    }

    push_scalar(&mut output, bit_width as u8);
    push_scalar(&mut output, count);
    push_scalar(&mut output, values[0]);
    push_scalar(&mut output, values[1]);

    let mut writer = BitWriter::new(output);
    for diff in diffs {
        writer.push(u64::from(diff < 0), 1);
        writer.push(diff.unsigned_abs(), bit_width);
    }
    Ok(writer.finish())
}

fn decode<T: IntScalar>(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut reader = ByteReader::new(input);
    let bit_width = u32::from(reader.read::<u8>()?);
    let count = reader.read::<u64>()? as usize;

    if count.checked_mul(T::SIZE) != Some(output.len()) {
        return Err(FilterError::codec(
            "double delta",
            format!(
                "stream holds {} values, expected {} bytes",
                count,
                output.len()
            ),
        ));
    }
    if count == 0 {
        return Ok(());
    }

    let mut values: Vec<T> = Vec::with_capacity(count);
    values.push(reader.read::<T>()?);
    if count >= 2 {
        values.push(reader.read::<T>()?);
    }

    if count > 2 {
        if bit_width >= T::BITS {
            // Uncompressed fallback stream.
            for _ in 2..count {
                values.push(reader.read::<T>()?);
            }
        } else {
            let mut bits = BitReader::new(reader);
            for i in 2..count {
                let negative = bits.read(1)? == 1;
                let magnitude = bits.read(bit_width)? as i128;
                let diff = if negative { -magnitude } else { magnitude };
                let reconstructed = diff + 2 * values[i - 1].to_i128()
                    - values[i - 2].to_i128();
                values.push(T::from_i128(reconstructed));
            }
        }
    }

    for (slot, value) in output.chunks_exact_mut(T::SIZE).zip(values) {
        value.write_le(slot);
    }
    Ok(())
}

/// Packs values little-endian into whole 64-bit chunks.
struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    used: u32,
}

impl BitWriter {
    fn new(out: Vec<u8>) -> Self {
        BitWriter {
            out,
            acc: 0,
            used: 0,
        }
    }

    fn push(&mut self, value: u64, width: u32) {
        let value = if width == 64 {
            value
        } else {
            value & ((1u64 << width) - 1)
        };
        let available = 64 - self.used;
        if width <= available {
            self.acc |= value << self.used;
            self.used += width;
            if self.used == 64 {
                self.flush();
            }
        } else {
            self.acc |= value << self.used;
            self.flush();
            self.acc = value >> available;
            self.used = width - available;
        }
    }

    fn flush(&mut self) {
        self.out.extend_from_slice(&self.acc.to_le_bytes());
        self.acc = 0;
        self.used = 0;
    }

    fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.flush();
        }
        self.out
    }
}

struct BitReader<'a> {
    reader: ByteReader<'a>,
    acc: u64,
    left: u32,
}

impl<'a> BitReader<'a> {
    fn new(reader: ByteReader<'a>) -> Self {
        BitReader {
            reader,
            acc: 0,
            left: 0,
        }
    }

    fn read(&mut self, width: u32) -> Result<u64> {
        let mut value = 0u64;
        let mut got = 0u32;
        while got < width {
            if self.left == 0 {
                self.acc = self.reader.read::<u64>()?;
                self.left = 64;
            }
            let take = (width - got).min(self.left);
            let mask = if take == 64 {
                u64::MAX
            } else {
                (1u64 << take) - 1
            };
            value |= (self.acc & mask) << got;
            self.acc = if take == 64 { 0 } else { self.acc >> take };
            self.left -= take;
            got += take;
        }
        Ok(value)
    }
}
