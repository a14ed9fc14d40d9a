// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use std::sync::Arc;

use crate::buffer::{Buffer, Scalar};
use crate::error::{FilterError, Result};

/// One stretch of contiguous bytes inside a `FilterBuffer`.
///
/// Owned segments are refcounted so that a downstream stage can hold a view
/// over them after the runner swaps buffers between stages. While any view
/// is alive the owning segment cannot be written (`Arc::get_mut` fails),
/// which is exactly the read-only window the pipeline requires.
enum Segment<'a> {
    Owned(Arc<Buffer>),
    OwnedView {
        data: Arc<Buffer>,
        start: usize,
        len: usize,
    },
    Slice(&'a [u8]),
}

impl<'a> Segment<'a> {
    fn content(&self) -> &[u8] {
        match self {
            Segment::Owned(buffer) => buffer.as_slice(),
            Segment::OwnedView { data, start, len } => {
                &data.as_slice()[*start..*start + *len]
            }
            Segment::Slice(slice) => slice,
        }
    }

    fn view_of(&self, start: usize, len: usize) -> Segment<'a> {
        match self {
            Segment::Owned(buffer) => Segment::OwnedView {
                data: Arc::clone(buffer),
                start,
                len,
            },
            Segment::OwnedView {
                data,
                start: base, ..
            } => Segment::OwnedView {
                data: Arc::clone(data),
                start: base + start,
                len,
            },
            Segment::Slice(slice) => Segment::Slice(&slice[start..start + len]),
        }
    }
}

/// An output region pinned to caller-owned memory of a fixed size. Used by
/// the reverse runner to make the last stage write straight into the plain
/// tile.
struct FixedAlloc<'a> {
    data: &'a mut [u8],
    size: usize,
}

/// A cursor-style view stitching multiple discontiguous segments into one
/// logical byte stream.
///
/// Filters receive their input and produce their output through this type.
/// `prepend_buffer` allocates a new owning segment at the logical front,
/// `append_view` aliases another buffer's bytes without copying, and
/// sequential reads and writes never return short while bytes remain in
/// aggregate.
#[derive(Default)]
pub struct FilterBuffer<'a> {
    segments: Vec<Segment<'a>>,
    offset: usize,
    read_only: bool,
    fixed: Option<FixedAlloc<'a>>,
}

impl<'a> FilterBuffer<'a> {
    pub fn new() -> Self {
        FilterBuffer::default()
    }

    /// A buffer whose single segment borrows the given bytes.
    pub fn from_slice(data: &'a [u8]) -> Self {
        FilterBuffer {
            segments: vec![Segment::Slice(data)],
            offset: 0,
            read_only: false,
            fixed: None,
        }
    }

    /// Pins all future output to the given slice. The buffer must be empty.
    pub fn set_fixed_allocation(&mut self, data: &'a mut [u8]) -> Result<()> {
        if !self.segments.is_empty() || self.fixed.is_some() {
            return Err(FilterError::BufferError(
                "fixed allocation requires an empty buffer".to_string(),
            ));
        }
        self.fixed = Some(FixedAlloc { data, size: 0 });
        Ok(())
    }

    pub fn size(&self) -> usize {
        match &self.fixed {
            Some(fixed) => fixed.size,
            None => self.segments.iter().map(|s| s.content().len()).sum(),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn reset_offset(&mut self) {
        self.offset = 0;
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn advance_offset(&mut self, nbytes: usize) {
        self.offset += nbytes;
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn clear(&mut self) -> Result<()> {
        if self.read_only {
            return Err(FilterError::BufferError(
                "cannot clear a read-only buffer".to_string(),
            ));
        }
        self.segments.clear();
        self.fixed = None;
        self.offset = 0;
        Ok(())
    }

    /// Inserts a new owning segment of exactly `nbytes` capacity at the
    /// logical front and rewinds the cursor to its start. With a fixed
    /// allocation set, the allocation itself backs the request.
    pub fn prepend_buffer(&mut self, nbytes: usize) -> Result<()> {
        self.ensure_writable()?;
        if let Some(fixed) = &self.fixed {
            if nbytes > fixed.data.len() {
                return Err(FilterError::BufferError(format!(
                    "prepend of {} bytes exceeds fixed allocation of {}",
                    nbytes,
                    fixed.data.len()
                )));
            }
            self.offset = 0;
            return Ok(());
        }
        self.segments
            .insert(0, Segment::Owned(Arc::new(Buffer::with_capacity(nbytes))));
        self.offset = 0;
        Ok(())
    }

    /// Appends an owning segment holding the given bytes at the logical end.
    pub fn append_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.ensure_writable()?;
        if let Some(fixed) = &mut self.fixed {
            return write_fixed(fixed, &mut self.offset, &data);
        }
        self.segments
            .push(Segment::Owned(Arc::new(Buffer::from_vec(data))));
        Ok(())
    }

    /// Appends a zero-copy view of every byte in `src`. With a fixed
    /// allocation set, this degrades to a copy into the allocation.
    pub fn append_view(&mut self, src: &FilterBuffer<'a>) -> Result<()> {
        self.append_view_range(src, 0, src.size())
    }

    /// Appends a zero-copy view over `src[start..start + len]` in logical
    /// byte coordinates.
    pub fn append_view_range(
        &mut self,
        src: &FilterBuffer<'a>,
        start: usize,
        len: usize,
    ) -> Result<()> {
        self.ensure_writable()?;
        if src.fixed.is_some() {
            return Err(FilterError::BufferError(
                "cannot take a view of a fixed-allocation buffer".to_string(),
            ));
        }
        if start + len > src.size() {
            return Err(FilterError::BufferError(format!(
                "view of {} bytes at {} exceeds source size {}",
                len,
                start,
                src.size()
            )));
        }
        let mut skip = start;
        let mut remaining = len;
        for segment in &src.segments {
            if remaining == 0 {
                break;
            }
            let content_len = segment.content().len();
            if skip >= content_len {
                skip -= content_len;
                continue;
            }
            let take = remaining.min(content_len - skip);
            if let Some(fixed) = &mut self.fixed {
                let bytes = &segment.content()[skip..skip + take];
                write_fixed(fixed, &mut self.offset, bytes)?;
            } else {
                self.segments.push(segment.view_of(skip, take));
            }
            skip = 0;
            remaining -= take;
        }
        Ok(())
    }

    /// Writes at the cursor. Outside fixed-allocation mode the write must
    /// land inside the owning head segment created by `prepend_buffer`.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if let Some(fixed) = &mut self.fixed {
            return write_fixed(fixed, &mut self.offset, bytes);
        }
        let offset = self.offset;
        let head = self.head_buffer_mut()?;
        head.write_at(offset, bytes)?;
        self.offset += bytes.len();
        Ok(())
    }

    pub fn write_scalar<T: Scalar>(&mut self, value: T) -> Result<()> {
        let mut raw = [0u8; 16];
        value.write_le(&mut raw[..T::SIZE]);
        self.write(&raw[..T::SIZE])
    }

    /// Copies `nbytes` from the cursor of `src` to the cursor of `self`,
    /// advancing both.
    pub fn copy_from(
        &mut self,
        src: &mut FilterBuffer<'a>,
        nbytes: usize,
    ) -> Result<()> {
        let mut staged = vec![0u8; nbytes];
        src.read_exact(&mut staged)?;
        self.write(&staged)
    }

    /// Reads exactly `out.len()` bytes at the cursor, spanning segment
    /// boundaries.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if let Some(fixed) = &self.fixed {
            let end = self.offset + out.len();
            if end > fixed.size {
                return Err(short_read(out.len(), self.offset, fixed.size));
            }
            out.copy_from_slice(&fixed.data[self.offset..end]);
            self.offset = end;
            return Ok(());
        }
        if self.offset + out.len() > self.size() {
            return Err(short_read(out.len(), self.offset, self.size()));
        }
        let mut skip = self.offset;
        let mut filled = 0;
        for segment in &self.segments {
            if filled == out.len() {
                break;
            }
            let content = segment.content();
            if skip >= content.len() {
                skip -= content.len();
                continue;
            }
            let take = (out.len() - filled).min(content.len() - skip);
            out[filled..filled + take]
                .copy_from_slice(&content[skip..skip + take]);
            filled += take;
            skip = 0;
        }
        self.offset += out.len();
        Ok(())
    }

    pub fn read_scalar<T: Scalar>(&mut self) -> Result<T> {
        let mut raw = [0u8; 16];
        self.read_exact(&mut raw[..T::SIZE])?;
        Ok(T::read_le(&raw[..T::SIZE]))
    }

    /// The contiguous byte runs making up this buffer, in logical order.
    pub fn parts(&self) -> Vec<&[u8]> {
        match &self.fixed {
            Some(fixed) => vec![&fixed.data[..fixed.size]],
            None => self.segments.iter().map(|s| s.content()).collect(),
        }
    }

    /// Mutable access to the head segment's full allocation, for codecs
    /// that fill a preallocated output in one call.
    pub fn head_alloc_mut(&mut self) -> Result<&mut [u8]> {
        if self.fixed.is_some() {
            return Ok(&mut *self.fixed.as_mut().unwrap().data);
        }
        Ok(self.head_buffer_mut()?.alloc_mut())
    }

    /// Pins the logical size of the head segment after writes through
    /// `head_alloc_mut`.
    pub fn set_head_size(&mut self, size: usize) -> Result<()> {
        if let Some(fixed) = &mut self.fixed {
            if size > fixed.data.len() {
                return Err(FilterError::BufferError(format!(
                    "size {} exceeds fixed allocation of {}",
                    size,
                    fixed.data.len()
                )));
            }
            fixed.size = fixed.size.max(size);
            return Ok(());
        }
        self.head_buffer_mut()?.set_size(size)
    }

    pub fn copy_to(&self, out: &mut [u8]) -> Result<()> {
        if out.len() != self.size() {
            return Err(FilterError::BufferError(format!(
                "copy of {} bytes into slice of {}",
                self.size(),
                out.len()
            )));
        }
        let mut filled = 0;
        for part in self.parts() {
            out[filled..filled + part.len()].copy_from_slice(part);
            filled += part.len();
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for part in self.parts() {
            out.extend_from_slice(part);
        }
        out
    }

    pub fn swap(&mut self, other: &mut FilterBuffer<'a>) {
        std::mem::swap(self, other);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(FilterError::BufferError(
                "buffer is read-only".to_string(),
            ));
        }
        Ok(())
    }

    fn head_buffer_mut(&mut self) -> Result<&mut Buffer> {
        let segment = self.segments.first_mut().ok_or_else(|| {
            FilterError::BufferError(
                "no owning head segment to write into".to_string(),
            )
        })?;
        let Segment::Owned(arc) = segment else {
            return Err(FilterError::BufferError(
                "head segment does not own its bytes".to_string(),
            ));
        };
        Arc::get_mut(arc).ok_or_else(|| {
            FilterError::BufferError(
                "head segment is aliased by a view and sealed".to_string(),
            )
        })
    }
}

fn write_fixed(
    fixed: &mut FixedAlloc<'_>,
    offset: &mut usize,
    bytes: &[u8],
) -> Result<()> {
    let end = *offset + bytes.len();
    if end > fixed.data.len() {
        return Err(FilterError::BufferError(format!(
            "write of {} bytes at {} exceeds fixed allocation of {}",
            bytes.len(),
            offset,
            fixed.data.len()
        )));
    }
    fixed.data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    fixed.size = fixed.size.max(end);
    Ok(())
}

fn short_read(len: usize, offset: usize, size: usize) -> FilterError {
    FilterError::BufferError(format!(
        "read of {} bytes at offset {} exceeds size {}",
        len, offset, size
    ))
}
