// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::buffer::FilterBuffer;
use crate::error::{FilterError, Result};
use crate::filters::{
    Filter, FilterType, ForwardContext, ReverseContext,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    fn name(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha256 => "SHA256",
        }
    }

    fn digest_size(&self) -> usize {
        match self {
            Algorithm::Md5 => 16,
            Algorithm::Sha256 => 32,
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Algorithm::Md5 => Md5::digest(data).to_vec(),
            Algorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Data passes through untouched; a digest of every metadata part and
/// every data part is prepended to the metadata. Reverse recomputes and
/// compares, unless `sm.skip_checksum_validation` is set.
///
/// The forward metadata is:
///   `u32 num_metadata_checksums; u32 num_data_checksums;`
///   then per checksum `u64 length; u8[digest_size] digest`,
///   metadata checksums first, followed by the forwarded input metadata.
fn checksum_forward<'a>(
    algorithm: Algorithm,
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    let metadata_sums: Vec<(u64, Vec<u8>)> = input_metadata
        .parts()
        .iter()
        .map(|part| (part.len() as u64, algorithm.digest(part)))
        .collect();
    let data_sums: Vec<(u64, Vec<u8>)> = input
        .parts()
        .iter()
        .map(|part| (part.len() as u64, algorithm.digest(part)))
        .collect();

    output.append_view(input)?;

    let entry_size = 8 + algorithm.digest_size();
    let block_size = 8 + (metadata_sums.len() + data_sums.len()) * entry_size;
    output_metadata.append_view(input_metadata)?;
    output_metadata.prepend_buffer(block_size)?;
    output_metadata.write_scalar(metadata_sums.len() as u32)?;
    output_metadata.write_scalar(data_sums.len() as u32)?;
    for (length, digest) in metadata_sums.iter().chain(data_sums.iter()) {
        output_metadata.write_scalar(*length)?;
        output_metadata.write(digest)?;
    }

    Ok(())
}

fn checksum_reverse<'a>(
    algorithm: Algorithm,
    ctx: &ReverseContext<'_>,
    input_metadata: &mut FilterBuffer<'a>,
    input: &mut FilterBuffer<'a>,
    output_metadata: &mut FilterBuffer<'a>,
    output: &mut FilterBuffer<'a>,
) -> Result<()> {
    let num_metadata_sums: u32 = input_metadata.read_scalar()?;
    let num_data_sums: u32 = input_metadata.read_scalar()?;

    let total_sums = u64::from(num_metadata_sums) + u64::from(num_data_sums);
    let mut sums = Vec::new();
    for _ in 0..total_sums {
        let length: u64 = input_metadata.read_scalar()?;
        let mut digest = vec![0u8; algorithm.digest_size()];
        input_metadata.read_exact(&mut digest)?;
        sums.push((length, digest));
    }

    // Everything after the checksum block is the predecessor's metadata,
    // which is what the recorded metadata digests cover.
    let block_end = input_metadata.offset();

    if !ctx.config.skip_checksum_validation() {
        let (metadata_sums, data_sums) =
            sums.split_at(num_metadata_sums as usize);
        for (length, digest) in metadata_sums {
            compare_part(algorithm, input_metadata, *length, digest)?;
        }
        input.reset_offset();
        for (length, digest) in data_sums {
            compare_part(algorithm, input, *length, digest)?;
        }
        input.reset_offset();
    }

    output.append_view(input)?;
    output_metadata.append_view_range(
        input_metadata,
        block_end,
        input_metadata.size() - block_end,
    )?;
    Ok(())
}

fn compare_part(
    algorithm: Algorithm,
    source: &mut FilterBuffer<'_>,
    length: u64,
    expected: &[u8],
) -> Result<()> {
    let mut bytes = vec![0u8; length as usize];
    source.read_exact(&mut bytes)?;
    if algorithm.digest(&bytes) != expected {
        return Err(FilterError::ChecksumMismatch {
            algorithm: algorithm.name(),
        });
    }
    Ok(())
}

macro_rules! checksum_filter {
    ($name:ident, $algorithm:expr, $ftype:expr) => {
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl Filter for $name {
            fn filter_type(&self) -> FilterType {
                $ftype
            }

            fn clone_dyn(&self) -> Box<dyn Filter> {
                Box::new(*self)
            }

            fn run_forward<'a>(
                &self,
                _ctx: &mut ForwardContext<'_>,
                input_metadata: &mut FilterBuffer<'a>,
                input: &mut FilterBuffer<'a>,
                output_metadata: &mut FilterBuffer<'a>,
                output: &mut FilterBuffer<'a>,
            ) -> Result<()> {
                checksum_forward(
                    $algorithm,
                    input_metadata,
                    input,
                    output_metadata,
                    output,
                )
            }

            fn run_reverse<'a>(
                &self,
                ctx: &mut ReverseContext<'_>,
                input_metadata: &mut FilterBuffer<'a>,
                input: &mut FilterBuffer<'a>,
                output_metadata: &mut FilterBuffer<'a>,
                output: &mut FilterBuffer<'a>,
            ) -> Result<()> {
                checksum_reverse(
                    $algorithm,
                    ctx,
                    input_metadata,
                    input,
                    output_metadata,
                    output,
                )
            }
        }
    };
}

checksum_filter!(ChecksumMd5Filter, Algorithm::Md5, FilterType::ChecksumMD5);
checksum_filter!(
    ChecksumSha256Filter,
    Algorithm::Sha256,
    FilterType::ChecksumSHA256
);
