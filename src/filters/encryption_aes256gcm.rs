// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use std::sync::Arc;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::buffer::FilterBuffer;
use crate::error::{FilterError, Result};
use crate::filters::{
    Filter, FilterType, ForwardContext, ReverseContext,
};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Authenticated encryption with AES-256-GCM.
///
/// Every input part, metadata parts included, is encrypted independently
/// with a fresh random IV. The key is held by reference in the filter
/// instance and is never serialized.
///
/// The forward metadata is:
///   `u32 num_metadata_parts; u32 num_data_parts;`
///   then per part `u32 plaintext_len; u32 ciphertext_len;
///   u8[12] iv; u8[16] tag`.
/// The forward output data is the concatenated ciphertexts, metadata
/// parts first.
#[derive(Clone, Default)]
pub struct Aes256GcmFilter {
    key: Option<Arc<[u8; KEY_SIZE]>>,
}

impl std::fmt::Debug for Aes256GcmFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key must not leak into logs.
        f.debug_struct("Aes256GcmFilter")
            .field("key_set", &self.key.is_some())
            .finish()
    }
}

impl Aes256GcmFilter {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Aes256GcmFilter {
            key: Some(Arc::new(key)),
        }
    }

    pub fn set_key(&mut self, key: Arc<[u8; KEY_SIZE]>) {
        self.key = Some(key);
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self.key.as_ref().ok_or_else(|| {
            FilterError::InvalidArgument(
                "encryption key is not set on the AES-256-GCM filter"
                    .to_string(),
            )
        })?;
        Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| {
            FilterError::InvalidArgument(
                "AES-256-GCM requires a 32-byte key".to_string(),
            )
        })
    }
}

struct PartHeader {
    plaintext_len: u32,
    ciphertext_len: u32,
    iv: [u8; IV_SIZE],
    tag: [u8; TAG_SIZE],
}

impl Filter for Aes256GcmFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Aes256Gcm
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(self.clone())
    }

    fn run_forward<'a>(
        &self,
        _ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let cipher = self.cipher()?;

        let metadata_parts: Vec<Vec<u8>> =
            input_metadata.parts().iter().map(|p| p.to_vec()).collect();
        let data_parts: Vec<Vec<u8>> =
            input.parts().iter().map(|p| p.to_vec()).collect();

        let num_parts = metadata_parts.len() + data_parts.len();
        let entry_size = 8 + IV_SIZE + TAG_SIZE;
        output_metadata.prepend_buffer(8 + num_parts * entry_size)?;
        output_metadata.write_scalar(metadata_parts.len() as u32)?;
        output_metadata.write_scalar(data_parts.len() as u32)?;

        for part in metadata_parts.into_iter().chain(data_parts) {
            let header = encrypt_part(&cipher, part, output)?;
            output_metadata.write_scalar(header.plaintext_len)?;
            output_metadata.write_scalar(header.ciphertext_len)?;
            output_metadata.write(&header.iv)?;
            output_metadata.write(&header.tag)?;
        }

        Ok(())
    }

    fn run_reverse<'a>(
        &self,
        _ctx: &mut ReverseContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        let cipher = self.cipher()?;

        let num_metadata_parts: u32 = input_metadata.read_scalar()?;
        let num_data_parts: u32 = input_metadata.read_scalar()?;
        let total = u64::from(num_metadata_parts) + u64::from(num_data_parts);

        let mut headers = Vec::new();
        for _ in 0..total {
            let plaintext_len: u32 = input_metadata.read_scalar()?;
            let ciphertext_len: u32 = input_metadata.read_scalar()?;
            let mut iv = [0u8; IV_SIZE];
            input_metadata.read_exact(&mut iv)?;
            let mut tag = [0u8; TAG_SIZE];
            input_metadata.read_exact(&mut tag)?;
            headers.push(PartHeader {
                plaintext_len,
                ciphertext_len,
                iv,
                tag,
            });
        }

        let (metadata_headers, data_headers) =
            headers.split_at(num_metadata_parts as usize);

        let metadata_plain: usize =
            metadata_headers.iter().map(|h| h.plaintext_len as usize).sum();
        output_metadata.prepend_buffer(metadata_plain)?;
        for header in metadata_headers {
            let plain = decrypt_part(&cipher, header, input)?;
            output_metadata.write(&plain)?;
        }

        let data_plain: usize =
            data_headers.iter().map(|h| h.plaintext_len as usize).sum();
        output.prepend_buffer(data_plain)?;
        for header in data_headers {
            let plain = decrypt_part(&cipher, header, input)?;
            output.write(&plain)?;
        }

        Ok(())
    }
}

fn encrypt_part(
    cipher: &Aes256Gcm,
    mut part: Vec<u8>,
    output: &mut FilterBuffer<'_>,
) -> Result<PartHeader> {
    let plaintext_len = part.len() as u32;

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut part)
        .map_err(|_| {
            FilterError::codec("AES-256-GCM", "encryption failed")
        })?;

    let ciphertext_len = part.len() as u32;
    output.append_data(part)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(PartHeader {
        plaintext_len,
        ciphertext_len,
        iv,
        tag: tag_bytes,
    })
}

fn decrypt_part(
    cipher: &Aes256Gcm,
    header: &PartHeader,
    input: &mut FilterBuffer<'_>,
) -> Result<Vec<u8>> {
    let mut part = vec![0u8; header.ciphertext_len as usize];
    input.read_exact(&mut part)?;

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&header.iv),
            b"",
            &mut part,
            Tag::from_slice(&header.tag),
        )
        .map_err(|_| FilterError::AuthTagInvalid)?;

    if part.len() != header.plaintext_len as usize {
        return Err(FilterError::FormatCorrupt(
            "decrypted part length does not match its header".to_string(),
        ));
    }
    Ok(part)
}
