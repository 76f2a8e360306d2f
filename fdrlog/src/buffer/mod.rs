//! # Buffer Pipeline
//!
//! Accumulates entry bytes produced by polled sources, compresses the
//! accumulated region into one LZ4 frame once the flush threshold is
//! reached, optionally seals the frame, and hands the finished block to
//! a sink (the frontend, in production).
//!
//! Sources write payload bytes straight into the buffer's spare region,
//! so the hot path is free of intermediate copies: reserve, fill,
//! commit.


use std::io::{self, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::SealContext;
use crate::format::{put_entry, ENTRY_HEADER_LEN, ENTRY_ID_AES, ENTRY_ID_LZ4};

/// Receiver of finished compressed (and possibly sealed) blocks.
pub trait BlockSink {
  fn write_block(&mut self, id: u32, payload: &[u8]) -> io::Result<()>;
}

impl BlockSink for Vec<(u32, Vec<u8>)> {
  fn write_block(&mut self, id: u32, payload: &[u8]) -> io::Result<()> {
    self.push((id, payload.to_vec()));
    Ok(())
  }
}

pub struct LogBuffer {
  data: Vec<u8>,
  used: usize,
  flush_threshold: usize,
  entry_space: usize,
  seal: Option<SealContext>,
}

impl LogBuffer {
  /// `flush_threshold` bounds how much uncompressed data accumulates
  /// before a flush; `entry_space` is the contiguous region guaranteed
  /// to a single `read_data` call.
  pub fn new(flush_threshold: usize, entry_space: usize) -> Self {
    Self {
      data: vec![0; flush_threshold + entry_space + ENTRY_HEADER_LEN],
      used: 0,
      flush_threshold,
      entry_space,
      seal: None,
    }
  }

  pub fn used(&self) -> usize {
    self.used
  }

  pub fn is_empty(&self) -> bool {
    self.used == 0
  }

  pub fn entry_space(&self) -> usize {
    self.entry_space
  }

  /// Spare payload region for the next entry. A source writes its
  /// bytes here, then the caller commits with [`commit_entry`].
  /// Guaranteed to be at least `entry_space` bytes.
  ///
  /// [`commit_entry`]: LogBuffer::commit_entry
  pub fn entry_payload_space(&mut self) -> &mut [u8] {
    let need = self.used + ENTRY_HEADER_LEN + self.entry_space;
    if self.data.len() < need {
      self.data.resize(need, 0);
    }
    &mut self.data[self.used + ENTRY_HEADER_LEN..need]
  }

  /// Commit `len` payload bytes previously produced in
  /// [`entry_payload_space`], framing them with an entry header.
  ///
  /// [`entry_payload_space`]: LogBuffer::entry_payload_space
  pub fn commit_entry(&mut self, id: u32, len: usize) {
    debug_assert!(len <= self.entry_space);
    LittleEndian::write_u32(&mut self.data[self.used..self.used + 4], id);
    LittleEndian::write_u32(&mut self.data[self.used + 4..self.used + 8], len as u32);
    self.used += ENTRY_HEADER_LEN + len;
  }

  /// Append an already-framed payload (descriptor records and other
  /// entries built outside the buffer).
  pub fn append_entry(&mut self, id: u32, payload: &[u8]) {
    let need = self.used + ENTRY_HEADER_LEN + payload.len();
    if self.data.len() < need {
      self.data.resize(need, 0);
    }
    LittleEndian::write_u32(&mut self.data[self.used..self.used + 4], id);
    LittleEndian::write_u32(&mut self.data[self.used + 4..self.used + 8], payload.len() as u32);
    self.data[self.used + ENTRY_HEADER_LEN..need].copy_from_slice(payload);
    self.used = need;
  }

  pub fn should_flush(&self) -> bool {
    self.used >= self.flush_threshold
  }

  /// Install the per-file seal. Cleared again by [`reset`].
  ///
  /// [`reset`]: LogBuffer::reset
  pub fn set_seal(&mut self, seal: SealContext) {
    self.seal = Some(seal);
  }

  pub fn is_sealed(&self) -> bool {
    self.seal.is_some()
  }

  /// Compress everything accumulated so far into a single LZ4 frame
  /// (level 1, content checksum, autoflush), seal it if encryption is
  /// active, and push the resulting entry to `sink`. Returns the
  /// number of uncompressed bytes flushed.
  pub fn flush(&mut self, sink: &mut dyn BlockSink) -> io::Result<usize> {
    if self.used == 0 {
      return Ok(0);
    }

    let mut encoder = lz4::EncoderBuilder::new()
      .level(1)
      .checksum(lz4::ContentChecksum::ChecksumEnabled)
      .auto_flush(true)
      .build(Vec::with_capacity(self.used / 2 + 64))?;
    encoder.write_all(&self.data[..self.used])?;
    let (frame, result) = encoder.finish();
    result?;

    match self.seal.as_mut() {
      Some(seal) => {
        // the sealed plaintext is the complete LZ4 entry, padded
        let mut block = Vec::with_capacity(frame.len() + ENTRY_HEADER_LEN + 16);
        put_entry(&mut block, ENTRY_ID_LZ4, &frame);
        seal.seal(&mut block);
        sink.write_block(ENTRY_ID_AES, &block)?;
      },
      None => sink.write_block(ENTRY_ID_LZ4, &frame)?,
    }

    let flushed = self.used;
    self.used = 0;
    Ok(flushed)
  }

  /// Discard uncommitted bytes and destroy the cipher context. The
  /// next file must re-enable encryption before sealing anything.
  pub fn reset(&mut self) {
    self.used = 0;
    self.seal = None;
  }
}
