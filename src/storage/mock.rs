//! Deterministic mock backing store
//!
//! Serves GETs either from an in-memory image (`key_hash -> val_size`,
//! loadable from a CSV dump of the workload) or, with no image configured,
//! by synthesizing a value in a fixed self-describing format. PUTs update
//! the image when one exists. Completion timing is handled by the worker's
//! delay queue, not here.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use bytes::Bytes;

use crate::error::{Error, KvFormatError};
use crate::ghost::ghost_hash;

/// Value layout parameters for synthesized key-value pairs.
///
/// The value reads `'V' + zero-padded offset + 's' + zero-padded val_size +
/// 'A' * v_pad_len + 'L'`; the input key must start with `'K'` and carry a
/// decimal offset terminated by `'s'`.
#[derive(Debug, Clone, Copy)]
pub struct MockKvFormat {
    pub key_size: u32,
    pub val_size: u32,
    pub size_len: u32,
    pub offset_len: u32,
    pub k_pad_len: u32,
    pub v_pad_len: u32,
}

impl MockKvFormat {
    pub fn new(key_size: u32, val_size: u32) -> Result<Self, KvFormatError> {
        let size_len = key_size
            .to_string()
            .len()
            .max(val_size.to_string().len()) as i64;
        let least_len_left = key_size.min(val_size) as i64 - 3 - size_len;
        if least_len_left <= 0 {
            return Err(KvFormatError::NoRoomForOffset);
        }
        let offset_len = least_len_left.min(10);
        let k_pad_len = key_size as i64 - 3 - size_len - offset_len;
        let v_pad_len = val_size as i64 - 3 - size_len - offset_len;
        if k_pad_len < 0 {
            return Err(KvFormatError::NegativeKeyPad);
        }
        if v_pad_len < 0 {
            return Err(KvFormatError::NegativeValPad);
        }

        Ok(Self {
            key_size,
            val_size,
            size_len: size_len as u32,
            offset_len: offset_len as u32,
            k_pad_len: k_pad_len as u32,
            v_pad_len: v_pad_len as u32,
        })
    }

    /// Synthesize the value for a well-formed key
    pub fn make_val(&self, key: &[u8]) -> Result<Bytes, KvFormatError> {
        let printable = || String::from_utf8_lossy(key).into_owned();
        if key.len() != self.key_size as usize {
            return Err(KvFormatError::KeyLenMismatch(printable()));
        }
        if key[0] != b'K' {
            return Err(KvFormatError::BadKeySentinel(printable()));
        }

        let mut offset: u64 = 0;
        for &c in &key[1..] {
            if c == b's' {
                break;
            }
            if c.is_ascii_digit() {
                offset = offset * 10 + (c - b'0') as u64;
            } else {
                return Err(KvFormatError::BadKeyOffset(printable()));
            }
        }

        let mut val = String::with_capacity(self.val_size as usize);
        val.push('V');
        val.push_str(&format!("{:0w$}", offset, w = self.offset_len as usize));
        val.push('s');
        val.push_str(&format!("{:0w$}", self.val_size, w = self.size_len as usize));
        val.push_str(&"A".repeat(self.v_pad_len as usize));
        val.push('L');
        Ok(Bytes::from(val))
    }
}

/// Mock store state: optional image plus the synthesis format
pub struct MockStore {
    image: Option<HashMap<u32, u32>>,
    format: MockKvFormat,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            image: None,
            // default KV format
            format: MockKvFormat::new(16, 500).expect("default format is valid"),
        }
    }

    pub fn format(&self) -> MockKvFormat {
        self.format
    }

    pub fn set_format(&mut self, key_size: u32, val_size: u32) -> Result<(), KvFormatError> {
        self.format = MockKvFormat::new(key_size, val_size)?;
        Ok(())
    }

    /// Switch from format synthesis to image serving; lazily created so
    /// several image files can be layered
    pub fn init_image(&mut self) {
        if self.image.is_none() {
            self.image = Some(HashMap::new());
        }
    }

    /// Merge a CSV image (`key,val_size` header) into the store. Keys are
    /// collapsed to their hash for space efficiency.
    pub fn load_image(&mut self, path: &Path) -> Result<(), Error> {
        let image = self.image.as_mut().expect("init_image called first");
        let f = BufReader::new(File::open(path)?);
        let mut lines = f.lines();

        let header = lines.next().transpose()?.unwrap_or_default();
        if header != "key,val_size" {
            return Err(Error::Parse("invalid image file format".into()));
        }

        for line in lines {
            let line = line?;
            let (key, val_size_str) = line
                .split_once(',')
                .ok_or_else(|| Error::Parse("invalid image file format".into()))?;
            let val_size: u32 = val_size_str
                .trim()
                .parse()
                .map_err(|_| Error::Parse("invalid image file format".into()))?;
            image.insert(ghost_hash(key.as_bytes()), val_size);
        }
        Ok(())
    }

    /// Resolve a GET: image lookup when an image is configured, format
    /// synthesis otherwise. The error string travels back to the client.
    pub fn handle_get(&self, key: &[u8]) -> Result<Bytes, String> {
        match &self.image {
            Some(image) => match image.get(&ghost_hash(key)) {
                Some(&val_size) => Ok(Bytes::from(vec![b'v'; val_size as usize])),
                None => Err("key not found in image".to_string()),
            },
            None => self.format.make_val(key).map_err(|e| e.to_string()),
        }
    }

    /// Record a PUT into the image, if one is configured
    pub fn record_put(&mut self, key: &[u8], val_size: usize) {
        if let Some(image) = self.image.as_mut() {
            image.insert(ghost_hash(key), val_size as u32);
        }
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}
