//! TFRecord container framing.
//!
//! Each record is stored as:
//!
//! ```text
//! u64 length (le) | u32 masked_crc32c(length) | data[length] | u32 masked_crc32c(data)
//! ```

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;

const MASK_DELTA: u32 = 0xa282_ead8;
/// Reflected Castagnoli polynomial.
const CASTAGNOLI: u32 = 0x82f6_3b78;

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ CASTAGNOLI
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

pub fn crc32c(bytes: &[u8]) -> u32 {
    let crc = bytes.iter().fold(!0u32, |crc, &b| {
        CRC_TABLE[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8)
    });
    !crc
}

pub fn masked_crc32c(bytes: &[u8]) -> u32 {
    let crc = crc32c(bytes);
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Iterates over the payloads of a TFRecord stream.
pub struct RecordReader<R> {
    reader: R,
    index: usize,
    verify: bool,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            index: 0,
            verify: true,
            done: false,
        }
    }

    /// Enables or disables the crc verification of lengths and payloads.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Reads the next record, or `None` on a clean end of stream.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let index = self.index;

        let mut header = [0u8; 12];
        let filled = read_full(&mut self.reader, &mut header)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < header.len() {
            return Err(Error::Truncated { index });
        }

        let mut len_bytes = [0u8; 8];
        let mut len_crc = [0u8; 4];
        len_bytes.copy_from_slice(&header[..8]);
        len_crc.copy_from_slice(&header[8..]);
        if self.verify {
            let found = u32::from_le_bytes(len_crc);
            let expected = masked_crc32c(&len_bytes);
            if found != expected {
                return Err(Error::LengthChecksum {
                    index,
                    found,
                    expected,
                });
            }
        }
        let len = u64::from_le_bytes(len_bytes);
        let len = usize::try_from(len).map_err(|_| Error::Truncated { index })?;

        // grown as bytes arrive so a corrupted length can't trigger a huge allocation
        let mut data = Vec::new();
        let read = (&mut self.reader).take(len as u64).read_to_end(&mut data)?;
        if read < len {
            return Err(Error::Truncated { index });
        }

        let mut footer = [0u8; 4];
        if read_full(&mut self.reader, &mut footer)? < footer.len() {
            return Err(Error::Truncated { index });
        }
        if self.verify {
            let found = u32::from_le_bytes(footer);
            let expected = masked_crc32c(&data);
            if found != expected {
                return Err(Error::DataChecksum {
                    index,
                    found,
                    expected,
                });
            }
        }

        self.index += 1;
        Ok(Some(data))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.read_record().transpose();
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}

/// Fills `buf` as far as the stream allows, returning the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

pub struct RecordWriter<W> {
    writer: W,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_record(&mut self, data: &[u8]) -> Result<()> {
        let len = (data.len() as u64).to_le_bytes();
        self.writer.write_all(&len)?;
        self.writer.write_all(&masked_crc32c(&len).to_le_bytes())?;
        self.writer.write_all(data)?;
        self.writer.write_all(&masked_crc32c(data).to_le_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads every record of the file at `path`.
pub fn read_records(path: &Path) -> Result<Vec<Vec<u8>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    RecordReader::new(BufReader::new(file))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| match e {
            Error::Stream(source) => Error::io(path, source),
            e => e,
        })
}

/// Writes `records` into a new file at `path`.
pub fn write_records<'a>(path: &Path, records: impl IntoIterator<Item = &'a [u8]>) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = RecordWriter::new(std::io::BufWriter::new(file));
    for record in records {
        writer.write_record(record)?;
    }
    writer.flush()
}
