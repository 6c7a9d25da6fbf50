//! Batch Wire Codec
//!
//! A batch is a list of records sharing one schema version, encoded once into a
//! self-describing frame and sent to a single shard.
//!
//! ## Frame Layout
//!
//! All integers little-endian.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ Header (36 bytes)                                             │
//! │  - Magic: "DHUB" (4 bytes)                                    │
//! │  - Version: 1 (4 bytes)                                       │
//! │  - Total frame length incl. header (4 bytes)                  │
//! │  - Raw (uncompressed) payload length (4 bytes)                │
//! │  - CRC32-Castagnoli of the stored payload (4 bytes)           │
//! │  - Attributes: low 2 bits = codec id (2 bytes)                │
//! │  - Data type: 2 = Avro rows (2 bytes)                         │
//! │  - Schema version id, signed (4 bytes)                        │
//! │  - Payload offset: 36 (4 bytes)                               │
//! │  - Record count (4 bytes)                                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │ Payload: concatenated Avro datums, possibly compressed        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! If compression does not make the payload smaller it is stored raw and the
//! codec bits are cleared, so the attribute bits always describe the bytes on
//! the wire.
//!
//! ## Validation
//!
//! [`BatchReader::new`] checks, in order: minimum length, magic, version,
//! declared length, payload offset, CRC and data type. The payload is not
//! touched until all of them pass.

use crate::compression::CompressType;
use crate::record::{ReadMeta, Record};
use crate::wire::{record_to_value, value_to_record, SchemaItem};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

pub const BATCH_MAGIC: [u8; 4] = *b"DHUB";
pub const BATCH_VERSION: u32 = 1;
pub const BATCH_HEADER_SIZE: usize = 36;

/// Data type tag for Avro-encoded rows, the only payload encoding.
pub const DATA_TYPE_AVRO: u16 = 2;

const COMPRESS_MASK: u16 = 0x03;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub version: u32,
    pub length: u32,
    pub raw_size: u32,
    pub crc32: u32,
    pub attributes: u16,
    pub data_type: u16,
    pub schema_version: i32,
    pub data_offset: u32,
    pub record_count: u32,
}

impl BatchHeader {
    pub fn compress_type(&self) -> Result<CompressType> {
        CompressType::try_from(self.attributes & COMPRESS_MASK)
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&BATCH_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.length);
        buf.put_u32_le(self.raw_size);
        buf.put_u32_le(self.crc32);
        buf.put_u16_le(self.attributes);
        buf.put_u16_le(self.data_type);
        buf.put_i32_le(self.schema_version);
        buf.put_u32_le(self.data_offset);
        buf.put_u32_le(self.record_count);
    }

    /// Parse and validate the header of `frame`, including the payload CRC.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < BATCH_HEADER_SIZE {
            return Err(Error::InvalidLength(format!(
                "frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                BATCH_HEADER_SIZE
            )));
        }

        let mut cursor = &frame[..BATCH_HEADER_SIZE];
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != BATCH_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let header = BatchHeader {
            version: cursor.get_u32_le(),
            length: cursor.get_u32_le(),
            raw_size: cursor.get_u32_le(),
            crc32: cursor.get_u32_le(),
            attributes: cursor.get_u16_le(),
            data_type: cursor.get_u16_le(),
            schema_version: cursor.get_i32_le(),
            data_offset: cursor.get_u32_le(),
            record_count: cursor.get_u32_le(),
        };

        if header.version != BATCH_VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        if header.length as usize != frame.len() {
            return Err(Error::InvalidLength(format!(
                "header declares {} bytes, frame has {}",
                header.length,
                frame.len()
            )));
        }
        let offset = header.data_offset as usize;
        if offset < BATCH_HEADER_SIZE || offset > frame.len() {
            return Err(Error::InvalidLength(format!(
                "payload offset {offset} outside frame"
            )));
        }

        let computed = crc32c::crc32c(&frame[offset..]);
        if computed != header.crc32 {
            return Err(Error::CrcMismatch {
                stored: header.crc32,
                computed,
            });
        }

        if header.data_type != DATA_TYPE_AVRO {
            return Err(Error::UnsupportedDataType(header.data_type));
        }

        // Neither size field is covered by the CRC.
        let stored = frame.len() - offset;
        let compress_type = header.compress_type()?;
        let limit = compress_type.max_raw_size(stored);
        if header.raw_size as usize > limit {
            return Err(Error::InvalidLength(format!(
                "raw size {} exceeds what {stored} {compress_type} bytes can hold ({limit})",
                header.raw_size
            )));
        }
        // Every Avro row takes at least one byte.
        if header.record_count > header.raw_size {
            return Err(Error::InvalidLength(format!(
                "{} records cannot fit in {} payload bytes",
                header.record_count, header.raw_size
            )));
        }

        Ok(header)
    }
}

/// Encodes record lists into frames with a fixed payload codec.
#[derive(Debug, Clone, Copy)]
pub struct BatchEncoder {
    compress_type: CompressType,
}

impl BatchEncoder {
    pub fn new(compress_type: CompressType) -> Self {
        Self { compress_type }
    }

    pub fn compress_type(&self) -> CompressType {
        self.compress_type
    }

    /// Encode `records` under the schema version `item`.
    ///
    /// Every record must fit `item`; a blob record against a tuple schema, an
    /// unset not-null field or a value of the wrong type is an error.
    pub fn encode(&self, records: &[Record], item: &SchemaItem) -> Result<Bytes> {
        let mut raw = Vec::new();
        for record in records {
            let value = record_to_value(record, item)?;
            raw.extend_from_slice(&apache_avro::to_avro_datum(&item.wire, value)?);
        }

        let (payload, stored_as) = self.compress(raw.as_slice())?;
        let payload: &[u8] = payload.as_deref().unwrap_or(&raw);

        let header = BatchHeader {
            version: BATCH_VERSION,
            length: frame_u32(BATCH_HEADER_SIZE + payload.len())?,
            raw_size: frame_u32(raw.len())?,
            crc32: crc32c::crc32c(payload),
            attributes: stored_as.id() & COMPRESS_MASK,
            data_type: DATA_TYPE_AVRO,
            schema_version: item.version_id,
            data_offset: BATCH_HEADER_SIZE as u32,
            record_count: frame_u32(records.len())?,
        };

        let mut buf = BytesMut::with_capacity(BATCH_HEADER_SIZE + payload.len());
        header.write(&mut buf);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Returns the compressed payload, or `None` when the raw bytes should be
    /// stored instead.
    fn compress(&self, raw: &[u8]) -> Result<(Option<Vec<u8>>, CompressType)> {
        if self.compress_type == CompressType::None || raw.is_empty() {
            return Ok((None, CompressType::None));
        }

        let packed = self.compress_type.compressor().compress(raw)?;
        if packed.len() >= raw.len() {
            debug!(
                codec = %self.compress_type,
                raw_size = raw.len(),
                compressed_size = packed.len(),
                "Compression did not shrink payload, storing raw"
            );
            return Ok((None, CompressType::None));
        }
        Ok((Some(packed), self.compress_type))
    }
}

fn frame_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidLength(format!("{len} exceeds frame limits")))
}

/// Validated view over one frame.
pub struct BatchReader {
    frame: Bytes,
    header: BatchHeader,
}

impl BatchReader {
    /// Validate `frame`. Fails on any header or checksum problem.
    pub fn new(frame: Bytes) -> Result<Self> {
        let header = BatchHeader::parse(&frame)?;
        Ok(Self { frame, header })
    }

    pub fn header(&self) -> &BatchHeader {
        &self.header
    }

    pub fn schema_version(&self) -> i32 {
        self.header.schema_version
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    /// Decompressed payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let stored = &self.frame[self.header.data_offset as usize..];
        self.header
            .compress_type()?
            .compressor()
            .decompress(stored, self.header.raw_size as usize)
    }

    /// Decode every record.
    ///
    /// `writer` must be the schema version named in the header. When `reader`
    /// is given, rows are resolved into it; fields it adds must be nullable and
    /// come back unset. Each record gets a copy of `meta` with its batch index.
    pub fn read_all(
        &self,
        writer: &SchemaItem,
        reader: Option<&SchemaItem>,
        meta: &ReadMeta,
    ) -> Result<Vec<Record>> {
        if writer.version_id != self.header.schema_version {
            return Err(Error::SchemaMismatch(format!(
                "frame written with version {}, decoder given {}",
                self.header.schema_version, writer.version_id
            )));
        }

        let payload = self.payload()?;
        let target = reader.unwrap_or(writer);
        let reader_wire = reader.map(|r| &r.wire);

        let mut cursor = payload.as_slice();
        let count = self.header.record_count as usize;
        let mut records = Vec::with_capacity(count.min(payload.len()));
        for index in 0..count {
            let value = apache_avro::from_avro_datum(&writer.wire, &mut cursor, reader_wire)?;
            let mut record = value_to_record(value, target.schema.as_ref())?;
            record.meta = Some(ReadMeta {
                batch_index: index as u32,
                ..meta.clone()
            });
            records.push(record);
        }

        if !cursor.is_empty() {
            return Err(Error::InvalidLength(format!(
                "{} trailing payload bytes after {} records",
                cursor.len(),
                count
            )));
        }
        Ok(records)
    }
}
