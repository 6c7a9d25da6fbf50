#![no_main]

use bytes::Bytes;
use dhub_core::{BatchHeader, BatchReader, ReadMeta, SchemaItem};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the frame reader. Malformed input must come
    // back as an error:
    // - Invalid magic or version
    // - Length fields disagreeing with the buffer
    // - Bad CRC32C checksums
    // - Unknown codec bits or corrupt compressed payloads
    // - Truncated Avro rows
    let _ = BatchHeader::parse(data);

    let Ok(reader) = BatchReader::new(Bytes::copy_from_slice(data)) else {
        return;
    };
    let _ = reader.record_count();
    let _ = reader.payload();

    if let Ok(blob) = SchemaItem::blob() {
        let _ = reader.read_all(&blob, None, &ReadMeta::default());
    }
});
