//! Builders for objects in the format the scanner consumes.

use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;

/// Gzip-compresses the given raw bytes.
pub fn gzip(raw: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).unwrap();
    encoder.finish().unwrap().into()
}

/// Builds the uncompressed NDJSON body for `records` simple records.
///
/// Each line is a small JSON object tagged with `object` and its line index.
pub fn ndjson(object: usize, records: usize) -> String {
    (0..records)
        .map(|line| {
            let record = serde_json::json!({
                "object": object,
                "line": line,
                "message": format!("record {line} of object {object}"),
            });
            format!("{record}\n")
        })
        .collect()
}

/// Builds a gzip-compressed NDJSON object with `records` lines.
pub fn gzip_ndjson(object: usize, records: usize) -> Bytes {
    gzip(ndjson(object, records).as_bytes())
}
