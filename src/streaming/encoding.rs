//! Record encoders for chunked streams.
//!
//! A [`ChunkedTransferSession`](super::ChunkedTransferSession) owns all the
//! buffering, flushing and termination logic; an encoder only knows how one
//! record becomes bytes. Encoders are created per session, never shared.

use serde::Serialize;
use std::io;
use std::marker::PhantomData;

/// Output encoding of a streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Length-delimited protobuf messages.
    Binary,
    /// One JSON document per line.
    #[default]
    Json,
    /// Delimited text with an optional header row.
    Csv,
}

impl Encoding {
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Encoding::Binary => "application/protobuf",
            Encoding::Json => "application/json",
            Encoding::Csv => "text/csv",
        }
    }

    /// Pick an encoding from an `Accept` header. The first recognised media
    /// type wins; anything else falls back to JSON.
    #[must_use]
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Encoding::Json;
        };
        for media in accept.split(',') {
            let media = media.split(';').next().unwrap_or("").trim();
            match media.to_ascii_lowercase().as_str() {
                "application/protobuf" | "application/x-protobuf" | "application/octet-stream" => {
                    return Encoding::Binary
                }
                "text/csv" | "text/tab-separated-values" => return Encoding::Csv,
                "application/json" | "application/x-ndjson" => return Encoding::Json,
                _ => {}
            }
        }
        Encoding::Json
    }
}

/// Maps records of one kind to bytes in one encoding.
pub trait RecordEncoder: Send {
    type Record;

    fn content_type(&self) -> &'static str;

    /// Bytes written once, before the first record (e.g. a header row).
    fn begin(&mut self, _buf: &mut Vec<u8>) -> io::Result<()> {
        Ok(())
    }

    /// Append one serialized record.
    fn encode(&mut self, record: &Self::Record, buf: &mut Vec<u8>) -> io::Result<()>;

    /// Close out the current serialization before the buffer becomes a chunk.
    fn end_chunk(&mut self, _buf: &mut Vec<u8>) -> io::Result<()> {
        Ok(())
    }
}

/// Length-delimited protobuf: a varint size followed by the message.
pub struct BinaryEncoder<R> {
    _record: PhantomData<fn(&R)>,
}

impl<R> BinaryEncoder<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<R> Default for BinaryEncoder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: prost::Message> RecordEncoder for BinaryEncoder<R> {
    type Record = R;

    fn content_type(&self) -> &'static str {
        Encoding::Binary.content_type()
    }

    fn encode(&mut self, record: &R, buf: &mut Vec<u8>) -> io::Result<()> {
        record
            .encode_length_delimited(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Newline-delimited JSON.
pub struct JsonEncoder<R> {
    _record: PhantomData<fn(&R)>,
}

impl<R> JsonEncoder<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _record: PhantomData,
        }
    }
}

impl<R> Default for JsonEncoder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Serialize> RecordEncoder for JsonEncoder<R> {
    type Record = R;

    fn content_type(&self) -> &'static str {
        Encoding::Json.content_type()
    }

    fn encode(&mut self, record: &R, buf: &mut Vec<u8>) -> io::Result<()> {
        serde_json::to_writer(&mut *buf, record).map_err(io::Error::from)?;
        buf.push(b'\n');
        Ok(())
    }
}

/// A record that can be written as one delimited-text row.
pub trait CsvRecord {
    fn csv_fields(&self) -> Vec<String>;
}

/// Delimited text. Tab-separated unless told otherwise; fields holding the
/// delimiter, a quote or a line break are quoted.
pub struct CsvEncoder<R> {
    delimiter: u8,
    header: Option<Vec<String>>,
    _record: PhantomData<fn(&R)>,
}

impl<R> CsvEncoder<R> {
    #[must_use]
    pub fn new(header: Option<Vec<String>>) -> Self {
        Self {
            delimiter: b'\t',
            header,
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn write_row<S: AsRef<str>>(&self, fields: &[S], buf: &mut Vec<u8>) {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                buf.push(self.delimiter);
            }
            let field = field.as_ref();
            let needs_quotes = field
                .bytes()
                .any(|b| b == self.delimiter || b == b'"' || b == b'\n' || b == b'\r');
            if needs_quotes {
                buf.push(b'"');
                for b in field.bytes() {
                    if b == b'"' {
                        buf.push(b'"');
                    }
                    buf.push(b);
                }
                buf.push(b'"');
            } else {
                buf.extend_from_slice(field.as_bytes());
            }
        }
        buf.push(b'\n');
    }
}

impl<R: CsvRecord> RecordEncoder for CsvEncoder<R> {
    type Record = R;

    fn content_type(&self) -> &'static str {
        Encoding::Csv.content_type()
    }

    fn begin(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        if let Some(header) = &self.header {
            self.write_row(header, buf);
        }
        Ok(())
    }

    fn encode(&mut self, record: &R, buf: &mut Vec<u8>) -> io::Result<()> {
        self.write_row(&record.csv_fields(), buf);
        Ok(())
    }
}

/// One of the three encoders, chosen at runtime from an [`Encoding`].
pub enum FormatEncoder<R> {
    Binary(BinaryEncoder<R>),
    Json(JsonEncoder<R>),
    Csv(CsvEncoder<R>),
}

impl<R> FormatEncoder<R> {
    /// `csv_header` is only used for [`Encoding::Csv`].
    #[must_use]
    pub fn for_encoding(encoding: Encoding, csv_header: Option<Vec<String>>) -> Self {
        match encoding {
            Encoding::Binary => FormatEncoder::Binary(BinaryEncoder::new()),
            Encoding::Json => FormatEncoder::Json(JsonEncoder::new()),
            Encoding::Csv => FormatEncoder::Csv(CsvEncoder::new(csv_header)),
        }
    }
}

impl<R> RecordEncoder for FormatEncoder<R>
where
    R: prost::Message + Serialize + CsvRecord,
{
    type Record = R;

    fn content_type(&self) -> &'static str {
        match self {
            FormatEncoder::Binary(e) => e.content_type(),
            FormatEncoder::Json(e) => e.content_type(),
            FormatEncoder::Csv(e) => e.content_type(),
        }
    }

    fn begin(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            FormatEncoder::Binary(e) => e.begin(buf),
            FormatEncoder::Json(e) => e.begin(buf),
            FormatEncoder::Csv(e) => e.begin(buf),
        }
    }

    fn encode(&mut self, record: &R, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            FormatEncoder::Binary(e) => e.encode(record, buf),
            FormatEncoder::Json(e) => e.encode(record, buf),
            FormatEncoder::Csv(e) => e.encode(record, buf),
        }
    }

    fn end_chunk(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        match self {
            FormatEncoder::Binary(e) => e.end_chunk(buf),
            FormatEncoder::Json(e) => e.end_chunk(buf),
            FormatEncoder::Csv(e) => e.end_chunk(buf),
        }
    }
}
