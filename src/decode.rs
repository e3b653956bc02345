//! Incremental decoding of `[{...}, {...}]` response bodies.
//!
//! [`RowDecoder`] is a push parser: feed it chunks as they arrive and pull
//! complete rows out. Only the bytes of the element (or skipped member)
//! currently being decoded are retained, so memory does not grow with the
//! size of the array. The whole document is still validated: members around
//! the array and bytes after it must be well-formed JSON.

use bytes::{Buf, Bytes, BytesMut};
use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use serde::de::IgnoredAny;
use serde_json::{Map, Value};

use crate::{Result, StatError};

/// One decoded record.
pub type Row = Map<String, Value>;

/// Location of the row array inside a response document.
///
/// The root path addresses a top-level array. A keyed path walks nested
/// objects first: `ItemPath::parse("result.item")` addresses the array in
/// `{"result": [...]}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemPath {
    keys: Vec<String>,
}

impl ItemPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses dotted notation where a trailing `item` segment names the
    /// array elements: `"item"` is the root array, `"data.rows.item"` the
    /// array at `data.rows`. The trailing segment may be omitted.
    pub fn parse(path: &str) -> Self {
        let mut keys: Vec<String> = path
            .split('.')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect();
        if keys.last().is_some_and(|last| last == "item") {
            keys.pop();
        }
        Self { keys }
    }

    pub fn segments(&self) -> &[String] {
        &self.keys
    }
}

impl From<&str> for ItemPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Outcome of one [`RowDecoder::next_row`] call.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Row(Row),
    /// The buffered input holds no complete row; feed more or call `finish`.
    NeedMore,
    /// The document is complete; the target array was exhausted or absent.
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Begin,
    /// Expecting a key in the object at `level`; `}` is allowed when `first`.
    Member { level: usize, first: bool },
    /// Value of the key that matched `level`.
    Descend { level: usize },
    SkipValue { level: usize },
    AfterMember { level: usize },
    ArrayOpen,
    Element,
    AfterElement,
    /// Only whitespace may follow the top-level value.
    Tail,
    Done,
}

/// Push parser for an array of objects, optionally nested in objects.
#[derive(Debug)]
pub struct RowDecoder {
    buf: BytesMut,
    path: ItemPath,
    phase: Phase,
    scan: Scan,
    /// The target array has been entered; later members are skipped.
    found: bool,
    eof: bool,
}

impl RowDecoder {
    pub fn new(path: ItemPath) -> Self {
        Self {
            buf: BytesMut::new(),
            path,
            phase: Phase::Begin,
            scan: Scan::default(),
            found: false,
            eof: false,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Marks the end of input.
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// Bytes currently held back waiting for a complete token.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pulls the next complete row.
    ///
    /// After an error the decoder is finished and only returns [`Decoded::End`].
    pub fn next_row(&mut self) -> Result<Decoded> {
        let step = self.step();
        if step.is_err() {
            self.phase = Phase::Done;
        }
        step
    }

    fn step(&mut self) -> Result<Decoded> {
        loop {
            match self.phase {
                Phase::Done => return Ok(Decoded::End),
                Phase::Begin => {
                    let Some(byte) = self.peek() else {
                        return self.starve(true);
                    };
                    if self.path.keys.is_empty() {
                        self.expect(byte, b'[', "array")?;
                        self.found = true;
                        self.phase = Phase::ArrayOpen;
                    } else {
                        self.expect(byte, b'{', "object")?;
                        self.phase = Phase::Member {
                            level: 0,
                            first: true,
                        };
                    }
                }
                Phase::Member { level, first } => {
                    let Some(byte) = self.peek() else {
                        return self.starve(false);
                    };
                    if first && byte == b'}' {
                        self.buf.advance(1);
                        self.close_object(level);
                        continue;
                    }
                    if byte != b'"' {
                        return Err(unexpected(byte, "object key"));
                    }
                    let Some((key, consumed)) = self.object_key()? else {
                        return self.starve(false);
                    };
                    self.buf.advance(consumed);
                    self.phase = if !self.found && key == self.path.keys[level] {
                        Phase::Descend { level }
                    } else {
                        Phase::SkipValue { level }
                    };
                }
                Phase::Descend { level } => {
                    let Some(byte) = self.peek() else {
                        return self.starve(false);
                    };
                    if level + 1 == self.path.keys.len() {
                        self.expect(byte, b'[', "array")?;
                        self.found = true;
                        self.phase = Phase::ArrayOpen;
                    } else {
                        self.expect(byte, b'{', "object")?;
                        self.phase = Phase::Member {
                            level: level + 1,
                            first: true,
                        };
                    }
                }
                Phase::SkipValue { level } => {
                    if !self.scan.started && self.peek().is_none() {
                        return self.starve(false);
                    }
                    let Some(len) = self.scan.scan(&self.buf, self.eof)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    serde_json::from_slice::<IgnoredAny>(&self.buf[..len])
                        .map_err(|err| StatError::Decode(format!("invalid value: {err}")))?;
                    self.buf.advance(len);
                    self.scan = Scan::default();
                    self.phase = Phase::AfterMember { level };
                }
                Phase::AfterMember { level } => {
                    let Some(byte) = self.peek() else {
                        return self.starve(false);
                    };
                    match byte {
                        b',' => {
                            self.buf.advance(1);
                            self.phase = Phase::Member {
                                level,
                                first: false,
                            };
                        }
                        b'}' => {
                            self.buf.advance(1);
                            self.close_object(level);
                        }
                        other => return Err(unexpected(other, "',' or '}'")),
                    }
                }
                Phase::ArrayOpen => {
                    let Some(byte) = self.peek() else {
                        return self.starve(false);
                    };
                    if byte == b']' {
                        self.buf.advance(1);
                        self.close_array();
                    } else {
                        self.phase = Phase::Element;
                    }
                }
                Phase::Element => {
                    if !self.scan.started && self.peek().is_none() {
                        return self.starve(false);
                    }
                    let Some(len) = self.scan.scan(&self.buf, self.eof)? else {
                        return Ok(Decoded::NeedMore);
                    };
                    let element = self.buf.split_to(len);
                    self.scan = Scan::default();
                    self.phase = Phase::AfterElement;
                    return parse_row(&element).map(Decoded::Row);
                }
                Phase::AfterElement => {
                    let Some(byte) = self.peek() else {
                        return self.starve(false);
                    };
                    match byte {
                        b',' => {
                            self.buf.advance(1);
                            self.phase = Phase::Element;
                        }
                        b']' => {
                            self.buf.advance(1);
                            self.close_array();
                        }
                        other => return Err(unexpected(other, "',' or ']'")),
                    }
                }
                Phase::Tail => match self.peek() {
                    Some(byte) => return Err(unexpected(byte, "end of input")),
                    None if self.eof => self.phase = Phase::Done,
                    None => return Ok(Decoded::NeedMore),
                },
            }
        }
    }

    /// The target array closed; resume in the object that holds it.
    fn close_array(&mut self) {
        self.phase = match self.path.keys.len() {
            0 => Phase::Tail,
            len => Phase::AfterMember { level: len - 1 },
        };
    }

    /// The object at `level` closed; resume in its parent.
    fn close_object(&mut self, level: usize) {
        self.phase = match level {
            0 => Phase::Tail,
            level => Phase::AfterMember { level: level - 1 },
        };
    }

    /// Drops leading whitespace and returns the next byte, if buffered.
    fn peek(&mut self) -> Option<u8> {
        let skip = self
            .buf
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        self.buf.advance(skip);
        self.buf.first().copied()
    }

    fn expect(&mut self, byte: u8, wanted: u8, what: &str) -> Result<()> {
        if byte != wanted {
            return Err(unexpected(byte, what));
        }
        self.buf.advance(1);
        Ok(())
    }

    /// Decodes `"key" :` at the start of the buffer without consuming it.
    fn object_key(&self) -> Result<Option<(String, usize)>> {
        let mut scan = Scan::default();
        let Some(len) = scan.scan(&self.buf, self.eof)? else {
            return Ok(None);
        };
        let Some(colon) = self.buf[len..]
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .map(|offset| len + offset)
        else {
            return if self.eof {
                Err(StatError::Decode("unexpected end of input".to_owned()))
            } else {
                Ok(None)
            };
        };
        if self.buf[colon] != b':' {
            return Err(unexpected(self.buf[colon], "':'"));
        }
        let key = serde_json::from_slice::<String>(&self.buf[..len])
            .map_err(|err| StatError::Decode(format!("invalid object key: {err}")))?;
        Ok(Some((key, colon + 1)))
    }

    fn starve(&mut self, may_end: bool) -> Result<Decoded> {
        if !self.eof {
            return Ok(Decoded::NeedMore);
        }
        if may_end {
            self.phase = Phase::Done;
            return Ok(Decoded::End);
        }
        Err(StatError::Decode("unexpected end of input".to_owned()))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ValueKind {
    #[default]
    Scalar,
    Text,
    Container,
}

/// Resumable scanner that finds where one JSON value ends.
///
/// It only tracks nesting and string state; the bytes are validated by
/// `serde_json` once the extent is known.
#[derive(Debug, Default)]
struct Scan {
    offset: usize,
    started: bool,
    kind: ValueKind,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Length of the value starting at `bytes[0]`, or `None` if incomplete.
    fn scan(&mut self, bytes: &[u8], eof: bool) -> Result<Option<usize>> {
        while self.offset < bytes.len() {
            let byte = bytes[self.offset];

            if !self.started {
                self.started = true;
                match byte {
                    b'{' | b'[' => {
                        self.kind = ValueKind::Container;
                        self.depth = 1;
                    }
                    b'"' => {
                        self.kind = ValueKind::Text;
                        self.in_string = true;
                    }
                    b',' | b':' | b']' | b'}' => return Err(unexpected(byte, "value")),
                    _ => self.kind = ValueKind::Scalar,
                }
                self.offset += 1;
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.kind == ValueKind::Text {
                        return Ok(Some(self.offset + 1));
                    }
                }
                self.offset += 1;
                continue;
            }

            match self.kind {
                ValueKind::Scalar => {
                    if is_delimiter(byte) {
                        return Ok(Some(self.offset));
                    }
                }
                ValueKind::Container => match byte {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            return Ok(Some(self.offset + 1));
                        }
                    }
                    _ => {}
                },
                ValueKind::Text => {}
            }
            self.offset += 1;
        }

        if !eof {
            return Ok(None);
        }
        if self.started && self.kind == ValueKind::Scalar {
            return Ok(Some(self.offset));
        }
        Err(StatError::Decode("unexpected end of input".to_owned()))
    }
}

fn is_delimiter(byte: u8) -> bool {
    byte.is_ascii_whitespace() || matches!(byte, b',' | b']' | b'}')
}

fn unexpected(byte: u8, expected: &str) -> StatError {
    StatError::Decode(format!(
        "expected {expected}, found '{}'",
        char::from(byte).escape_default()
    ))
}

fn parse_row(bytes: &[u8]) -> Result<Row> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(StatError::Decode(format!(
            "expected object row, found {}",
            json_kind(&other)
        ))),
        Err(err) => Err(StatError::Decode(format!("invalid row: {err}"))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decodes rows lazily from a body stream.
///
/// Transport errors from `bytes` are passed through. The stream ends after
/// the first error.
pub fn decode_rows<S>(bytes: S, path: ItemPath) -> BoxStream<'static, Result<Row>>
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    stream::try_unfold((bytes.boxed(), RowDecoder::new(path)), |(bytes, decoder)| {
        pull_row(bytes, decoder)
    })
    .boxed()
}

type ByteStream = BoxStream<'static, Result<Bytes>>;

async fn pull_row(
    mut bytes: ByteStream,
    mut decoder: RowDecoder,
) -> Result<Option<(Row, (ByteStream, RowDecoder))>> {
    loop {
        match decoder.next_row()? {
            Decoded::Row(row) => return Ok(Some((row, (bytes, decoder)))),
            Decoded::End => return Ok(None),
            Decoded::NeedMore => match bytes.next().await {
                Some(chunk) => decoder.feed(&chunk?),
                None => decoder.finish(),
            },
        }
    }
}

/// Extracts rows from a fully buffered body.
///
/// Runs the same [`RowDecoder`] as the streaming path, so both accept and
/// reject exactly the same documents.
pub(crate) fn rows_from_slice(body: &[u8], path: &ItemPath) -> Result<Vec<Row>> {
    let mut decoder = RowDecoder::new(path.clone());
    decoder.feed(body);
    decoder.finish();

    let mut rows = Vec::new();
    loop {
        match decoder.next_row()? {
            Decoded::Row(row) => rows.push(row),
            Decoded::End => return Ok(rows),
            Decoded::NeedMore => {
                return Err(StatError::Decode("unexpected end of input".to_owned()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::{stream, TryStreamExt};
    use serde_json::json;

    use crate::{
        decode::{self, Decoded, ItemPath, Row, RowDecoder},
        ErrorKind, Result,
    };

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test row must be an object"),
        }
    }

    /// Feeds `body` in chunks of `size` bytes and collects every row.
    fn decode_chunked(body: &[u8], path: ItemPath, size: usize) -> Result<Vec<Row>> {
        let mut decoder = RowDecoder::new(path);
        let mut chunks = body.chunks(size);
        let mut rows = Vec::new();
        loop {
            match decoder.next_row()? {
                Decoded::Row(row) => rows.push(row),
                Decoded::End => return Ok(rows),
                Decoded::NeedMore => match chunks.next() {
                    Some(chunk) => decoder.feed(chunk),
                    None => decoder.finish(),
                },
            }
        }
    }

    #[test]
    fn item_path_parse() {
        assert_eq!(ItemPath::parse("item"), ItemPath::root());
        assert_eq!(ItemPath::parse("result.item"), ItemPath::keys(["result"]));
        assert_eq!(ItemPath::parse("data.rows"), ItemPath::keys(["data", "rows"]));
        assert_eq!(ItemPath::from(""), ItemPath::root());
    }

    #[test]
    fn decodes_root_array_byte_by_byte() {
        let body = br#" [ {"rrd_id": 1, "name": "a,]}"}, {"rrd_id": 2, "esc": "q\"}"} ] "#;
        let rows = decode_chunked(body, ItemPath::root(), 1).expect("must decode");
        assert_eq!(
            rows,
            vec![
                row(json!({"rrd_id": 1, "name": "a,]}"})),
                row(json!({"rrd_id": 2, "esc": "q\"}"})),
            ]
        );
    }

    #[test]
    fn empty_body_and_empty_array_yield_nothing() {
        let bodies: [&[u8]; 4] = [b"", b"   \n", b"[]", b" [ ] "];
        for body in bodies {
            let rows = decode_chunked(body, ItemPath::root(), 3).expect("must decode");
            assert!(rows.is_empty());
        }
    }

    #[test]
    fn nested_path_skips_other_members() {
        let body = br#"{"meta": {"skip": [1, 2, {"x": "]"}], "n": -1.5e3}, "flag": true,
            "result": [{"id": 1}, {"id": 2}], "tail": null}"#;
        for size in [1, 2, 7, body.len()] {
            let rows = decode_chunked(body, ItemPath::parse("result.item"), size)
                .expect("must decode");
            assert_eq!(rows, vec![row(json!({"id": 1})), row(json!({"id": 2}))]);
        }
    }

    #[test]
    fn deeper_nested_path() {
        let body = br#"{"data": {"count": 1, "rows": [{"id": 9}]}}"#;
        let rows = decode_chunked(body, ItemPath::keys(["data", "rows"]), 4)
            .expect("must decode");
        assert_eq!(rows, vec![row(json!({"id": 9}))]);
    }

    #[test]
    fn missing_key_yields_nothing() {
        let rows = decode_chunked(br#"{"other": [1, 2]}"#, ItemPath::parse("result.item"), 5)
            .expect("must decode");
        assert!(rows.is_empty());

        let rows = decode_chunked(b"{}", ItemPath::parse("result.item"), 1).expect("must decode");
        assert!(rows.is_empty());

        let rows = decode_chunked(br#"{"data": {}, "n": 1}"#, ItemPath::keys(["data", "rows"]), 3)
            .expect("must decode");
        assert!(rows.is_empty());
    }

    #[test]
    fn truncated_body_emits_complete_rows_then_fails() {
        let mut decoder = RowDecoder::new(ItemPath::root());
        decoder.feed(br#"[{"a": 1}, {"b": "#);
        assert_eq!(
            decoder.next_row().expect("first row"),
            Decoded::Row(row(json!({"a": 1})))
        );
        assert_eq!(decoder.next_row().expect("needs more"), Decoded::NeedMore);

        decoder.finish();
        let err = decoder.next_row().expect_err("truncated row must fail");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(decoder.next_row().expect("finished"), Decoded::End);
    }

    #[test]
    fn malformed_inputs_are_decode_errors() {
        let cases: [(&[u8], ItemPath); 6] = [
            (&br#"{"a": 1}"#[..], ItemPath::root()),
            (&b"[1, 2]"[..], ItemPath::root()),
            (&br#"[{"a": 1} {"b": 2}]"#[..], ItemPath::root()),
            (&br#"[{"a": }]"#[..], ItemPath::root()),
            (&br#"[{"a": 1},]"#[..], ItemPath::root()),
            (&br#"{"result": {"a": 1}}"#[..], ItemPath::parse("result.item")),
        ];
        for (body, path) in cases {
            let err = decode_chunked(body, path, 2).expect_err("must fail");
            assert_eq!(err.kind(), ErrorKind::Decode, "body {:?}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn buffer_stays_bounded_for_large_arrays() {
        let mut decoder = RowDecoder::new(ItemPath::root());
        decoder.feed(b"[");
        let mut seen = 0;
        for id in 0..10_000 {
            let chunk = format!(r#"{{"rrd_id": {id}, "pad": "xxxxxxxxxxxxxxxx"}},"#);
            decoder.feed(chunk.as_bytes());
            while let Decoded::Row(_) = decoder.next_row().expect("must decode") {
                seen += 1;
            }
            assert!(decoder.buffered() < 128, "buffer grew to {}", decoder.buffered());
        }
        decoder.feed(br#"{"rrd_id": -1}]"#);
        decoder.finish();
        while let Decoded::Row(_) = decoder.next_row().expect("must decode") {
            seen += 1;
        }
        assert_eq!(seen, 10_001);
    }

    #[test]
    fn buffered_extraction_matches_streaming() {
        let body = br#"{"result": [{"id": 1}, {"id": 2, "nested": {"a": [1]}}]}"#;
        let path = ItemPath::parse("result.item");
        let buffered = decode::rows_from_slice(body, &path).expect("must decode");
        let streamed = decode_chunked(body, path, 3).expect("must decode");
        assert_eq!(buffered, streamed);

        assert!(decode::rows_from_slice(b"", &ItemPath::root())
            .expect("empty body")
            .is_empty());
        let err = decode::rows_from_slice(b"[1]", &ItemPath::root()).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn both_modes_reject_malformed_surroundings() {
        let cases: [(&[u8], ItemPath); 5] = [
            (&br#"{"meta": tru, "result": [{"id": 1}]}"#[..], ItemPath::parse("result.item")),
            (&br#"{"result": [{"id": 1}], "tail": nul}"#[..], ItemPath::parse("result.item")),
            (&br#"{"result": [{"id": 1}]"#[..], ItemPath::parse("result.item")),
            (&br#"[{"id": 1}] xyz"#[..], ItemPath::root()),
            (&br#"{"other": [1,, 2]}"#[..], ItemPath::parse("result.item")),
        ];
        for (body, path) in cases {
            let shown = String::from_utf8_lossy(body);
            let buffered = decode::rows_from_slice(body, &path).expect_err("buffered must fail");
            assert_eq!(buffered.kind(), ErrorKind::Decode, "buffered {shown}");
            for size in [1, 4, body.len()] {
                let streamed = decode_chunked(body, path.clone(), size).expect_err("must fail");
                assert_eq!(streamed.kind(), ErrorKind::Decode, "streamed {shown}");
            }
        }
    }

    #[test]
    fn trailing_garbage_fails_after_rows() {
        let mut decoder = RowDecoder::new(ItemPath::root());
        decoder.feed(br#"[{"id": 1}] x"#);
        decoder.finish();
        assert_eq!(
            decoder.next_row().expect("row before the garbage"),
            Decoded::Row(row(json!({"id": 1})))
        );
        let err = decoder.next_row().expect_err("garbage must fail");
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn trailing_whitespace_and_later_members_are_accepted() {
        let body = b"{\"result\": [{\"id\": 1}], \"result\": [{\"id\": 2}], \"n\": 3}\n\n";
        let path = ItemPath::parse("result.item");
        let buffered = decode::rows_from_slice(body, &path).expect("must decode");
        let streamed = decode_chunked(body, path, 5).expect("must decode");
        assert_eq!(buffered, vec![row(json!({"id": 1}))]);
        assert_eq!(buffered, streamed);
    }

    #[tokio::test]
    async fn decode_rows_over_byte_stream() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(br#"[{"rrd_id""#)),
            Ok(Bytes::from_static(br#": 1}, {"rrd_"#)),
            Ok(Bytes::from_static(br#"id": 2}]"#)),
        ];
        let rows: Vec<Row> = decode::decode_rows(stream::iter(chunks), ItemPath::root())
            .try_collect()
            .await
            .expect("must decode");
        assert_eq!(
            rows,
            vec![row(json!({"rrd_id": 1})), row(json!({"rrd_id": 2}))]
        );
    }
}
