// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Serialization Negotiation
//!
//! Converts between wire bytes and application payloads. Readers and writers
//! are registered on a [`Negotiator`]; for each message the applicable entry
//! with the highest priority is used.
//!
//! Encoding runs in a fixed order:
//! 1. properties already set on the outgoing message are kept as they are,
//! 2. compression is negotiated against the requester's Accept-Encoding
//!    preference, unless a content-encoding is already set,
//! 3. the selected writer serializes into a size-bounded sink, through the
//!    negotiated compressor, and may set content-type or the type tag.
//!
//! Decoding undoes the content-encoding before the selected reader runs.

use crate::{
    config::{BridgeConfig, DEFAULT_MAX_MESSAGE_SIZE},
    encoding::{negotiate, ContentEncoding},
    errors::{CodecError, EncodingError},
    message::{Incoming, MessageProperties, Outgoing},
};
use flate2::{
    read::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::type_name,
    io::{self, Read, Write},
    marker::PhantomData,
    sync::Arc,
};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

/// Turns wire bytes into a `T`.
pub trait MessageReader<T>: Send + Sync {
    fn is_applicable(&self, message: &Incoming<Vec<u8>>) -> bool;

    fn priority(&self) -> i32 {
        0
    }

    fn read(&self, properties: &MessageProperties, input: &mut dyn Read) -> Result<T, CodecError>;
}

/// Turns a `T` into wire bytes. May set content-type and the type tag.
pub trait MessageWriter<T>: Send + Sync {
    fn is_applicable(&self, message: &Outgoing<T>) -> bool;

    fn priority(&self) -> i32 {
        0
    }

    fn write(
        &self,
        value: &T,
        properties: &mut MessageProperties,
        output: &mut dyn Write,
    ) -> Result<(), CodecError>;
}

/// Registry of readers and writers for payload type `T`.
pub struct Negotiator<T> {
    readers: Vec<Arc<dyn MessageReader<T>>>,
    writers: Vec<Arc<dyn MessageWriter<T>>>,
    max_size: usize,
    compression: bool,
}

impl<T: 'static> Default for Negotiator<T> {
    fn default() -> Self {
        Negotiator::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl<T: 'static> Negotiator<T> {
    /// An empty registry whose encoded and decoded messages are bounded by
    /// `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Negotiator {
            readers: vec![],
            writers: vec![],
            max_size,
            compression: true,
        }
    }

    /// An empty registry bounded by the configured `max_message_size`.
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Negotiator::new(cfg.max_message_size)
    }

    pub fn with_reader(mut self, reader: impl MessageReader<T> + 'static) -> Self {
        self.readers.push(Arc::new(reader));
        self
    }

    pub fn with_writer(mut self, writer: impl MessageWriter<T> + 'static) -> Self {
        self.writers.push(Arc::new(writer));
        self
    }

    /// Disables compression negotiation; messages are written as identity.
    pub fn without_compression(mut self) -> Self {
        self.compression = false;
        self
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn reader_for(&self, message: &Incoming<Vec<u8>>) -> Result<&dyn MessageReader<T>, CodecError> {
        self.readers
            .iter()
            .filter(|reader| reader.is_applicable(message))
            .max_by_key(|reader| reader.priority())
            .map(|reader| reader.as_ref())
            .ok_or(CodecError::NoReader(type_name::<T>()))
    }

    pub fn writer_for(&self, message: &Outgoing<T>) -> Result<&dyn MessageWriter<T>, CodecError> {
        self.writers
            .iter()
            .filter(|writer| writer.is_applicable(message))
            .max_by_key(|writer| writer.priority())
            .map(|writer| writer.as_ref())
            .ok_or(CodecError::NoWriter(type_name::<T>()))
    }

    /// Decodes the raw content, keeping every other field of the message.
    pub fn decode(&self, message: Incoming<Vec<u8>>) -> Result<Incoming<T>, CodecError> {
        let reader = self.reader_for(&message)?;
        let value = self.read_content(reader, &message)?;

        Ok(message.with_content(value))
    }

    fn read_content(
        &self,
        reader: &dyn MessageReader<T>,
        message: &Incoming<Vec<u8>>,
    ) -> Result<T, CodecError> {
        let properties = message.envelope().properties();

        let encoding = match properties.content_encoding() {
            None => ContentEncoding::Identity,
            Some(token) => ContentEncoding::from_token(token)
                .ok_or_else(|| EncodingError::Unsupported(token.to_owned()))?,
        };

        let bytes = message.content().as_slice();
        let source: Box<dyn Read + '_> = match encoding {
            ContentEncoding::Identity => Box::new(bytes),
            ContentEncoding::Gzip => Box::new(GzDecoder::new(bytes)),
            ContentEncoding::Deflate => Box::new(ZlibDecoder::new(bytes)),
        };
        let mut input = BoundedSource::new(source, self.max_size);

        match reader.read(properties, &mut input) {
            Err(_) if input.overflowed() => Err(CodecError::TooLarge {
                max: self.max_size,
            }),
            result => result,
        }
    }

    /// Encodes the content, keeping routing and every property the writer
    /// does not set.
    pub fn encode(&self, message: Outgoing<T>) -> Result<Outgoing<Vec<u8>>, CodecError> {
        let writer = self.writer_for(&message)?;
        let mut properties = message.properties().clone();

        let encoding = if !self.compression || properties.content_encoding().is_some() {
            ContentEncoding::Identity
        } else {
            negotiate(message.accept_encoding(), &ContentEncoding::ALL)?
        };

        let mut sink = BoundedSink::new(self.max_size);
        if let Err(err) = write_through(writer, message.content(), &mut properties, &mut sink, encoding)
        {
            if sink.overflowed() {
                return Err(CodecError::TooLarge {
                    max: self.max_size,
                });
            }
            return Err(err);
        }

        if encoding != ContentEncoding::Identity {
            properties.set_content_encoding(encoding.token());
        }

        let mut encoded = message.with_content(sink.into_inner());
        *encoded.envelope_mut().properties_mut() = properties;
        Ok(encoded)
    }
}

fn write_through<T>(
    writer: &dyn MessageWriter<T>,
    value: &T,
    properties: &mut MessageProperties,
    sink: &mut BoundedSink,
    encoding: ContentEncoding,
) -> Result<(), CodecError> {
    let mut output = EncodingSink::new(sink, encoding);
    writer.write(value, properties, &mut output)?;
    output
        .finish()
        .map_err(|err| CodecError::Encode(err.to_string()))
}

/// In-memory output that refuses any write taking it past `max` bytes.
///
/// A rejected write leaves the buffer untouched, so at most `max` bytes are
/// ever stored.
#[derive(Debug)]
pub struct BoundedSink {
    buf: Vec<u8>,
    max: usize,
    overflowed: bool,
}

impl BoundedSink {
    pub fn new(max: usize) -> Self {
        BoundedSink {
            buf: vec![],
            max,
            overflowed: false,
        }
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for BoundedSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.max {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("message too large: exceeds the maximum of {} bytes", self.max),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum EncodingSink<'a> {
    Identity(&'a mut BoundedSink),
    Gzip(GzEncoder<&'a mut BoundedSink>),
    Deflate(ZlibEncoder<&'a mut BoundedSink>),
}

impl<'a> EncodingSink<'a> {
    fn new(sink: &'a mut BoundedSink, encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => EncodingSink::Identity(sink),
            ContentEncoding::Gzip => EncodingSink::Gzip(GzEncoder::new(sink, Compression::default())),
            ContentEncoding::Deflate => {
                EncodingSink::Deflate(ZlibEncoder::new(sink, Compression::default()))
            }
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            EncodingSink::Identity(_) => Ok(()),
            EncodingSink::Gzip(encoder) => encoder.finish().map(|_| ()),
            EncodingSink::Deflate(encoder) => encoder.finish().map(|_| ()),
        }
    }
}

impl Write for EncodingSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            EncodingSink::Identity(sink) => sink.write(data),
            EncodingSink::Gzip(encoder) => encoder.write(data),
            EncodingSink::Deflate(encoder) => encoder.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EncodingSink::Identity(sink) => sink.flush(),
            EncodingSink::Gzip(encoder) => encoder.flush(),
            EncodingSink::Deflate(encoder) => encoder.flush(),
        }
    }
}

/// Input that fails once more than `max` bytes would be produced, which
/// guards decompression of oversized payloads.
struct BoundedSource<R> {
    inner: R,
    remaining: usize,
    overflowed: bool,
}

impl<R: Read> BoundedSource<R> {
    fn new(inner: R, max: usize) -> Self {
        BoundedSource {
            inner,
            remaining: max,
            overflowed: false,
        }
    }

    fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl<R: Read> Read for BoundedSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.remaining == 0 {
            let mut probe = [0u8; 1];
            if self.inner.read(&mut probe)? > 0 {
                self.overflowed = true;
                return Err(io::Error::new(io::ErrorKind::Other, "message too large"));
            }
            return Ok(0);
        }

        let limit = buf.len().min(self.remaining);
        let read = self.inner.read(&mut buf[..limit])?;
        self.remaining -= read;
        Ok(read)
    }
}

/// JSON codec backed by serde.
///
/// Reads messages whose content-type is JSON (or missing) and writes any
/// message, setting the JSON content-type and, when configured, a type tag.
pub struct JsonCodec<T> {
    kind: Option<String>,
    priority: i32,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec {
            kind: None,
            priority: 0,
            _payload: PhantomData,
        }
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec::default()
    }

    /// Type tag written to messages that don't carry one yet.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

fn is_json(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(value) => {
            let essence = value.split(';').next().unwrap_or_default().trim();
            essence.eq_ignore_ascii_case(JSON_CONTENT_TYPE) || essence.ends_with("+json")
        }
    }
}

impl<T: DeserializeOwned> MessageReader<T> for JsonCodec<T> {
    fn is_applicable(&self, message: &Incoming<Vec<u8>>) -> bool {
        is_json(message.envelope().properties().content_type())
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn read(&self, _: &MessageProperties, input: &mut dyn Read) -> Result<T, CodecError> {
        serde_json::from_reader(input).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

impl<T: Serialize> MessageWriter<T> for JsonCodec<T> {
    fn is_applicable(&self, _: &Outgoing<T>) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn write(
        &self,
        value: &T,
        properties: &mut MessageProperties,
        output: &mut dyn Write,
    ) -> Result<(), CodecError> {
        serde_json::to_writer(output, value).map_err(|err| CodecError::Encode(err.to_string()))?;

        properties.set_content_type(JSON_CONTENT_TYPE);
        if let (None, Some(kind)) = (properties.kind(), &self.kind) {
            properties.set_kind(kind);
        }
        Ok(())
    }
}

/// UTF-8 text codec for `String` payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl MessageReader<String> for TextCodec {
    fn is_applicable(&self, message: &Incoming<Vec<u8>>) -> bool {
        message
            .envelope()
            .properties()
            .content_type()
            .is_some_and(|value| value.starts_with("text/"))
    }

    fn read(&self, _: &MessageProperties, input: &mut dyn Read) -> Result<String, CodecError> {
        let mut text = String::new();
        input
            .read_to_string(&mut text)
            .map_err(|err| CodecError::Decode(err.to_string()))?;
        Ok(text)
    }
}

impl MessageWriter<String> for TextCodec {
    fn is_applicable(&self, _: &Outgoing<String>) -> bool {
        true
    }

    fn write(
        &self,
        value: &String,
        properties: &mut MessageProperties,
        output: &mut dyn Write,
    ) -> Result<(), CodecError> {
        output
            .write_all(value.as_bytes())
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        properties.set_content_type(TEXT_CONTENT_TYPE);
        Ok(())
    }
}

/// Pass-through codec for raw bytes. Lowest priority, so it only applies
/// when nothing more specific does.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl MessageReader<Vec<u8>> for BytesCodec {
    fn is_applicable(&self, _: &Incoming<Vec<u8>>) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn read(&self, _: &MessageProperties, input: &mut dyn Read) -> Result<Vec<u8>, CodecError> {
        let mut bytes = vec![];
        input
            .read_to_end(&mut bytes)
            .map_err(|err| CodecError::Decode(err.to_string()))?;
        Ok(bytes)
    }
}

impl MessageWriter<Vec<u8>> for BytesCodec {
    fn is_applicable(&self, _: &Outgoing<Vec<u8>>) -> bool {
        true
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn write(
        &self,
        value: &Vec<u8>,
        properties: &mut MessageProperties,
        output: &mut dyn Write,
    ) -> Result<(), CodecError> {
        output
            .write_all(value)
            .map_err(|err| CodecError::Encode(err.to_string()))?;
        if properties.content_type().is_none() {
            properties.set_content_type(BYTES_CONTENT_TYPE);
        }
        Ok(())
    }
}
