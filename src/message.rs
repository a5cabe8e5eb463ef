// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! Incoming and outgoing messages are closed sum types over three patterns:
//! fire-and-forget casts, requests expecting a reply, and responses to a prior
//! request. Every variant wraps an [`Envelope`] carrying the routing fields,
//! the property bag and a content value whose type changes as the message
//! moves through the encoding stages (raw bytes, decoded payload, ...).
//!
//! Responses never choose their own destination: it is derived from the
//! request they answer, and the correlation id is pinned to the request's.
//! The only way to start building a reply is
//! [`IncomingRequest::response_builder`].

use crate::{
    channel::BrokerDelivery,
    errors::EnvelopeError,
    exchange::DEFAULT_EXCHANGE,
    queue::DIRECT_REPLY_TO,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the encodings a requester accepts for its reply.
pub const HEADER_ACCEPT_ENCODING: &str = "accept-encoding";

/// AMQP delivery mode. Only the two values defined by the protocol exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

impl TryFrom<u8> for DeliveryMode {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DeliveryMode::Transient),
            2 => Ok(DeliveryMode::Persistent),
            other => Err(EnvelopeError::InvalidDeliveryMode(other)),
        }
    }
}

/// The property bag shared by every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub(crate) content_type: Option<String>,
    pub(crate) content_encoding: Option<String>,
    pub(crate) headers: FieldTable,
    pub(crate) delivery_mode: DeliveryMode,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) kind: Option<String>,
}

impl MessageProperties {
    /// Creates an empty property bag with transient delivery.
    pub fn new() -> Self {
        MessageProperties::default()
    }

    /// Sets the MIME type of the payload, e.g. `application/json`.
    ///
    /// The selected writer may replace it while encoding.
    ///
    /// # Parameters
    /// * `content_type` - The MIME type of the encoded payload
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the content encoding explicitly.
    ///
    /// Compression negotiation is skipped for messages that already carry
    /// an encoding, so the payload must already be encoded accordingly.
    ///
    /// # Parameters
    /// * `encoding` - An encoding token such as `gzip` or `identity`
    pub fn with_content_encoding(mut self, encoding: &str) -> Self {
        self.content_encoding = Some(encoding.to_owned());
        self
    }

    /// Adds a header, replacing any previous value under `key`.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    pub fn with_header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    /// Sets whether the broker persists the message.
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Sets the token linking a response to its request.
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Sets the queue a reply should be routed to.
    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    /// Sets the message type tag.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// The MIME type of the payload, if set.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The content encoding of the payload, if set. `None` means identity.
    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    /// All headers, trace context included.
    pub fn headers(&self) -> &FieldTable {
        &self.headers
    }

    /// The delivery mode, transient unless set otherwise.
    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// The correlation id, if set.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The reply destination, if set. Its presence makes a delivery a
    /// request.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// The message type tag, if set.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// A header value as text, when it is a string header.
    pub fn header_str(&self, key: &str) -> Option<String> {
        match self.headers.inner().get(key)? {
            AMQPValue::LongString(value) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
            _ => None,
        }
    }

    pub(crate) fn set_content_type(&mut self, content_type: &str) {
        self.content_type = Some(content_type.to_owned());
    }

    pub(crate) fn set_content_encoding(&mut self, encoding: &str) {
        self.content_encoding = Some(encoding.to_owned());
    }

    pub(crate) fn set_kind(&mut self, kind: &str) {
        self.kind = Some(kind.to_owned());
    }

    pub(crate) fn headers_mut(&mut self) -> &mut FieldTable {
        &mut self.headers
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_owned())
}

impl TryFrom<&BasicProperties> for MessageProperties {
    type Error = EnvelopeError;

    fn try_from(props: &BasicProperties) -> Result<Self, Self::Error> {
        let delivery_mode = match props.delivery_mode() {
            Some(mode) => DeliveryMode::try_from(*mode)?,
            None => DeliveryMode::default(),
        };

        Ok(MessageProperties {
            content_type: short(props.content_type()),
            content_encoding: short(props.content_encoding()),
            headers: props.headers().clone().unwrap_or_default(),
            delivery_mode,
            correlation_id: short(props.correlation_id()),
            reply_to: short(props.reply_to()),
            kind: short(props.kind()),
        })
    }
}

impl From<&MessageProperties> for BasicProperties {
    fn from(props: &MessageProperties) -> Self {
        let mut basic = BasicProperties::default()
            .with_delivery_mode(props.delivery_mode.as_u8())
            .with_headers(props.headers.clone());

        if let Some(value) = &props.content_type {
            basic = basic.with_content_type(ShortString::from(value.as_str()));
        }
        if let Some(value) = &props.content_encoding {
            basic = basic.with_content_encoding(ShortString::from(value.as_str()));
        }
        if let Some(value) = &props.correlation_id {
            basic = basic.with_correlation_id(ShortString::from(value.as_str()));
        }
        if let Some(value) = &props.reply_to {
            basic = basic.with_reply_to(ShortString::from(value.as_str()));
        }
        if let Some(value) = &props.kind {
            basic = basic.with_type(ShortString::from(value.as_str()));
        }

        basic
    }
}

/// Routing fields, properties and content common to every message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<C> {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    content: C,
}

impl<C> Envelope<C> {
    pub fn new(exchange: &str, routing_key: &str, properties: MessageProperties, content: C) -> Self {
        Envelope {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            content,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn content(&self) -> &C {
        &self.content
    }

    pub fn into_content(self) -> C {
        self.content
    }

    /// Same envelope with its content replaced; every other field is kept.
    pub fn with_content<D>(self, content: D) -> Envelope<D> {
        Envelope {
            exchange: self.exchange,
            routing_key: self.routing_key,
            properties: self.properties,
            content,
        }
    }

    pub(crate) fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    pub(crate) fn into_parts(self) -> (String, String, MessageProperties, C) {
        (self.exchange, self.routing_key, self.properties, self.content)
    }
}

/// Where a delivery came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// A received cast or response.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage<C> {
    envelope: Envelope<C>,
    delivery: DeliveryInfo,
}

impl<C> IncomingMessage<C> {
    pub fn envelope(&self) -> &Envelope<C> {
        &self.envelope
    }

    pub fn delivery(&self) -> &DeliveryInfo {
        &self.delivery
    }

    pub fn with_content<D>(self, content: D) -> IncomingMessage<D> {
        IncomingMessage {
            envelope: self.envelope.with_content(content),
            delivery: self.delivery,
        }
    }
}

/// What a response needs to know about the request it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) reply_to: String,
    pub(crate) correlation_id: String,
    pub(crate) accept_encoding: Option<String>,
}

impl RequestOrigin {
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The requester's Accept-Encoding preference for the reply, if any.
    pub fn accept_encoding(&self) -> Option<&str> {
        self.accept_encoding.as_deref()
    }

    fn of<C>(envelope: &Envelope<C>, reply_to: &str, correlation_id: &str) -> Self {
        RequestOrigin {
            exchange: envelope.exchange.clone(),
            routing_key: envelope.routing_key.clone(),
            reply_to: reply_to.to_owned(),
            correlation_id: correlation_id.to_owned(),
            accept_encoding: envelope.properties.header_str(HEADER_ACCEPT_ENCODING),
        }
    }
}

/// A received request. Reply-to and correlation id are always present.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest<C> {
    message: IncomingMessage<C>,
    origin: Arc<RequestOrigin>,
}

impl<C> IncomingRequest<C> {
    pub fn envelope(&self) -> &Envelope<C> {
        &self.message.envelope
    }

    pub fn delivery(&self) -> &DeliveryInfo {
        &self.message.delivery
    }

    pub fn reply_to(&self) -> &str {
        &self.origin.reply_to
    }

    pub fn correlation_id(&self) -> &str {
        &self.origin.correlation_id
    }

    pub fn origin(&self) -> Arc<RequestOrigin> {
        self.origin.clone()
    }

    /// Starts a reply addressed to this request's reply-to destination with
    /// its correlation id.
    pub fn response_builder(&self) -> OutgoingBuilder<()> {
        OutgoingBuilder::response(self.origin.clone())
    }

    pub fn with_content<D>(self, content: D) -> IncomingRequest<D> {
        IncomingRequest {
            message: self.message.with_content(content),
            origin: self.origin,
        }
    }
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming<C> {
    Cast(IncomingMessage<C>),
    Request(IncomingRequest<C>),
    Response(IncomingMessage<C>),
}

impl Incoming<Vec<u8>> {
    /// Classifies a delivery consumed from `queue`.
    ///
    /// Deliveries on the direct reply-to pseudo-queue are responses and must
    /// carry a correlation id. Otherwise a reply-to property makes the
    /// delivery a request (a missing correlation id is synthesized) and its
    /// absence a cast.
    pub fn from_delivery(delivery: BrokerDelivery, queue: &str) -> Result<Self, EnvelopeError> {
        let properties = MessageProperties::try_from(&delivery.properties)?;
        let info = DeliveryInfo {
            queue: queue.to_owned(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        };
        let mut envelope = Envelope {
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            properties,
            content: delivery.data,
        };

        if queue == DIRECT_REPLY_TO {
            if envelope.properties.correlation_id.is_none() {
                return Err(EnvelopeError::MissingCorrelationId);
            }
            return Ok(Incoming::Response(IncomingMessage {
                envelope,
                delivery: info,
            }));
        }

        let Some(reply_to) = envelope.properties.reply_to.clone() else {
            return Ok(Incoming::Cast(IncomingMessage {
                envelope,
                delivery: info,
            }));
        };

        let correlation_id = envelope
            .properties
            .correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let origin = Arc::new(RequestOrigin::of(&envelope, &reply_to, &correlation_id));

        Ok(Incoming::Request(IncomingRequest {
            message: IncomingMessage {
                envelope,
                delivery: info,
            },
            origin,
        }))
    }
}

impl<C> Incoming<C> {
    pub fn envelope(&self) -> &Envelope<C> {
        match self {
            Incoming::Cast(msg) | Incoming::Response(msg) => &msg.envelope,
            Incoming::Request(req) => &req.message.envelope,
        }
    }

    pub fn delivery(&self) -> &DeliveryInfo {
        match self {
            Incoming::Cast(msg) | Incoming::Response(msg) => &msg.delivery,
            Incoming::Request(req) => &req.message.delivery,
        }
    }

    pub fn content(&self) -> &C {
        &self.envelope().content
    }

    /// Same message with its content replaced; every other field is kept.
    pub fn with_content<D>(self, content: D) -> Incoming<D> {
        match self {
            Incoming::Cast(msg) => Incoming::Cast(msg.with_content(content)),
            Incoming::Request(req) => Incoming::Request(req.with_content(content)),
            Incoming::Response(msg) => Incoming::Response(msg.with_content(content)),
        }
    }
}

/// An outgoing request. Reply-to and correlation id are always present.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest<C> {
    envelope: Envelope<C>,
}

impl<C> OutgoingRequest<C> {
    pub fn envelope(&self) -> &Envelope<C> {
        &self.envelope
    }

    pub fn correlation_id(&self) -> &str {
        self.envelope.properties.correlation_id.as_deref().unwrap_or_default()
    }

    pub fn reply_to(&self) -> &str {
        self.envelope.properties.reply_to.as_deref().unwrap_or_default()
    }
}

/// An outgoing reply. Holds a shared reference to the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingResponse<C> {
    envelope: Envelope<C>,
    request: Arc<RequestOrigin>,
}

impl<C> OutgoingResponse<C> {
    pub fn envelope(&self) -> &Envelope<C> {
        &self.envelope
    }

    pub fn request(&self) -> &RequestOrigin {
        &self.request
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing<C> {
    Cast(Envelope<C>),
    Request(OutgoingRequest<C>),
    Response(OutgoingResponse<C>),
}

impl<C> Outgoing<C> {
    pub fn cast(exchange: &str, routing_key: &str, properties: MessageProperties, content: C) -> Self {
        Outgoing::Cast(Envelope::new(exchange, routing_key, properties, content))
    }

    /// A request; reply-to defaults to the direct reply-to pseudo-queue and
    /// the correlation id to a fresh random token.
    pub fn request(
        exchange: &str,
        routing_key: &str,
        mut properties: MessageProperties,
        content: C,
    ) -> Self {
        properties
            .reply_to
            .get_or_insert_with(|| DIRECT_REPLY_TO.to_owned());
        properties
            .correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());

        Outgoing::Request(OutgoingRequest {
            envelope: Envelope::new(exchange, routing_key, properties, content),
        })
    }

    /// A reply to `request`, published through the default exchange to the
    /// request's reply-to destination.
    pub fn response(
        request: Arc<RequestOrigin>,
        mut properties: MessageProperties,
        content: C,
    ) -> Result<Self, EnvelopeError> {
        match &properties.correlation_id {
            Some(id) if *id != request.correlation_id => {
                return Err(EnvelopeError::CorrelationMismatch {
                    expected: request.correlation_id.clone(),
                    found: id.clone(),
                });
            }
            _ => properties.correlation_id = Some(request.correlation_id.clone()),
        }

        Ok(Outgoing::Response(OutgoingResponse {
            envelope: Envelope::new(DEFAULT_EXCHANGE, &request.reply_to, properties, content),
            request,
        }))
    }

    pub fn envelope(&self) -> &Envelope<C> {
        match self {
            Outgoing::Cast(envelope) => envelope,
            Outgoing::Request(req) => &req.envelope,
            Outgoing::Response(res) => &res.envelope,
        }
    }

    pub(crate) fn envelope_mut(&mut self) -> &mut Envelope<C> {
        match self {
            Outgoing::Cast(envelope) => envelope,
            Outgoing::Request(req) => &mut req.envelope,
            Outgoing::Response(res) => &mut res.envelope,
        }
    }

    pub fn into_envelope(self) -> Envelope<C> {
        match self {
            Outgoing::Cast(envelope) => envelope,
            Outgoing::Request(req) => req.envelope,
            Outgoing::Response(res) => res.envelope,
        }
    }

    pub fn exchange(&self) -> &str {
        self.envelope().exchange()
    }

    pub fn routing_key(&self) -> &str {
        self.envelope().routing_key()
    }

    pub fn properties(&self) -> &MessageProperties {
        self.envelope().properties()
    }

    pub fn content(&self) -> &C {
        self.envelope().content()
    }

    /// The requester's Accept-Encoding preference when this is a reply.
    pub fn accept_encoding(&self) -> Option<&str> {
        match self {
            Outgoing::Response(res) => res.request.accept_encoding(),
            Outgoing::Cast(_) | Outgoing::Request(_) => None,
        }
    }

    /// Same message with its content replaced; every other field is kept.
    pub fn with_content<D>(self, content: D) -> Outgoing<D> {
        match self {
            Outgoing::Cast(envelope) => Outgoing::Cast(envelope.with_content(content)),
            Outgoing::Request(req) => Outgoing::Request(OutgoingRequest {
                envelope: req.envelope.with_content(content),
            }),
            Outgoing::Response(res) => Outgoing::Response(OutgoingResponse {
                envelope: res.envelope.with_content(content),
                request: res.request,
            }),
        }
    }

    /// A builder seeded with every field of this message.
    pub fn builder(self) -> OutgoingBuilder<C> {
        let pattern = match &self {
            Outgoing::Cast(_) => Pattern::Cast,
            Outgoing::Request(_) => Pattern::Request,
            Outgoing::Response(res) => Pattern::Response(res.request.clone()),
        };
        let (exchange, routing_key, properties, content) = self.into_envelope().into_parts();

        OutgoingBuilder {
            pattern,
            exchange,
            routing_key,
            properties,
            content: Some(content),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Pattern {
    Cast,
    Request,
    Response(Arc<RequestOrigin>),
}

/// Mutable builder for outgoing messages.
///
/// Builders seeded from a response keep the destination and correlation id of
/// the request: [`OutgoingBuilder::exchange`], [`OutgoingBuilder::routing_key`]
/// and a diverging [`OutgoingBuilder::correlation_id`] fail.
#[derive(Debug, Clone)]
pub struct OutgoingBuilder<C> {
    pattern: Pattern,
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    content: Option<C>,
}

impl OutgoingBuilder<()> {
    /// Starts a cast; set the content with [`OutgoingBuilder::content`].
    pub fn cast(exchange: &str, routing_key: &str) -> Self {
        OutgoingBuilder::new(Pattern::Cast, exchange, routing_key, MessageProperties::default())
    }

    /// Starts a request; set the content with [`OutgoingBuilder::content`].
    pub fn request(exchange: &str, routing_key: &str) -> Self {
        OutgoingBuilder::new(Pattern::Request, exchange, routing_key, MessageProperties::default())
    }
}

impl<C> OutgoingBuilder<C> {
    fn response(request: Arc<RequestOrigin>) -> Self {
        let properties = MessageProperties::default().with_correlation_id(&request.correlation_id);
        let reply_to = request.reply_to.clone();

        OutgoingBuilder::new(Pattern::Response(request), DEFAULT_EXCHANGE, &reply_to, properties)
    }

    fn new(pattern: Pattern, exchange: &str, routing_key: &str, properties: MessageProperties) -> Self {
        OutgoingBuilder {
            pattern,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            content: None,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Result<Self, EnvelopeError> {
        if let Pattern::Response(_) = self.pattern {
            return Err(EnvelopeError::DestinationPinned("exchange"));
        }
        self.exchange = exchange.to_owned();
        Ok(self)
    }

    pub fn routing_key(mut self, routing_key: &str) -> Result<Self, EnvelopeError> {
        if let Pattern::Response(_) = self.pattern {
            return Err(EnvelopeError::DestinationPinned("routing key"));
        }
        self.routing_key = routing_key.to_owned();
        Ok(self)
    }

    pub fn correlation_id(mut self, id: &str) -> Result<Self, EnvelopeError> {
        if let Pattern::Response(request) = &self.pattern {
            if request.correlation_id != id {
                return Err(EnvelopeError::CorrelationMismatch {
                    expected: request.correlation_id.clone(),
                    found: id.to_owned(),
                });
            }
        }
        self.properties.correlation_id = Some(id.to_owned());
        Ok(self)
    }

    /// Replaces the property bag. A response still fails to build if the new
    /// bag carries a different correlation id.
    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.properties.set_content_type(content_type);
        self
    }

    pub fn content_encoding(mut self, encoding: &str) -> Self {
        self.properties.set_content_encoding(encoding);
        self
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.properties.headers.insert(ShortString::from(key), value);
        self
    }

    /// Asks the responder to compress its reply with one of `encodings`.
    pub fn accept_encoding(self, encodings: &str) -> Self {
        self.header(
            HEADER_ACCEPT_ENCODING,
            AMQPValue::LongString(LongString::from(encodings)),
        )
    }

    pub fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.properties.delivery_mode = mode;
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.properties.set_kind(kind);
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.properties.reply_to = Some(reply_to.to_owned());
        self
    }

    /// Sets the content, possibly changing its type.
    pub fn content<D>(self, content: D) -> OutgoingBuilder<D> {
        OutgoingBuilder {
            pattern: self.pattern,
            exchange: self.exchange,
            routing_key: self.routing_key,
            properties: self.properties,
            content: Some(content),
        }
    }

    pub fn build(self) -> Result<Outgoing<C>, EnvelopeError> {
        let content = self.content.ok_or(EnvelopeError::MissingContent)?;

        match self.pattern {
            Pattern::Cast => Ok(Outgoing::cast(
                &self.exchange,
                &self.routing_key,
                self.properties,
                content,
            )),
            Pattern::Request => Ok(Outgoing::request(
                &self.exchange,
                &self.routing_key,
                self.properties,
                content,
            )),
            Pattern::Response(request) => Outgoing::response(request, self.properties, content),
        }
    }
}
