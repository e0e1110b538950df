//! Envelope protocol for requests and responses exchanged over the bus.
//!
//! Every envelope is serialised as a single JSON object. The recipient is an
//! address of the form `routing.key[:exchange]`; the exchange and routing key
//! used for publishing are derived from it whenever it changes.
//!
//! Decoding never panics and the receive path never has to propagate a
//! decoding failure: [`Message::decode_lossy`] always yields an envelope,
//! carrying the failure in [`Message::errors`] when the payload was
//! malformed.

use std::str::FromStr;

use emissary_config::{Address, ExchangeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{EmissaryError, ErrorKind};

/// Outcome recorded on an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StatusType {
    /// The request succeeded, or this is a request.
    #[default]
    Ok,
    /// The request failed; `status_note` explains why.
    Error,
}

/// A request or response envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    uuid: Uuid,
    originator: String,
    recipient: String,
    message_type: String,
    args: Vec<Value>,
    status_type: StatusType,
    status_note: String,
    exchange_type: Option<ExchangeKind>,
    routing_key: String,
    in_reply_to: Option<Uuid>,
    sent_at: Option<OffsetDateTime>,
    received_at: Option<OffsetDateTime>,
    errors: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    uuid: Option<Uuid>,
    #[serde(default)]
    originator: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(rename = "type", default)]
    message_type: Option<String>,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    status_type: StatusType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    status_note: String,
    #[serde(default)]
    exchange_type: Option<String>,
    #[serde(default)]
    routing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<Uuid>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    sent_at: Option<OffsetDateTime>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    received_at: Option<OffsetDateTime>,
}

impl Message {
    /// Builds a fresh request with a new uuid.
    pub fn new(
        originator: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        let mut message = Self {
            uuid: Uuid::new_v4(),
            originator: originator.into(),
            recipient: String::new(),
            message_type: message_type.into(),
            args,
            status_type: StatusType::Ok,
            status_note: String::new(),
            exchange_type: None,
            routing_key: String::new(),
            in_reply_to: None,
            sent_at: None,
            received_at: None,
            errors: Vec::new(),
        };
        message.set_recipient(recipient);
        message
    }

    /// Serialises the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidMessageFormat`] if an argument cannot be
    /// represented as JSON.
    pub fn encode(&self) -> Result<Vec<u8>, EmissaryError> {
        let wire = WireMessage {
            uuid: Some(self.uuid),
            originator: Some(self.originator.clone()),
            recipient: Some(self.recipient.clone()),
            message_type: Some(self.message_type.clone()),
            args: self.args.clone(),
            status_type: self.status_type,
            status_note: self.status_note.clone(),
            exchange_type: self.exchange_type.map(|kind| kind.to_string()),
            routing_key: Some(self.routing_key.clone()),
            in_reply_to: self.in_reply_to,
            sent_at: self.sent_at,
            received_at: self.received_at,
        };
        serde_json::to_vec(&wire).map_err(|error| {
            EmissaryError::with_origin(
                ErrorKind::InvalidMessageFormat,
                "envelope could not be serialised",
                error,
            )
        })
    }

    /// Parses an envelope from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidMessageFormat`] when the payload is not a
    /// JSON object, when `uuid`, `recipient` or `type` is absent, or when the
    /// exchange type is not one of the known kinds.
    pub fn decode(bytes: &[u8]) -> Result<Self, EmissaryError> {
        let wire: WireMessage = serde_json::from_slice(bytes).map_err(|error| {
            EmissaryError::with_origin(
                ErrorKind::InvalidMessageFormat,
                "payload is not a well-formed envelope",
                error,
            )
        })?;

        let missing: Vec<&str> = [
            ("uuid", wire.uuid.is_none()),
            ("recipient", is_blank(wire.recipient.as_deref())),
            ("type", is_blank(wire.message_type.as_deref())),
        ]
        .into_iter()
        .filter_map(|(field, absent)| absent.then_some(field))
        .collect();
        if !missing.is_empty() {
            return Err(EmissaryError::invalid_message_format(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let exchange_type = wire
            .exchange_type
            .as_deref()
            .map(|kind| {
                ExchangeKind::from_str(kind).map_err(|_| {
                    EmissaryError::invalid_message_format(format!("unknown exchange type '{kind}'"))
                })
            })
            .transpose()?;

        let recipient = wire.recipient.unwrap_or_default();
        let routing_key = wire
            .routing_key
            .unwrap_or_else(|| routing_key_of(&recipient));
        Ok(Self {
            uuid: wire.uuid.unwrap_or_else(Uuid::new_v4),
            originator: wire.originator.unwrap_or_default(),
            recipient,
            message_type: wire.message_type.unwrap_or_default(),
            args: wire.args,
            status_type: wire.status_type,
            status_note: wire.status_note,
            exchange_type,
            routing_key,
            in_reply_to: wire.in_reply_to,
            sent_at: wire.sent_at,
            received_at: wire.received_at,
            errors: Vec::new(),
        })
    }

    /// Parses an envelope, turning a decoding failure into an error-flagged
    /// envelope instead of an `Err`.
    ///
    /// Whatever could be salvaged from the payload (uuid, originator,
    /// recipient, type) is kept so the failure can be reported back to the
    /// sender.
    #[must_use]
    pub fn decode_lossy(bytes: &[u8]) -> Self {
        match Self::decode(bytes) {
            Ok(message) => message,
            Err(error) => Self::undecodable(bytes, &error),
        }
    }

    fn undecodable(bytes: &[u8], error: &EmissaryError) -> Self {
        let partial: Value = serde_json::from_slice(bytes).unwrap_or(Value::Null);
        let text = |field: &str| {
            partial
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let uuid = partial
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::new_v4);

        let mut message = Self::new(text("originator"), text("recipient"), text("type"), Vec::new());
        message.uuid = uuid;
        message.status_type = StatusType::Error;
        message.status_note = error.to_string();
        message.errors.push(error.to_string());
        message
    }

    /// Builds the reply to this envelope.
    ///
    /// Originator and recipient are swapped, the status is `ok`, the
    /// argument list is empty and the reply records this envelope's uuid in
    /// `in_reply_to`.
    #[must_use]
    pub fn response(&self) -> Self {
        let mut reply = Self::new(
            self.recipient.clone(),
            self.originator.clone(),
            self.message_type.clone(),
            Vec::new(),
        );
        reply.in_reply_to = Some(self.uuid);
        reply
    }

    /// Builds an error reply carrying `note`.
    #[must_use]
    pub fn error_response(&self, note: impl Into<String>) -> Self {
        let mut reply = self.response();
        reply.set_status(StatusType::Error, note);
        reply
    }

    /// Records the send time; later calls leave the first stamp intact.
    pub fn stamp_sent(&mut self) -> &mut Self {
        if self.sent_at.is_none() {
            self.sent_at = Some(OffsetDateTime::now_utc());
        }
        self
    }

    /// Records the receive time; later calls leave the first stamp intact.
    pub fn stamp_received(&mut self) -> &mut Self {
        if self.received_at.is_none() {
            self.received_at = Some(OffsetDateTime::now_utc());
        }
        self
    }

    /// Readdresses the envelope, deriving exchange and routing key from the
    /// `routing.key[:exchange]` address.
    ///
    /// An address that cannot be parsed leaves the exchange unset, so a later
    /// send fails with [`ErrorKind::InvalidExchange`].
    pub fn set_recipient(&mut self, recipient: impl Into<String>) -> &mut Self {
        self.recipient = recipient.into();
        match self.recipient.parse::<Address>() {
            Ok(address) => {
                self.exchange_type = Some(address.exchange());
                self.routing_key = address.routing_key().to_owned();
            }
            Err(_) => {
                self.exchange_type = None;
                self.routing_key = self.recipient.clone();
            }
        }
        self
    }

    /// Replaces the positional arguments.
    pub fn set_args(&mut self, args: Vec<Value>) -> &mut Self {
        self.args = args;
        self
    }

    /// Sets the status and its note.
    pub fn set_status(&mut self, status: StatusType, note: impl Into<String>) -> &mut Self {
        self.status_type = status;
        self.status_note = note.into();
        self
    }

    /// Unique identifier of this envelope.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Address of the sender.
    #[must_use]
    pub fn originator(&self) -> &str {
        &self.originator
    }

    /// Address of the receiver.
    #[must_use]
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Operation name, `agent.method` or a bare method.
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Positional arguments.
    #[must_use]
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Outcome status.
    #[must_use]
    pub fn status_type(&self) -> StatusType {
        self.status_type
    }

    /// Human-readable status detail.
    #[must_use]
    pub fn status_note(&self) -> &str {
        &self.status_note
    }

    /// Exchange the envelope is published on.
    #[must_use]
    pub fn exchange_type(&self) -> Option<ExchangeKind> {
        self.exchange_type
    }

    /// Routing key the envelope is published with.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Uuid of the request this envelope answers.
    #[must_use]
    pub fn in_reply_to(&self) -> Option<Uuid> {
        self.in_reply_to
    }

    /// Time the envelope was sent.
    #[must_use]
    pub fn sent_at(&self) -> Option<OffsetDateTime> {
        self.sent_at
    }

    /// Time the envelope was received.
    #[must_use]
    pub fn received_at(&self) -> Option<OffsetDateTime> {
        self.received_at
    }

    /// Decoding failures attached to an inbound envelope.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Whether decoding failed for this envelope.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|text| text.trim().is_empty())
}

fn routing_key_of(recipient: &str) -> String {
    recipient
        .parse::<Address>()
        .map_or_else(|_| recipient.to_owned(), |address| address.routing_key().to_owned())
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use serde_json::json;

    use super::*;

    #[fixture]
    fn request() -> Message {
        Message::new(
            "operator.console:direct",
            "request.2.12:topic",
            "emissary.selfupdate",
            vec![json!("1.2.0"), json!({"force": true}), json!(3)],
        )
    }

    #[rstest]
    fn round_trip_preserves_addressing_and_payload(request: Message) {
        let bytes = request.encode().expect("encode");
        let decoded = Message::decode(&bytes).expect("decode");

        assert_eq!(decoded.uuid(), request.uuid());
        assert_eq!(decoded.originator(), request.originator());
        assert_eq!(decoded.recipient(), request.recipient());
        assert_eq!(decoded.message_type(), request.message_type());
        assert_eq!(decoded.args(), request.args());
        assert_eq!(decoded.exchange_type(), Some(ExchangeKind::Topic));
        assert_eq!(decoded.routing_key(), "request.2.12");
        assert!(!decoded.has_errors());
    }

    #[rstest]
    #[case(json!({"recipient": "a:topic", "type": "ping"}), "uuid")]
    #[case(json!({"uuid": Uuid::new_v4(), "type": "ping"}), "recipient")]
    #[case(json!({"uuid": Uuid::new_v4(), "recipient": "a:topic"}), "type")]
    fn decode_rejects_missing_required_fields(#[case] payload: Value, #[case] field: &str) {
        let bytes = serde_json::to_vec(&payload).expect("payload");
        let error = Message::decode(&bytes).expect_err("decode should fail");
        assert!(error.matches(ErrorKind::InvalidMessageFormat));
        assert!(error.message().contains(field), "{error}");
    }

    #[test]
    fn decode_rejects_unknown_exchange() {
        let payload = json!({
            "uuid": Uuid::new_v4(),
            "recipient": "a",
            "type": "ping",
            "exchange_type": "multicast",
        });
        let bytes = serde_json::to_vec(&payload).expect("payload");
        let error = Message::decode(&bytes).expect_err("decode should fail");
        assert!(error.matches(ErrorKind::InvalidMessageFormat));
    }

    #[test]
    fn lossy_decode_keeps_salvageable_fields() {
        let uuid = Uuid::new_v4();
        let payload = json!({"uuid": uuid.to_string(), "originator": "console:direct"});
        let bytes = serde_json::to_vec(&payload).expect("payload");

        let message = Message::decode_lossy(&bytes);
        assert_eq!(message.uuid(), uuid);
        assert_eq!(message.originator(), "console:direct");
        assert_eq!(message.status_type(), StatusType::Error);
        assert_eq!(message.errors().len(), 1);
    }

    #[test]
    fn lossy_decode_survives_garbage() {
        let message = Message::decode_lossy(b"\xff\x00not json");
        assert!(message.has_errors());
        assert!(message.errors()[0].contains("invalid message format"));
    }

    #[rstest]
    fn response_swaps_parties(request: Message) {
        let reply = request.response();
        assert_ne!(reply.uuid(), request.uuid());
        assert_eq!(reply.in_reply_to(), Some(request.uuid()));
        assert_eq!(reply.originator(), request.recipient());
        assert_eq!(reply.recipient(), request.originator());
        assert_eq!(reply.exchange_type(), Some(ExchangeKind::Direct));
        assert_eq!(reply.routing_key(), "operator.console");
        assert_eq!(reply.status_type(), StatusType::Ok);
        assert!(reply.args().is_empty());
    }

    #[rstest]
    fn error_response_carries_note(request: Message) {
        let reply = request.error_response("method not permitted");
        assert_eq!(reply.status_type(), StatusType::Error);
        assert_eq!(reply.status_note(), "method not permitted");
    }

    #[rstest]
    fn stamps_are_set_once(mut request: Message) {
        let first = request.stamp_sent().sent_at();
        assert!(first.is_some());
        let second = request.stamp_sent().sent_at();
        assert_eq!(first, second);

        assert!(request.received_at().is_none());
        request.stamp_received();
        assert!(request.received_at().is_some());
    }

    #[test]
    fn unparsable_recipient_leaves_exchange_unset() {
        let message = Message::new("me:direct", ":topic", "ping", Vec::new());
        assert_eq!(message.exchange_type(), None);
    }
}
