use std::fmt;

use arbflow_helpers::{
    consumers::StreamMessage,
    opportunities::{
        validate_opportunity_message, Opportunity, ValidationOutcome, DATA_FIELD,
        STREAM_INIT_TYPE, TYPE_FIELD,
    },
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    consts::{
        FAST_LANE_STREAM, HEALTH_STREAM, OPPORTUNITIES_STREAM, PRICE_UPDATES_STREAM,
        SWAP_EVENTS_STREAM, VOLUME_AGGREGATES_STREAM, WHALE_ALERTS_STREAM,
    },
    types::ServiceHealth,
};

/// A swap observed by a detector, used to keep the active pair
/// tracker warm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEvent {
    pub pair_address: String,
    pub chain: String,
    pub dex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_usd: Option<f64>,
    pub timestamp: u64,
}

/// A large transfer flagged by a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleAlert {
    pub token: String,
    pub chain: String,
    pub amount_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub timestamp: u64,
}

/// A windowed trading volume aggregate for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAggregate {
    pub pair_address: String,
    pub chain: String,
    pub window_ms: u64,
    pub volume_usd: f64,
    pub swap_count: u64,
    pub timestamp: u64,
}

/// A token price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub token: String,
    pub chain: String,
    pub price_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: u64,
}

/// A delivered stream entry decoded into its per-stream payload type.
#[derive(Debug)]
pub enum StreamPayload {
    Health(Box<ServiceHealth>),
    Opportunity(Box<Opportunity>),
    WhaleAlert(WhaleAlert),
    SwapEvent(SwapEvent),
    VolumeAggregate(VolumeAggregate),
    PriceUpdate(PriceUpdate),
    /// A broker-level system message; acknowledged silently.
    StreamInit,
}

/// Why a stream entry could not be decoded.
#[derive(Debug)]
pub enum PayloadError {
    /// The entry carried no payload at all.
    Empty,
    /// The payload was present but structurally invalid.
    Malformed { code: &'static str, details: String },
    /// The entry arrived on a stream this coordinator does not route.
    UnknownStream(String),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PayloadError::Empty => write!(f, "stream entry carries no payload"),
            PayloadError::Malformed { code, details } => {
                write!(f, "malformed stream payload ({code}): {details}")
            }
            PayloadError::UnknownStream(stream) => {
                write!(f, "no payload decoder registered for stream {stream}")
            }
        }
    }
}

impl std::error::Error for PayloadError {}

fn parse_json_payload<T: DeserializeOwned>(
    message: &StreamMessage,
) -> Result<T, PayloadError> {
    let payload = message.field(DATA_FIELD).ok_or(PayloadError::Empty)?;
    serde_json::from_str(payload).map_err(|err| PayloadError::Malformed {
        code: "malformed_payload",
        details: err.to_string(),
    })
}

/// Decodes a delivered entry according to the stream it arrived on.
pub fn parse_stream_payload(
    stream: &str,
    message: &StreamMessage,
) -> Result<StreamPayload, PayloadError> {
    if message.fields.is_empty() {
        return Err(PayloadError::Empty);
    }

    if message.field(TYPE_FIELD) == Some(STREAM_INIT_TYPE) {
        return Ok(StreamPayload::StreamInit);
    }

    match stream {
        HEALTH_STREAM => Ok(StreamPayload::Health(Box::new(parse_json_payload(
            message,
        )?))),
        OPPORTUNITIES_STREAM | FAST_LANE_STREAM => {
            match validate_opportunity_message(message) {
                ValidationOutcome::Ok(opportunity) => {
                    Ok(StreamPayload::Opportunity(opportunity))
                }
                ValidationOutcome::Reject { code, details } => {
                    Err(PayloadError::Malformed { code, details })
                }
                ValidationOutcome::System => Ok(StreamPayload::StreamInit),
                ValidationOutcome::Empty => Err(PayloadError::Empty),
            }
        }
        WHALE_ALERTS_STREAM => Ok(StreamPayload::WhaleAlert(parse_json_payload(message)?)),
        SWAP_EVENTS_STREAM => Ok(StreamPayload::SwapEvent(parse_json_payload(message)?)),
        VOLUME_AGGREGATES_STREAM => Ok(StreamPayload::VolumeAggregate(parse_json_payload(
            message,
        )?)),
        PRICE_UPDATES_STREAM => Ok(StreamPayload::PriceUpdate(parse_json_payload(message)?)),
        other => Err(PayloadError::UnknownStream(other.to_string())),
    }
}
