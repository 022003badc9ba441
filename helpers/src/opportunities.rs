use serde::{Deserialize, Serialize};

use crate::consumers::StreamMessage;

/// The chains the platform currently routes cross-chain trades across.
pub const SUPPORTED_CHAINS: &[&str] = &[
    "ethereum",
    "arbitrum",
    "optimism",
    "base",
    "polygon",
    "bsc",
    "avalanche",
];

/// The field under which stream entries carry their JSON payload.
pub const DATA_FIELD: &str = "data";

/// The field used by broker-level system messages such as the entry
/// written when a stream is initialised.
pub const TYPE_FIELD: &str = "type";

/// The `type` value of the placeholder entry written when a stream
/// is created; carries no payload and must be acknowledged silently.
pub const STREAM_INIT_TYPE: &str = "stream-init";

/// The shape of a detected trade opportunity as published by
/// the detector services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OpportunityKind,
    pub token_in: String,
    pub token_out: String,
    /// A non-negative integer amount in the token's smallest unit,
    /// kept as a string to avoid precision loss for 256-bit amounts.
    pub amount_in: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_percentage: Option<f64>,
    pub confidence: f64,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_chain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OpportunityStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityKind {
    #[serde(rename = "simple")]
    Simple,
    #[serde(rename = "cross-dex")]
    CrossDex,
    #[serde(rename = "triangular")]
    Triangular,
    #[serde(rename = "quadrilateral")]
    Quadrilateral,
    #[serde(rename = "multi-leg")]
    MultiLeg,
    #[serde(rename = "cross-chain")]
    CrossChain,
    #[serde(rename = "predictive")]
    Predictive,
    #[serde(rename = "intra-dex")]
    IntraDex,
    #[serde(rename = "flash-loan")]
    FlashLoan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl Opportunity {
    /// Serializes the opportunity into the field pairs used to publish
    /// it to a stream.
    pub fn to_stream_fields(&self) -> Vec<(String, String)> {
        let payload = serde_json::to_string(self)
            .unwrap_or_else(|_| "{}".to_string());
        vec![(DATA_FIELD.to_string(), payload)]
    }
}

/// The result of structurally validating a delivered stream entry
/// as an opportunity.
#[derive(Debug)]
pub enum ValidationOutcome {
    Ok(Box<Opportunity>),
    Reject {
        code: &'static str,
        details: String,
    },
    /// A broker-level system message with no payload to process.
    System,
    /// An entry with no usable payload at all.
    Empty,
}

/// Structurally validates a stream entry as an opportunity.
///
/// Business-rule checks (profit thresholds, confidence floors,
/// duplicate suppression) are the caller's concern; this only
/// establishes that the payload is a well-formed opportunity.
pub fn validate_opportunity_message(message: &StreamMessage) -> ValidationOutcome {
    if message.fields.is_empty() {
        return ValidationOutcome::Empty;
    }

    if message.field(TYPE_FIELD) == Some(STREAM_INIT_TYPE) {
        return ValidationOutcome::System;
    }

    let payload = match message.field(DATA_FIELD) {
        Some(payload) => payload,
        None => return ValidationOutcome::Empty,
    };

    let opportunity: Opportunity = match serde_json::from_str(payload) {
        Ok(opportunity) => opportunity,
        Err(err) => {
            return ValidationOutcome::Reject {
                code: "malformed_payload",
                details: err.to_string(),
            }
        }
    };

    validate_opportunity(opportunity)
}

/// Applies the structural invariants to an already-parsed opportunity.
pub fn validate_opportunity(opportunity: Opportunity) -> ValidationOutcome {
    if opportunity.id.is_empty() {
        return ValidationOutcome::Reject {
            code: "missing_id",
            details: "opportunity has an empty id".to_string(),
        };
    }

    if opportunity.token_in == opportunity.token_out {
        return ValidationOutcome::Reject {
            code: "same_token_pair",
            details: format!(
                "tokenIn and tokenOut must differ, both are {}",
                opportunity.token_in
            ),
        };
    }

    match opportunity.amount_in.parse::<u128>() {
        Ok(0) | Err(_) => {
            return ValidationOutcome::Reject {
                code: "invalid_amount",
                details: format!(
                    "amountIn must be a positive integer string, got {:?}",
                    opportunity.amount_in
                ),
            }
        }
        Ok(_) => {}
    }

    if !(0.0..=1.0).contains(&opportunity.confidence) {
        return ValidationOutcome::Reject {
            code: "invalid_confidence",
            details: format!("confidence must be within [0, 1], got {}", opportunity.confidence),
        };
    }

    if opportunity.kind == OpportunityKind::CrossChain {
        let buy_chain = opportunity.buy_chain.as_deref().unwrap_or("");
        let sell_chain = opportunity.sell_chain.as_deref().unwrap_or("");

        if buy_chain.is_empty() || sell_chain.is_empty() {
            return ValidationOutcome::Reject {
                code: "missing_chains",
                details: "cross-chain opportunities must carry buyChain and sellChain".to_string(),
            };
        }

        if buy_chain == sell_chain {
            return ValidationOutcome::Reject {
                code: "same_chain",
                details: format!("buyChain and sellChain must differ, both are {buy_chain}"),
            };
        }

        if !SUPPORTED_CHAINS.contains(&buy_chain) || !SUPPORTED_CHAINS.contains(&sell_chain) {
            return ValidationOutcome::Reject {
                code: "unsupported_chain",
                details: format!("unsupported chain pair {buy_chain} -> {sell_chain}"),
            };
        }
    }

    ValidationOutcome::Ok(Box::new(opportunity))
}
