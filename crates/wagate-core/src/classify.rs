//! Trigger classification for inbound group messages.

use serde::{Deserialize, Serialize};

/// What a message matched, if anything.
///
/// Precedence is fixed (first match wins, top to bottom): a quoted reply
/// beats the request header, which beats the rate-update triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// A reply quoting a message we previously forwarded to a banker group.
    ValuationReply,
    /// Body contains the valuation request header.
    ValuationRequest,
    RatePackageUpdate,
    BankRatesUpdate,
    InterestRate,
    Ignored,
}

impl Classification {
    /// Name of the workflow handler this classification dispatches to.
    pub fn handler_name(self) -> Option<&'static str> {
        match self {
            Classification::ValuationReply => Some("valuation_reply"),
            Classification::ValuationRequest => Some("valuation_request"),
            Classification::RatePackageUpdate => Some("rate_package_update"),
            Classification::BankRatesUpdate => Some("bank_rates_update"),
            Classification::InterestRate => Some("interest_rate"),
            Classification::Ignored => None,
        }
    }
}

/// Classify a message body. Pure function of the body text and whether the
/// message carries a quoted reference.
pub fn classify(body: &str, has_quote: bool) -> Classification {
    if has_quote {
        return Classification::ValuationReply;
    }

    let lower = body.to_lowercase();
    if lower.contains("valuation request:") {
        Classification::ValuationRequest
    } else if lower.contains("rate package update:") {
        Classification::RatePackageUpdate
    } else if lower.contains("update bank rates") {
        Classification::BankRatesUpdate
    } else if lower.contains("keyquest mortgage team") {
        Classification::InterestRate
    } else {
        Classification::Ignored
    }
}
