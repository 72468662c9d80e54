//! JSON message bodies carried inside frames.
//!
//! Requests are tagged by `request_type`, responses by `response_type`. Tags this
//! build does not know decode to an explicit `Invalid` variant instead of failing.

use serde::{Deserialize, Serialize};

use crate::error::{MetashopError, Result};
use crate::types::{ImageData, ProductId, UNKNOWN_PRICE};

/// Product name reported for an image that matched nothing.
pub const INVALID_PRODUCT_NAME: &str = "INVALID PRODUCT";

/// Identifier placeholder used by the "invalid product" entry.
pub const INVALID_ID: &str = "-1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum Request {
    Identify {
        images: Vec<ImageData>,
    },
    PriceCheck {
        metashop_ids: Vec<String>,
    },
    #[serde(other)]
    Invalid,
}

impl Request {
    pub fn request_type(&self) -> &'static str {
        match self {
            Request::Identify { .. } => "identify",
            Request::PriceCheck { .. } => "price_check",
            Request::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response_type", rename_all = "snake_case")]
pub enum Response {
    Identify {
        products: Vec<ProductEntry>,
    },
    PriceCheck {
        prices: Vec<PricePair>,
    },
    Error {
        reason: String,
    },
    #[serde(other)]
    Invalid,
}

impl Response {
    pub fn error(reason: impl Into<String>) -> Self {
        Response::Error {
            reason: reason.into(),
        }
    }
}

/// One identified product, in request image order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductEntry {
    pub product_name: String,
    pub metashop_id: String,
    pub walmart_id: String,
    pub amazon_id: String,
    pub image: ImageData,
}

impl ProductEntry {
    /// Entry returned for an image that could not be matched to any product.
    pub fn invalid(image: ImageData) -> Self {
        Self {
            product_name: INVALID_PRODUCT_NAME.to_string(),
            metashop_id: INVALID_ID.to_string(),
            walmart_id: INVALID_ID.to_string(),
            amazon_id: INVALID_ID.to_string(),
            image,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.metashop_id == INVALID_ID
    }

    /// Parsed `metashop_id`, or `None` for the invalid-product entry.
    pub fn product_id(&self) -> Option<ProductId> {
        self.metashop_id.parse().ok().filter(|id: &ProductId| *id >= 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePair {
    pub walmart: f64,
    pub amazon: f64,
}

impl PricePair {
    pub const UNKNOWN: PricePair = PricePair {
        walmart: UNKNOWN_PRICE,
        amazon: UNKNOWN_PRICE,
    };
}

impl Default for PricePair {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// Decode a request payload. Schema violations become `MalformedRequest`.
pub fn decode_request(payload: &[u8]) -> Result<Request> {
    let request: Request = serde_json::from_slice(payload)
        .map_err(|e| MetashopError::MalformedRequest(e.to_string()))?;

    if let Request::Identify { images } = &request {
        if images.is_empty() {
            return Err(MetashopError::MalformedRequest(
                "identify request must contain at least one image".to_string(),
            ));
        }
    }

    Ok(request)
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    if matches!(request, Request::Invalid) {
        return Err(MetashopError::Validation(
            "cannot encode an invalid request".to_string(),
        ));
    }
    Ok(serde_json::to_vec(request)?)
}

pub fn decode_response(payload: &[u8]) -> Result<Response> {
    serde_json::from_slice(payload).map_err(|e| MetashopError::MalformedResponse(e.to_string()))
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(response)?)
}
