use rust_decimal::Decimal;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_timestamp(ms: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_window_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    validate_timestamp(start)?;
    validate_timestamp(end)?;
    if end <= start {
        return Err(EngineError::invalid("window end must be after its start"));
    }
    if end - start > MAX_WINDOW_SPAN_MS {
        return Err(EngineError::LimitExceeded("window too long"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price.is_sign_negative() && !price.is_zero() {
        return Err(EngineError::invalid("price must not be negative"));
    }
    if price.scale() > MAX_PRICE_SCALE {
        return Err(EngineError::invalid("price has more than two decimal places"));
    }
    if price > Decimal::from(MAX_PRICE_UNITS) {
        return Err(EngineError::LimitExceeded("price too large"));
    }
    Ok(())
}

/// Trim free text and reject it when it exceeds `max` bytes. Blank text is `None`.
pub(crate) fn clean_text(text: Option<String>, max: usize, what: &'static str) -> Result<Option<String>, EngineError> {
    let Some(text) = text else { return Ok(None) };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(Some(trimmed.to_string()))
}
