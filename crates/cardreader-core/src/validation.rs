//! # Validation Module
//!
//! Checks a [`PaymentInfo`] before any vendor call is made.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Field                 Rule                                             │
//! │  ───────────────────   ──────────────────────────────────────────────   │
//! │  currency              3 ASCII letters (ISO 4217)                       │
//! │  amount                > 0 and ≥ the currency's minimum charge          │
//! │  payment_description   required, at most 1000 characters                │
//! │  statement_descriptor  at most 22 characters                            │
//! │  refund charge_id      required                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::money::Money;
use crate::payment::PaymentInfo;
use crate::refund::RefundParams;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

const MAX_DESCRIPTION_LEN: usize = 1000;
const MAX_STATEMENT_DESCRIPTOR_LEN: usize = 22;

/// Validates an ISO 4217 currency code.
///
/// ```rust
/// use cardreader_core::validation::validate_currency;
///
/// assert!(validate_currency("usd").is_ok());
/// assert!(validate_currency("US").is_err());
/// ```
pub fn validate_currency(currency: &str) -> ValidationResult<()> {
    let currency = currency.trim();
    if currency.is_empty() {
        return Err(ValidationError::Required {
            field: "currency".to_string(),
        });
    }
    if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidFormat {
            field: "currency".to_string(),
            reason: "expected a 3-letter ISO code".to_string(),
        });
    }
    Ok(())
}

/// Validates a charge amount against an optional per-currency minimum.
pub fn validate_amount(
    amount: Money,
    currency: &str,
    minimum: Option<Money>,
) -> ValidationResult<()> {
    if !amount.is_positive() {
        return Err(ValidationError::MustBePositive {
            field: "amount".to_string(),
        });
    }
    if let Some(minimum) = minimum {
        if amount < minimum {
            return Err(ValidationError::BelowMinimum {
                field: "amount".to_string(),
                minimum: format!("{} {}", minimum, currency.to_uppercase()),
            });
        }
    }
    Ok(())
}

/// Validates a complete payment input.
pub fn validate_payment_info(info: &PaymentInfo, minimum: Option<Money>) -> ValidationResult<()> {
    validate_currency(&info.currency)?;
    validate_amount(info.amount, &info.currency, minimum)?;

    if info.payment_description.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "payment_description".to_string(),
        });
    }
    if info.payment_description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::TooLong {
            field: "payment_description".to_string(),
            max: MAX_DESCRIPTION_LEN,
        });
    }
    if let Some(descriptor) = &info.statement_descriptor {
        if descriptor.chars().count() > MAX_STATEMENT_DESCRIPTOR_LEN {
            return Err(ValidationError::TooLong {
                field: "statement_descriptor".to_string(),
                max: MAX_STATEMENT_DESCRIPTOR_LEN,
            });
        }
    }
    Ok(())
}

/// Validates an Interac refund before the reader is asked for the card.
pub fn validate_refund_params(params: &RefundParams) -> ValidationResult<()> {
    if params.charge_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "charge_id".to_string(),
        });
    }
    validate_currency(&params.currency)?;
    validate_amount(params.amount, &params.currency, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(amount: i64, currency: &str) -> PaymentInfo {
        PaymentInfo {
            payment_description: "Order #1".into(),
            order_id: 1,
            amount: Money::from_minor_units(amount),
            currency: currency.into(),
            customer_email: None,
            customer_name: None,
            store_name: None,
            site_url: None,
            order_key: None,
            statement_descriptor: None,
            country_code: None,
            fee_amount: None,
            plugin_can_send_receipt: true,
        }
    }

    #[test]
    fn test_currency_codes() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("").is_err());
        assert!(validate_currency("US1").is_err());
        assert!(validate_currency("EURO").is_err());
    }

    #[test]
    fn test_minimum_charge() {
        let fifty = Some(Money::from_minor_units(50));
        assert!(validate_payment_info(&info(50, "USD"), fifty).is_ok());

        let err = validate_payment_info(&info(49, "USD"), fifty).unwrap_err();
        assert!(err.is_amount_too_small());
        assert_eq!(err.to_string(), "amount must be at least 0.50 USD");
    }

    #[test]
    fn test_no_minimum_still_requires_positive() {
        assert!(validate_payment_info(&info(1, "CZK"), None).is_ok());
        assert_eq!(
            validate_payment_info(&info(0, "CZK"), None),
            Err(ValidationError::MustBePositive {
                field: "amount".into()
            })
        );
    }

    #[test]
    fn test_description_and_descriptor() {
        let mut i = info(100, "USD");
        i.payment_description = "  ".into();
        assert!(validate_payment_info(&i, None).is_err());

        let mut i = info(100, "USD");
        i.statement_descriptor = Some("A".repeat(23));
        assert!(matches!(
            validate_payment_info(&i, None),
            Err(ValidationError::TooLong { max: 22, .. })
        ));
    }

    #[test]
    fn test_refund_params() {
        let params = RefundParams {
            charge_id: "ch_1".into(),
            amount: Money::from_minor_units(500),
            currency: "CAD".into(),
        };
        assert!(validate_refund_params(&params).is_ok());

        let missing_charge = RefundParams {
            charge_id: " ".into(),
            ..params.clone()
        };
        assert_eq!(
            validate_refund_params(&missing_charge),
            Err(ValidationError::Required {
                field: "charge_id".into()
            })
        );

        let zero = RefundParams {
            amount: Money::from_minor_units(0),
            ..params
        };
        assert!(validate_refund_params(&zero).is_err());
    }
}
