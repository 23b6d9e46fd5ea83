//! Type-safe price representation using decimal arithmetic.
//!
//! Prices are held in the currency's standard unit (`99` means 99 dollars).
//! The payment processor speaks in minor units (cents), so conversion is
//! explicit and fallible rather than a lossy float cast.

use core::fmt;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// A price with currency information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., dollars, not cents).
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency_code: CurrencyCode,
}

impl Price {
    /// Create a new price.
    #[must_use]
    pub const fn new(amount: Decimal, currency_code: CurrencyCode) -> Self {
        Self {
            amount,
            currency_code,
        }
    }

    /// Create a price from minor units (e.g., cents).
    #[must_use]
    pub fn from_minor_units(units: i64, currency_code: CurrencyCode) -> Self {
        Self {
            amount: Decimal::new(units, currency_code.minor_unit_digits()),
            currency_code,
        }
    }

    /// Convert to minor units for the payment processor.
    ///
    /// Returns `None` if the amount is negative, has more precision than the
    /// currency allows, or does not fit in an `i64`.
    #[must_use]
    pub fn to_minor_units(&self) -> Option<i64> {
        if self.amount.is_sign_negative() {
            return None;
        }
        let scale = Decimal::from(10_i64.pow(self.currency_code.minor_unit_digits()));
        let minor = self.amount.checked_mul(scale)?;
        if minor.fract() != Decimal::ZERO {
            return None;
        }
        minor.to_i64()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:.2}",
            self.currency_code.symbol(),
            self.amount.round_dp(2)
        )
    }
}

/// ISO 4217 currency codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    USD,
    EUR,
    GBP,
    CAD,
    AUD,
}

impl CurrencyCode {
    /// Currency symbol for display.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::USD | Self::CAD | Self::AUD => "$",
            Self::EUR => "€",
            Self::GBP => "£",
        }
    }

    /// ISO 4217 code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::CAD => "CAD",
            Self::AUD => "AUD",
        }
    }

    /// Number of minor-unit digits (all supported currencies use cents).
    #[must_use]
    pub const fn minor_unit_digits(&self) -> u32 {
        2
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::USD),
            "EUR" => Ok(Self::EUR),
            "GBP" => Ok(Self::GBP),
            "CAD" => Ok(Self::CAD),
            "AUD" => Ok(Self::AUD),
            _ => Err(format!("unsupported currency: {s}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_units_conversion() {
        let price = Price::new(Decimal::new(99, 0), CurrencyCode::USD);
        assert_eq!(price.to_minor_units(), Some(9900));

        let price = Price::new(Decimal::new(1999, 2), CurrencyCode::EUR);
        assert_eq!(price.to_minor_units(), Some(1999));
    }

    #[test]
    fn test_minor_units_rejects_sub_cent_and_negative() {
        let price = Price::new(Decimal::new(10_001, 3), CurrencyCode::USD);
        assert_eq!(price.to_minor_units(), None);

        let price = Price::new(Decimal::new(-5, 0), CurrencyCode::USD);
        assert_eq!(price.to_minor_units(), None);
    }

    #[test]
    fn test_from_minor_units() {
        let price = Price::from_minor_units(9900, CurrencyCode::USD);
        assert_eq!(price.amount, Decimal::new(99, 0));
    }

    #[test]
    fn test_display() {
        let price = Price::new(Decimal::new(99, 0), CurrencyCode::USD);
        assert_eq!(price.to_string(), "$99.00");
    }

    #[test]
    fn test_currency_from_str() {
        assert_eq!("usd".parse::<CurrencyCode>().unwrap(), CurrencyCode::USD);
        assert!("XYZ".parse::<CurrencyCode>().is_err());
    }
}
