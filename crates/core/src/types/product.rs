//! Digital products sold by the storefront.

use serde::{Deserialize, Serialize};

use super::id::ProductId;
use super::price::Price;

/// Kind of downloadable product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Course,
    Diet,
}

impl ProductType {
    /// Stable string form used in storage and processor metadata.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Course => "course",
            Self::Diet => "diet",
        }
    }
}

impl std::fmt::Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "course" => Ok(Self::Course),
            "diet" => Ok(Self::Diet),
            _ => Err(format!("invalid product type: {s}")),
        }
    }
}

/// A catalog product as far as checkout is concerned.
///
/// The catalog is the authoritative source of `price`; nothing a shopper
/// sends is ever used in its place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub title: String,
    pub price: Price,
    pub product_type: ProductType,
}
