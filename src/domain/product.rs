use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a purchasable item or subscription.
///
/// Always supplied by the caller; the session never generates one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProductId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ProductId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    Managed,
    Subscription,
}

impl ProductKind {
    pub fn is_subscription(self) -> bool {
        self == ProductKind::Subscription
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductKind::Managed => f.write_str("managed"),
            ProductKind::Subscription => f.write_str("subscription"),
        }
    }
}

/// A purchase reported by the Billing Service.
///
/// Lives in the session's purchase cache. A record is never dropped from the
/// cache; consuming it only flips `is_consumed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub product_id: ProductId,
    pub purchase_token: String,
    #[serde(default)]
    pub is_subscription: bool,
    #[serde(default)]
    pub is_consumed: bool,
    /// Order identifier issued by the payment processor, e.g. `GPA.1234-5678`.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl PurchaseRecord {
    pub fn new(product_id: impl Into<ProductId>, purchase_token: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            purchase_token: purchase_token.into(),
            is_subscription: false,
            is_consumed: false,
            order_id: None,
        }
    }

    pub fn subscription(product_id: impl Into<ProductId>, purchase_token: impl Into<String>) -> Self {
        Self {
            is_subscription: true,
            ..Self::new(product_id, purchase_token)
        }
    }

    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn kind(&self) -> ProductKind {
        if self.is_subscription {
            ProductKind::Subscription
        } else {
            ProductKind::Managed
        }
    }

    /// True when the record still grants ownership of a product of `kind`.
    pub fn grants(&self, kind: ProductKind) -> bool {
        !self.is_consumed && self.kind() == kind
    }

    /// Merchant prefix of the order id (the text before the first `.`).
    pub fn merchant_prefix(&self) -> Option<&str> {
        let order_id = self.order_id.as_deref()?.trim();
        match order_id.find('.') {
            Some(index) if index > 0 => Some(&order_id[..index]),
            _ => None,
        }
    }
}

/// Display metadata for a product, as returned by a listing query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDetails {
    pub product_id: ProductId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub is_subscription: bool,
}

impl ListingDetails {
    pub fn kind(&self) -> ProductKind {
        if self.is_subscription {
            ProductKind::Subscription
        } else {
            ProductKind::Managed
        }
    }
}

impl fmt::Display for ListingDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({})",
            self.product_id, self.price, self.currency, self.title
        )
    }
}
