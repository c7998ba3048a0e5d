use crate::domain::product::{ListingDetails, PurchaseRecord};
use crate::error::Result;
use serde::Deserialize;
use std::io::Read;

/// Seed data for the in-memory Billing Service: what can be bought and what
/// the user already owns.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub listings: Vec<ListingDetails>,
    #[serde(default)]
    pub owned: Vec<PurchaseRecord>,
}

impl Catalog {
    pub fn from_reader<R: Read>(source: R) -> Result<Self> {
        Ok(serde_json::from_reader(source)?)
    }
}
