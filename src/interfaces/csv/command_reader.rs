use crate::domain::product::ProductId;
use crate::error::{BillingError, Result};
use serde::Deserialize;
use std::io::Read;

/// Host actions a command script can issue against a session.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "kebab-case")]
pub enum HostAction {
    Purchase,
    Subscribe,
    /// The external flow succeeded.
    Complete,
    /// The user abandoned the external flow.
    Cancel,
    /// The external flow reported an error.
    Fail,
    Consume,
    Restore,
    Details,
    SubscriptionDetails,
    Release,
}

impl HostAction {
    pub fn needs_product(self) -> bool {
        !matches!(self, HostAction::Restore | HostAction::Release)
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct HostCommand {
    pub action: HostAction,
    #[serde(default)]
    pub product: Option<ProductId>,
}

impl HostCommand {
    /// The product this command targets, if the action requires one.
    pub fn require_product(&self) -> Result<&ProductId> {
        self.product.as_ref().ok_or_else(|| {
            BillingError::InvalidCommand(format!("{:?} requires a product", self.action))
        })
    }
}

/// Reads host commands from a CSV script with an `action, product` header.
///
/// Whitespace is trimmed and the product column may be left out for actions
/// that do not take one.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes commands; a malformed row yields an error and
    /// reading continues with the next one.
    pub fn commands(self) -> impl Iterator<Item = Result<HostCommand>> {
        self.reader
            .into_deserialize::<HostCommand>()
            .map(|result| {
                let command = result?;
                if command.action.needs_product() {
                    command.require_product()?;
                }
                Ok(command)
            })
    }
}
