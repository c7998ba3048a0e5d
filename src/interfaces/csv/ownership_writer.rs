use crate::domain::product::{ProductId, ProductKind, PurchaseRecord};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct OwnershipRow<'a> {
    product: &'a ProductId,
    kind: ProductKind,
    consumed: bool,
}

/// Writes the purchase cache as `product,kind,consumed` CSV rows.
pub struct OwnershipWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OwnershipWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes one row per record. The header is written even when there are
    /// no records.
    pub fn write_records(&mut self, records: &[PurchaseRecord]) -> Result<()> {
        if records.is_empty() {
            self.writer.write_record(["product", "kind", "consumed"])?;
        }
        for record in records {
            self.writer.serialize(OwnershipRow {
                product: &record.product_id,
                kind: record.kind(),
                consumed: record.is_consumed,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
