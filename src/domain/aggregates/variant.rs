//! Variant Aggregate
//!
//! The catalog owns products; the lifecycle only needs a variant's price, owning
//! store, weight and current stock.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use crate::domain::value_objects::{Money, Quantity};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: Uuid,
    pub store_id: Uuid,
    pub product_name: String,
    pub sku: String,
    pub unit_price: Money,
    pub weight_grams: u32,
    stock: Quantity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub phone: String,
    pub street: String,
    pub ward: String,
    pub district: String,
    pub province: String,
}

impl Variant {
    pub fn new(id: Uuid, store_id: Uuid, product_name: impl Into<String>, sku: impl Into<String>, unit_price: Money, weight_grams: u32, stock: u32) -> Self {
        Self { id, store_id, product_name: product_name.into(), sku: sku.into(), unit_price, weight_grams, stock: Quantity::new(stock) }
    }

    pub fn stock(&self) -> u32 { self.stock.value() }
    pub fn is_in_stock(&self) -> bool { !self.stock.is_zero() }

    pub fn ensure_available(&self, requested: u32) -> Result<(), StockError> {
        if requested > self.stock.value() {
            return Err(StockError::Insufficient { variant_id: self.id, requested, available: self.stock.value() });
        }
        Ok(())
    }

    pub fn take_stock(&mut self, qty: u32) -> Result<(), StockError> {
        self.ensure_available(qty)?;
        self.stock = self.stock.subtract(qty).unwrap_or_default();
        Ok(())
    }

    pub fn restore_stock(&mut self, qty: u32) { self.stock = self.stock.add(qty); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StockError {
    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    Insufficient { variant_id: Uuid, requested: u32, available: u32 },
}
