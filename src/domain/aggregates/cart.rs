//! Cart Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    user_id: Uuid,
    lines: Vec<CartLine>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub variant_id: Uuid,
    pub quantity: u32,
}

impl Cart {
    pub fn empty(user_id: Uuid) -> Self {
        Self { user_id, lines: vec![], updated_at: Utc::now() }
    }

    /// Rebuild a persisted cart.
    pub fn restore(user_id: Uuid, lines: Vec<CartLine>, updated_at: DateTime<Utc>) -> Self {
        Self { user_id, lines, updated_at }
    }

    pub fn user_id(&self) -> Uuid { self.user_id }
    pub fn lines(&self) -> &[CartLine] { &self.lines }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn is_empty(&self) -> bool { self.lines.is_empty() }
    pub fn item_count(&self) -> u32 { self.lines.iter().map(|l| l.quantity).sum() }

    pub fn add_item(&mut self, variant_id: Uuid, quantity: u32) -> Result<(), CartError> {
        if quantity == 0 { return Err(CartError::InvalidQuantity); }
        if let Some(existing) = self.lines.iter_mut().find(|l| l.variant_id == variant_id) {
            existing.quantity = existing.quantity.saturating_add(quantity);
        } else {
            self.lines.push(CartLine { variant_id, quantity });
        }
        self.touch();
        Ok(())
    }

    pub fn set_quantity(&mut self, variant_id: Uuid, quantity: u32) -> Result<(), CartError> {
        let line = self.lines.iter_mut().find(|l| l.variant_id == variant_id).ok_or(CartError::ItemNotFound)?;
        if quantity == 0 { self.lines.retain(|l| l.variant_id != variant_id); }
        else { line.quantity = quantity; }
        self.touch();
        Ok(())
    }

    pub fn remove_item(&mut self, variant_id: Uuid) -> Result<(), CartError> {
        let before = self.lines.len();
        self.lines.retain(|l| l.variant_id != variant_id);
        if self.lines.len() == before { return Err(CartError::ItemNotFound); }
        self.touch();
        Ok(())
    }

    /// Drop the lines that were turned into an order.
    pub fn remove_purchased(&mut self, variant_ids: &[Uuid]) {
        self.lines.retain(|l| !variant_ids.contains(&l.variant_id));
        self.touch();
    }

    pub fn clear(&mut self) { self.lines.clear(); self.touch(); }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("cart item not found")]
    ItemNotFound,
    #[error("quantity must be at least 1")]
    InvalidQuantity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cart_operations() {
        let variant = Uuid::now_v7();
        let mut cart = Cart::empty(Uuid::now_v7());
        cart.add_item(variant, 2).unwrap();
        cart.add_item(variant, 1).unwrap();
        assert_eq!(cart.lines().len(), 1);
        assert_eq!(cart.lines()[0].quantity, 3); // Merged
        assert_eq!(cart.add_item(variant, 0), Err(CartError::InvalidQuantity));
    }

    #[test]
    fn test_set_quantity_zero_removes_line() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let mut cart = Cart::empty(Uuid::now_v7());
        cart.add_item(a, 1).unwrap();
        cart.add_item(b, 4).unwrap();
        cart.set_quantity(a, 0).unwrap();
        assert_eq!(cart.lines(), &[CartLine { variant_id: b, quantity: 4 }]);
        assert_eq!(cart.set_quantity(a, 2), Err(CartError::ItemNotFound));
        assert_eq!(cart.remove_item(a), Err(CartError::ItemNotFound));
    }

    #[test]
    fn test_remove_purchased_keeps_other_lines() {
        let (a, b) = (Uuid::now_v7(), Uuid::now_v7());
        let mut cart = Cart::empty(Uuid::now_v7());
        cart.add_item(a, 1).unwrap();
        cart.add_item(b, 1).unwrap();
        cart.remove_purchased(&[a]);
        assert_eq!(cart.item_count(), 1);
        assert_eq!(cart.lines()[0].variant_id, b);
    }
}
