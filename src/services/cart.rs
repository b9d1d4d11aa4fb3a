//! Cart operations, priced against the live catalog.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;
use crate::domain::aggregates::Cart;
use crate::domain::value_objects::Money;
use crate::store::DynStore;
use crate::{MarketplaceError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CartLineView {
    pub variant_id: Uuid,
    pub quantity: u32,
    /// `None` once the variant has left the catalog.
    pub store_id: Option<Uuid>,
    pub product_name: Option<String>,
    pub unit_price: Option<Money>,
    pub line_total: Money,
    pub in_stock: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CartView {
    pub user_id: Uuid,
    pub lines: Vec<CartLineView>,
    pub item_count: u32,
    pub items_subtotal: Money,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CartService { store: DynStore }

impl CartService {
    pub fn new(store: DynStore) -> Self { Self { store } }

    pub async fn view(&self, user_id: Uuid) -> Result<CartView> {
        let cart = self.store.load_cart(user_id).await?;
        self.render(&cart).await
    }

    pub async fn add_item(&self, user_id: Uuid, variant_id: Uuid, quantity: u32) -> Result<CartView> {
        if self.store.variants(&[variant_id]).await?.is_empty() { return Err(MarketplaceError::NotFound("variant")); }
        let mut cart = self.store.load_cart(user_id).await?;
        cart.add_item(variant_id, quantity)?;
        self.store.save_cart(&cart).await?;
        self.render(&cart).await
    }

    pub async fn set_quantity(&self, user_id: Uuid, variant_id: Uuid, quantity: u32) -> Result<CartView> {
        let mut cart = self.store.load_cart(user_id).await?;
        cart.set_quantity(variant_id, quantity)?;
        self.store.save_cart(&cart).await?;
        self.render(&cart).await
    }

    pub async fn remove_item(&self, user_id: Uuid, variant_id: Uuid) -> Result<CartView> {
        let mut cart = self.store.load_cart(user_id).await?;
        cart.remove_item(variant_id)?;
        self.store.save_cart(&cart).await?;
        self.render(&cart).await
    }

    pub async fn clear(&self, user_id: Uuid) -> Result<CartView> {
        let mut cart = self.store.load_cart(user_id).await?;
        cart.clear();
        self.store.save_cart(&cart).await?;
        self.render(&cart).await
    }

    async fn render(&self, cart: &Cart) -> Result<CartView> {
        let ids: Vec<Uuid> = cart.lines().iter().map(|l| l.variant_id).collect();
        let variants: HashMap<Uuid, _> = self.store.variants(&ids).await?.into_iter().map(|v| (v.id, v)).collect();
        let lines: Vec<CartLineView> = cart.lines().iter().map(|line| match variants.get(&line.variant_id) {
            Some(v) => CartLineView {
                variant_id: line.variant_id, quantity: line.quantity, store_id: Some(v.store_id),
                product_name: Some(v.product_name.clone()), unit_price: Some(v.unit_price),
                line_total: v.unit_price.multiply(line.quantity), in_stock: v.ensure_available(line.quantity).is_ok(),
            },
            None => CartLineView {
                variant_id: line.variant_id, quantity: line.quantity, store_id: None, product_name: None,
                unit_price: None, line_total: Money::ZERO, in_stock: false,
            },
        }).collect();
        Ok(CartView {
            user_id: cart.user_id(),
            item_count: cart.item_count(),
            items_subtotal: lines.iter().map(|l| l.line_total).sum(),
            lines,
            updated_at: cart.updated_at(),
        })
    }
}
