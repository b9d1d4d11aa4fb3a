//! Checkout planning
//!
//! Turns a cart into a fully priced [`CheckoutPlan`]: lines grouped per store, shipping
//! fees attached, vouchers applied and allocated. The plan is pure data; persisting it
//! atomically is the store's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::cart::CartLine;
use crate::domain::aggregates::order::{generate_order_code, Order, OrderItem, OrderStatus, SubOrder, SubOrderStatus};
use crate::domain::aggregates::payment::{Payment, PaymentMethod};
use crate::domain::aggregates::shipment::Shipment;
use crate::domain::aggregates::variant::{Address, Variant};
use crate::domain::aggregates::voucher::{Voucher, VoucherError, VoucherScope};
use crate::domain::value_objects::{allocate_proportionally, Money};

/// Lines of one store, before pricing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreDraft {
    pub store_id: Uuid,
    pub lines: Vec<(Variant, u32)>,
}

/// Shipping quote for a [`StoreDraft`], in the same order as the drafts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShippingQuote {
    pub store_id: Uuid,
    pub pickup: Address,
    pub fee: Money,
}

/// A voucher held by an active reservation, about to be consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedVoucher {
    pub reservation_id: Uuid,
    pub voucher: Voucher,
}

#[derive(Clone, Debug)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub shipping_address: Address,
    pub payment_method: PaymentMethod,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
    pub order_voucher: Option<ReservedVoucher>,
    pub shipping_voucher: Option<ReservedVoucher>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOrderPlan {
    pub sub_order: SubOrder,
    pub items: Vec<OrderItem>,
    pub shipment: Shipment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutPlan {
    pub order: Order,
    pub sub_orders: Vec<SubOrderPlan>,
    pub payment: Payment,
    /// Reservations to consume, all owned by the buyer.
    pub reservation_ids: Vec<Uuid>,
}

impl StoreDraft {
    pub fn items_subtotal(&self) -> Money { self.lines.iter().map(|(v, qty)| v.unit_price.multiply(*qty)).sum() }
    pub fn weight_grams(&self) -> u32 { self.lines.iter().map(|(v, qty)| v.weight_grams.saturating_mul(*qty)).fold(0u32, u32::saturating_add) }
}

impl CheckoutPlan {
    /// Quantity to take from each variant, sorted by variant id so that row locks are
    /// always acquired in the same order.
    pub fn stock_requirements(&self) -> Vec<(Uuid, u32)> {
        let mut needed: BTreeMap<Uuid, u32> = BTreeMap::new();
        for plan in &self.sub_orders {
            for item in &plan.items { *needed.entry(item.variant_id).or_default() += item.quantity; }
        }
        needed.into_iter().collect()
    }

    pub fn purchased_variants(&self) -> Vec<Uuid> { self.stock_requirements().into_iter().map(|(id, _)| id).collect() }
}

/// Group cart lines by owning store; stores come out sorted by id.
pub fn split_by_store(lines: &[CartLine], variants: &HashMap<Uuid, Variant>) -> Result<Vec<StoreDraft>, CheckoutError> {
    if lines.is_empty() { return Err(CheckoutError::EmptyCart); }
    let mut by_store: BTreeMap<Uuid, Vec<(Variant, u32)>> = BTreeMap::new();
    for line in lines {
        let variant = variants.get(&line.variant_id).ok_or(CheckoutError::UnknownVariant(line.variant_id))?;
        variant.ensure_available(line.quantity).map_err(|_| CheckoutError::InsufficientStock {
            variant_id: variant.id, requested: line.quantity, available: variant.stock(),
        })?;
        by_store.entry(variant.store_id).or_default().push((variant.clone(), line.quantity));
    }
    Ok(by_store.into_iter().map(|(store_id, lines)| StoreDraft { store_id, lines }).collect())
}

/// Discount of one voucher spread across sub-orders: `(store_funded, platform_funded)` per draft.
fn voucher_shares(voucher: &ReservedVoucher, bases: &[Money], drafts: &[StoreDraft]) -> Result<Vec<(Money, Money)>, CheckoutError> {
    let v = &voucher.voucher;
    match v.store_id {
        Some(store_id) => {
            let idx = drafts.iter().position(|d| d.store_id == store_id)
                .ok_or_else(|| VoucherError::NotApplicable(format!("voucher {} belongs to a store not in this order", v.code)))?;
            let base = bases[idx];
            if base < v.min_order_value {
                return Err(VoucherError::MinimumNotMet { required: v.min_order_value, actual: base }.into());
            }
            let mut shares = vec![(Money::ZERO, Money::ZERO); drafts.len()];
            shares[idx].0 = v.discount_for(base);
            Ok(shares)
        }
        None => {
            let total: Money = bases.iter().copied().sum();
            if total < v.min_order_value {
                return Err(VoucherError::MinimumNotMet { required: v.min_order_value, actual: total }.into());
            }
            let parts = allocate_proportionally(v.discount_for(total), bases);
            Ok(parts.into_iter().map(|p| (Money::ZERO, p)).collect())
        }
    }
}

/// Price the drafts and assemble every row CreateOrder writes.
pub fn build_plan(request: &CheckoutRequest, drafts: &[StoreDraft], quotes: &[ShippingQuote], carrier: &str, now: DateTime<Utc>) -> Result<CheckoutPlan, CheckoutError> {
    if drafts.is_empty() { return Err(CheckoutError::EmptyCart); }
    if drafts.len() != quotes.len() || drafts.iter().zip(quotes).any(|(d, q)| d.store_id != q.store_id) {
        return Err(CheckoutError::QuoteMismatch);
    }
    let subtotals: Vec<Money> = drafts.iter().map(StoreDraft::items_subtotal).collect();
    let fees: Vec<Money> = quotes.iter().map(|q| q.fee).collect();

    let mut store_discounts = vec![Money::ZERO; drafts.len()];
    let mut platform_discounts = vec![Money::ZERO; drafts.len()];
    let mut shipping_discounts = vec![Money::ZERO; drafts.len()];
    let mut reservation_ids = Vec::new();

    if let Some(reserved) = &request.order_voucher {
        if reserved.voucher.scope != VoucherScope::Order {
            return Err(VoucherError::NotApplicable(format!("{} is not an order voucher", reserved.voucher.code)).into());
        }
        for (idx, (store, platform)) in voucher_shares(reserved, &subtotals, drafts)?.into_iter().enumerate() {
            store_discounts[idx] += store;
            platform_discounts[idx] += platform;
        }
        reservation_ids.push(reserved.reservation_id);
    }
    if let Some(reserved) = &request.shipping_voucher {
        if reserved.voucher.scope != VoucherScope::Shipping {
            return Err(VoucherError::NotApplicable(format!("{} is not a shipping voucher", reserved.voucher.code)).into());
        }
        for (idx, (store, platform)) in voucher_shares(reserved, &fees, drafts)?.into_iter().enumerate() {
            store_discounts[idx] += store;
            shipping_discounts[idx] += platform;
        }
        reservation_ids.push(reserved.reservation_id);
    }

    let order_id = Uuid::now_v7();
    let mut sub_orders = Vec::with_capacity(drafts.len());
    for (idx, draft) in drafts.iter().enumerate() {
        let sub_id = Uuid::now_v7();
        let items: Vec<OrderItem> = draft.lines.iter().map(|(variant, qty)| OrderItem {
            id: Uuid::now_v7(), sub_order_id: sub_id, variant_id: variant.id, product_name: variant.product_name.clone(),
            sku: variant.sku.clone(), unit_price: variant.unit_price, quantity: *qty, line_total: variant.unit_price.multiply(*qty),
        }).collect();
        let mut sub_order = SubOrder {
            id: sub_id, order_id, store_id: draft.store_id, status: SubOrderStatus::Pending,
            items_subtotal: subtotals[idx], shipping_fee: fees[idx], store_discount: store_discounts[idx],
            platform_discount: platform_discounts[idx], shipping_discount: shipping_discounts[idx], total: Money::ZERO,
            completed_at: None, settlement_id: None, created_at: now, updated_at: now,
        };
        sub_order.recompute_total();
        let cod_amount = match request.payment_method { PaymentMethod::Cod => sub_order.total, PaymentMethod::Vnpay => Money::ZERO };
        let shipment = Shipment::pending(
            sub_id, carrier, quotes[idx].pickup.clone(), request.shipping_address.clone(),
            draft.weight_grams(), fees[idx], cod_amount, subtotals[idx], now,
        );
        sub_orders.push(SubOrderPlan { sub_order, items, shipment });
    }

    let items_subtotal: Money = subtotals.iter().copied().sum();
    let shipping_total: Money = fees.iter().copied().sum();
    let discount_total: Money = sub_orders.iter().map(|p| p.sub_order.discount_total()).sum();
    let grand_total: Money = sub_orders.iter().map(|p| p.sub_order.total).sum();
    let order = Order {
        id: order_id, code: generate_order_code(), user_id: request.user_id, status: OrderStatus::Pending,
        items_subtotal, shipping_total, discount_total, grand_total, payment_method: request.payment_method,
        shipping_address: request.shipping_address.clone(), note: request.note.clone(),
        idempotency_key: request.idempotency_key.clone(), created_at: now, updated_at: now,
    };
    let payment = Payment::pending(order_id, request.payment_method, grand_total, now);
    Ok(CheckoutPlan { order, sub_orders, payment, reservation_ids })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckoutError {
    #[error("cart is empty")]
    EmptyCart,
    #[error("variant {0} does not exist")]
    UnknownVariant(Uuid),
    #[error("insufficient stock for variant {variant_id}: requested {requested}, available {available}")]
    InsufficientStock { variant_id: Uuid, requested: u32, available: u32 },
    #[error("shipping quotes do not match the store split")]
    QuoteMismatch,
    #[error(transparent)]
    Voucher(#[from] VoucherError),
}
