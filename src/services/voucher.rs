//! Voucher creation and reservation holds.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use crate::domain::aggregates::{Discount, Voucher, VoucherError, VoucherReservation, VoucherScope};
use crate::domain::value_objects::{Money, VoucherCode};
use crate::store::{DynStore, ReservationRequest};
use crate::{MarketplaceError, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct NewVoucher {
    pub code: String,
    pub scope: VoucherScope,
    pub discount: Discount,
    pub max_discount: Option<Money>,
    #[serde(default)]
    pub min_order_value: Money,
    pub usage_limit: Option<u32>,
    pub per_user_limit: Option<u32>,
    pub store_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct VoucherService {
    store: DynStore,
    ttl: Duration,
}

impl VoucherService {
    pub fn new(store: DynStore, ttl: Duration) -> Self { Self { store, ttl } }

    pub async fn create(&self, new: NewVoucher) -> Result<Voucher> {
        let voucher = Voucher {
            id: Uuid::now_v7(), code: VoucherCode::new(new.code)?, scope: new.scope, discount: new.discount,
            max_discount: new.max_discount, min_order_value: new.min_order_value, usage_limit: new.usage_limit,
            per_user_limit: new.per_user_limit, store_id: new.store_id, starts_at: new.starts_at, ends_at: new.ends_at,
            is_active: true,
        };
        voucher.validate()?;
        self.store.create_voucher(&voucher).await?;
        info!(code = %voucher.code, scope = ?voucher.scope, "🎟️ Voucher created");
        Ok(voucher)
    }

    /// Hold one use of `code` for the buyer. Without an explicit amount the order-scope
    /// base is taken from the cart: the whole subtotal, or the owning store's share.
    pub async fn reserve(&self, user_id: Uuid, code: &str, eligible_amount: Option<Money>) -> Result<VoucherReservation> {
        let code = VoucherCode::new(code)?;
        let eligible_amount = match eligible_amount {
            Some(amount) => amount,
            None => self.cart_base(user_id, &code).await?,
        };
        let request = ReservationRequest { code, user_id, eligible_amount, now: Utc::now(), ttl: self.ttl };
        let reservation = self.store.reserve_voucher(&request).await?;
        info!(code = %request.code, reservation_id = %reservation.id, user_id = %user_id, "Voucher reserved");
        Ok(reservation)
    }

    pub async fn release(&self, user_id: Uuid, reservation_id: Uuid) -> Result<VoucherReservation> {
        let reservation = self.store.release_reservation(reservation_id, user_id).await?;
        info!(reservation_id = %reservation_id, status = reservation.status.as_str(), "Voucher reservation released");
        Ok(reservation)
    }

    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<u64> { self.store.expire_reservations(now).await }

    async fn cart_base(&self, user_id: Uuid, code: &VoucherCode) -> Result<Money> {
        let voucher = self.store.voucher_by_code(code).await?.ok_or(VoucherError::NotFound)?;
        if voucher.scope == VoucherScope::Shipping {
            return Err(MarketplaceError::Validation("eligible_amount is required for shipping vouchers".into()));
        }
        let cart = self.store.load_cart(user_id).await?;
        let ids: Vec<Uuid> = cart.lines().iter().map(|l| l.variant_id).collect();
        let variants = self.store.variants(&ids).await?;
        Ok(cart.lines().iter().filter_map(|line| {
            let variant = variants.iter().find(|v| v.id == line.variant_id)?;
            match voucher.store_id {
                Some(store_id) if store_id != variant.store_id => None,
                _ => Some(variant.unit_price.multiply(line.quantity)),
            }
        }).sum())
    }
}
