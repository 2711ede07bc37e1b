use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::{order, Order, OrderModel, OrderStatus, User},
    errors::ServiceError,
    services::{
        cart::{load_lines, CartService, OrderWithItems},
        notifications::{
            order_cancelled_mail, order_confirmed_mail, order_delivered_mail, send_best_effort,
            MailData, Notifier,
        },
        payments::{CardDetails, PaymentError, PaymentGateway},
        stock::{consume_stock_in, restock_in},
    },
};

/// Input for paying the current cart
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PayCartInput {
    #[validate(length(min = 1, message = "Address is required"))]
    pub address: String,
    #[validate]
    pub card: CardDetails,
}

/// Drives orders through `CART -> CONFIRMED -> DELIVERED | CANCELLED`,
/// moving stock and money along with each transition.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            carts,
            gateway,
            notifier,
            currency: currency.into(),
        }
    }

    /// Pays the user's cart and confirms it.
    ///
    /// Payment, stock consumption and the status change share one transaction.
    /// If the cart can not be confirmed (stock short, cart changed concurrently,
    /// store failure) the payment is dropped again and the order stays `CART`.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderWithItems)` - The `CONFIRMED` order
    /// * `Err(ServiceError::BadRequest)` - No cart, empty cart or insufficient stock
    /// * `Err(ServiceError::InvalidStatus)` - The order is no longer a cart
    /// * `Err(ServiceError::PaymentFailed)` - The card was declined
    #[instrument(skip(self, user, input), fields(user_id = %user.user_id, order_id = %order_id))]
    pub async fn pay_cart(
        &self,
        user: &AuthUser,
        order_id: &str,
        input: PayCartInput,
    ) -> Result<OrderWithItems, ServiceError> {
        let row = Order::find_by_id(order_id.to_string())
            .filter(order::Column::UserId.eq(user.user_id.as_str()))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::BadRequest("Cart is empty".to_string()))?;

        if row.status != OrderStatus::Cart {
            return Err(ServiceError::InvalidStatus("Order already paid".to_string()));
        }

        let cart = self
            .carts
            .resolve_cart(&user.user_id)
            .await?
            .filter(|cart| cart.order.id == row.id)
            .ok_or_else(|| ServiceError::BadRequest("Cart is empty".to_string()))?;

        if cart.order.total == 0 || cart.items.is_empty() {
            return Err(ServiceError::BadRequest("Cart is empty".to_string()));
        }

        let order = self.confirm_cart(&cart, &input).await?;

        self.carts.invalidate(&user.user_id).await;
        metrics::counter!("commerce_orders_total", 1, "status" => "confirmed");
        info!(order_id = %order.id, total = order.total, "Order paid and confirmed");

        send_best_effort(
            self.notifier.as_ref(),
            order_confirmed_mail(&user.email, &order, &self.currency),
        )
        .await;

        Ok(OrderWithItems {
            order,
            items: cart.items,
        })
    }

    /// Initializes the payment, consumes stock and flips the cart to `CONFIRMED`
    /// in one transaction.
    async fn confirm_cart(
        &self,
        cart: &OrderWithItems,
        input: &PayCartInput,
    ) -> Result<OrderModel, ServiceError> {
        let txn = self.db.begin().await?;
        let mut initialized = false;

        let outcome = match self.confirm_in(&txn, cart, input, &mut initialized).await {
            Ok(order) => txn.commit().await.map(|_| order).map_err(ServiceError::from),
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(order_id = %cart.order.id, error = %rollback, "Rollback after failed confirmation failed");
                }
                Err(e)
            }
        };

        if outcome.is_err() && initialized {
            self.discard_payment(&cart.order.id).await;
        }
        outcome
    }

    async fn confirm_in(
        &self,
        txn: &DatabaseTransaction,
        cart: &OrderWithItems,
        input: &PayCartInput,
        initialized: &mut bool,
    ) -> Result<OrderModel, ServiceError> {
        let row = lock_order(txn, &cart.order.id).await?;
        if row.status != OrderStatus::Cart {
            return Err(ServiceError::InvalidStatus("Order already paid".to_string()));
        }
        if row.version != cart.order.version {
            return Err(ServiceError::Conflict(
                "Cart changed while paying, please retry".to_string(),
            ));
        }

        self.gateway
            .initialize_payment(txn, &row.id, row.total, &self.currency, &input.card)
            .await?;
        *initialized = true;

        if !consume_stock_in(txn, &cart.stock_lines()).await? {
            return Err(ServiceError::BadRequest("Insufficient stock".to_string()));
        }

        transition(txn, row, OrderStatus::Confirmed, Some(input.address.as_str())).await
    }

    /// Removes a payment left behind by a rolled back confirmation.
    ///
    /// Transactional stores already dropped it with the rollback, which shows up
    /// here as `NotFound`.
    async fn discard_payment(&self, order_id: &str) {
        let result = async {
            let txn = self.db.begin().await?;
            match self.gateway.void_payment(&txn, order_id).await {
                Ok(()) | Err(PaymentError::NotFound) => {}
                Err(e) => return Err(ServiceError::from(e)),
            }
            txn.commit().await?;
            Ok::<_, ServiceError>(())
        }
        .await;

        if let Err(e) = result {
            error!(order_id = %order_id, error = %e, "Failed to void payment after failed confirmation");
        }
    }

    /// Cancels a confirmed order, refunding the payment and restocking its lines.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderWithItems)` - The `CANCELLED` order
    /// * `Err(ServiceError::NotFound)` - Unknown order
    /// * `Err(ServiceError::BadRequest)` - The order is not `CONFIRMED`
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn cancel_order(
        &self,
        user: &AuthUser,
        order_id: &str,
    ) -> Result<OrderWithItems, ServiceError> {
        user.require_admin()?;

        let txn = self.db.begin().await?;
        let row = lock_order(&txn, order_id).await?;
        if row.status != OrderStatus::Confirmed {
            return Err(ServiceError::BadRequest(
                "Order cannot be canceled".to_string(),
            ));
        }

        let items = load_lines(&txn, &row.id).await?;
        let order = transition(&txn, row, OrderStatus::Cancelled, None).await?;
        let cancelled = OrderWithItems { order, items };
        restock_in(&txn, &cancelled.stock_lines()).await?;

        // Refund on the same transaction; any failure leaves the order CONFIRMED
        self.gateway.refund_payment(&txn, &cancelled.order.id).await?;
        txn.commit().await?;

        metrics::counter!("commerce_orders_total", 1, "status" => "cancelled");
        info!(order_id = %cancelled.order.id, "Order cancelled");

        self.notify_owner(&cancelled.order, order_cancelled_mail).await;
        Ok(cancelled)
    }

    /// Marks a confirmed order delivered and captures its payment.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderWithItems)` - The `DELIVERED` order
    /// * `Err(ServiceError::NotFound)` - Unknown order
    /// * `Err(ServiceError::BadRequest)` - The order is not `CONFIRMED`
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn deliver_order(
        &self,
        user: &AuthUser,
        order_id: &str,
    ) -> Result<OrderWithItems, ServiceError> {
        user.require_admin()?;

        let txn = self.db.begin().await?;
        let row = lock_order(&txn, order_id).await?;
        if row.status != OrderStatus::Confirmed {
            return Err(ServiceError::BadRequest(
                "Order cannot be delivered".to_string(),
            ));
        }

        let items = load_lines(&txn, &row.id).await?;
        self.gateway.capture_payment(&txn, &row.id).await?;
        let order = transition(&txn, row, OrderStatus::Delivered, None).await?;
        txn.commit().await?;

        metrics::counter!("commerce_orders_total", 1, "status" => "delivered");
        info!(order_id = %order.id, "Order delivered");

        self.notify_owner(&order, order_delivered_mail).await;
        Ok(OrderWithItems { order, items })
    }

    /// Lists orders: all of them for admins, the caller's own otherwise.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn get_orders(&self, user: &AuthUser) -> Result<Vec<OrderModel>, ServiceError> {
        let mut query = Order::find().order_by_desc(order::Column::CreatedAt);
        if !user.is_admin() {
            query = query.filter(order::Column::UserId.eq(user.user_id.as_str()));
        }
        Ok(query.all(&*self.db).await?)
    }

    /// Fetches one order with its lines, scoped to the caller unless admin.
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn get_order(
        &self,
        user: &AuthUser,
        order_id: &str,
    ) -> Result<OrderWithItems, ServiceError> {
        let mut query = Order::find_by_id(order_id.to_string());
        if !user.is_admin() {
            query = query.filter(order::Column::UserId.eq(user.user_id.as_str()));
        }

        let order = query
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))?;
        let items = load_lines(&*self.db, &order.id).await?;
        Ok(OrderWithItems { order, items })
    }

    async fn notify_owner(&self, order: &OrderModel, mail: fn(&str, &OrderModel) -> MailData) {
        let owner = match User::find_by_id(order.user_id.clone()).one(&*self.db).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                warn!(order_id = %order.id, user_id = %order.user_id, "Order owner not found, skipping mail");
                return;
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "Failed to load order owner, skipping mail");
                return;
            }
        };

        send_best_effort(self.notifier.as_ref(), mail(&owner.email, order)).await;
    }
}

async fn lock_order(txn: &DatabaseTransaction, order_id: &str) -> Result<OrderModel, ServiceError> {
    Order::find_by_id(order_id.to_string())
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound("Order not found".to_string()))
}

/// Moves `order` to `next`, bumping its version.
async fn transition(
    txn: &DatabaseTransaction,
    order: OrderModel,
    next: OrderStatus,
    address: Option<&str>,
) -> Result<OrderModel, ServiceError> {
    if !order.status.can_transition_to(next) {
        return Err(ServiceError::InvalidStatus(format!(
            "Cannot move order from {} to {}",
            order.status, next
        )));
    }

    let version = order.version;
    let mut active: order::ActiveModel = order.into();
    active.status = Set(next);
    active.version = Set(version + 1);
    if let Some(address) = address {
        active.address = Set(Some(address.to_string()));
    }
    Ok(active.update(txn).await?)
}
