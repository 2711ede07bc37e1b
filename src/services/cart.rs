use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    auth::AuthUser,
    cache::JsonCache,
    entities::{
        order, order_item, Order, OrderItem, OrderItemModel, OrderModel, OrderStatus, Product,
        ProductModel,
    },
    errors::ServiceError,
    services::stock::StockLine,
};

/// An order line together with the product it refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    #[serde(flatten)]
    pub item: OrderItemModel,
    pub product: ProductModel,
}

/// An order with its lines. This is also the cached cart snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderWithItems {
    #[serde(flatten)]
    pub order: OrderModel,
    pub items: Vec<OrderLine>,
}

impl OrderWithItems {
    pub fn contains_product(&self, product_id: &str) -> bool {
        self.items.iter().any(|line| line.item.product_id == product_id)
    }

    /// Sum of the line subtotals
    pub fn items_total(&self) -> i64 {
        self.items.iter().map(|line| line.item.price).sum()
    }

    pub fn stock_lines(&self) -> Vec<StockLine> {
        self.items
            .iter()
            .map(|line| StockLine::new(line.item.product_id.clone(), line.item.quantity))
            .collect()
    }
}

/// Largest quantity a single cart line may hold
pub const MAX_LINE_QUANTITY: i32 = 1_000_000;

/// Product and quantity to add to the cart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProductDelta {
    #[validate(length(min = 1, message = "Product id is required"))]
    pub product_id: String,
    #[validate(range(
        min = 1,
        max = 1000000,
        message = "Quantity must be between 1 and 1000000"
    ))]
    pub quantity: i32,
}

impl ProductDelta {
    pub fn new(product_id: impl Into<String>, quantity: i32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Input for changing the cart contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[validate(schema(function = "validate_update_cart"))]
pub struct UpdateCartInput {
    #[serde(default)]
    #[validate]
    pub add_products: Vec<ProductDelta>,
    #[serde(default)]
    pub remove_products: Vec<String>,
}

fn validate_update_cart(input: &UpdateCartInput) -> Result<(), ValidationError> {
    if input.add_products.is_empty() && input.remove_products.is_empty() {
        let mut err = ValidationError::new("update_cart");
        err.message = Some("At least one field must be provided".into());
        return Err(err);
    }
    Ok(())
}

/// Sums quantities of repeated products, keeping first-seen order.
fn merge_deltas(deltas: &[ProductDelta]) -> Result<Vec<ProductDelta>, ServiceError> {
    let mut merged: Vec<ProductDelta> = Vec::with_capacity(deltas.len());
    for delta in deltas {
        match merged.iter_mut().find(|d| d.product_id == delta.product_id) {
            Some(existing) => existing.quantity = line_quantity(existing.quantity, delta.quantity)?,
            None => {
                line_quantity(0, delta.quantity)?;
                merged.push(delta.clone());
            }
        }
    }
    Ok(merged)
}

fn line_quantity(current: i32, added: i32) -> Result<i32, ServiceError> {
    current
        .checked_add(added)
        .filter(|quantity| *quantity <= MAX_LINE_QUANTITY)
        .ok_or_else(quantity_too_large)
}

fn line_price(quantity: i32, unit_price: i64) -> Result<i64, ServiceError> {
    i64::from(quantity)
        .checked_mul(unit_price)
        .ok_or_else(quantity_too_large)
}

fn quantity_too_large() -> ServiceError {
    ServiceError::BadRequest("Quantity is too large".to_string())
}

/// Working-cart engine: one `CART` order per user, cached by user id.
///
/// The cache is only an accelerator. A snapshot is served only when the order
/// row still has status `CART` and the same `version`; anything else is
/// reloaded from the database and the stale entry dropped.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    cache: JsonCache,
    cache_ttl: Option<Duration>,
}

impl CartService {
    /// Creates a new `CartService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `cache` - Cart snapshot cache, keyed by user id
    /// * `cache_ttl` - Lifetime of a cached snapshot, `None` for no expiry
    pub fn new(db: Arc<DatabaseConnection>, cache: JsonCache, cache_ttl: Option<Duration>) -> Self {
        Self {
            db,
            cache,
            cache_ttl,
        }
    }

    /// Returns the user's current cart with its lines.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderWithItems)` - The `CART` order, served from cache when the snapshot is current
    /// * `Err(ServiceError::NotFound)` - The user has no cart
    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    pub async fn get_cart(&self, user: &AuthUser) -> Result<OrderWithItems, ServiceError> {
        self.resolve_cart(&user.user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Cart not found".to_string()))
    }

    /// Cache-first lookup of the user's cart, without locking.
    pub async fn resolve_cart(&self, user_id: &str) -> Result<Option<OrderWithItems>, ServiceError> {
        self.resolve_cart_in(&*self.db, user_id, false).await
    }

    /// Cache-first lookup of the user's cart on `conn`.
    ///
    /// With `lock` set, the order row is selected `FOR UPDATE`, which serializes
    /// concurrent cart mutations for the same user inside a transaction.
    pub async fn resolve_cart_in<C>(
        &self,
        conn: &C,
        user_id: &str,
        lock: bool,
    ) -> Result<Option<OrderWithItems>, ServiceError>
    where
        C: ConnectionTrait,
    {
        let mut query = Order::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::Status.eq(OrderStatus::Cart));
        if lock {
            query = query.lock_exclusive();
        }

        let Some(row) = query.one(conn).await? else {
            self.invalidate(user_id).await;
            return Ok(None);
        };

        if let Some(snapshot) = self.cached(user_id).await {
            if snapshot.order.id == row.id && snapshot.order.version == row.version {
                debug!(user_id = %user_id, order_id = %row.id, "Cart served from cache");
                return Ok(Some(OrderWithItems {
                    order: row,
                    items: snapshot.items,
                }));
            }
            debug!(user_id = %user_id, order_id = %row.id, "Discarding stale cart snapshot");
            self.invalidate(user_id).await;
        }

        let items = load_lines(conn, &row.id).await?;
        Ok(Some(OrderWithItems { order: row, items }))
    }

    /// Applies product additions and removals to the user's cart, creating it if needed.
    ///
    /// Removals are applied before additions. Adding a product already in the
    /// cart increments that line's quantity and subtotal at the line's product
    /// price. The order total is recomputed from the stored lines afterwards.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderWithItems)` - The cart after the change
    /// * `Err(ServiceError::BadRequest)` - Removing from an empty cart, removing a
    ///   product that is not in the cart, or adding a deleted product
    /// * `Err(ServiceError::NotFound)` - An added product does not exist
    /// * `Err(ServiceError::Conflict)` - A concurrent request created the cart first
    #[instrument(skip(self, user, input), fields(user_id = %user.user_id))]
    pub async fn update_cart_items(
        &self,
        user: &AuthUser,
        input: UpdateCartInput,
    ) -> Result<OrderWithItems, ServiceError> {
        let user_id = user.user_id.as_str();
        let additions = merge_deltas(&input.add_products)?;
        let removals: BTreeSet<String> = input.remove_products.into_iter().collect();

        if additions.is_empty() && removals.is_empty() {
            return Err(ServiceError::ValidationError(
                "At least one field must be provided".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let current = self.resolve_cart_in(&txn, user_id, true).await?;

        if let Some(cart) = &current {
            if removals.iter().any(|product_id| !cart.contains_product(product_id)) {
                return Err(ServiceError::BadRequest(
                    "Some products are not in the cart".to_string(),
                ));
            }
        } else if !removals.is_empty() {
            return Err(ServiceError::BadRequest(
                "Cannot remove products from an empty cart".to_string(),
            ));
        }

        // Lines that survive the removal step, by product
        let kept: HashMap<&str, &OrderLine> = current
            .iter()
            .flat_map(|cart| cart.items.iter())
            .filter(|line| !removals.contains(&line.item.product_id))
            .map(|line| (line.item.product_id.as_str(), line))
            .collect();

        let new_ids: Vec<&str> = additions
            .iter()
            .map(|delta| delta.product_id.as_str())
            .filter(|product_id| !kept.contains_key(product_id))
            .collect();
        let products = fetch_addable_products(&txn, &new_ids).await?;

        let order = match current.as_ref() {
            Some(cart) => cart.order.clone(),
            None => create_cart_order(&txn, user_id).await?,
        };

        if !removals.is_empty() {
            let removed = OrderItem::delete_many()
                .filter(order_item::Column::OrderId.eq(order.id.as_str()))
                .filter(order_item::Column::ProductId.is_in(removals.iter().map(String::as_str)))
                .exec(&txn)
                .await?;
            debug!(order_id = %order.id, removed = removed.rows_affected, "Removed cart lines");
        }

        for delta in &additions {
            match kept.get(delta.product_id.as_str()) {
                Some(line) => {
                    line_quantity(line.item.quantity, delta.quantity)?;
                    let increment = line_price(delta.quantity, line.product.price)?;
                    OrderItem::update_many()
                        .col_expr(
                            order_item::Column::Quantity,
                            Expr::col(order_item::Column::Quantity).add(delta.quantity),
                        )
                        .col_expr(
                            order_item::Column::Price,
                            Expr::col(order_item::Column::Price).add(increment),
                        )
                        .filter(order_item::Column::Id.eq(line.item.id.as_str()))
                        .exec(&txn)
                        .await?;
                }
                None => {
                    let product = products.get(delta.product_id.as_str()).ok_or_else(|| {
                        ServiceError::NotFound(format!("Product {} not found", delta.product_id))
                    })?;
                    order_item::ActiveModel {
                        id: Set(Uuid::new_v4().to_string()),
                        order_id: Set(order.id.clone()),
                        product_id: Set(product.id.clone()),
                        quantity: Set(delta.quantity),
                        price: Set(line_price(delta.quantity, product.price)?),
                    }
                    .insert(&txn)
                    .await?;
                }
            }
        }

        let items = load_lines(&txn, &order.id).await?;
        let total = items
            .iter()
            .try_fold(0i64, |total, line| total.checked_add(line.item.price))
            .ok_or_else(|| ServiceError::BadRequest("Cart total is too large".to_string()))?;
        let next_version = order.version + 1;

        let mut active: order::ActiveModel = order.into();
        active.total = Set(total);
        active.version = Set(next_version);
        let order = active.update(&txn).await?;

        txn.commit().await?;

        let cart = OrderWithItems { order, items };
        self.store(user_id, &cart).await;

        metrics::counter!("commerce_cart_updates_total", 1);
        info!(
            order_id = %cart.order.id,
            lines = cart.items.len(),
            total = cart.order.total,
            "Cart updated"
        );
        Ok(cart)
    }

    /// Drops the cached snapshot for a user. Failures are logged only.
    pub async fn invalidate(&self, user_id: &str) {
        if let Err(e) = self.cache.delete(user_id).await {
            warn!(user_id = %user_id, error = %e, "Failed to invalidate cart cache");
            metrics::counter!("commerce_cache_errors_total", 1, "operation" => "delete");
        }
    }

    async fn cached(&self, user_id: &str) -> Option<OrderWithItems> {
        match self.cache.get::<OrderWithItems>(user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Cart cache read failed, using database");
                metrics::counter!("commerce_cache_errors_total", 1, "operation" => "get");
                None
            }
        }
    }

    async fn store(&self, user_id: &str, cart: &OrderWithItems) {
        if let Err(e) = self.cache.set(user_id, cart, self.cache_ttl).await {
            warn!(user_id = %user_id, error = %e, "Failed to cache cart snapshot");
            metrics::counter!("commerce_cache_errors_total", 1, "operation" => "set");
        }
    }
}

/// Lines of an order with their products, oldest first.
pub async fn load_lines<C>(conn: &C, order_id: &str) -> Result<Vec<OrderLine>, ServiceError>
where
    C: ConnectionTrait,
{
    OrderItem::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::Id)
        .find_also_related(Product)
        .all(conn)
        .await?
        .into_iter()
        .map(|(item, product)| {
            let product = product.ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Order line {} references missing product {}",
                    item.id, item.product_id
                ))
            })?;
            Ok(OrderLine { item, product })
        })
        .collect()
}

async fn fetch_addable_products<C>(
    conn: &C,
    product_ids: &[&str],
) -> Result<BTreeMap<String, ProductModel>, ServiceError>
where
    C: ConnectionTrait,
{
    if product_ids.is_empty() {
        return Ok(BTreeMap::new());
    }

    let products: BTreeMap<String, ProductModel> = Product::find()
        .filter(crate::entities::product::Column::Id.is_in(product_ids.iter().copied()))
        .all(conn)
        .await?
        .into_iter()
        .map(|product| (product.id.clone(), product))
        .collect();

    for product_id in product_ids {
        match products.get(*product_id) {
            None => {
                return Err(ServiceError::NotFound(format!(
                    "Product {} not found",
                    product_id
                )))
            }
            Some(product) if product.deleted => {
                return Err(ServiceError::BadRequest(format!(
                    "Product {} is no longer available",
                    product_id
                )))
            }
            Some(_) => {}
        }
    }

    Ok(products)
}

async fn create_cart_order<C>(conn: &C, user_id: &str) -> Result<OrderModel, ServiceError>
where
    C: ConnectionTrait,
{
    let now = Utc::now();
    let cart = order::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        user_id: Set(user_id.to_string()),
        status: Set(OrderStatus::Cart),
        total: Set(0),
        address: Set(None),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    };

    let order = cart
        .insert(conn)
        .await
        .map_err(|e| ServiceError::from_db_conflict(e, "A cart already exists for this user"))?;
    info!(order_id = %order.id, user_id = %user_id, "Cart created");
    Ok(order)
}
