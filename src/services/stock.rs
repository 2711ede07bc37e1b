use std::collections::BTreeMap;
use std::sync::Arc;

use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    entities::{stock, Product, Stock, StockModel},
    errors::ServiceError,
};

/// One product/quantity pair to consume or release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLine {
    pub product_id: String,
    pub quantity: i32,
}

impl StockLine {
    pub fn new(product_id: impl Into<String>, quantity: i32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Per-product quantity counters.
///
/// Every decrement is a conditional `UPDATE ... WHERE quantity >= n`, so the
/// counter can never go negative even when requests race on the same row.
#[derive(Clone)]
pub struct StockService {
    db: Arc<DatabaseConnection>,
}

impl StockService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Current stock row for a product.
    #[instrument(skip(self))]
    pub async fn get(&self, product_id: &str) -> Result<StockModel, ServiceError> {
        Stock::find_by_id(product_id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Stock not found".to_string()))
    }

    /// Adds `quantity` units, creating the stock row on first use.
    ///
    /// # Errors
    ///
    /// * `NotFound` - the product does not exist
    #[instrument(skip(self))]
    pub async fn add(&self, product_id: &str, quantity: i32) -> Result<StockModel, ServiceError> {
        ensure_positive(quantity)?;
        self.ensure_product(product_id).await?;

        if let Some(current) = Stock::find_by_id(product_id.to_string()).one(&*self.db).await? {
            if current.quantity.checked_add(quantity).is_none() {
                return Err(ServiceError::BadRequest(
                    "Stock quantity is too large".to_string(),
                ));
            }
        }

        upsert_increment(&*self.db, product_id, quantity).await?;
        let stock = self.get(product_id).await?;

        info!(product_id = %product_id, added = quantity, quantity = stock.quantity, "Stock added");
        Ok(stock)
    }

    /// Removes `quantity` units.
    ///
    /// # Errors
    ///
    /// * `NotFound` - the product or its stock row does not exist
    /// * `InsufficientStock` - fewer than `quantity` units are available
    #[instrument(skip(self))]
    pub async fn remove(
        &self,
        product_id: &str,
        quantity: i32,
    ) -> Result<StockModel, ServiceError> {
        ensure_positive(quantity)?;
        self.ensure_product(product_id).await?;

        let current = self.get(product_id).await?;
        if current.quantity < quantity {
            warn!(
                product_id = %product_id,
                available = current.quantity,
                requested = quantity,
                "Stock removal rejected"
            );
            return Err(ServiceError::InsufficientStock(
                "Insufficient stock".to_string(),
            ));
        }

        if !decrement_if_available(&*self.db, product_id, quantity).await? {
            // Another request took the units between the read and the write
            return Err(ServiceError::InsufficientStock(
                "Insufficient stock".to_string(),
            ));
        }

        let stock = self.get(product_id).await?;
        info!(product_id = %product_id, removed = quantity, quantity = stock.quantity, "Stock removed");
        Ok(stock)
    }

    /// All-or-nothing consumption in its own transaction.
    /// Returns `false`, with no stock changed, if any line cannot be covered.
    #[instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn consume_stock(&self, items: &[StockLine]) -> Result<bool, ServiceError> {
        let txn = self.db.begin().await?;
        if !consume_stock_in(&txn, items).await? {
            txn.rollback().await?;
            return Ok(false);
        }
        txn.commit().await?;
        Ok(true)
    }

    async fn ensure_product(&self, product_id: &str) -> Result<(), ServiceError> {
        Product::find_by_id(product_id.to_string())
            .one(&*self.db)
            .await?
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound("Product not found".to_string()))
    }
}

fn ensure_positive(quantity: i32) -> Result<(), ServiceError> {
    if quantity < 1 {
        return Err(ServiceError::ValidationError(
            "Quantity must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Sums quantities per product; ordered so row updates always happen in the same order.
/// `None` when a product's sum does not fit an `i32`.
fn aggregate(items: &[StockLine]) -> Option<BTreeMap<&str, i32>> {
    let mut required = BTreeMap::new();
    for item in items {
        let sum = required.entry(item.product_id.as_str()).or_insert(0i32);
        *sum = sum.checked_add(item.quantity)?;
    }
    Some(required)
}

/// Checks and decrements every line on `conn`.
///
/// Returns `Ok(false)` when a line is short. Decrements may already have been
/// applied at that point, so the caller must roll the transaction back.
pub async fn consume_stock_in<C>(conn: &C, items: &[StockLine]) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    // A sum past i32::MAX exceeds any stock counter
    let Some(required) = aggregate(items) else {
        warn!("Requested stock overflows the counter");
        return Ok(false);
    };
    if required.is_empty() {
        return Ok(true);
    }

    let available: BTreeMap<String, i32> = Stock::find()
        .filter(stock::Column::ProductId.is_in(required.keys().copied()))
        .all(conn)
        .await?
        .into_iter()
        .map(|row| (row.product_id, row.quantity))
        .collect();

    for (product_id, quantity) in &required {
        let on_hand = available.get(*product_id).copied().unwrap_or(0);
        if on_hand < *quantity {
            warn!(
                product_id = %product_id,
                available = on_hand,
                requested = quantity,
                "Insufficient stock"
            );
            return Ok(false);
        }
    }

    for (product_id, quantity) in &required {
        if !decrement_if_available(conn, product_id, *quantity).await? {
            warn!(product_id = %product_id, "Stock changed concurrently, aborting consumption");
            return Ok(false);
        }
    }

    Ok(true)
}

/// Puts each line's quantity back on `conn`.
pub async fn restock_in<C>(conn: &C, items: &[StockLine]) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let required = aggregate(items)
        .ok_or_else(|| DbErr::Custom("Restocked quantity overflows the counter".to_string()))?;
    for (product_id, quantity) in required {
        upsert_increment(conn, product_id, quantity).await?;
    }
    Ok(())
}

async fn upsert_increment<C>(conn: &C, product_id: &str, quantity: i32) -> Result<(), DbErr>
where
    C: ConnectionTrait,
{
    let row = stock::ActiveModel {
        product_id: Set(product_id.to_string()),
        quantity: Set(quantity),
    };

    Stock::insert(row)
        .on_conflict(
            OnConflict::column(stock::Column::ProductId)
                .value(
                    stock::Column::Quantity,
                    Expr::col((Stock, stock::Column::Quantity)).add(quantity),
                )
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

async fn decrement_if_available<C>(conn: &C, product_id: &str, quantity: i32) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let result = Stock::update_many()
        .col_expr(
            stock::Column::Quantity,
            Expr::col(stock::Column::Quantity).sub(quantity),
        )
        .filter(stock::Column::ProductId.eq(product_id))
        .filter(stock::Column::Quantity.gte(quantity))
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}
