use axum::{
    extract::{Path, State},
    response::Response,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::common::{success_response, ValidJson};
use super::AppState;
use crate::{
    auth::AuthUser,
    errors::{ResultExt, ServiceError},
};

/// Body of the stock add/remove endpoints
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StockQuantityInput {
    #[validate(range(
        min = 1,
        max = 1000000,
        message = "Quantity must be between 1 and 1000000"
    ))]
    pub quantity: i32,
}

pub async fn get_stock(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    _user: AuthUser,
) -> Result<Response, ServiceError> {
    let stock = state
        .services
        .stock
        .get(&product_id)
        .await
        .record_err("get_stock")?;
    Ok(success_response(stock))
}

/// Restock a product (admin only)
pub async fn add_stock(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    user: AuthUser,
    ValidJson(payload): ValidJson<StockQuantityInput>,
) -> Result<Response, ServiceError> {
    user.require_admin().record_err("add_stock")?;
    let stock = state
        .services
        .stock
        .add(&product_id, payload.quantity)
        .await
        .record_err("add_stock")?;
    Ok(success_response(stock))
}

/// Take units out of stock (admin only)
pub async fn remove_stock(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    user: AuthUser,
    ValidJson(payload): ValidJson<StockQuantityInput>,
) -> Result<Response, ServiceError> {
    user.require_admin().record_err("remove_stock")?;
    let stock = state
        .services
        .stock
        .remove(&product_id, payload.quantity)
        .await
        .record_err("remove_stock")?;
    Ok(success_response(stock))
}
