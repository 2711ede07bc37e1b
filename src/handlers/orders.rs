use axum::{
    extract::{Path, State},
    response::Response,
};

use super::common::{success_response, ValidJson};
use super::AppState;
use crate::{
    auth::AuthUser,
    errors::{ResultExt, ServiceError},
    services::{cart::UpdateCartInput, orders::PayCartInput},
};

/// Add and remove products in the caller's cart
pub async fn update_cart(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(payload): ValidJson<UpdateCartInput>,
) -> Result<Response, ServiceError> {
    let cart = state
        .services
        .carts
        .update_cart_items(&user, payload)
        .await
        .record_err("update_cart")?;
    Ok(success_response(cart))
}

/// Current cart of the caller
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Response, ServiceError> {
    let cart = state
        .services
        .carts
        .get_cart(&user)
        .await
        .record_err("get_cart")?;
    Ok(success_response(cart))
}

/// Pay the cart and confirm it
pub async fn pay_cart(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
    ValidJson(payload): ValidJson<PayCartInput>,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .pay_cart(&user, &id, payload)
        .await
        .record_err("pay_cart")?;
    Ok(success_response(order))
}

/// Cancel a confirmed order
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .cancel_order(&user, &id)
        .await
        .record_err("cancel_order")?;
    Ok(success_response(order))
}

/// Mark a confirmed order delivered
pub async fn deliver_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .deliver_order(&user, &id)
        .await
        .record_err("deliver_order")?;
    Ok(success_response(order))
}

/// List orders visible to the caller
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Response, ServiceError> {
    let orders = state
        .services
        .orders
        .get_orders(&user)
        .await
        .record_err("list_orders")?;
    Ok(success_response(orders))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
    user: AuthUser,
) -> Result<Response, ServiceError> {
    let order = state
        .services
        .orders
        .get_order(&user, &id)
        .await
        .record_err("get_order")?;
    Ok(success_response(order))
}
