//! HTTP surface: routing, auth, validation and the `{error}` response contract.

mod common;

use axum::http::{Method, StatusCode};
use commerce_api::entities::UserRole;
use common::{response_json, TestApp, TEST_CARD};
use serde_json::{json, Value};

fn pay_body() -> Value {
    json!({
        "address": "1 Main St, Springfield",
        "card": {
            "cardNumber": TEST_CARD,
            "cardHolder": "Jane Doe",
            "expirationDate": "12/99",
            "cvv": "123"
        }
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/health", None, None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn requests_without_token_are_unauthorized() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/order", None, None).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn garbage_token_is_unauthorized() {
    let app = TestApp::new().await;

    let response = app
        .request(Method::GET, "/api/v1/order", None, Some("not-a-jwt"))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn invalid_bodies_are_bad_requests() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let token = app.token_for(&user);

    for body in [
        json!({}),
        json!({"addProducts": [{"productId": "p1", "quantity": 0}]}),
        json!({"addProducts": [], "unexpected": true}),
        json!({"addProducts": "p1"}),
        json!({"addProducts": [{"productId": "p1", "quantity": 1_000_001}]}),
    ] {
        let response = app
            .request(Method::POST, "/api/v1/order/update", Some(body), Some(&token))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert!(body["error"].is_string());
    }
}

#[tokio::test]
async fn oversized_quantities_for_one_product_are_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let token = app.token_for(&user);
    let p1 = app.seed_product(100, 5).await;

    for lines in [
        json!([
            {"productId": p1.id, "quantity": i32::MAX},
            {"productId": p1.id, "quantity": 1}
        ]),
        json!([
            {"productId": p1.id, "quantity": 600_000},
            {"productId": p1.id, "quantity": 600_000}
        ]),
    ] {
        let response = app
            .request(
                Method::POST,
                "/api/v1/order/update",
                Some(json!({ "addProducts": lines })),
                Some(&token),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response_json(response).await["error"].is_string());
    }

    // An existing line can not be pushed past the limit either
    let response = app
        .request(
            Method::POST,
            "/api/v1/order/update",
            Some(json!({"addProducts": [{"productId": p1.id, "quantity": 900_000}]})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .request(
            Method::POST,
            "/api/v1/order/update",
            Some(json!({"addProducts": [{"productId": p1.id, "quantity": 200_000}]})),
            Some(&token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response_json(response).await["error"],
        "Quantity is too large"
    );
}

#[tokio::test]
async fn cart_to_delivery_over_http() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let admin = app.seed_user(UserRole::Admin).await;
    let user_token = app.token_for(&user);
    let admin_token = app.token_for(&admin);
    let p1 = app.seed_product(100, 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/order/update",
            Some(json!({"addProducts": [{"productId": p1.id, "quantity": 2}]})),
            Some(&user_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cart = response_json(response).await;
    assert_eq!(cart["status"], "CART");
    assert_eq!(cart["total"], 200);
    assert_eq!(cart["items"][0]["productId"], p1.id.as_str());
    let order_id = cart["id"].as_str().unwrap().to_string();

    let response = app
        .request(Method::GET, "/api/v1/order/cart", None, Some(&user_token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["id"], order_id.as_str());

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order/{}/pay", order_id),
            Some(pay_body()),
            Some(&user_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let paid = response_json(response).await;
    assert_eq!(paid["status"], "CONFIRMED");
    assert_eq!(app.stock_of(&p1.id).await, 3);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order/{}/cancel", order_id),
            None,
            Some(&user_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order/{}/delivery", order_id),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["status"], "DELIVERED");

    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order/{}/cancel", order_id),
            None,
            Some(&admin_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response_json(response).await["error"],
        "Order cannot be canceled"
    );

    let response = app
        .request(Method::GET, "/api/v1/order", None, Some(&user_token))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let orders = response_json(response).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/order/{}", order_id),
            None,
            Some(&user_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn paying_with_malformed_card_is_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let token = app.token_for(&user);
    let p1 = app.seed_product(100, 5).await;

    let cart = app
        .request(
            Method::POST,
            "/api/v1/order/update",
            Some(json!({"addProducts": [{"productId": p1.id, "quantity": 1}]})),
            Some(&token),
        )
        .await;
    let order_id = response_json(cart).await["id"].as_str().unwrap().to_string();

    let mut body = pay_body();
    body["card"]["expirationDate"] = json!("13/30");
    let response = app
        .request(
            Method::POST,
            &format!("/api/v1/order/{}/pay", order_id),
            Some(body),
            Some(&token),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.stock_of(&p1.id).await, 5);
}

#[tokio::test]
async fn missing_cart_is_reported_as_error_body() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let token = app.token_for(&user);

    let response = app
        .request(Method::GET, "/api/v1/order/cart", None, Some(&token))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await["error"], "Cart not found");
}

#[tokio::test]
async fn stock_endpoints_require_admin_for_changes() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let admin = app.seed_user(UserRole::Admin).await;
    let user_token = app.token_for(&user);
    let admin_token = app.token_for(&admin);
    let p1 = app.seed_product(100, 5).await;
    let base = format!("/api/v1/stock/product/{}", p1.id);

    let response = app.request(Method::GET, &base, None, Some(&user_token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let stock = response_json(response).await;
    assert_eq!(stock["productId"], p1.id.as_str());
    assert_eq!(stock["quantity"], 5);

    let response = app
        .request(
            Method::POST,
            &format!("{}/add", base),
            Some(json!({"quantity": 3})),
            Some(&user_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .request(
            Method::POST,
            &format!("{}/add", base),
            Some(json!({"quantity": 3})),
            Some(&admin_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["quantity"], 8);

    let response = app
        .request(
            Method::POST,
            &format!("{}/remove", base),
            Some(json!({"quantity": 2})),
            Some(&admin_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["quantity"], 6);

    let response = app
        .request(
            Method::POST,
            &format!("{}/remove", base),
            Some(json!({"quantity": 100})),
            Some(&admin_token),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await["error"], "Insufficient stock");
    assert_eq!(app.stock_of(&p1.id).await, 6);
}
