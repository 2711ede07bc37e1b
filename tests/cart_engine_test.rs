//! Cart engine: totals, line merging, validation and the snapshot cache.

mod common;

use assert_matches::assert_matches;
use commerce_api::{
    entities::{order, Order, OrderStatus, UserRole},
    errors::ServiceError,
    services::cart::{OrderWithItems, ProductDelta, UpdateCartInput},
};
use common::TestApp;
use sea_orm::{ActiveModelTrait, EntityTrait, PaginatorTrait, Set};

fn add(products: &[(&str, i32)]) -> UpdateCartInput {
    UpdateCartInput {
        add_products: products
            .iter()
            .map(|(id, qty)| ProductDelta::new(*id, *qty))
            .collect(),
        remove_products: Vec::new(),
    }
}

fn remove(products: &[&str]) -> UpdateCartInput {
    UpdateCartInput {
        add_products: Vec::new(),
        remove_products: products.iter().map(|id| id.to_string()).collect(),
    }
}

#[tokio::test]
async fn first_add_creates_cart_with_line_subtotals() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let p2 = app.seed_product(250, 10).await;

    let cart = app
        .services()
        .carts
        .update_cart_items(&user, add(&[(&p1.id, 2), (&p2.id, 1)]))
        .await
        .unwrap();

    assert_eq!(cart.order.status, OrderStatus::Cart);
    assert_eq!(cart.order.user_id, user.user_id);
    assert_eq!(cart.items.len(), 2);
    assert_eq!(cart.order.total, 450);
    assert_eq!(cart.order.total, cart.items_total());
}

#[tokio::test]
async fn adding_existing_product_increments_its_line() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let carts = &app.services().carts;

    let first = carts.update_cart_items(&user, add(&[(&p1.id, 2)])).await.unwrap();
    let second = carts.update_cart_items(&user, add(&[(&p1.id, 1)])).await.unwrap();

    assert_eq!(first.order.id, second.order.id);
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].item.quantity, 3);
    assert_eq!(second.items[0].item.price, 300);
    assert_eq!(second.order.total, 300);
    assert!(second.order.version > first.order.version);
}

#[tokio::test]
async fn repeated_products_in_one_request_are_merged() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;

    let cart = app
        .services()
        .carts
        .update_cart_items(&user, add(&[(&p1.id, 1), (&p1.id, 2)]))
        .await
        .unwrap();

    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].item.quantity, 3);
    assert_eq!(cart.order.total, 300);
}

#[tokio::test]
async fn removing_a_line_recomputes_total() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let p2 = app.seed_product(250, 10).await;
    let carts = &app.services().carts;

    carts
        .update_cart_items(&user, add(&[(&p1.id, 2), (&p2.id, 2)]))
        .await
        .unwrap();
    let cart = carts.update_cart_items(&user, remove(&[&p1.id])).await.unwrap();

    assert_eq!(cart.items.len(), 1);
    assert!(!cart.contains_product(&p1.id));
    assert_eq!(cart.order.total, 500);
}

#[tokio::test]
async fn remove_and_add_same_product_replaces_the_line() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let carts = &app.services().carts;

    carts.update_cart_items(&user, add(&[(&p1.id, 5)])).await.unwrap();
    let cart = carts
        .update_cart_items(
            &user,
            UpdateCartInput {
                add_products: vec![ProductDelta::new(p1.id.clone(), 1)],
                remove_products: vec![p1.id.clone()],
            },
        )
        .await
        .unwrap();

    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.items[0].item.quantity, 1);
    assert_eq!(cart.order.total, 100);
}

#[tokio::test]
async fn removing_from_empty_cart_fails() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;

    let err = app
        .services()
        .carts
        .update_cart_items(&user, remove(&["p1"]))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::BadRequest(msg) if msg == "Cannot remove products from an empty cart");
}

#[tokio::test]
async fn removing_product_not_in_cart_fails_without_changes() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let p2 = app.seed_product(250, 10).await;
    let carts = &app.services().carts;

    let before = carts.update_cart_items(&user, add(&[(&p1.id, 1)])).await.unwrap();
    let err = carts
        .update_cart_items(&user, remove(&[&p2.id]))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::BadRequest(msg) if msg == "Some products are not in the cart");
    let after = carts.get_cart(&user).await.unwrap();
    assert_eq!(after.order.version, before.order.version);
    assert_eq!(after.order.total, 100);
}

#[tokio::test]
async fn deleted_product_cannot_be_added() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    app.mark_deleted(&p1).await;

    let err = app
        .services()
        .carts
        .update_cart_items(&user, add(&[(&p1.id, 1)]))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::BadRequest(_));
    assert_eq!(Order::find().count(&*app.db).await.unwrap(), 0);
}

#[tokio::test]
async fn missing_product_aborts_the_whole_update() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let carts = &app.services().carts;

    carts.update_cart_items(&user, add(&[(&p1.id, 1)])).await.unwrap();
    let err = carts
        .update_cart_items(&user, add(&[(&p1.id, 1), ("no-such-product", 1)]))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::NotFound(_));
    let cart = carts.get_cart(&user).await.unwrap();
    assert_eq!(cart.items[0].item.quantity, 1);
    assert_eq!(cart.order.total, 100);
}

#[tokio::test]
async fn empty_update_is_rejected() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;

    let err = app
        .services()
        .carts
        .update_cart_items(&user, UpdateCartInput::default())
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn get_cart_without_cart_is_not_found() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;

    assert_matches!(
        app.services().carts.get_cart(&user).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn update_stores_snapshot_in_cache() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;

    let cart = app
        .services()
        .carts
        .update_cart_items(&user, add(&[(&p1.id, 2)]))
        .await
        .unwrap();

    let cached: OrderWithItems = app
        .cart_cache
        .get(&user.user_id)
        .await
        .unwrap()
        .expect("snapshot cached");
    assert_eq!(cached, cart);
}

#[tokio::test]
async fn snapshot_is_served_only_while_version_matches() {
    let app = TestApp::new().await;
    let user = app.seed_user(UserRole::User).await;
    let p1 = app.seed_product(100, 10).await;
    let carts = &app.services().carts;

    let cart = carts.update_cart_items(&user, add(&[(&p1.id, 2)])).await.unwrap();

    // A snapshot with the current version is trusted as is
    let mut tampered = cart.clone();
    tampered.items.clear();
    app.cart_cache
        .set(&user.user_id, &tampered, None)
        .await
        .unwrap();
    assert!(carts.get_cart(&user).await.unwrap().items.is_empty());

    // Once the row moves on, the snapshot is dropped and lines come from the store
    let mut row: order::ActiveModel = cart.order.clone().into();
    row.version = Set(cart.order.version + 1);
    row.update(&*app.db).await.unwrap();

    let fresh = carts.get_cart(&user).await.unwrap();
    assert_eq!(fresh.items.len(), 1);
    assert!(app
        .cart_cache
        .get::<OrderWithItems>(&user.user_id)
        .await
        .unwrap()
        .is_none());
}
