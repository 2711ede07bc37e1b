#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use commerce_api::{
    auth::{AuthConfig, AuthService, AuthUser},
    cache::{CacheBackend, InMemoryCache, JsonCache},
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    entities::{product, stock, user, Stock, UserRole},
    errors::ServiceError,
    services::{
        factory::{ServiceContainer, ServiceFactory},
        notifications::{MailData, Notifier},
        payments::{
            CardDetails, DbPaymentStore, InMemoryPaymentStore, MockPaymentGateway, PaymentGateway,
            PaymentRecord, PaymentStore,
        },
    },
    AppState,
};
use sea_orm::{ActiveModelTrait, EntityTrait, Set, TransactionTrait};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const TEST_CARD: &str = "4242424242424242";

/// Notifier that keeps every mail it is asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<MailData>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<MailData> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, mail: &MailData) -> Result<bool, ServiceError> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(true)
    }
}

/// Helper harness wiring the full service graph on an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DbPool>,
    pub cache: InMemoryCache,
    pub cart_cache: JsonCache,
    pub gateway: Arc<MockPaymentGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub auth: Arc<AuthService>,
    db_dir: Option<TempDir>,
}

impl TestApp {
    /// Construct a new test application with fresh database state.
    pub async fn new() -> Self {
        // A single connection keeps the in-memory database alive and shared
        let db_config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        Self::build(db_config, Arc::new(InMemoryPaymentStore::new()), None).await
    }

    /// Same wiring as a default deployment: a SQLite file behind the default
    /// pool settings, with payments stored in the database. The file lives in a
    /// temp dir removed with the app.
    pub async fn file_backed() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let db_config = DbConfig {
            url: format!("sqlite://{}?mode=rwc", dir.path().join("commerce.db").display()),
            ..Default::default()
        };
        Self::build(db_config, Arc::new(DbPaymentStore::new()), Some(dir)).await
    }

    async fn build(
        db_config: DbConfig,
        store: Arc<dyn PaymentStore>,
        db_dir: Option<TempDir>,
    ) -> Self {
        let mut cfg = AppConfig::new(
            db_config.url.clone(),
            "redis://127.0.0.1:6379".to_string(),
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.cache.backend = "in-memory".to_string();
        cfg.payment.store = if db_dir.is_some() { "database" } else { "memory" }.to_string();

        let pool = db::establish_connection_with_config(&db_config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let cache = InMemoryCache::new();
        let backend: Arc<dyn CacheBackend> = Arc::new(cache.clone());
        let cart_cache = JsonCache::new(backend.clone(), cfg.cache.cart_prefix.clone());
        let gateway = Arc::new(MockPaymentGateway::new(store, TEST_CARD));
        let notifier = Arc::new(RecordingNotifier::default());

        let factory = ServiceFactory::new(
            db.clone(),
            cart_cache.clone(),
            cfg.cache.cart_ttl(),
            gateway.clone(),
            notifier.clone(),
            cfg.payment.currency.clone(),
        );
        let services = ServiceContainer::new(&factory);
        let auth = Arc::new(AuthService::new(AuthConfig::new(JWT_SECRET.to_string())));

        let state = AppState {
            db: db.clone(),
            config: Arc::new(cfg),
            cache: backend,
            services,
            auth: auth.clone(),
        };
        let router = commerce_api::app(state.clone());

        Self {
            router,
            state,
            db,
            cache,
            cart_cache,
            gateway,
            notifier,
            auth,
            db_dir,
        }
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.state.services
    }

    /// Insert a user and return its principal
    pub async fn seed_user(&self, role: UserRole) -> AuthUser {
        let id = Uuid::new_v4().to_string();
        let email = format!("{}@example.com", &id[..8]);
        user::ActiveModel {
            id: Set(id.clone()),
            name: Set("Test User".to_string()),
            email: Set(email.clone()),
            role: Set(role),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed user");
        AuthUser::new(id, email, role)
    }

    /// Insert a product priced in minor units, with `quantity` units in stock
    pub async fn seed_product(&self, price: i64, quantity: i32) -> product::Model {
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            name: Set(format!("Product {}", price)),
            description: Set(Some("Seeded for integration tests".to_string())),
            price: Set(price),
            deleted: Set(false),
            category_id: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed product");

        stock::ActiveModel {
            product_id: Set(product.id.clone()),
            quantity: Set(quantity),
        }
        .insert(&*self.db)
        .await
        .expect("seed stock");

        product
    }

    pub async fn mark_deleted(&self, product: &product::Model) {
        let mut active: product::ActiveModel = product.clone().into();
        active.deleted = Set(true);
        active.update(&*self.db).await.expect("mark product deleted");
    }

    pub async fn stock_of(&self, product_id: &str) -> i32 {
        Stock::find_by_id(product_id.to_string())
            .one(&*self.db)
            .await
            .expect("read stock")
            .map(|row| row.quantity)
            .unwrap_or_default()
    }

    /// Payment record for an order, read in its own transaction
    pub async fn payment_of(&self, order_id: &str) -> Option<PaymentRecord> {
        let txn = self.db.begin().await.expect("begin transaction");
        let record = self
            .gateway
            .get_payment(&txn, order_id)
            .await
            .expect("read payment");
        txn.commit().await.expect("commit transaction");
        record
    }

    pub fn token_for(&self, user: &AuthUser) -> String {
        self.auth.issue_token(user).expect("issue token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub fn valid_card() -> CardDetails {
    CardDetails {
        card_number: TEST_CARD.to_string(),
        card_holder: "Jane Doe".to_string(),
        expiration_date: "12/99".to_string(),
        cvv: "123".to_string(),
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
