use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    cache::{CacheBackend, JsonCache},
    config::AppConfig,
    db::DbPool,
    errors::ServiceError,
    services::{
        cart::CartService,
        notifications::{LogNotifier, Notifier, SmtpNotifier},
        orders::OrderService,
        payments::{
            DbPaymentStore, InMemoryPaymentStore, MockPaymentGateway, PaymentGateway, PaymentStore,
        },
        stock::StockService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    cart_cache: JsonCache,
    cart_ttl: Option<std::time::Duration>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    currency: String,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies
    pub fn new(
        db_pool: Arc<DbPool>,
        cart_cache: JsonCache,
        cart_ttl: Option<std::time::Duration>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            cart_cache,
            cart_ttl,
            gateway,
            notifier,
            currency: currency.into(),
        }
    }

    /// Wires the collaborators selected by configuration
    pub fn from_config(
        config: &AppConfig,
        db_pool: Arc<DbPool>,
        cache: Arc<dyn CacheBackend>,
    ) -> Result<Self, ServiceError> {
        let store: Arc<dyn PaymentStore> = if config.uses_database_payment_store() {
            Arc::new(DbPaymentStore::new())
        } else {
            warn!("Payment records are kept in memory and will not survive a restart");
            Arc::new(InMemoryPaymentStore::new())
        };
        let gateway = Arc::new(MockPaymentGateway::new(
            store,
            config.payment.accepted_card_number.clone(),
        ));

        let notifier: Arc<dyn Notifier> = if config.smtp.enabled {
            info!(host = %config.smtp.host, "Sending order mails over SMTP");
            Arc::new(SmtpNotifier::new(&config.smtp)?)
        } else {
            info!("SMTP disabled, order mails are only logged");
            Arc::new(LogNotifier)
        };

        Ok(Self::new(
            db_pool,
            JsonCache::new(cache, config.cache.cart_prefix.clone()),
            config.cache.cart_ttl(),
            gateway,
            notifier,
            config.payment.currency.clone(),
        ))
    }

    /// Creates a stock ledger instance
    pub fn stock_service(&self) -> StockService {
        StockService::new(self.db_pool.clone())
    }

    /// Creates a cart engine instance
    pub fn cart_service(&self) -> CartService {
        CartService::new(self.db_pool.clone(), self.cart_cache.clone(), self.cart_ttl)
    }

    /// Creates an order lifecycle instance
    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db_pool.clone(),
            self.cart_service(),
            self.gateway.clone(),
            self.notifier.clone(),
            self.currency.clone(),
        )
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub stock: Arc<StockService>,
    pub carts: Arc<CartService>,
    pub orders: Arc<OrderService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            stock: Arc::new(factory.stock_service()),
            carts: Arc::new(factory.cart_service()),
            orders: Arc::new(factory.order_service()),
        }
    }
}
