use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use lazy_static::lazy_static;
use regex::Regex;
use sea_orm::{
    ActiveModelTrait, DatabaseTransaction, DbErr, EntityTrait, IntoActiveModel, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use validator::Validate;

#[cfg(test)]
use mockall::automock;

use crate::{
    entities::{payment, Payment},
    errors::ServiceError,
};

lazy_static! {
    static ref CARD_NUMBER: Regex = Regex::new(r"^\d{16}$").unwrap();
    static ref EXPIRATION_DATE: Regex = Regex::new(r"^(0[1-9]|1[0-2])/\d{2}$").unwrap();
    static ref CVV: Regex = Regex::new(r"^\d{3}$").unwrap();
}

/// Card data supplied with a pay request. Never logged.
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    #[validate(regex(path = "CARD_NUMBER", message = "Card number must have 16 digits"))]
    pub card_number: String,
    #[validate(length(min = 1, message = "Card holder is required"))]
    pub card_holder: String,
    /// `MM/YY`
    #[validate(regex(path = "EXPIRATION_DATE", message = "Expiration date must be MM/YY"))]
    pub expiration_date: String,
    #[validate(regex(path = "CVV", message = "CVV must have 3 digits"))]
    pub cvv: String,
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last4 = self
            .card_number
            .get(self.card_number.len().saturating_sub(4)..)
            .unwrap_or("");
        f.debug_struct("CardDetails")
            .field("card_number", &format_args!("************{}", last4))
            .field("card_holder", &self.card_holder)
            .field("expiration_date", &self.expiration_date)
            .field("cvv", &"***")
            .finish()
    }
}

/// Gateway-side state of a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentState {
    Initialized,
    Captured,
    Refunded,
}

/// Per-order payment record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub order_id: String,
    pub amount: i64,
    pub currency: String,
    pub captured: bool,
    pub refunded: bool,
}

impl PaymentRecord {
    pub fn state(&self) -> PaymentState {
        if self.refunded {
            PaymentState::Refunded
        } else if self.captured {
            PaymentState::Captured
        } else {
            PaymentState::Initialized
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaymentError {
    #[error("{0}")]
    InvalidCard(String),
    #[error("Payment already exists")]
    AlreadyExists,
    #[error("Payment not found")]
    NotFound,
    #[error("Payment already captured")]
    AlreadyCaptured,
    #[error("Payment already refunded")]
    AlreadyRefunded,
    #[error("Only an initialized payment can be voided")]
    NotVoidable,
    #[error("Payment store error: {0}")]
    Store(String),
}

impl PaymentError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCard(_) => "invalid_card",
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::AlreadyCaptured => "already_captured",
            Self::AlreadyRefunded => "already_refunded",
            Self::NotVoidable => "not_voidable",
            Self::Store(_) => "store",
        }
    }
}

impl From<DbErr> for PaymentError {
    fn from(err: DbErr) -> Self {
        PaymentError::Store(err.to_string())
    }
}

impl From<PaymentError> for ServiceError {
    fn from(err: PaymentError) -> Self {
        let message = err.to_string();
        match err {
            PaymentError::InvalidCard(_) => ServiceError::PaymentFailed(message),
            PaymentError::AlreadyExists => ServiceError::Conflict(message),
            PaymentError::NotFound => ServiceError::NotFound(message),
            PaymentError::AlreadyCaptured
            | PaymentError::AlreadyRefunded
            | PaymentError::NotVoidable => ServiceError::InvalidStatus(message),
            PaymentError::Store(_) => ServiceError::InternalError(message),
        }
    }
}

/// Validates a card against the single accepted number and its `MM/YY` expiry.
pub fn validate_card(
    card: &CardDetails,
    accepted_card_number: &str,
    today: NaiveDate,
) -> Result<(), PaymentError> {
    let expired = || PaymentError::InvalidCard("Invalid credit card expiration date".to_string());

    let (month, year) = card
        .expiration_date
        .split_once('/')
        .ok_or_else(expired)?;
    let month: u32 = month.parse().map_err(|_| expired())?;
    let year: i32 = year.parse().map_err(|_| expired())?;
    if !(1..=12).contains(&month) || year < 0 || year > 99 {
        return Err(expired());
    }

    if (2000 + year, month) < (today.year(), today.month()) {
        return Err(expired());
    }

    if card.card_number != accepted_card_number {
        return Err(PaymentError::InvalidCard(
            "Invalid credit card number".to_string(),
        ));
    }

    Ok(())
}

/// Storage for payment records, keyed by order id.
///
/// Every operation runs on the caller's transaction so a payment moves together
/// with the order row it belongs to.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `AlreadyExists` if a record for the order is present.
    async fn insert(
        &self,
        txn: &DatabaseTransaction,
        record: PaymentRecord,
    ) -> Result<(), PaymentError>;
    async fn get(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError>;
    async fn update(
        &self,
        txn: &DatabaseTransaction,
        record: PaymentRecord,
    ) -> Result<(), PaymentError>;
    /// Returns whether a record was removed.
    async fn remove(&self, txn: &DatabaseTransaction, order_id: &str)
        -> Result<bool, PaymentError>;
}

/// Process-local records. Writes are not tied to the transaction and survive a rollback.
#[derive(Debug, Default)]
pub struct InMemoryPaymentStore {
    records: DashMap<String, PaymentRecord>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(
        &self,
        _txn: &DatabaseTransaction,
        record: PaymentRecord,
    ) -> Result<(), PaymentError> {
        match self.records.entry(record.order_id.clone()) {
            Entry::Occupied(_) => Err(PaymentError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(
        &self,
        _txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError> {
        Ok(self.records.get(order_id).map(|r| r.value().clone()))
    }

    async fn update(
        &self,
        _txn: &DatabaseTransaction,
        record: PaymentRecord,
    ) -> Result<(), PaymentError> {
        match self.records.get_mut(&record.order_id) {
            Some(mut slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(PaymentError::NotFound),
        }
    }

    async fn remove(
        &self,
        _txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<bool, PaymentError> {
        Ok(self.records.remove(order_id).is_some())
    }
}

/// Payment records persisted in the `payments` table
#[derive(Debug, Clone, Default)]
pub struct DbPaymentStore;

impl DbPaymentStore {
    pub fn new() -> Self {
        Self
    }
}

impl From<payment::Model> for PaymentRecord {
    fn from(model: payment::Model) -> Self {
        Self {
            order_id: model.order_id,
            amount: model.amount,
            currency: model.currency,
            captured: model.captured,
            refunded: model.refunded,
        }
    }
}

#[async_trait]
impl PaymentStore for DbPaymentStore {
    async fn insert(
        &self,
        txn: &DatabaseTransaction,
        record: PaymentRecord,
    ) -> Result<(), PaymentError> {
        let now = Utc::now();
        let row = payment::ActiveModel {
            order_id: Set(record.order_id),
            amount: Set(record.amount),
            currency: Set(record.currency),
            captured: Set(record.captured),
            refunded: Set(record.refunded),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match Payment::insert(row).exec_without_returning(txn).await {
            Ok(_) => Ok(()),
            Err(e) => match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => Err(PaymentError::AlreadyExists),
                _ => Err(e.into()),
            },
        }
    }

    async fn get(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError> {
        Ok(Payment::find_by_id(order_id.to_string())
            .one(txn)
            .await?
            .map(PaymentRecord::from))
    }

    async fn update(
        &self,
        txn: &DatabaseTransaction,
        record: PaymentRecord,
    ) -> Result<(), PaymentError> {
        let existing = Payment::find_by_id(record.order_id.clone())
            .one(txn)
            .await?
            .ok_or(PaymentError::NotFound)?;

        let mut row = existing.into_active_model();
        row.captured = Set(record.captured);
        row.refunded = Set(record.refunded);
        row.updated_at = Set(Utc::now());
        row.update(txn).await?;
        Ok(())
    }

    async fn remove(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<bool, PaymentError> {
        let result = Payment::delete_by_id(order_id.to_string())
            .exec(txn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

/// Money movement for an order: `NONE -> INITIALIZED -> CAPTURED`, and
/// `INITIALIZED | CAPTURED -> REFUNDED`. An `INITIALIZED` payment may also be voided.
///
/// Callers pass the transaction that moves the order, so a rollback undoes the
/// payment step as well when the store is transactional.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
        amount: i64,
        currency: &str,
        card: &CardDetails,
    ) -> Result<PaymentRecord, PaymentError>;

    async fn capture_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError>;

    async fn refund_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError>;

    /// Drops an initialized, uncaptured payment so the order can be paid again.
    async fn void_payment(&self, txn: &DatabaseTransaction, order_id: &str)
        -> Result<(), PaymentError>;

    async fn get_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError>;
}

/// Simulated gateway that accepts a single test card.
pub struct MockPaymentGateway {
    store: Arc<dyn PaymentStore>,
    accepted_card_number: String,
}

impl MockPaymentGateway {
    pub fn new(store: Arc<dyn PaymentStore>, accepted_card_number: impl Into<String>) -> Self {
        Self {
            store,
            accepted_card_number: accepted_card_number.into(),
        }
    }

    async fn existing(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError> {
        self.store
            .get(txn, order_id)
            .await?
            .ok_or(PaymentError::NotFound)
    }

    async fn initialize(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
        amount: i64,
        currency: &str,
        card: &CardDetails,
    ) -> Result<PaymentRecord, PaymentError> {
        validate_card(card, &self.accepted_card_number, Utc::now().date_naive())?;

        let record = PaymentRecord {
            order_id: order_id.to_string(),
            amount,
            currency: currency.to_string(),
            captured: false,
            refunded: false,
        };
        self.store.insert(txn, record.clone()).await?;
        info!(order_id = %order_id, amount, currency = %currency, "Payment initialized");
        Ok(record)
    }

    async fn capture(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError> {
        let mut record = self.existing(txn, order_id).await?;
        match record.state() {
            PaymentState::Captured => return Err(PaymentError::AlreadyCaptured),
            PaymentState::Refunded => return Err(PaymentError::AlreadyRefunded),
            PaymentState::Initialized => {}
        }

        record.captured = true;
        self.store.update(txn, record.clone()).await?;
        info!(order_id = %order_id, "Payment captured");
        Ok(record)
    }

    async fn refund(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError> {
        let mut record = self.existing(txn, order_id).await?;
        if record.state() == PaymentState::Refunded {
            return Err(PaymentError::AlreadyRefunded);
        }

        record.refunded = true;
        self.store.update(txn, record.clone()).await?;
        info!(order_id = %order_id, captured = record.captured, "Payment refunded");
        Ok(record)
    }

    async fn void(&self, txn: &DatabaseTransaction, order_id: &str) -> Result<(), PaymentError> {
        let record = self.existing(txn, order_id).await?;
        if record.state() != PaymentState::Initialized {
            return Err(PaymentError::NotVoidable);
        }

        self.store.remove(txn, order_id).await?;
        info!(order_id = %order_id, "Payment voided");
        Ok(())
    }
}

fn record_failure<T>(
    result: Result<T, PaymentError>,
    operation: &'static str,
) -> Result<T, PaymentError> {
    if let Err(e) = &result {
        warn!(operation, error = %e, "Payment operation failed");
        metrics::counter!(
            "payment_gateway_errors_total",
            1,
            "error_type" => e.kind(),
            "operation" => operation
        );
    }
    result
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    #[instrument(skip(self, txn, card))]
    async fn initialize_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
        amount: i64,
        currency: &str,
        card: &CardDetails,
    ) -> Result<PaymentRecord, PaymentError> {
        record_failure(
            self.initialize(txn, order_id, amount, currency, card).await,
            "initialize_payment",
        )
    }

    #[instrument(skip(self, txn))]
    async fn capture_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError> {
        record_failure(self.capture(txn, order_id).await, "capture_payment")
    }

    #[instrument(skip(self, txn))]
    async fn refund_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<PaymentRecord, PaymentError> {
        record_failure(self.refund(txn, order_id).await, "refund_payment")
    }

    #[instrument(skip(self, txn))]
    async fn void_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<(), PaymentError> {
        record_failure(self.void(txn, order_id).await, "void_payment")
    }

    async fn get_payment(
        &self,
        txn: &DatabaseTransaction,
        order_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError> {
        self.store.get(txn, order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use sea_orm::{Database, TransactionTrait};

    const CARD: &str = "4242424242424242";

    fn card(number: &str, expiry: &str) -> CardDetails {
        CardDetails {
            card_number: number.to_string(),
            card_holder: "Jane Doe".to_string(),
            expiration_date: expiry.to_string(),
            cvv: "123".to_string(),
        }
    }

    fn valid_card() -> CardDetails {
        card(CARD, "12/99")
    }

    fn gateway() -> MockPaymentGateway {
        MockPaymentGateway::new(Arc::new(InMemoryPaymentStore::new()), CARD)
    }

    async fn txn() -> DatabaseTransaction {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.begin().await.unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[rstest]
    #[case("06/25", true)]
    #[case("12/25", true)]
    #[case("01/30", true)]
    #[case("05/25", false)]
    #[case("12/24", false)]
    #[case("13/30", false)]
    #[case("00/30", false)]
    #[case("6/2025", false)]
    #[case("garbage", false)]
    fn expiry_must_be_current_month_or_later(#[case] expiry: &str, #[case] ok: bool) {
        let result = validate_card(&card(CARD, expiry), CARD, day(2025, 6, 15));
        assert_eq!(result.is_ok(), ok, "{expiry}");
        if !ok {
            assert_eq!(
                result.unwrap_err(),
                PaymentError::InvalidCard("Invalid credit card expiration date".into())
            );
        }
    }

    #[test]
    fn only_the_accepted_number_passes() {
        let result = validate_card(&card("4000000000000002", "12/30"), CARD, day(2025, 1, 1));
        assert_eq!(
            result.unwrap_err(),
            PaymentError::InvalidCard("Invalid credit card number".into())
        );
    }

    #[test]
    fn card_debug_output_is_redacted() {
        let rendered = format!("{:?}", valid_card());
        assert!(!rendered.contains(CARD));
        assert!(rendered.contains("4242"));
        assert!(!rendered.contains("123"));
    }

    #[test]
    fn card_shape_is_validated() {
        assert!(valid_card().validate().is_ok());
        assert!(card("4242", "12/30").validate().is_err());
        assert!(card(CARD, "2030-12").validate().is_err());
    }

    #[tokio::test]
    async fn initialize_capture_refund_round_trip() {
        let gw = gateway();
        let txn = txn().await;
        let init = gw
            .initialize_payment(&txn, "o1", 1000, "USD", &valid_card())
            .await
            .unwrap();
        assert_eq!(init.state(), PaymentState::Initialized);

        let captured = gw.capture_payment(&txn, "o1").await.unwrap();
        assert!(captured.captured && !captured.refunded);

        let refunded = gw.refund_payment(&txn, "o1").await.unwrap();
        assert!(refunded.captured && refunded.refunded);
        assert_eq!(refunded.state(), PaymentState::Refunded);
    }

    #[tokio::test]
    async fn duplicate_initialize_is_rejected() {
        let gw = gateway();
        let txn = txn().await;
        gw.initialize_payment(&txn, "o1", 1000, "USD", &valid_card())
            .await
            .unwrap();
        assert_eq!(
            gw.initialize_payment(&txn, "o1", 1000, "USD", &valid_card())
                .await
                .unwrap_err(),
            PaymentError::AlreadyExists
        );
    }

    #[tokio::test]
    async fn invalid_card_creates_no_record() {
        let gw = gateway();
        let txn = txn().await;
        let err = gw
            .initialize_payment(&txn, "o1", 1000, "USD", &card("1111222233334444", "12/99"))
            .await
            .unwrap_err();
        assert_matches!(err, PaymentError::InvalidCard(_));
        assert!(gw.get_payment(&txn, "o1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_on_missing_payment_fail_not_found() {
        let gw = gateway();
        let txn = txn().await;
        assert_eq!(gw.capture_payment(&txn, "nope").await.unwrap_err(), PaymentError::NotFound);
        assert_eq!(gw.refund_payment(&txn, "nope").await.unwrap_err(), PaymentError::NotFound);
        assert_eq!(gw.void_payment(&txn, "nope").await.unwrap_err(), PaymentError::NotFound);
    }

    #[tokio::test]
    async fn double_capture_and_double_refund_fail() {
        let gw = gateway();
        let txn = txn().await;
        gw.initialize_payment(&txn, "o1", 1, "USD", &valid_card())
            .await
            .unwrap();
        gw.capture_payment(&txn, "o1").await.unwrap();
        assert_eq!(
            gw.capture_payment(&txn, "o1").await.unwrap_err(),
            PaymentError::AlreadyCaptured
        );

        gw.refund_payment(&txn, "o1").await.unwrap();
        assert_eq!(
            gw.refund_payment(&txn, "o1").await.unwrap_err(),
            PaymentError::AlreadyRefunded
        );
    }

    #[tokio::test]
    async fn uncaptured_payment_can_be_refunded_but_not_captured_afterwards() {
        let gw = gateway();
        let txn = txn().await;
        gw.initialize_payment(&txn, "o1", 1, "USD", &valid_card())
            .await
            .unwrap();

        let refunded = gw.refund_payment(&txn, "o1").await.unwrap();
        assert!(!refunded.captured && refunded.refunded);
        assert_eq!(
            gw.capture_payment(&txn, "o1").await.unwrap_err(),
            PaymentError::AlreadyRefunded
        );
    }

    #[tokio::test]
    async fn void_removes_only_initialized_payments() {
        let gw = gateway();
        let txn = txn().await;
        gw.initialize_payment(&txn, "o1", 1, "USD", &valid_card())
            .await
            .unwrap();
        gw.void_payment(&txn, "o1").await.unwrap();
        assert!(gw.get_payment(&txn, "o1").await.unwrap().is_none());

        // the order can be paid again after a void
        gw.initialize_payment(&txn, "o1", 1, "USD", &valid_card())
            .await
            .unwrap();
        gw.capture_payment(&txn, "o1").await.unwrap();
        assert_eq!(gw.void_payment(&txn, "o1").await.unwrap_err(), PaymentError::NotVoidable);
    }

    #[tokio::test]
    async fn store_failures_surface_as_unexpected_errors() {
        let mut store = MockPaymentStore::new();
        store
            .expect_get()
            .returning(|_, _| Err(PaymentError::Store("connection reset".into())));
        let gw = MockPaymentGateway::new(Arc::new(store), CARD);
        let txn = txn().await;

        let err = gw.capture_payment(&txn, "o1").await.unwrap_err();
        assert_matches!(err, PaymentError::Store(_));
        assert_matches!(ServiceError::from(err), ServiceError::InternalError(_));
    }

    #[test]
    fn payment_errors_map_onto_the_service_taxonomy() {
        assert_matches!(
            ServiceError::from(PaymentError::AlreadyExists),
            ServiceError::Conflict(_)
        );
        assert_matches!(
            ServiceError::from(PaymentError::AlreadyCaptured),
            ServiceError::InvalidStatus(_)
        );
        assert_matches!(
            ServiceError::from(PaymentError::InvalidCard("x".into())),
            ServiceError::PaymentFailed(_)
        );
    }
}
