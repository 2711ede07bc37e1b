use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{config::SmtpConfig, entities::OrderModel, errors::ServiceError};

/// A single outgoing mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailData {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Delivers order mails. `Ok(true)` means the recipient was accepted.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, mail: &MailData) -> Result<bool, ServiceError>;
}

/// SMTP delivery through lettre
pub struct SmtpNotifier {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, ServiceError> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| ServiceError::NotificationError(format!("Invalid from address: {}", e)))?;

        let creds = Credentials::new(config.user.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                ServiceError::NotificationError(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self { from, transport })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, mail: &MailData) -> Result<bool, ServiceError> {
        let to: Mailbox = mail
            .to
            .parse()
            .map_err(|e| ServiceError::NotificationError(format!("Invalid recipient: {}", e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&mail.subject)
            .header(ContentType::TEXT_HTML)
            .body(mail.html.clone())
            .map_err(|e| {
                ServiceError::NotificationError(format!("Failed to build message: {}", e))
            })?;

        let response = self.transport.send(message).await.map_err(|e| {
            ServiceError::NotificationError(format!("Failed to send email: {}", e))
        })?;

        info!(to = %mail.to, subject = %mail.subject, "Email sent");
        Ok(response.is_positive())
    }
}

/// Writes mails to the log instead of sending them. Used when SMTP is disabled.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, mail: &MailData) -> Result<bool, ServiceError> {
        info!(to = %mail.to, subject = %mail.subject, "[LOG] Email would be sent");
        Ok(true)
    }
}

/// Sends `mail`, logging and counting failures instead of returning them.
pub async fn send_best_effort(notifier: &dyn Notifier, mail: MailData) {
    match notifier.send(&mail).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(to = %mail.to, subject = %mail.subject, "Mail recipient was not accepted");
            metrics::counter!("commerce_notifications_failed_total", 1, "reason" => "rejected");
        }
        Err(e) => {
            warn!(to = %mail.to, subject = %mail.subject, error = %e, "Failed to send mail");
            metrics::counter!("commerce_notifications_failed_total", 1, "reason" => "error");
        }
    }
}

fn format_amount(minor_units: i64) -> String {
    let sign = if minor_units < 0 { "-" } else { "" };
    let abs = minor_units.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn order_confirmed_mail(to: &str, order: &OrderModel, currency: &str) -> MailData {
    MailData {
        to: to.to_string(),
        subject: "Your order has been confirmed".to_string(),
        html: format!(
            "<h1>Thank you for your order!</h1>\
             <p>Order <strong>{}</strong> was paid and confirmed.</p>\
             <p>Total: {} {}</p>\
             <p>Shipping to: {}</p>",
            html_escape(&order.id),
            format_amount(order.total),
            html_escape(currency),
            html_escape(order.address.as_deref().unwrap_or("-")),
        ),
    }
}

pub fn order_cancelled_mail(to: &str, order: &OrderModel) -> MailData {
    MailData {
        to: to.to_string(),
        subject: "Your order has been cancelled".to_string(),
        html: format!(
            "<h1>Order cancelled</h1>\
             <p>Order <strong>{}</strong> was cancelled and your payment refunded.</p>",
            html_escape(&order.id),
        ),
    }
}

pub fn order_delivered_mail(to: &str, order: &OrderModel) -> MailData {
    MailData {
        to: to.to_string(),
        subject: "Your order has been delivered".to_string(),
        html: format!(
            "<h1>Order delivered</h1>\
             <p>Order <strong>{}</strong> has been delivered. Enjoy!</p>",
            html_escape(&order.id),
        ),
    }
}
