//! Notification dispatching and payment request formatting.
//!
//! The messaging transport is an external collaborator behind the
//! [`NotificationDispatcher`] trait. This module also owns payment tokens and
//! the public payment URLs built from them.

use crate::config::billing::BillingSettings;
use async_trait::async_trait;
use rand::{Rng, distributions::Alphanumeric};
use std::fmt::Write as _;
use tracing::info;

/// Number of random characters after the token prefix.
pub const PAYMENT_TOKEN_LEN: usize = 5;

/// Outbound messaging channel.
///
/// Implementations report delivery with the returned flag only; the engine
/// never waits for any further confirmation.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Sends `body` to `recipient`. Returns whether the message was accepted.
    async fn send(&self, recipient: &str, body: &str) -> bool;
}

/// Dispatcher that writes messages to the log instead of a real channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn send(&self, recipient: &str, body: &str) -> bool {
        info!(recipient, body, "Payment request (log dispatcher)");
        true
    }
}

/// One bill line in a payment request.
#[derive(Debug, Clone)]
pub struct PaymentLine {
    /// Bill id
    pub bill_id: i64,
    /// Hours covered by the bill
    pub hours: f64,
    /// Amount due
    pub amount: f64,
    /// Public payment URL
    pub url: String,
}

/// Everything a payment request message shows.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    /// Student's display name
    pub student_name: String,
    /// Package round being billed
    pub round_number: i32,
    /// Hours purchased in the round
    pub package_hours: f64,
    /// Currency of every amount
    pub currency: String,
    /// Bills included in the request
    pub lines: Vec<PaymentLine>,
}

impl PaymentRequest {
    /// Sum of every line's amount.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.lines.iter().map(|line| line.amount).sum()
    }
}

/// Renders a payment request as a plain-text message.
#[must_use]
pub fn format_payment_request(request: &PaymentRequest) -> String {
    let mut body = format!(
        "Hello {}, your package round {} ({:.2} h) is complete.\n",
        request.student_name, request.round_number, request.package_hours
    );
    for line in &request.lines {
        let _ = writeln!(
            body,
            "Invoice #{}: {:.2} h, {:.2} {} - pay at {}",
            line.bill_id, line.hours, line.amount, request.currency, line.url
        );
    }
    let _ = write!(
        body,
        "Total due: {:.2} {}",
        request.total(),
        request.currency
    );
    body
}

/// Generates a candidate payment token: the configured prefix followed by
/// [`PAYMENT_TOKEN_LEN`] random alphanumeric characters. Uniqueness is checked
/// by the caller against the bills table.
#[must_use]
pub fn generate_payment_token(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PAYMENT_TOKEN_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

/// The part of a token that appears in the public payment URL.
#[must_use]
pub fn token_suffix<'a>(settings: &BillingSettings, token: &'a str) -> &'a str {
    token
        .strip_prefix(settings.payment_token_prefix.as_str())
        .unwrap_or(token)
}

/// Public, unauthenticated payment URL for a token.
#[must_use]
pub fn payment_url(settings: &BillingSettings, token: &str) -> String {
    format!(
        "{}/payment/{}",
        settings.payment_base_url.trim_end_matches('/'),
        token_suffix(settings, token)
    )
}
