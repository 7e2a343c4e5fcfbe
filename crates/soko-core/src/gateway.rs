use crate::error::MarketError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Initialization handle returned by the payment processor. The storefront
/// hands `authorization_url`/`access_code` to the checkout widget; the engine
/// only keeps the reference for later verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInit {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedStatus {
    Success,
    Failed,
    Abandoned,
}

/// Verified payment facts as reported by the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentVerification {
    pub reference: String,
    pub status: VerifiedStatus,
    pub amount_minor: u64,
    pub channel: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub payer_email: String,
}

/// Payment processor contract (Paystack-style initialize/verify).
///
/// Implementations must be side-effect free on `verify_payment`: the engine
/// re-invokes it on retries and relies on its own state guards for
/// exactly-once settlement.
#[async_trait]
pub trait PaymentGateway: Send + Sync + std::fmt::Debug {
    fn provider(&self) -> &'static str;

    async fn initialize_payment(
        &self,
        email: &str,
        amount_minor: u64,
        order_ref: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<PaymentInit, MarketError>;

    async fn verify_payment(&self, reference: &str) -> Result<PaymentVerification, MarketError>;
}

/// Bound a gateway call with a timeout. On elapse the order must stay
/// pending; reconciliation happens through an explicit later verify, never by
/// assuming success.
pub async fn with_deadline<T>(
    provider: &'static str,
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, MarketError>>,
) -> Result<T, MarketError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(MarketError::upstream(
            provider,
            format!("no response within {}ms", deadline.as_millis()),
        )),
    }
}
