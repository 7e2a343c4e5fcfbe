//! Payment gateway adapters for the soko settlement engine.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use soko_core::error::MarketError;
use soko_core::gateway::{PaymentGateway, PaymentInit, PaymentVerification, VerifiedStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Deterministic Paystack-contract gateway for local settlement simulation.
///
/// `initialize_payment` issues a reference and records a successful charge
/// for the initialized amount, so a follow-up `verify_payment` behaves like a
/// sandbox transaction the buyer completed. Tests and operators can script
/// failures per reference with [`MockPaystackGateway::mark_failed`].
#[derive(Debug, Default)]
pub struct MockPaystackGateway {
    charges: Mutex<HashMap<String, PaymentVerification>>,
}

impl MockPaystackGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a failed charge for a reference.
    pub fn mark_failed(&self, reference: &str) {
        self.charges.lock().unwrap().insert(
            reference.to_string(),
            PaymentVerification {
                reference: reference.to_string(),
                status: VerifiedStatus::Failed,
                amount_minor: 0,
                channel: String::new(),
                paid_at: None,
                payer_email: String::new(),
            },
        );
    }

    /// Script a successful charge for an externally issued reference.
    pub fn mark_paid(&self, reference: &str, amount_minor: u64, email: &str) {
        self.charges.lock().unwrap().insert(
            reference.to_string(),
            PaymentVerification {
                reference: reference.to_string(),
                status: VerifiedStatus::Success,
                amount_minor,
                channel: "card".to_string(),
                paid_at: Some(Utc::now()),
                payer_email: email.to_string(),
            },
        );
    }
}

#[async_trait]
impl PaymentGateway for MockPaystackGateway {
    fn provider(&self) -> &'static str {
        "paystack-mock"
    }

    async fn initialize_payment(
        &self,
        email: &str,
        amount_minor: u64,
        order_ref: &str,
        _metadata: BTreeMap<String, String>,
    ) -> Result<PaymentInit, MarketError> {
        let short_id: String = Uuid::new_v4().simple().to_string().chars().take(12).collect();
        let reference = format!("PS-{}", short_id.to_uppercase());

        self.charges.lock().unwrap().insert(
            reference.clone(),
            PaymentVerification {
                reference: reference.clone(),
                status: VerifiedStatus::Success,
                amount_minor,
                channel: "card".to_string(),
                paid_at: Some(Utc::now()),
                payer_email: email.to_string(),
            },
        );

        Ok(PaymentInit {
            authorization_url: format!("https://checkout.paystack.test/{order_ref}/{reference}"),
            access_code: format!("AC_{short_id}"),
            reference,
        })
    }

    async fn verify_payment(&self, reference: &str) -> Result<PaymentVerification, MarketError> {
        self.charges
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| {
                MarketError::upstream(
                    "paystack-mock",
                    format!("transaction reference '{reference}' not found"),
                )
            })
    }
}

/// Deterministic failing gateway useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailGateway {
    reason: String,
}

impl AlwaysFailGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for AlwaysFailGateway {
    fn provider(&self) -> &'static str {
        "always-fail"
    }

    async fn initialize_payment(
        &self,
        _email: &str,
        _amount_minor: u64,
        _order_ref: &str,
        _metadata: BTreeMap<String, String>,
    ) -> Result<PaymentInit, MarketError> {
        Err(MarketError::upstream("always-fail", self.reason.clone()))
    }

    async fn verify_payment(&self, _reference: &str) -> Result<PaymentVerification, MarketError> {
        Err(MarketError::upstream("always-fail", self.reason.clone()))
    }
}

/// Gateway that answers after a fixed delay, for deadline testing.
#[derive(Debug, Clone)]
pub struct StallingGateway {
    delay: Duration,
}

impl StallingGateway {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl PaymentGateway for StallingGateway {
    fn provider(&self) -> &'static str {
        "stalling"
    }

    async fn initialize_payment(
        &self,
        _email: &str,
        _amount_minor: u64,
        _order_ref: &str,
        _metadata: BTreeMap<String, String>,
    ) -> Result<PaymentInit, MarketError> {
        tokio::time::sleep(self.delay).await;
        Err(MarketError::upstream("stalling", "gateway unreachable"))
    }

    async fn verify_payment(&self, _reference: &str) -> Result<PaymentVerification, MarketError> {
        tokio::time::sleep(self.delay).await;
        Err(MarketError::upstream("stalling", "gateway unreachable"))
    }
}
