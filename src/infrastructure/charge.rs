//! Charge processor adapters.

use crate::config::ProcessorConfig;
use crate::domain::ports::{ChargeOutcome, ChargeProcessor, ChargeRequest};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Off-session charges through a Stripe-style PaymentIntents API.
pub struct HttpChargeProcessor {
    base_url: String,
    api_key: SecretString,
    currency: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    last_payment_error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    payment_intent: Option<IntentRef>,
}

#[derive(Debug, Deserialize)]
struct IntentRef {
    id: String,
}

impl ApiErrorBody {
    fn reason(&self) -> String {
        self.decline_code
            .clone()
            .or_else(|| self.code.clone())
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "card_error".to_string())
    }
}

impl HttpChargeProcessor {
    pub fn new(config: &ProcessorConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            currency: config.currency.to_lowercase(),
            client,
        })
    }
}

#[async_trait]
impl ChargeProcessor for HttpChargeProcessor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome> {
        let params = [
            ("amount", request.amount.cents()?.to_string()),
            ("currency", self.currency.clone()),
            ("customer", request.customer_ref.clone()),
            ("confirm", "true".to_string()),
            ("off_session", "true".to_string()),
        ];

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        debug!(%status, idempotency_key = %request.idempotency_key, "Processor answered");

        if status.is_success() {
            let intent: PaymentIntent = response.json().await?;
            if intent.status == "succeeded" {
                return Ok(ChargeOutcome::succeeded(intent.id));
            }
            let reason = intent
                .last_payment_error
                .as_ref()
                .map(ApiErrorBody::reason)
                .unwrap_or_else(|| intent.status.clone());
            return Ok(ChargeOutcome::declined(intent.id, reason));
        }

        if status == StatusCode::PAYMENT_REQUIRED || status.is_client_error() {
            let envelope: ApiErrorEnvelope = response.json().await.map_err(|e| {
                BillingError::Processor(format!("Unreadable {} response: {}", status, e))
            })?;
            let reference = envelope
                .error
                .payment_intent
                .as_ref()
                .map(|intent| intent.id.clone())
                .unwrap_or_default();
            return Ok(ChargeOutcome::declined(reference, envelope.error.reason()));
        }

        Err(BillingError::Processor(format!(
            "Processor answered {}",
            status
        )))
    }
}

/// One step of a [`ScriptedChargeProcessor`] script.
#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Succeed,
    Decline(String),
    /// The processor call itself fails.
    Error(String),
    /// The processor never answers.
    Hang,
}

/// Deterministic processor: replays a script of outcomes in order and records
/// every request it receives. Once the script is exhausted it falls back to
/// `default`.
pub struct ScriptedChargeProcessor {
    script: Mutex<VecDeque<ScriptedCharge>>,
    default: ScriptedCharge,
    requests: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedChargeProcessor {
    pub fn new(script: impl IntoIterator<Item = ScriptedCharge>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            default: ScriptedCharge::Succeed,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(outcome: ScriptedCharge) -> Self {
        Self {
            default: outcome,
            ..Self::new(Vec::new())
        }
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChargeProcessor for ScriptedChargeProcessor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome> {
        let step = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        let sequence = {
            let mut requests = self
                .requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            requests.push(request);
            requests.len()
        };
        let reference = format!("pi_scripted_{:04}", sequence);

        match step {
            ScriptedCharge::Succeed => Ok(ChargeOutcome::succeeded(reference)),
            ScriptedCharge::Decline(reason) => Ok(ChargeOutcome::declined(reference, reason)),
            ScriptedCharge::Error(message) => Err(BillingError::Processor(message)),
            ScriptedCharge::Hang => {
                std::future::pending::<()>().await;
                Err(BillingError::Processor("unreachable".to_string()))
            }
        }
    }
}
