use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use loot_schemas::{
    Account, BatchOutcome, ClaimOutcome, ClaimRequest, ErrorBody, Identity, IssuedNonce,
    ItemBatchRequest, ItemOp, NonceRequest, RegisterRequest, RejectReason,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response inside the request deadline.
    Timeout,
    /// The server answered with a taxonomy reason.
    Rejected(RejectReason),
    /// Non-2xx without a recognizable reason.
    Http { status: u16, body: String },
    Network(String),
    Decode(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::Network(_) => true,
            TransportError::Rejected(r) => r.is_retryable(),
            TransportError::Http { status, .. } => *status >= 500,
            TransportError::Decode(_) => false,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Rejected(r) => write!(f, "rejected: {r}"),
            TransportError::Http { status, body } => write!(f, "http {status}: {body}"),
            TransportError::Network(m) => write!(f, "network error: {m}"),
            TransportError::Decode(m) => write!(f, "response decode failed: {m}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The client's view of the daemon.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn register(&self, identity: &Identity) -> Result<Account, TransportError>;

    async fn request_nonce(
        &self,
        identity: &Identity,
        session_ref: &str,
    ) -> Result<IssuedNonce, TransportError>;

    /// Claim rejections come back as `Ok(ClaimOutcome::Rejected)`.
    async fn submit_claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, TransportError>;

    async fn batch_items(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
    ) -> Result<BatchOutcome, TransportError>;
}

/// JSON over HTTP with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(from_reqwest)?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()));
        }
        if let Ok(ErrorBody {
            reason: Some(reason),
            ..
        }) = serde_json::from_slice::<ErrorBody>(&bytes)
        {
            return Err(TransportError::Rejected(reason));
        }
        Err(TransportError::Http {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

fn from_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn register(&self, identity: &Identity) -> Result<Account, TransportError> {
        self.post(
            "/v1/accounts/register",
            &RegisterRequest {
                identity: identity.clone(),
            },
        )
        .await
    }

    async fn request_nonce(
        &self,
        identity: &Identity,
        session_ref: &str,
    ) -> Result<IssuedNonce, TransportError> {
        self.post(
            "/v1/nonce",
            &NonceRequest {
                identity: identity.clone(),
                session_ref: session_ref.to_string(),
            },
        )
        .await
    }

    async fn submit_claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, TransportError> {
        match self.post("/v1/claims", req).await {
            Err(TransportError::Rejected(reason)) => Ok(ClaimOutcome::Rejected { reason }),
            other => other,
        }
    }

    async fn batch_items(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
    ) -> Result<BatchOutcome, TransportError> {
        self.post(
            "/v1/items/batch",
            &ItemBatchRequest {
                identity: identity.clone(),
                ops: ops.to_vec(),
            },
        )
        .await
    }
}
