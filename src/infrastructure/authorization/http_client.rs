//! HTTP 授权服务客户端
//!
//! 请求：`POST {endpoint}/verify`、`POST {endpoint}/verify/batch`
//! 非 2xx 响应与网络错误都作为错误返回，由订阅管理器按拒绝处理。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::model::ClientIdentity;
use crate::domain::repository::{AuthorizationDecision, AuthorizationService};
use crate::error::{RealtimeError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest<'a> {
    user_id: &'a str,
    organization_id: &'a str,
    roles: &'a [String],
    session_id: &'a str,
    topic: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchVerifyRequest<'a> {
    user_id: &'a str,
    organization_id: &'a str,
    roles: &'a [String],
    session_id: &'a str,
    topics: &'a [String],
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    topic: Option<String>,
    approved: bool,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct BatchVerifyResponse {
    decisions: Vec<VerifyResponse>,
}

pub struct HttpAuthorizationClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAuthorizationClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RealtimeError::Authorization(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|err| RealtimeError::Authorization(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RealtimeError::Authorization(format!(
                "authorization service returned {}",
                status
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| RealtimeError::Authorization(err.to_string()))
    }
}

#[async_trait]
impl AuthorizationService for HttpAuthorizationClient {
    async fn verify(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        session_id: &str,
    ) -> Result<AuthorizationDecision> {
        let request = VerifyRequest {
            user_id: &identity.user_id,
            organization_id: &identity.organization_id,
            roles: &identity.roles,
            session_id,
            topic,
        };
        let response: VerifyResponse = self.post("/verify", &request).await?;
        Ok(AuthorizationDecision {
            topic: topic.to_string(),
            approved: response.approved,
            reason: response.reason,
        })
    }

    async fn verify_batch(
        &self,
        identity: &ClientIdentity,
        topics: &[String],
        session_id: &str,
    ) -> Result<Vec<AuthorizationDecision>> {
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        let request = BatchVerifyRequest {
            user_id: &identity.user_id,
            organization_id: &identity.organization_id,
            roles: &identity.roles,
            session_id,
            topics,
        };
        let response: BatchVerifyResponse = self.post("/verify/batch", &request).await?;
        if response.decisions.len() != topics.len() {
            return Err(RealtimeError::Authorization(format!(
                "batch response size mismatch: expected {}, got {}",
                topics.len(),
                response.decisions.len()
            )));
        }

        Ok(topics
            .iter()
            .zip(response.decisions)
            .map(|(topic, decision)| AuthorizationDecision {
                topic: decision.topic.unwrap_or_else(|| topic.clone()),
                approved: decision.approved,
                reason: decision.reason,
            })
            .collect())
    }
}
