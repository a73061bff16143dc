//! Fire-and-accept action submission.

use actionstream_core::{AcceptedResponse, ActionId, ActionRequest, SandboxId};
use serde_json::Value;

use crate::{config::ClientConfig, error::ClientError};

/// Posts actions to the backend and returns their ids.
///
/// Never waits for the action to finish and never touches the stream.
#[derive(Debug, Clone)]
pub struct ActionSubmitter {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ActionSubmitter {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// Submit `request` to `sandbox_id`.
    ///
    /// # Errors
    /// - [`ClientError::Request`] if the backend cannot be reached
    /// - [`ClientError::Rejected`] for a non-success status
    /// - [`ClientError::InvalidResponse`] if a success carries no action id
    pub async fn submit(
        &self,
        sandbox_id: &SandboxId,
        request: &ActionRequest,
    ) -> Result<ActionId, ClientError> {
        let url = self.config.action_url(sandbox_id, request.kind);
        tracing::debug!(%sandbox_id, kind = %request.kind, %url, "Submitting action");

        let response = self.http.post(&url).json(&request.to_body()).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = extract_detail(&body);
            tracing::warn!(%sandbox_id, status = status.as_u16(), %detail, "Action rejected");
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let accepted: AcceptedResponse = serde_json::from_str(&body)
            .map_err(|e| ClientError::InvalidResponse(format!("expected an action id: {e}")))?;
        if accepted.action_id.as_str().is_empty() {
            return Err(ClientError::InvalidResponse("empty action id".to_string()));
        }
        tracing::info!(%sandbox_id, action_id = %accepted.action_id, kind = %request.kind, "Action accepted");
        Ok(accepted.action_id)
    }
}

/// `detail`, else `message`, else the raw body.
fn extract_detail(body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        ["detail", "message"]
            .into_iter()
            .find_map(|key| match value.get(key)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
    });
    from_json.unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, method, path},
    };

    use super::*;

    fn submitter(server: &MockServer) -> ActionSubmitter {
        ActionSubmitter::new(ClientConfig::new(server.uri())).unwrap()
    }

    #[tokio::test]
    async fn test_accepted_returns_backend_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb1/shell"))
            .and(body_json(serde_json::json!({ "command": "echo hi" })))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(serde_json::json!({ "action_id": "act-7" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = submitter(&server)
            .submit(&"sb1".to_string(), &ActionRequest::shell("echo hi"))
            .await
            .unwrap();
        assert_eq!(id, ActionId::from("act-7"));
    }

    #[tokio::test]
    async fn test_rejection_carries_status_and_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb1/ipython"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({ "detail": "no such sandbox" })),
            )
            .mount(&server)
            .await;

        let err = submitter(&server)
            .submit(&"sb1".to_string(), &ActionRequest::cell("1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected { status: 404, ref detail } if detail == "no such sandbox"
        ));
    }

    #[tokio::test]
    async fn test_rejection_with_plain_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom\n"))
            .mount(&server)
            .await;

        let err = submitter(&server)
            .submit(&"sb1".to_string(), &ActionRequest::cell("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 500, ref detail } if detail == "boom"));
    }

    #[tokio::test]
    async fn test_success_without_id_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let err = submitter(&server)
            .submit(&"sb1".to_string(), &ActionRequest::cell("1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let submitter = ActionSubmitter::new(ClientConfig::new(format!("http://{addr}"))).unwrap();
        let err = submitter
            .submit(&"sb1".to_string(), &ActionRequest::shell("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Request(_)));
    }

    #[test]
    fn test_extract_detail_prefers_detail() {
        assert_eq!(extract_detail(r#"{"message":"m","detail":"d"}"#), "d");
        assert_eq!(extract_detail(r#"{"message":"m"}"#), "m");
        assert_eq!(extract_detail(r#"{"detail":[{"loc":["body"]}]}"#), r#"[{"loc":["body"]}]"#);
        assert_eq!(extract_detail(""), "");
    }
}
