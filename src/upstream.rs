use axum::http::StatusCode;
use reqwest::Client;
use url::Url;

use crate::conf::ConfUpstream;

pub const MODEL: &str = "dall-e-3";
pub const SIZE: &str = "1024x1024";

const GENERATIONS_PATH: &str = "/v1/images/generations";

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("Prompt is required")]
    PromptRequired,

    #[error("OPENAI_API_KEY is not set")]
    MissingApiKey,

    #[error("OPENAI_API_BASE is not set")]
    MissingApiBase,

    #[error("OPENAI_API_BASE is not a valid URL: {0}")]
    InvalidApiBase(#[source] url::ParseError),

    #[error("Failed to generate image: {reason}")]
    Upstream {
        status: StatusCode,
        reason: String,
        body: String,
    },

    #[error("Unexpected API response structure")]
    UnexpectedResponse,

    #[error("Failed to process request")]
    Transport(#[source] reqwest::Error),
}

impl GenerateError {
    /// Upstream HTTP failures keep the upstream status.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PromptRequired => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => *status,
            Self::MissingApiKey
            | Self::MissingApiBase
            | Self::InvalidApiBase(_)
            | Self::UnexpectedResponse
            | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Option<String> {
        match self {
            Self::Upstream { body, .. } => Some(body.clone()),
            Self::Transport(error) => Some(error.to_string()),
            _ => None,
        }
    }
}

#[derive(serde::Serialize)]
struct GenerationsReq<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
}

#[derive(serde::Deserialize)]
struct GenerationsResp {
    data: Option<Vec<GenerationsDatum>>,
}

#[derive(serde::Deserialize)]
struct GenerationsDatum {
    url: Option<String>,
}

/// Client of the image generation API. Holds the credential; callers only
/// ever pass a prompt.
#[derive(Clone)]
pub struct Upstream {
    client: Client,
    api_key: Option<String>,
    api_base: Option<String>,
}

impl Upstream {
    pub fn new(conf: &ConfUpstream) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = conf.timeout()? {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            api_key: present(conf.api_key.as_deref()),
            api_base: present(conf.api_base.as_deref()),
        })
    }

    /// Returns the URL of the single image generated for `prompt`.
    ///
    /// Prompt and configuration are checked before anything goes over the
    /// network. Nothing is retried.
    #[tracing::instrument(name = "upstream", skip_all)]
    pub async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerateError::PromptRequired);
        }
        let api_key =
            self.api_key.as_deref().ok_or(GenerateError::MissingApiKey)?;
        let api_base =
            self.api_base.as_deref().ok_or(GenerateError::MissingApiBase)?;
        let url = Url::parse(api_base)
            .and_then(|base| base.join(GENERATIONS_PATH))
            .map_err(GenerateError::InvalidApiBase)?;

        tracing::debug!(%url, "Requesting image generation.");
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(&GenerationsReq {
                model: MODEL,
                prompt,
                n: 1,
                size: SIZE,
            })
            .send()
            .await
            .map_err(|error| {
                tracing::error!(?error, "Failed to reach upstream.");
                GenerateError::Transport(error)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body =
                response.text().await.map_err(GenerateError::Transport)?;
            tracing::error!(%status, body = %body, "Upstream returned an error.");
            return Err(GenerateError::Upstream {
                status,
                reason: status.canonical_reason().unwrap_or("").to_string(),
                body,
            });
        }

        let body = response.bytes().await.map_err(GenerateError::Transport)?;
        let parsed: GenerationsResp =
            serde_json::from_slice(&body).map_err(|error| {
                tracing::error!(
                    ?error,
                    body = %String::from_utf8_lossy(&body),
                    "Unparsable upstream response."
                );
                GenerateError::UnexpectedResponse
            })?;
        parsed
            .data
            .and_then(|data| data.into_iter().next())
            .and_then(|datum| datum.url)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                tracing::error!(
                    body = %String::from_utf8_lossy(&body),
                    "Unexpected upstream response structure."
                );
                GenerateError::UnexpectedResponse
            })
    }
}

fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;
    use wiremock::{
        matchers::{body_json, header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::{GenerateError, Upstream};
    use crate::conf::ConfUpstream;

    fn upstream(api_key: Option<&str>, api_base: Option<&str>) -> Upstream {
        Upstream::new(&ConfUpstream {
            api_key: api_key.map(str::to_string),
            api_base: api_base.map(str::to_string),
            timeout: None,
        })
        .unwrap()
    }

    async fn mock(server: &MockServer, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn sends_fixed_payload_and_returns_first_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_json(json!({
                "model": "dall-e-3",
                "prompt": "a cat",
                "n": 1,
                "size": "1024x1024",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"url": "https://x/img.png"},
                    {"url": "https://x/other.png"},
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let url = upstream(Some("sk-test"), Some(&server.uri()))
            .generate("  a cat \n")
            .await
            .unwrap();

        assert_eq!(url, "https://x/img.png");
    }

    #[tokio::test]
    async fn base_path_is_replaced() {
        let server = MockServer::start().await;
        mock(
            &server,
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": [{"url": "https://x/1.png"}]})),
        )
        .await;

        let base = format!("{}/some/prefix/", server.uri());
        let url = upstream(Some("k"), Some(&base)).generate("p").await.unwrap();

        assert_eq!(url, "https://x/1.png");
    }

    #[tokio::test]
    async fn upstream_failure_carries_status_and_body() {
        let server = MockServer::start().await;
        mock(
            &server,
            ResponseTemplate::new(500).set_body_string("rate limited"),
        )
        .await;

        let error = upstream(Some("k"), Some(&server.uri()))
            .generate("p")
            .await
            .unwrap_err();

        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.details().as_deref(), Some("rate limited"));
        assert!(matches!(
            &error,
            GenerateError::Upstream { status, body, .. }
                if *status == StatusCode::INTERNAL_SERVER_ERROR
                    && body == "rate limited"
        ));
        assert_eq!(
            error.to_string(),
            "Failed to generate image: Internal Server Error"
        );
    }

    #[tokio::test]
    async fn upstream_status_is_not_interpreted() {
        let server = MockServer::start().await;
        mock(&server, ResponseTemplate::new(429).set_body_string("slow down"))
            .await;

        let error = upstream(Some("k"), Some(&server.uri()))
            .generate("p")
            .await
            .unwrap_err();

        assert_eq!(error.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(matches!(error, GenerateError::Upstream { .. }));
    }

    #[tokio::test]
    async fn malformed_success_bodies_are_unexpected_structure() {
        let bodies = [
            json!({"data": []}),
            json!({"data": null}),
            json!({}),
            json!({"data": [{}]}),
            json!({"data": [{"url": ""}]}),
            json!({"data": "nope"}),
        ];
        for body in bodies {
            let server = MockServer::start().await;
            mock(&server, ResponseTemplate::new(200).set_body_json(&body)).await;

            let error = upstream(Some("k"), Some(&server.uri()))
                .generate("p")
                .await
                .unwrap_err();

            assert!(
                matches!(error, GenerateError::UnexpectedResponse),
                "body={body}"
            );
            assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[tokio::test]
    async fn non_json_success_body_is_unexpected_structure() {
        let server = MockServer::start().await;
        mock(&server, ResponseTemplate::new(200).set_body_string("<html>"))
            .await;

        let error = upstream(Some("k"), Some(&server.uri()))
            .generate("p")
            .await
            .unwrap_err();

        assert!(matches!(error, GenerateError::UnexpectedResponse));
    }

    #[tokio::test]
    async fn rejects_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let uri = server.uri();

        let error = upstream(Some("k"), Some(&uri))
            .generate(" \t ")
            .await
            .unwrap_err();
        assert!(matches!(error, GenerateError::PromptRequired));
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);

        let error = upstream(None, Some(&uri)).generate("p").await.unwrap_err();
        assert!(matches!(error, GenerateError::MissingApiKey));
        assert_eq!(error.to_string(), "OPENAI_API_KEY is not set");

        let error = upstream(Some("  "), Some(&uri)).generate("p").await.unwrap_err();
        assert!(matches!(error, GenerateError::MissingApiKey));

        let error = upstream(Some("k"), None).generate("p").await.unwrap_err();
        assert!(matches!(error, GenerateError::MissingApiBase));
        assert_eq!(error.to_string(), "OPENAI_API_BASE is not set");
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let error = upstream(Some("k"), Some("not a url"))
            .generate("p")
            .await
            .unwrap_err();
        assert!(matches!(error, GenerateError::InvalidApiBase(_)));
    }

    #[test]
    fn unrepresentable_timeout_fails_construction() {
        let result = Upstream::new(&ConfUpstream {
            api_key: Some("k".to_string()),
            api_base: Some("http://127.0.0.1:9".to_string()),
            timeout: Some(1e30),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_transport_failure() {
        let uri = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("http://{}", listener.local_addr().unwrap())
        };

        let error = upstream(Some("k"), Some(&uri)).generate("p").await.unwrap_err();

        assert!(matches!(error, GenerateError::Transport(_)));
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(error.details().is_some());
    }
}
