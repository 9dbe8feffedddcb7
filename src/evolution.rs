use serde_json::{json, Value};

use crate::config::AppConfig;

/// Evolution API wrapper: send-text and send-media only. Non-2xx responses
/// surface as `Err` with the body captured verbatim so callers can attach
/// the message to per-recipient results.
#[derive(Clone)]
pub struct EvolutionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
}

impl EvolutionClient {
    pub fn from_config(http: reqwest::Client, config: &AppConfig) -> Option<Self> {
        if !config.evolution_configured() {
            return None;
        }
        Some(Self {
            http,
            base_url: config.evolution_api_url.clone(),
            api_key: config.evolution_api_key.clone(),
            instance: config.evolution_instance.clone(),
        })
    }

    #[cfg(test)]
    pub fn for_tests(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: "test-key".to_string(),
            instance: "test-instance".to_string(),
        }
    }

    async fn post(&self, endpoint: &str, payload: Value) -> Result<Value, String> {
        let url = format!("{}/{}/{}", self.base_url, endpoint, self.instance);
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| format!("evolution request failed: {err}"))?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("evolution returned {status}: {raw_body}"));
        }
        Ok(serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body })))
    }

    pub async fn send_text(&self, number: &str, text: &str) -> Result<Value, String> {
        self.post(
            "message/sendText",
            json!({
                "number": number,
                "text": text,
            }),
        )
        .await
    }

    pub async fn send_image(
        &self,
        number: &str,
        media_url: &str,
        caption: &str,
    ) -> Result<Value, String> {
        self.post(
            "message/sendMedia",
            json!({
                "number": number,
                "mediatype": "image",
                "media": media_url,
                "caption": caption,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn send_text_hits_the_instance_endpoint_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendText/test-instance"))
            .and(header("apikey", "test-key"))
            .and(body_partial_json(json!({
                "number": "5511988887777",
                "text": "Olá Maria!"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "key": { "id": "MSG1" }
            })))
            .mount(&server)
            .await;

        let client = EvolutionClient::for_tests(reqwest::Client::new(), &server.uri());
        let result = client.send_text("5511988887777", "Olá Maria!").await.unwrap();
        assert_eq!(result["key"]["id"], "MSG1");
    }

    #[tokio::test]
    async fn non_success_status_carries_the_body_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("number not on whatsapp"))
            .mount(&server)
            .await;

        let client = EvolutionClient::for_tests(reqwest::Client::new(), &server.uri());
        let err = client.send_text("123", "oi").await.unwrap_err();
        assert!(err.contains("400"));
        assert!(err.contains("number not on whatsapp"));
    }

    #[tokio::test]
    async fn send_image_uses_the_media_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message/sendMedia/test-instance"))
            .and(body_partial_json(json!({
                "mediatype": "image",
                "media": "https://site.example/fotos/casa1.jpg"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "status": "ok" })))
            .mount(&server)
            .await;

        let client = EvolutionClient::for_tests(reqwest::Client::new(), &server.uri());
        client
            .send_image("5511988887777", "https://site.example/fotos/casa1.jpg", "Casa Jardim Europa")
            .await
            .unwrap();
    }
}
