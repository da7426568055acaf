//! Client for an NER serving endpoint speaking the `instances` / `predictions` protocol.

use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, Result};
use crate::model::EntityModel;
use crate::record::Entity;

/// Blocking client that posts batches of texts to a remote NER service.
#[derive(Clone)]
pub struct HttpNerModel {
    client: Client,
    endpoint: Url,
    max_retries: usize,
}

impl HttpNerModel {
    /// Builds a client for `endpoint`.
    pub fn new(endpoint: Url, timeout: Duration, max_retries: usize) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| PipelineError::model_load(endpoint.as_str(), err))?;
        Ok(Self {
            client,
            endpoint,
            max_retries: max_retries.max(1),
        })
    }

    fn request(&self, texts: &[&str]) -> Result<PredictionResponse> {
        let payload = PredictionRequest {
            instances: texts
                .iter()
                .enumerate()
                .map(|(idx, text)| Instance {
                    post_url: idx.to_string(),
                    content: *text,
                })
                .collect(),
        };

        let mut attempt = 0usize;
        loop {
            let response = self
                .client
                .post(self.endpoint.clone())
                .json(&payload)
                .send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json().map_err(|err| {
                            PipelineError::Model(format!("failed to parse NER response: {err}"))
                        });
                    }

                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tracing::warn!(%status, attempt, "NER service busy, retrying");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(PipelineError::Model(format!(
                        "NER request failed ({status}): {body}"
                    )));
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        tracing::warn!(error = %err, attempt, "NER request failed, retrying");
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(PipelineError::Model(format!("NER request failed: {err}")));
                }
            }
        }
    }
}

impl EntityModel for HttpNerModel {
    fn extract(&mut self, texts: &[&str]) -> Result<Vec<Vec<Entity>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.request(texts)?;
        if response.predictions.len() != texts.len() {
            return Err(PipelineError::Model(format!(
                "NER service returned {} predictions for {} texts",
                response.predictions.len(),
                texts.len()
            )));
        }

        response
            .predictions
            .into_iter()
            .enumerate()
            .map(|(idx, prediction)| {
                if prediction.post_url != idx.to_string() {
                    return Err(PipelineError::Model(format!(
                        "prediction {idx} answers instance `{}`",
                        prediction.post_url
                    )));
                }
                prediction
                    .entities
                    .into_iter()
                    .map(ServiceEntity::into_entity)
                    .collect()
            })
            .collect()
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct PredictionRequest<'a> {
    instances: Vec<Instance<'a>>,
}

#[derive(Serialize)]
struct Instance<'a> {
    post_url: String,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    post_url: String,
    #[serde(default)]
    entities: Vec<ServiceEntity>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntity {
    text: String,
    entity_type: String,
    entity_startchar: Offset,
    entity_endchar: Offset,
}

/// The reference service declares offsets as strings; accept either form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Offset {
    Number(usize),
    Text(String),
}

impl Offset {
    fn value(self) -> Result<usize> {
        match self {
            Offset::Number(n) => Ok(n),
            Offset::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| PipelineError::Model(format!("invalid entity offset `{s}`"))),
        }
    }
}

impl ServiceEntity {
    fn into_entity(self) -> Result<Entity> {
        Ok(Entity::new(
            self.text,
            self.entity_type,
            self.entity_startchar.value()?,
            self.entity_endchar.value()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_string_and_numeric_offsets() {
        let body = r#"{"predictions":[{"post_url":"0","entities":[
            {"text":"UK","entity_type":"GPE","entity_startchar":"4","entity_endchar":6}
        ]}]}"#;
        let parsed: PredictionResponse = serde_json::from_str(body).unwrap();
        let entity = parsed
            .predictions
            .into_iter()
            .next()
            .unwrap()
            .entities
            .into_iter()
            .next()
            .unwrap()
            .into_entity()
            .unwrap();
        assert_eq!(entity, Entity::new("UK", "GPE", 4, 6));
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(retry_backoff(1), Duration::from_millis(1000));
        assert_eq!(retry_backoff(9), retry_backoff(5));
    }
}
