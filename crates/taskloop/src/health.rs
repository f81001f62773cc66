//! Startup health check for Ollama availability.

use crate::client::{ClientError, ModelClient};

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub healthy: bool,
    pub ollama_reachable: bool,
    pub model_available: bool,
    /// Human-readable status message.
    pub message: String,
    pub available_models: Vec<String>,
}

/// Check that Ollama is reachable and the configured model is installed.
///
/// Callers should pass a client configured with a short timeout and a single
/// attempt so startup feedback stays fast. Tag-suffixed names
/// (`llama3.2:latest`) count as a match for the bare model name.
pub async fn check<C: ModelClient>(client: &C, model: &str) -> HealthReport {
    let available_models = match client.list_models().await {
        Ok(models) => models,
        Err(ClientError::Connection(_)) => {
            return HealthReport {
                healthy: false,
                ollama_reachable: false,
                model_available: false,
                message: "Ollama not running. Start with: ollama serve".to_string(),
                available_models: Vec::new(),
            };
        }
        Err(e) => {
            return HealthReport {
                healthy: false,
                ollama_reachable: false,
                model_available: false,
                message: format!("Error connecting to Ollama: {e}"),
                available_models: Vec::new(),
            };
        }
    };

    let model_available = available_models
        .iter()
        .any(|m| m == model || m.starts_with(&format!("{model}:")));

    if !model_available {
        let message = if available_models.is_empty() {
            format!("Model '{model}' not found. Install with: ollama pull {model}\nNo models currently installed.")
        } else {
            let mut preview = available_models
                .iter()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            if available_models.len() > 5 {
                preview.push_str(&format!(" (+{} more)", available_models.len() - 5));
            }
            format!(
                "Model '{model}' not found. Install with: ollama pull {model}\nAvailable models: {preview}"
            )
        };
        return HealthReport {
            healthy: false,
            ollama_reachable: true,
            model_available: false,
            message,
            available_models,
        };
    }

    HealthReport {
        healthy: true,
        ollama_reachable: true,
        model_available: true,
        message: format!("Ollama ready with model '{model}'"),
        available_models,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ChatResponse, Message, Result};

    struct StubClient {
        models: Result<Vec<String>>,
    }

    impl ModelClient for StubClient {
        async fn chat(&self, _messages: &[Message], _model: &str) -> Result<ChatResponse> {
            unreachable!("health check never chats")
        }

        async fn list_models(&self) -> Result<Vec<String>> {
            match &self.models {
                Ok(models) => Ok(models.clone()),
                Err(ClientError::Connection(url)) => Err(ClientError::Connection(url.clone())),
                Err(ClientError::Timeout(s)) => Err(ClientError::Timeout(*s)),
                Err(ClientError::ModelNotFound(m)) => Err(ClientError::ModelNotFound(m.clone())),
                Err(ClientError::Api(m)) => Err(ClientError::Api(m.clone())),
            }
        }
    }

    #[tokio::test]
    async fn unreachable_ollama_reports_not_running() {
        let client = StubClient {
            models: Err(ClientError::Connection("http://localhost:11434".into())),
        };
        let report = check(&client, "llama3.2").await;
        assert!(!report.healthy);
        assert!(!report.ollama_reachable);
        assert!(report.message.contains("ollama serve"));
    }

    #[tokio::test]
    async fn tagged_model_name_counts_as_available() {
        let client = StubClient {
            models: Ok(vec!["llama3.2:latest".to_string()]),
        };
        let report = check(&client, "llama3.2").await;
        assert!(report.healthy);
        assert!(report.model_available);
        assert!(report.message.contains("llama3.2"));
    }

    #[tokio::test]
    async fn missing_model_lists_alternatives() {
        let client = StubClient {
            models: Ok(vec!["mistral".to_string(), "phi3".to_string()]),
        };
        let report = check(&client, "llama3.2").await;
        assert!(!report.healthy);
        assert!(report.ollama_reachable);
        assert!(report.message.contains("ollama pull llama3.2"));
        assert!(report.message.contains("mistral"));
    }

    #[tokio::test]
    async fn no_models_installed_message() {
        let client = StubClient { models: Ok(vec![]) };
        let report = check(&client, "llama3.2").await;
        assert!(!report.healthy);
        assert!(report.message.contains("No models currently installed"));
    }
}
