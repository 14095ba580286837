use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use super::mapping::UnmappedFieldSet;
use crate::llm::{parse_json_object, CompletionRequest, CompletionService, LlmError, Usage};

const SYSTEM_PROMPT: &str =
    "You are an expert at organizing insurance form contact and entity data. Return ONLY valid JSON.";

#[derive(Debug, Error)]
pub enum OrganizerError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("LLM response did not contain a JSON object")]
    Unparseable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrganizerOutcome {
    pub success: bool,
    pub unformatted_data: Map<String, Value>,
    pub tokens_used: Option<Usage>,
    pub error: Option<String>,
}

/// Groups leftover fields (insured, producer, insurers...) into entities with one LLM call.
pub struct AcordOrganizer {
    llm: Arc<dyn CompletionService>,
}

impl AcordOrganizer {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    /// Never fails: LLM or parse failures degrade to an empty object.
    pub async fn organize_unformatted(&self, unmapped: &UnmappedFieldSet) -> OrganizerOutcome {
        if unmapped.is_empty() {
            tracing::debug!("No unmapped fields, skipping organizer");
            return OrganizerOutcome {
                success: true,
                unformatted_data: Map::new(),
                tokens_used: None,
                error: None,
            };
        }

        match self.organize(unmapped).await {
            Ok((data, usage)) => {
                tracing::info!(entities = data.len(), "Organizer grouped unmapped fields");
                OrganizerOutcome { success: true, unformatted_data: data, tokens_used: usage, error: None }
            }
            Err(e) => {
                tracing::warn!("Organizer failed, continuing without entity data: {}", e);
                OrganizerOutcome {
                    success: false,
                    unformatted_data: Map::new(),
                    tokens_used: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn organize(
        &self,
        unmapped: &UnmappedFieldSet,
    ) -> Result<(Map<String, Value>, Option<Usage>), OrganizerError> {
        let request = CompletionRequest::new(SYSTEM_PROMPT, build_guidance_prompt(unmapped))
            .temperature(0.0)
            .json();
        let completion = self.llm.complete(request).await?;
        let data = parse_json_object(&completion.content).ok_or(OrganizerError::Unparseable)?;
        Ok((data, completion.usage))
    }
}

/// Fields with empty values are left out of the prompt.
pub fn build_guidance_prompt(unmapped: &UnmappedFieldSet) -> String {
    let compact: Map<String, Value> = unmapped
        .iter()
        .filter_map(|(k, v)| {
            let rendered = match v {
                Value::Null => return None,
                Value::String(s) if s.trim().is_empty() => return None,
                Value::String(s) => s.trim().to_string(),
                Value::Bool(true) => "Yes".to_string(),
                Value::Bool(false) => "No".to_string(),
                other => other.to_string(),
            };
            Some((k.clone(), Value::String(rendered)))
        })
        .collect();
    let input = Value::Object(compact).to_string();

    format!(
        r#"Organize these insurance certificate fields into logical groups.

INPUT: {input}

OUTPUT FORMAT:
{{
  "insured": {{"name": "...", "address": "..."}},
  "producer": {{"name": "...", "address": "...", "contact_person": "...", "phone": "...", "fax": "...", "email": "..."}},
  "certificate_holder": {{"name": "...", "address": "..."}},
  "insurers": [{{"letter": "A", "name": "...", "naic": "..."}}],
  "additional_fields": {{}}
}}

RULES:
1. Combine address parts (street, city, state, zip) into one address string.
2. List every insurer with its letter, full name and NAIC code.
3. Put anything that fits no group into additional_fields.
4. Leave out groups with no data. Do not invent values."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Completion;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedLlm {
        reply: Result<String, ()>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn new(reply: Result<&str, ()>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionService for ScriptedLlm {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request);
            match &self.reply {
                Ok(content) => Ok(Completion {
                    content: content.clone(),
                    usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
                    model: "scripted".into(),
                }),
                Err(()) => Err(LlmError::EmptyResponse),
            }
        }

        fn model_name(&self) -> String {
            "scripted".into()
        }
    }

    fn unmapped(pairs: &[(&str, Value)]) -> UnmappedFieldSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn empty_input_skips_the_llm() {
        let llm = ScriptedLlm::new(Ok("{}"));
        let organizer = AcordOrganizer::new(llm.clone());
        let outcome = organizer.organize_unformatted(&UnmappedFieldSet::new()).await;
        assert!(outcome.success);
        assert!(outcome.unformatted_data.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fenced_reply_is_parsed() {
        let llm = ScriptedLlm::new(Ok("```json\n{\"insured\": {\"name\": \"Acme LLC\"}}\n```"));
        let organizer = AcordOrganizer::new(llm.clone());
        let outcome = organizer
            .organize_unformatted(&unmapped(&[("NamedInsured_FullName_A", json!("Acme LLC"))]))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.unformatted_data["insured"]["name"], "Acme LLC");
        assert_eq!(outcome.tokens_used.unwrap().total_tokens, 15);

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].json_response);
        assert_eq!(prompts[0].temperature, Some(0.0));
        assert_eq!(prompts[0].messages[0].content, SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_empty_object() {
        let organizer = AcordOrganizer::new(ScriptedLlm::new(Err(())));
        let outcome = organizer.organize_unformatted(&unmapped(&[("X", json!("y"))])).await;
        assert!(!outcome.success);
        assert!(outcome.unformatted_data.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn garbage_reply_degrades_to_empty_object() {
        let organizer = AcordOrganizer::new(ScriptedLlm::new(Ok("I cannot help with that")));
        let outcome = organizer.organize_unformatted(&unmapped(&[("X", json!("y"))])).await;
        assert!(!outcome.success);
        assert!(outcome.unformatted_data.is_empty());
    }

    #[test]
    fn prompt_skips_empty_values() {
        let prompt = build_guidance_prompt(&unmapped(&[
            ("Producer_FullName_A", json!("Broker Co")),
            ("Producer_FaxNumber_A", json!("  ")),
            ("Insurer_NAICCode_B", Value::Null),
        ]));
        assert!(prompt.contains(r#"INPUT: {"Producer_FullName_A":"Broker Co"}"#));
        assert!(!prompt.contains("Producer_FaxNumber_A"));
        assert!(prompt.contains("\"insurers\": [{\"letter\": \"A\""));
    }
}
