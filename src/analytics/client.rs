//! Analytics collaborator: typed results, the backend trait, and the
//! Gemini `generateContent` client.
//!
//! Every call is best-effort. The model is asked for strict JSON; the
//! response still gets defensive extraction (fence stripping, outermost
//! braces) and tolerant parsing with defaults, because conversational
//! models decorate their output.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::intent;
use crate::session::{Role, TranscriptEntry};

/// Gemini REST endpoint base.
const GENERATE_URL_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

// ── Result payloads ────────────────────────────────────────────────

/// Sentiment of the latest customer utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentResult {
    #[serde(default)]
    pub score: u8,
    #[serde(default = "neutral")]
    pub sentiment: String,
    #[serde(default)]
    pub reason: String,
    #[serde(rename = "shouldEscalate", default)]
    pub should_escalate: bool,
}

fn neutral() -> String {
    "neutral".into()
}

impl SentimentResult {
    /// Escalation policy: model opinion OR score at/above the threshold
    /// OR a hot sentiment label.
    pub fn escalates(&self, threshold: u8) -> bool {
        self.should_escalate
            || self.score >= threshold
            || matches!(self.sentiment.as_str(), "frustrated" | "angry")
    }
}

/// Whole-conversation analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    #[serde(default)]
    pub intent: String,
    #[serde(default = "neutral")]
    pub sentiment: String,
    #[serde(rename = "sentimentScore", default)]
    pub sentiment_score: u8,
    #[serde(rename = "escalationRisk", default)]
    pub escalation_risk: String,
    #[serde(rename = "keyIssues", default)]
    pub key_issues: Vec<String>,
}

impl ConversationAnalysis {
    /// Deterministic fallback when the collaborator fails on a
    /// non-empty conversation.
    pub fn fallback(transcript_text: &str) -> Self {
        Self {
            intent: intent::classify(transcript_text).to_string(),
            sentiment: "neutral".into(),
            sentiment_score: 0,
            escalation_risk: "unknown".into(),
            key_issues: Vec::new(),
        }
    }
}

/// Coaching advice for the supervisor panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachingAdvice {
    #[serde(rename = "coachingTip", default)]
    pub coaching_tip: String,
    #[serde(rename = "suggestedResponses", default)]
    pub suggested_responses: Vec<String>,
    #[serde(default = "neutral")]
    pub tone: String,
    #[serde(default)]
    pub priority: String,
}

/// End-of-call summary payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    #[serde(default = "neutral")]
    pub sentiment: String,
    #[serde(default)]
    pub intent: String,
    #[serde(rename = "resolutionStatus", default)]
    pub resolution_status: String,
    #[serde(rename = "keyTopics", default)]
    pub key_topics: Vec<String>,
    #[serde(rename = "actionItems", default)]
    pub action_items: Vec<String>,
    #[serde(rename = "frustrationTrend", default)]
    pub frustration_trend: String,
    #[serde(rename = "fullText", default)]
    pub full_text: String,
    #[serde(default)]
    pub insights: String,
}

impl CallSummary {
    /// Neutral placeholder when the collaborator fails at end-of-call.
    pub fn placeholder(transcript_text: &str, frustration_trend: &str) -> Self {
        Self {
            sentiment: "neutral".into(),
            intent: intent::classify(transcript_text).to_string(),
            resolution_status: "unknown".into(),
            key_topics: Vec::new(),
            action_items: Vec::new(),
            frustration_trend: frustration_trend.into(),
            full_text: "Summary unavailable".into(),
            insights: String::new(),
        }
    }
}

// ── Backend trait ──────────────────────────────────────────────────

/// The analysis collaborator the mediation core consumes.
///
/// Session-level tests substitute a scripted double; production wires
/// up [`GeminiAnalytics`].
#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    /// Sentiment of the latest customer sentence given recent context.
    async fn sentiment(
        &self,
        latest: &str,
        recent: &[TranscriptEntry],
    ) -> Result<SentimentResult>;

    /// Intent/risk analysis over the full transcript.
    async fn analyze(&self, transcript: &[TranscriptEntry]) -> Result<ConversationAnalysis>;

    /// Coaching advice from recent context and the triggering sentence.
    async fn coaching(&self, latest: &str, recent: &[TranscriptEntry])
        -> Result<CoachingAdvice>;

    /// End-of-call summary over the full transcript.
    async fn summarize(&self, transcript: &[TranscriptEntry]) -> Result<CallSummary>;
}

// ── Transcript rendering ───────────────────────────────────────────

/// Render transcript entries as `role: content` lines for prompts.
pub fn render_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let role = match e.role {
                Role::Customer => "customer",
                Role::Ai => "agent",
                Role::Supervisor => "supervisor",
            };
            format!("{role}: {}", e.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Concatenated content only, for the fallback classifier.
pub fn concat_content(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

// ── JSON extraction ────────────────────────────────────────────────

/// Pull the outermost JSON object out of a model reply, tolerating
/// markdown fences and prose around it.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

// ── Gemini client ──────────────────────────────────────────────────

/// `generateContent` client for the analysis model.
pub struct GeminiAnalytics {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiAnalytics {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: GENERATE_URL_BASE.to_string(),
        }
    }

    /// Point at a different endpoint (local test server).
    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// One generateContent round-trip; returns the model's text part.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        let body = serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "system_instruction": {
                "parts": [{ "text": system }],
            },
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 1024,
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Analytics request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Analytics provider returned {status}: {text}");
        }

        let value: serde_json::Value = response
            .json()
            .await
            .context("Analytics response was not JSON")?;

        value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .context("Analytics response had no text part")
    }

    /// Parse a typed result out of a model reply.
    fn parse<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
        let json = extract_json(raw).context("No JSON object in analytics reply")?;
        serde_json::from_str(json).context("Analytics reply did not match expected shape")
    }
}

#[async_trait]
impl AnalyticsBackend for GeminiAnalytics {
    async fn sentiment(
        &self,
        latest: &str,
        recent: &[TranscriptEntry],
    ) -> Result<SentimentResult> {
        let prompt = format!(
            "Recent conversation:\n{}\n\nLatest customer message: \"{latest}\"\n\n\
             Rate the customer's frustration. Respond with ONLY a JSON object:\n\
             {{\"score\": <0-100>, \"sentiment\": \"<calm|neutral|annoyed|frustrated|angry>\", \
             \"reason\": \"<one sentence>\", \"shouldEscalate\": <bool>}}",
            render_transcript(recent)
        );
        let raw = self
            .generate("You analyze customer-support conversations.", &prompt)
            .await?;
        Self::parse(&raw)
    }

    async fn analyze(&self, transcript: &[TranscriptEntry]) -> Result<ConversationAnalysis> {
        let prompt = format!(
            "Conversation so far:\n{}\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"intent\": \"<complaint|cancellation|purchase|support|inquiry|feedback|unknown>\", \
             \"sentiment\": \"<label>\", \"sentimentScore\": <0-100>, \
             \"escalationRisk\": \"<low|medium|high>\", \"keyIssues\": [\"...\"]}}",
            render_transcript(transcript)
        );
        let raw = self
            .generate("You analyze customer-support conversations.", &prompt)
            .await?;
        Self::parse(&raw)
    }

    async fn coaching(
        &self,
        latest: &str,
        recent: &[TranscriptEntry],
    ) -> Result<CoachingAdvice> {
        let prompt = format!(
            "Recent conversation:\n{}\n\nLatest customer message: \"{latest}\"\n\n\
             Coach the support agent handling this call. Respond with ONLY a JSON object:\n\
             {{\"coachingTip\": \"<one sentence>\", \"suggestedResponses\": [\"...\", \"...\"], \
             \"tone\": \"<label>\", \"priority\": \"<low|medium|high>\"}}",
            render_transcript(recent)
        );
        let raw = self
            .generate("You coach customer-support agents in real time.", &prompt)
            .await?;
        Self::parse(&raw)
    }

    async fn summarize(&self, transcript: &[TranscriptEntry]) -> Result<CallSummary> {
        let prompt = format!(
            "Full call transcript:\n{}\n\n\
             Write the post-call record. Respond with ONLY a JSON object:\n\
             {{\"sentiment\": \"<label>\", \"intent\": \"<label>\", \
             \"resolutionStatus\": \"<resolved|unresolved|escalated|unknown>\", \
             \"keyTopics\": [\"...\"], \"actionItems\": [\"...\"], \
             \"frustrationTrend\": \"<rising|falling|stable>\", \
             \"fullText\": \"<2-3 sentence summary>\", \"insights\": \"<one sentence>\"}}",
            render_transcript(transcript)
        );
        let raw = self
            .generate("You write post-call summaries for support calls.", &prompt)
            .await?;
        Self::parse(&raw)
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(role: Role, content: &str) -> TranscriptEntry {
        TranscriptEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    #[test]
    fn extract_json_strips_fences_and_prose() {
        let raw = "Sure! Here you go:\n```json\n{\"score\": 85}\n```\nLet me know.";
        assert_eq!(extract_json(raw), Some("{\"score\": 85}"));
        assert_eq!(extract_json("{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn sentiment_parses_with_defaults() {
        let raw = r#"{"score": 85, "sentiment": "angry", "reason": "repeated complaints", "shouldEscalate": true}"#;
        let result: SentimentResult = GeminiAnalytics::parse(raw).unwrap();
        assert_eq!(result.score, 85);
        assert!(result.should_escalate);

        // Missing fields default instead of failing.
        let sparse: SentimentResult = GeminiAnalytics::parse(r#"{"score": 10}"#).unwrap();
        assert_eq!(sparse.sentiment, "neutral");
        assert!(!sparse.should_escalate);
    }

    #[test]
    fn escalation_policy_is_threshold_or_label_or_model() {
        let by_score = SentimentResult {
            score: 70,
            sentiment: "neutral".into(),
            reason: String::new(),
            should_escalate: false,
        };
        assert!(by_score.escalates(70));
        assert!(!by_score.escalates(80));

        let by_label = SentimentResult {
            score: 10,
            sentiment: "angry".into(),
            reason: String::new(),
            should_escalate: false,
        };
        assert!(by_label.escalates(70));

        let by_model = SentimentResult {
            score: 10,
            sentiment: "calm".into(),
            reason: String::new(),
            should_escalate: true,
        };
        assert!(by_model.escalates(70));
    }

    #[test]
    fn coaching_parses_both_known_shapes() {
        // The rich tip-plus-suggestions shape.
        let rich = r#"{"coachingTip": "Acknowledge the delay", "suggestedResponses": ["I understand", "Let me fix that"], "tone": "empathetic", "priority": "high"}"#;
        let advice: CoachingAdvice = GeminiAnalytics::parse(rich).unwrap();
        assert_eq!(advice.suggested_responses.len(), 2);
        assert_eq!(advice.priority, "high");

        // The flat tip-only shape some callers produce.
        let flat = r#"{"coachingTip": "Slow down and recap"}"#;
        let advice: CoachingAdvice = GeminiAnalytics::parse(flat).unwrap();
        assert_eq!(advice.coaching_tip, "Slow down and recap");
        assert!(advice.suggested_responses.is_empty());
        assert_eq!(advice.tone, "neutral");
    }

    #[test]
    fn analysis_fallback_uses_keyword_classifier() {
        let fallback =
            ConversationAnalysis::fallback("I want to cancel my subscription immediately");
        assert_eq!(fallback.intent, "cancellation");
        assert_eq!(fallback.sentiment, "neutral");
        assert_eq!(fallback.escalation_risk, "unknown");
    }

    #[test]
    fn summary_placeholder_is_neutral() {
        let placeholder = CallSummary::placeholder("the app is broken", "rising");
        assert_eq!(placeholder.sentiment, "neutral");
        assert_eq!(placeholder.intent, "support");
        assert_eq!(placeholder.resolution_status, "unknown");
        assert_eq!(placeholder.frustration_trend, "rising");
    }

    #[test]
    fn render_transcript_labels_roles() {
        let entries = vec![
            entry(Role::Customer, "my bill is wrong"),
            entry(Role::Ai, "Let me check."),
            entry(Role::Supervisor, "taking over"),
        ];
        let rendered = render_transcript(&entries);
        assert_eq!(
            rendered,
            "customer: my bill is wrong\nagent: Let me check.\nsupervisor: taking over"
        );
    }

    #[tokio::test]
    async fn gemini_client_surfaces_http_failure() {
        // Nothing listens on this port; the call must fail, not hang.
        let client = GeminiAnalytics::new("k".into(), "m".into())
            .with_base_url("http://127.0.0.1:9/v1beta");
        let result = client.sentiment("hi", &[]).await;
        assert!(result.is_err());
    }
}
