use log::{debug, error};
use serde::Serialize;
use thiserror::Error;

const FALLBACK_REASON: &str = "No reason provided";

/// The classifier's decision for a single message.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub is_spam: bool,
    pub reason: String,
}

impl Verdict {
    /// A classifier failure must never punish anyone: degrade to a clean
    /// verdict carrying the error text as its reason.
    pub fn fail_open(err: &ClassifyError) -> Self {
        Self {
            is_spam: false,
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion service returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("malformed completion response: {0}")]
    Malformed(String),
    #[error("unrecognized verdict line: {0:?}")]
    Verdict(String),
}

/// Adapter over an OpenAI-compatible chat-completions endpoint. One request
/// per message, no retries.
#[derive(Clone)]
pub struct Classifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Classifier {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub async fn classify(
        &self,
        rules: &str,
        language: &str,
        text: &str,
    ) -> Result<Verdict, ClassifyError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Body<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }

        let system = system_prompt(rules, language);
        let body = Body {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &system,
                },
                Msg {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.0,
            max_tokens: 200,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await?;
        if !status.is_success() {
            return Err(ClassifyError::Status {
                code: status.as_u16(),
                body: raw,
            });
        }

        let val: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| ClassifyError::Malformed(format!("{}: {}", e, raw)))?;
        let content = val["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ClassifyError::Malformed("missing message content".to_string()))?;

        parse_verdict(content)
    }

    /// Fail-open entry point used by the moderation pipeline.
    pub async fn classify_or_clean(&self, rules: &str, language: &str, text: &str) -> Verdict {
        match self.classify(rules, language, text).await {
            Ok(verdict) => {
                debug!("classified is_spam={} reason={:?}", verdict.is_spam, verdict.reason);
                verdict
            }
            Err(e) => {
                error!("classification failed, treating message as clean: {}", e);
                Verdict::fail_open(&e)
            }
        }
    }
}

fn system_prompt(rules: &str, language: &str) -> String {
    format!(
        "You are an anti-spam enforcement service for group chats. \
Analyze the user's message and decide whether it is spam according to these rules:\n\
{}\n\n\
Respond in exactly this format:\n\
YES or NO\n\
REASON: <short reason in {}>\n",
        rules, language
    )
}

/// Strict two-field decode of the model output: first line is the verdict
/// token, the remainder is the reason. Anything else is an error, never a
/// silent "not spam".
pub fn parse_verdict(content: &str) -> Result<Verdict, ClassifyError> {
    let content = content.trim();
    let (first, rest) = match content.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (content, ""),
    };

    let is_spam = match first.trim().to_uppercase().as_str() {
        "YES" => true,
        "NO" => false,
        other => return Err(ClassifyError::Verdict(other.to_string())),
    };

    let mut reason = rest.trim();
    if reason
        .get(..7)
        .is_some_and(|tag| tag.eq_ignore_ascii_case("REASON:"))
    {
        reason = reason[7..].trim();
    }
    let reason = if reason.is_empty() {
        FALLBACK_REASON.to_string()
    } else {
        reason.to_string()
    };

    Ok(Verdict { is_spam, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spam_verdict_with_reason() {
        let v = parse_verdict("YES\nREASON: promotional link").unwrap();
        assert!(v.is_spam);
        assert_eq!(v.reason, "promotional link");
    }

    #[test]
    fn parses_clean_verdict() {
        let v = parse_verdict("NO\nREASON: ordinary conversation").unwrap();
        assert!(!v.is_spam);
        assert_eq!(v.reason, "ordinary conversation");
    }

    #[test]
    fn verdict_token_is_case_insensitive_and_trimmed() {
        assert!(parse_verdict("  yes  \nREASON: ad").unwrap().is_spam);
        assert!(!parse_verdict("No").unwrap().is_spam);
    }

    #[test]
    fn missing_reason_substitutes_fallback() {
        let v = parse_verdict("YES").unwrap();
        assert_eq!(v.reason, FALLBACK_REASON);
        let v = parse_verdict("YES\nREASON:").unwrap();
        assert_eq!(v.reason, FALLBACK_REASON);
    }

    #[test]
    fn reason_tag_is_optional() {
        let v = parse_verdict("YES\nlooks like a casino promo").unwrap();
        assert_eq!(v.reason, "looks like a casino promo");
    }

    #[test]
    fn multi_line_reason_is_kept() {
        let v = parse_verdict("YES\nREASON: repeated links\nacross several messages").unwrap();
        assert_eq!(v.reason, "repeated links\nacross several messages");
    }

    #[test]
    fn unrecognized_first_line_is_an_error_not_a_silent_no() {
        assert!(matches!(
            parse_verdict("MAYBE\nREASON: unsure"),
            Err(ClassifyError::Verdict(_))
        ));
        assert!(matches!(parse_verdict(""), Err(ClassifyError::Verdict(_))));
    }

    #[test]
    fn fail_open_yields_clean_verdict_with_error_text() {
        let err = ClassifyError::Malformed("missing message content".to_string());
        let v = Verdict::fail_open(&err);
        assert!(!v.is_spam);
        assert!(v.reason.contains("missing message content"));
    }

    #[test]
    fn system_prompt_embeds_rules_and_language() {
        let prompt = system_prompt("no job offers", "german");
        assert!(prompt.contains("no job offers"));
        assert!(prompt.contains("german"));
        assert!(prompt.contains("YES or NO"));
    }
}
