//! Secret masking middleware.
//!
//! Masks sensitive values in place before envelopes leave the process. A
//! value is masked wholesale when its key contains (or equals, depending on
//! `match_substring`) any configured token, case-insensitively. String
//! scalars can additionally be scrubbed by regex, catching credentials
//! pasted into free-form messages under innocent keys.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::context::Ctx;
use crate::envelope::{Envelope, Record};
use crate::pipeline::{Decision, Middleware};
use crate::{Error, Result};

/// Which envelope sub-trees the middleware traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretPath {
    Ctx,
    LogData,
    LogErr,
    EventProps,
}

impl SecretPath {
    pub fn all() -> Vec<SecretPath> {
        vec![
            SecretPath::Ctx,
            SecretPath::LogData,
            SecretPath::LogErr,
            SecretPath::EventProps,
        ]
    }
}

/// Options for [`SecretMiddleware`].
#[derive(Clone)]
pub struct SecretOptions {
    /// Case-insensitive key tokens to mask.
    pub keys: Vec<String>,

    /// Match when the lowercased key contains a token (default). When false,
    /// the key must equal a token case-insensitively.
    pub match_substring: bool,

    /// Value substituted for masked sub-trees.
    pub replacement: Value,

    /// Traversal depth bound.
    pub max_depth: usize,

    /// Sub-trees to traverse; defaults to all four.
    pub paths: Vec<SecretPath>,

    /// Regex patterns applied to string scalars; matches are rewritten to
    /// the replacement text even under non-sensitive keys.
    pub value_patterns: Vec<String>,
}

impl Default for SecretOptions {
    fn default() -> Self {
        Self {
            keys: vec![
                "password".to_string(),
                "secret".to_string(),
                "token".to_string(),
                "api_key".to_string(),
                "authorization".to_string(),
            ],
            match_substring: true,
            replacement: Value::String("[MASKED]".to_string()),
            max_depth: 20,
            paths: SecretPath::all(),
            value_patterns: Vec::new(),
        }
    }
}

/// In-place key-based masking across designated envelope sub-trees.
pub struct SecretMiddleware {
    tokens: Vec<String>,
    patterns: Vec<Regex>,
    options: SecretOptions,
}

impl SecretMiddleware {
    pub fn new(options: SecretOptions) -> Result<Self> {
        let tokens = options.keys.iter().map(|k| k.to_lowercase()).collect();

        let mut patterns = Vec::with_capacity(options.value_patterns.len());
        for pattern in &options.value_patterns {
            let compiled = Regex::new(pattern).map_err(|e| Error::Config {
                message: format!("Invalid value pattern '{pattern}': {e}"),
            })?;
            patterns.push(compiled);
        }

        Ok(Self {
            tokens,
            patterns,
            options,
        })
    }

    fn key_matches(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        if self.options.match_substring {
            self.tokens.iter().any(|token| key.contains(token))
        } else {
            self.tokens.iter().any(|token| &key == token)
        }
    }

    fn replacement_text(&self) -> &str {
        self.options.replacement.as_str().unwrap_or("[MASKED]")
    }

    fn mask_map(&self, map: &mut Ctx, depth: usize) {
        for (key, value) in map.iter_mut() {
            if self.key_matches(key) {
                // The whole subtree goes, whatever its type; nothing under a
                // replacement is traversed.
                *value = self.options.replacement.clone();
            } else {
                self.mask_value(value, depth + 1);
            }
        }
    }

    fn mask_value(&self, value: &mut Value, depth: usize) {
        if depth > self.options.max_depth {
            return;
        }
        match value {
            Value::Object(map) => self.mask_map(map, depth),
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.mask_value(item, depth + 1);
                }
            }
            Value::String(s) => {
                for pattern in &self.patterns {
                    if pattern.is_match(s) {
                        *s = pattern.replace_all(s, self.replacement_text()).into_owned();
                    }
                }
            }
            _ => {}
        }
    }

    fn wants(&self, path: SecretPath) -> bool {
        self.options.paths.contains(&path)
    }
}

#[async_trait]
impl Middleware for SecretMiddleware {
    fn name(&self) -> &'static str {
        "secret"
    }

    async fn handle(&self, envelope: &mut Envelope) -> Result<Decision> {
        if self.wants(SecretPath::Ctx) {
            self.mask_map(&mut envelope.ctx, 0);
        }

        match &mut envelope.record {
            Record::Log(log) => {
                if self.wants(SecretPath::LogData) {
                    if let Some(data) = log.data.as_mut() {
                        self.mask_map(data, 0);
                    }
                }
                if self.wants(SecretPath::LogErr) {
                    if let Some(err) = log.err.as_mut() {
                        self.mask_value(err, 0);
                    }
                }
            }
            Record::Event(event) => {
                if self.wants(SecretPath::EventProps) {
                    if let Some(props) = event.props.as_mut() {
                        self.mask_map(props, 0);
                    }
                }
            }
        }

        Ok(Decision::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Level;
    use serde_json::json;

    fn middleware(options: SecretOptions) -> SecretMiddleware {
        SecretMiddleware::new(options).unwrap()
    }

    fn log_envelope(data: Ctx) -> Envelope {
        Envelope::new(
            0,
            Ctx::new(),
            Record::Log(crate::envelope::LogRecord {
                level: Level::Info,
                msg: "m".to_string(),
                data: Some(data),
                err: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_masks_matching_keys_wholesale() {
        let mw = middleware(SecretOptions::default());
        let mut data = Ctx::new();
        data.insert("password".into(), json!("hunter2"));
        data.insert("api_key_id".into(), json!({"nested": "sk-123"}));
        data.insert("username".into(), json!("alice"));
        let mut envelope = log_envelope(data);

        mw.handle(&mut envelope).await.unwrap();

        let data = match &envelope.record {
            Record::Log(log) => log.data.as_ref().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(data["password"], "[MASKED]");
        // Substring match catches the whole object under the key.
        assert_eq!(data["api_key_id"], "[MASKED]");
        assert_eq!(data["username"], "alice");
    }

    #[tokio::test]
    async fn test_exact_match_mode() {
        let options = SecretOptions {
            keys: vec!["token".into()],
            match_substring: false,
            ..Default::default()
        };
        let mw = middleware(options);
        let mut data = Ctx::new();
        data.insert("token".into(), json!("t"));
        data.insert("TOKEN".into(), json!("t"));
        data.insert("csrf_token".into(), json!("kept"));
        let mut envelope = log_envelope(data);

        mw.handle(&mut envelope).await.unwrap();

        let data = match &envelope.record {
            Record::Log(log) => log.data.as_ref().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(data["token"], "[MASKED]");
        assert_eq!(data["TOKEN"], "[MASKED]");
        assert_eq!(data["csrf_token"], "kept");
    }

    #[tokio::test]
    async fn test_traverses_arrays_and_nested_objects() {
        let mw = middleware(SecretOptions::default());
        let mut envelope = log_envelope(Ctx::new());
        envelope.ctx.insert(
            "users".into(),
            json!([{"name": "a", "password": "x"}, {"name": "b", "secret_note": 7}]),
        );

        mw.handle(&mut envelope).await.unwrap();

        assert_eq!(envelope.ctx["users"][0]["password"], "[MASKED]");
        assert_eq!(envelope.ctx["users"][0]["name"], "a");
        assert_eq!(envelope.ctx["users"][1]["secret_note"], "[MASKED]");
    }

    #[tokio::test]
    async fn test_masking_is_idempotent() {
        let mw = middleware(SecretOptions::default());
        let mut data = Ctx::new();
        data.insert("password".into(), json!("hunter2"));
        data.insert("profile".into(), json!({"auth_token": [1, 2, 3]}));
        let mut envelope = log_envelope(data);

        mw.handle(&mut envelope).await.unwrap();
        let once = envelope.clone();
        mw.handle(&mut envelope).await.unwrap();

        assert_eq!(envelope, once);
    }

    #[tokio::test]
    async fn test_paths_restrict_traversal() {
        let options = SecretOptions {
            paths: vec![SecretPath::LogData],
            ..Default::default()
        };
        let mw = middleware(options);
        let mut data = Ctx::new();
        data.insert("password".into(), json!("masked"));
        let mut envelope = log_envelope(data);
        envelope.ctx.insert("password".into(), json!("kept"));

        mw.handle(&mut envelope).await.unwrap();

        assert_eq!(envelope.ctx["password"], "kept");
        let data = match &envelope.record {
            Record::Log(log) => log.data.as_ref().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(data["password"], "[MASKED]");
    }

    #[tokio::test]
    async fn test_value_patterns_scrub_strings() {
        let options = SecretOptions {
            value_patterns: vec![r"sk-[A-Za-z0-9]{8,}".to_string()],
            ..Default::default()
        };
        let mw = middleware(options);
        let mut data = Ctx::new();
        data.insert("note".into(), json!("key is sk-abcdef123456 ok"));
        let mut envelope = log_envelope(data);

        mw.handle(&mut envelope).await.unwrap();

        let data = match &envelope.record {
            Record::Log(log) => log.data.as_ref().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(data["note"], "key is [MASKED] ok");
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let options = SecretOptions {
            value_patterns: vec!["[unclosed".to_string()],
            ..Default::default()
        };
        assert!(SecretMiddleware::new(options).is_err());
    }

    #[tokio::test]
    async fn test_event_props_masked() {
        let mw = middleware(SecretOptions::default());
        let mut props = Ctx::new();
        props.insert("auth_token".into(), json!("t"));
        let mut envelope = Envelope::new(0, Ctx::new(), Record::event("login", Some(props)));

        mw.handle(&mut envelope).await.unwrap();

        let props = match &envelope.record {
            Record::Event(event) => event.props.as_ref().unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(props["auth_token"], "[MASKED]");
    }
}
