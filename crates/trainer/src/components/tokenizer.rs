//! Whitespace tokenizer.

use super::{param_bool, param_str};
use crate::data::TrainingData;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Sentence-level token appended after the last word.
pub const CLS_TOKEN: &str = "__CLS__";

/// A token with character offsets into its source text.
///
/// Equality and ordering only consider `(offset, end, text, lemma)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    pub offset: usize,
    pub end: usize,
    pub lemma: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, Value>,
}

impl Token {
    pub fn new(text: impl Into<String>, offset: usize) -> Self {
        let text = text.into();
        Self {
            end: offset + text.chars().count(),
            lemma: text.clone(),
            text,
            offset,
            data: BTreeMap::new(),
        }
    }

    pub fn with_lemma(mut self, lemma: impl Into<String>) -> Self {
        self.lemma = lemma.into();
        self
    }

    pub fn set(&mut self, prop: impl Into<String>, info: Value) {
        self.data.insert(prop.into(), info);
    }

    pub fn get(&self, prop: &str) -> Option<&Value> {
        self.data.get(prop)
    }

    fn key(&self) -> (usize, usize, &str, &str) {
        (self.offset, self.end, &self.text, &self.lemma)
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Token {}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    pub tokens: Vec<Token>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intent_tokens: Vec<Token>,
}

/// Splits on whitespace and trims punctuation from both ends of each word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitespaceTokenizer {
    pub use_cls_token: bool,
    pub intent_tokenization_flag: bool,
    pub intent_split_symbol: String,
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self {
            use_cls_token: false,
            intent_tokenization_flag: false,
            intent_split_symbol: "_".to_string(),
        }
    }
}

impl WhitespaceTokenizer {
    pub fn from_config(config: &BTreeMap<String, Value>) -> anyhow::Result<Self> {
        Ok(Self {
            use_cls_token: param_bool(config, "use_cls_token")?,
            intent_tokenization_flag: param_bool(config, "intent_tokenization_flag")?,
            intent_split_symbol: param_str(config, "intent_split_symbol")?.to_string(),
        })
    }

    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        let chars: Vec<char> = text.chars().collect();
        let mut tokens = Vec::new();
        let mut idx = 0;

        while idx < chars.len() {
            if chars[idx].is_whitespace() {
                idx += 1;
                continue;
            }
            let word_start = idx;
            while idx < chars.len() && !chars[idx].is_whitespace() {
                idx += 1;
            }

            let (mut start, mut end) = (word_start, idx);
            while start < end && !chars[start].is_alphanumeric() {
                start += 1;
            }
            while end > start && !chars[end - 1].is_alphanumeric() {
                end -= 1;
            }
            if start < end {
                tokens.push(Token::new(chars[start..end].iter().collect::<String>(), start));
            }
        }
        tokens
    }

    pub fn add_cls_token(&self, mut tokens: Vec<Token>) -> Vec<Token> {
        if !self.use_cls_token {
            return tokens;
        }
        if let Some(last) = tokens.last() {
            // One position of separation after the last token.
            let idx = last.offset + last.text.chars().count() + 1;
            tokens.push(Token::new(CLS_TOKEN, idx));
        }
        tokens
    }

    /// Tokens of an intent label, split on the configured symbol if enabled.
    pub fn tokenize_intent(&self, intent: &str) -> Vec<Token> {
        if !self.intent_tokenization_flag {
            return vec![Token::new(intent, 0)];
        }
        let mut tokens = Vec::new();
        let mut offset = 0;
        for part in intent.split(self.intent_split_symbol.as_str()) {
            if !part.is_empty() {
                tokens.push(Token::new(part, offset));
            }
            offset += part.chars().count() + self.intent_split_symbol.chars().count();
        }
        tokens
    }

    pub fn process(&self, data: &TrainingData) -> Vec<TokenizedMessage> {
        data.examples
            .iter()
            .map(|message| TokenizedMessage {
                text: message.text.clone(),
                intent: message.intent.clone(),
                tokens: self.add_cls_token(self.tokenize(&message.text)),
                intent_tokens: message
                    .intent
                    .as_deref()
                    .map(|intent| self.tokenize_intent(intent))
                    .unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Message;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|token| token.text.as_str()).collect()
    }

    #[test]
    fn splits_and_trims_punctuation() {
        let tokens = WhitespaceTokenizer::default().tokenize("Hi, how are you?  I'm fine!");
        assert_eq!(texts(&tokens), vec!["Hi", "how", "are", "you", "I'm", "fine"]);
        assert_eq!((tokens[1].offset, tokens[1].end), (4, 7));
        assert_eq!(tokens[4].offset, 18);
    }

    #[test]
    fn cls_token_follows_last_word() {
        let tokenizer = WhitespaceTokenizer {
            use_cls_token: true,
            ..WhitespaceTokenizer::default()
        };
        let tokens = tokenizer.add_cls_token(tokenizer.tokenize("hello world"));
        let cls = tokens.last().unwrap();
        assert_eq!(cls.text, CLS_TOKEN);
        assert_eq!(cls.offset, 12);
        assert!(tokenizer.add_cls_token(Vec::new()).is_empty());
    }

    #[test]
    fn intent_tokenization() {
        let tokenizer = WhitespaceTokenizer {
            intent_tokenization_flag: true,
            intent_split_symbol: "+".into(),
            ..WhitespaceTokenizer::default()
        };
        let tokens = tokenizer.tokenize_intent("greet+ask_time");
        assert_eq!(texts(&tokens), vec!["greet", "ask_time"]);
        assert_eq!(tokens[1].offset, 6);

        let single = WhitespaceTokenizer::default().tokenize_intent("greet+ask_time");
        assert_eq!(texts(&single), vec!["greet+ask_time"]);
    }

    #[test]
    fn ordering_ignores_data() {
        let mut a = Token::new("hi", 0);
        a.set("pos", serde_json::json!("INTJ"));
        let b = Token::new("hi", 0);
        assert_eq!(a, b);
        assert!(Token::new("a", 0) < Token::new("a", 1));
        assert!(Token::new("a", 0) < Token::new("a", 0).with_lemma("b"));
    }

    #[test]
    fn processes_training_data() {
        let data = TrainingData::new(vec![Message::new("good morning", Some("greet"))]);
        let processed = WhitespaceTokenizer::default().process(&data);
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].tokens.len(), 2);
        assert_eq!(texts(&processed[0].intent_tokens), vec!["greet"]);
    }
}
