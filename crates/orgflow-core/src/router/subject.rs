//! Hierarchical subject patterns.
//!
//! Subjects are dot-delimited token lists. In a pattern `*` matches exactly one
//! token and a trailing `>` matches one or more remaining tokens; every other
//! token must match literally.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// A parsed subscription pattern such as `change.*.template_changed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl SubjectPattern {
    /// Parse and validate a pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSubject {
            subject: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut tokens = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            let token = match *part {
                "" => return Err(invalid("empty token")),
                "*" => Token::Single,
                ">" if i == last => Token::Tail,
                ">" => return Err(invalid("'>' is only allowed as the last token")),
                literal => {
                    validate_literal(literal).map_err(|reason| invalid(&reason))?;
                    Token::Literal(literal.to_string())
                }
            };
            tokens.push(token);
        }

        Ok(Self {
            raw: pattern.to_string(),
            tokens,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether a concrete subject matches this pattern.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        if subject_tokens.iter().any(|t| t.is_empty()) {
            return false;
        }

        for (i, token) in self.tokens.iter().enumerate() {
            match token {
                Token::Tail => return subject_tokens.len() > i,
                Token::Single => {
                    if i >= subject_tokens.len() {
                        return false;
                    }
                }
                Token::Literal(lit) => {
                    if subject_tokens.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
            }
        }

        subject_tokens.len() == self.tokens.len()
    }

    /// Whether some concrete subject would match both patterns.
    #[must_use]
    pub fn overlaps(&self, other: &SubjectPattern) -> bool {
        let (a, b) = (&self.tokens, &other.tokens);
        let mut i = 0;

        loop {
            match (a.get(i), b.get(i)) {
                (None, None) => return true,
                // '>' needs at least one token, which the other side supplies
                (Some(Token::Tail), Some(_)) | (Some(_), Some(Token::Tail)) => return true,
                (Some(_), None) | (None, Some(_)) => return false,
                (Some(Token::Literal(x)), Some(Token::Literal(y))) if x != y => return false,
                _ => i += 1,
            }
        }
    }
}

impl FromStr for SubjectPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SubjectPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn validate_literal(token: &str) -> std::result::Result<(), String> {
    if token.is_empty() {
        return Err("empty token".to_string());
    }
    if let Some(c) = token
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        return Err(format!("token '{}' contains '{}'", token, c));
    }
    Ok(())
}

/// Validate a single subject token (organization, event type, reason).
pub fn validate_token(token: &str) -> Result<()> {
    validate_literal(token).map_err(|reason| Error::InvalidSubject {
        subject: token.to_string(),
        reason,
    })
}

/// `<domain>.<organization>.<event_type>`
pub fn event_subject(domain: &str, organization: &str, event_type: &str) -> Result<String> {
    validate_token(domain)?;
    validate_token(organization)?;
    validate_token(event_type)?;
    Ok(format!("{domain}.{organization}.{event_type}"))
}

/// `lock.<organization>.<reason>`
pub fn lock_subject(organization: &str, reason: &str) -> Result<String> {
    event_subject("lock", organization, reason)
}

/// `deadletter.<organization>.<event_type>`
pub fn dead_letter_subject(organization: &str, event_type: &str) -> Result<String> {
    event_subject("deadletter", organization, event_type)
}
