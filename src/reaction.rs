//! Tapback reactions
//!
//! The closed set of reactions a client may send, and the text Messages.app
//! writes into chat.db for them ("Loved “hello”", "Removed a heart from an image").

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactionKind {
    Love,
    Like,
    Dislike,
    Laugh,
    Emphasize,
    Question,
}

impl ReactionKind {
    pub const ALL: [ReactionKind; 6] = [
        ReactionKind::Love,
        ReactionKind::Like,
        ReactionKind::Dislike,
        ReactionKind::Laugh,
        ReactionKind::Emphasize,
        ReactionKind::Question,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReactionKind::Love => "love",
            ReactionKind::Like => "like",
            ReactionKind::Dislike => "dislike",
            ReactionKind::Laugh => "laugh",
            ReactionKind::Emphasize => "emphasize",
            ReactionKind::Question => "question",
        }
    }

    fn offset(self) -> i64 {
        match self {
            ReactionKind::Love => 0,
            ReactionKind::Like => 1,
            ReactionKind::Dislike => 2,
            ReactionKind::Laugh => 3,
            ReactionKind::Emphasize => 4,
            ReactionKind::Question => 5,
        }
    }

    fn added_verb(self) -> &'static str {
        match self {
            ReactionKind::Love => "Loved",
            ReactionKind::Like => "Liked",
            ReactionKind::Dislike => "Disliked",
            ReactionKind::Laugh => "Laughed at",
            ReactionKind::Emphasize => "Emphasized",
            ReactionKind::Question => "Questioned",
        }
    }

    fn removed_verb(self) -> &'static str {
        match self {
            ReactionKind::Love => "Removed a heart from",
            ReactionKind::Like => "Removed a like from",
            ReactionKind::Dislike => "Removed a dislike from",
            ReactionKind::Laugh => "Removed a laugh from",
            ReactionKind::Emphasize => "Removed an exclamation from",
            ReactionKind::Question => "Removed a question mark from",
        }
    }
}

/// A reaction or its removal (`-love`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reaction {
    pub kind: ReactionKind,
    pub removed: bool,
}

/// How Messages.app describes attachment-only targets; these are not quoted
const ATTACHMENT_DESCRIPTIONS: &[&str] = &[
    "an image",
    "a movie",
    "an audio message",
    "an attachment",
    "a sticker",
    "a location",
    "a contact",
];

impl Reaction {
    /// `associated_message_type` as stored in chat.db (2000-2005 add, 3000-3005 remove)
    pub fn associated_message_type(&self) -> i64 {
        let base = if self.removed { 3000 } else { 2000 };
        base + self.kind.offset()
    }

    /// Text of the row Messages.app writes for this reaction on `target_text`
    pub fn describe(&self, target_text: &str) -> String {
        let verb = if self.removed {
            self.kind.removed_verb()
        } else {
            self.kind.added_verb()
        };
        let target = target_text.trim();
        if ATTACHMENT_DESCRIPTIONS.contains(&target) {
            format!("{} {}", verb, target)
        } else {
            format!("{} \u{201c}{}\u{201d}", verb, target)
        }
    }
}

impl FromStr for Reaction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = s.trim().to_lowercase();
        let (removed, name) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.as_str()),
        };
        ReactionKind::ALL
            .iter()
            .find(|k| k.as_str() == name)
            .map(|&kind| Reaction { kind, removed })
            .ok_or_else(|| {
                Error::Validation(format!(
                    "invalid reaction '{}'; expected one of love, like, dislike, laugh, emphasize, question (prefix '-' to remove)",
                    s
                ))
            })
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.removed {
            write!(f, "-")?;
        }
        write!(f, "{}", self.kind.as_str())
    }
}
