//! Capability matching for stream delivery.
//!
//! A client registers the events it wants as [`RegisteredSubscription`]s and
//! the permission service grants it a list of [`Rule`]s. Both compile into a
//! [`CapabilityMatcher`], a pure predicate deciding whether one event record
//! may be delivered. A record is allowed when any rule allows it (OR), a rule
//! allows when all of its conditions hold (AND), and a matching inverted rule
//! denies regardless of the others.

use events::{EventRecord, PublicEventKind, ScopeType};
use log::*;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Path pattern applied to subscriptions that do not name one: the root folder only.
pub const DEFAULT_SUBSCRIPTION_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Every subscribe action.
    Manage,
    SubscribeToCreationEvents,
    SubscribeToUpdateEvents,
    SubscribeToDeletionEvents,
    SubscribeToImportMutations,
}

impl Action {
    pub fn for_event(kind: PublicEventKind) -> Self {
        match kind {
            PublicEventKind::Create => Action::SubscribeToCreationEvents,
            PublicEventKind::Update => Action::SubscribeToUpdateEvents,
            PublicEventKind::Delete => Action::SubscribeToDeletionEvents,
            PublicEventKind::ImportMutation => Action::SubscribeToImportMutations,
        }
    }

    fn covers(&self, kind: PublicEventKind) -> bool {
        *self == Action::Manage || *self == Action::for_event(kind)
    }
}

/// Attribute constraints evaluated against each record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    /// Glob over the record path.
    #[serde(default)]
    pub path: Option<String>,
    /// Exact match on the record environment.
    #[serde(default)]
    pub environment: Option<String>,
}

/// What a client asks to receive when it opens a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredSubscription {
    pub subject: ScopeType,
    pub action: Action,
    #[serde(default)]
    pub conditions: Option<Conditions>,
}

/// A capability granted to a principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub subject: ScopeType,
    pub action: Action,
    #[serde(default)]
    pub conditions: Option<Conditions>,
    /// Explicit deny.
    #[serde(default)]
    pub inverted: bool,
}

/// One record of an event, as seen by the matcher.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub kind: PublicEventKind,
    pub record: &'a EventRecord,
}

/// Longest path pattern accepted, in characters.
pub const MAX_PATTERN_LEN: usize = 256;
/// Most `*`, `**` and `?` wildcards accepted in one path pattern.
pub const MAX_PATTERN_WILDCARDS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(char),
    /// `?`: one character other than `/`.
    AnyChar,
    /// `*`: any run of characters within one segment.
    Star,
    /// `**`, or `**/` when `slash` is set (zero or more whole segments).
    GlobStar { slash: bool },
    /// A pattern ending in `/**`: the parent itself or anything below it.
    TrailingGlobStar,
}

impl Token {
    fn is_wildcard(&self) -> bool {
        !matches!(self, Token::Literal(_))
    }

    fn push_regex(&self, out: &mut String) {
        match self {
            Token::Literal(c) => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            Token::AnyChar => out.push_str("[^/]"),
            Token::Star => out.push_str("[^/]*"),
            Token::GlobStar { slash: false } => out.push_str(".*"),
            Token::GlobStar { slash: true } => out.push_str("(?:.*/)?"),
            Token::TrailingGlobStar => out.push_str("(?:/.*)?"),
        }
    }
}

/// Compiled glob over `/`-separated paths.
///
/// Patterns compile to an anchored regular expression, so matching time is
/// linear in the path length whatever the pattern. Patterns longer than
/// [`MAX_PATTERN_LEN`] or with more than [`MAX_PATTERN_WILDCARDS`] wildcards
/// are rejected and never match.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Option<Regex>,
}

impl PartialEq for GlobPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '/' if chars[i + 1..] == ['*', '*'] => {
                tokens.push(Token::TrailingGlobStar);
                break;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                let slash = chars.get(i + 2) == Some(&'/');
                tokens.push(Token::GlobStar { slash });
                i += if slash { 3 } else { 2 };
                continue;
            }
            '*' => tokens.push(Token::Star),
            '?' => tokens.push(Token::AnyChar),
            c => tokens.push(Token::Literal(c)),
        }
        i += 1;
    }

    tokens
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Self {
        let source = normalize_path(pattern).to_string();
        let regex = Self::compile(&source);
        Self { source, regex }
    }

    fn compile(source: &str) -> Option<Regex> {
        if source.chars().count() > MAX_PATTERN_LEN {
            warn!("Path pattern longer than {MAX_PATTERN_LEN} characters never matches");
            return None;
        }

        let tokens = tokenize(source);
        let wildcards = tokens.iter().filter(|token| token.is_wildcard()).count();
        if wildcards > MAX_PATTERN_WILDCARDS {
            warn!("Path pattern with {wildcards} wildcards never matches: {source}");
            return None;
        }

        let mut expression = String::from("(?s)^");
        for token in &tokens {
            token.push_regex(&mut expression);
        }
        expression.push('$');

        match Regex::new(&expression) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("Path pattern {source} never matches: {e}");
                None
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// False for patterns rejected at compile time.
    pub fn is_valid(&self) -> bool {
        self.regex.is_some()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(normalize_path(path)))
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    subject: ScopeType,
    action: Action,
    path: Option<GlobPattern>,
    environment: Option<String>,
    inverted: bool,
}

impl CompiledRule {
    fn matches(&self, scope_type: ScopeType, candidate: &Candidate<'_>) -> bool {
        self.subject == scope_type
            && self.action.covers(candidate.kind)
            && self
                .path
                .as_ref()
                .map_or(true, |pattern| pattern.matches(&candidate.record.path))
            && self
                .environment
                .as_ref()
                .map_or(true, |env| *env == candidate.record.environment)
    }
}

/// Immutable predicate compiled from a rule list. Cheap to share behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityMatcher {
    rules: Vec<CompiledRule>,
}

impl CapabilityMatcher {
    /// Compile granted capabilities. A rule without conditions is unconditional.
    pub fn compile(rules: &[Rule]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| {
                let conditions = rule.conditions.clone().unwrap_or_default();
                CompiledRule {
                    subject: rule.subject,
                    action: rule.action,
                    path: conditions.path.as_deref().map(GlobPattern::new),
                    environment: conditions.environment,
                    inverted: rule.inverted,
                }
            })
            .collect();
        Self { rules }
    }

    /// Compile client subscriptions. A subscription without a path pattern
    /// only matches records at [`DEFAULT_SUBSCRIPTION_PATH`].
    pub fn for_subscriptions(subscriptions: &[RegisteredSubscription]) -> Self {
        let rules = subscriptions
            .iter()
            .map(|subscription| {
                let conditions = subscription.conditions.clone().unwrap_or_default();
                let path = conditions
                    .path
                    .unwrap_or_else(|| DEFAULT_SUBSCRIPTION_PATH.to_string());
                CompiledRule {
                    subject: subscription.subject,
                    action: subscription.action,
                    path: Some(GlobPattern::new(&path)),
                    environment: conditions.environment,
                    inverted: false,
                }
            })
            .collect();
        Self { rules }
    }

    pub fn allows(&self, scope_type: ScopeType, candidate: &Candidate<'_>) -> bool {
        let mut allowed = false;
        for rule in self.rules.iter().filter(|r| r.matches(scope_type, candidate)) {
            if rule.inverted {
                return false;
            }
            allowed = true;
        }
        allowed
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
