//! Ordered pattern classification of error text.

use std::sync::LazyLock;

use beacon_types::ErrorKind;
use regex::Regex;

/// One `(pattern, kind)` entry of a classification table.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    kind: ErrorKind,
}

impl Rule {
    /// Compiles a case-insensitive rule.
    pub fn new(pattern: &str, kind: ErrorKind) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&format!("(?i){pattern}"))?,
            kind,
        })
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// Built-in rules. Order matters: specific patterns precede general ones
/// (a CORS failure also reads "Failed to fetch", and "undefined is not an
/// object" must not be taken for an unresolved identifier).
const DEFAULT_RULES: &[(&str, ErrorKind)] = &[
    (r"cannot read propert(y|ies) of null", ErrorKind::NullDereference),
    (r"null is not an object", ErrorKind::NullDereference),
    (r"cannot set propert(y|ies) of null", ErrorKind::NullDereference),
    (r"called `option::unwrap\(\)` on a `none` value", ErrorKind::NullDereference),
    (r"null pointer", ErrorKind::NullDereference),
    (r"cannot read propert(y|ies) of undefined", ErrorKind::UndefinedReference),
    (r"undefined is not an object", ErrorKind::UndefinedReference),
    (r"cannot set propert(y|ies) of undefined", ErrorKind::UndefinedReference),
    (r"undefined is not a function", ErrorKind::UndefinedReference),
    (r"\w+ is not defined", ErrorKind::UnresolvedIdentifier),
    (r"referenceerror", ErrorKind::UnresolvedIdentifier),
    (r"cannot find (value|name|module)", ErrorKind::UnresolvedIdentifier),
    (r"syntaxerror", ErrorKind::SyntaxError),
    (r"unexpected token", ErrorKind::SyntaxError),
    (r"unexpected end of (input|json)", ErrorKind::SyntaxError),
    (r"invalid or unexpected token", ErrorKind::SyntaxError),
    (r"\bcors\b", ErrorKind::CrossOriginFailure),
    (r"cross-origin", ErrorKind::CrossOriginFailure),
    (r"access-control-allow-origin", ErrorKind::CrossOriginFailure),
    (r"failed to fetch", ErrorKind::NetworkFailure),
    (r"network ?error", ErrorKind::NetworkFailure),
    (r"err_(connection|network|internet|name_not_resolved)", ErrorKind::NetworkFailure),
    (r"connection (refused|reset)", ErrorKind::NetworkFailure),
    (r"econn(refused|reset)", ErrorKind::NetworkFailure),
    (r"timed out", ErrorKind::NetworkFailure),
    // Bare status numbers would also hit line numbers in stacks.
    (r"\b(status|http|code)\s*:?\s*404\b", ErrorKind::NotFound),
    (r"not found", ErrorKind::NotFound),
    (r"\b(status|http|code)\s*:?\s*5\d\d\b", ErrorKind::ServerError),
    (r"internal server error", ErrorKind::ServerError),
    (r"bad gateway", ErrorKind::ServerError),
    (r"service unavailable", ErrorKind::ServerError),
    (r"gateway timeout", ErrorKind::ServerError),
];

static DEFAULT_CLASSIFIER: LazyLock<Classifier> = LazyLock::new(|| {
    let rules = DEFAULT_RULES
        .iter()
        .filter_map(|(pattern, kind)| match Rule::new(pattern, *kind) {
            Ok(rule) => Some(rule),
            Err(e) => {
                tracing::error!(pattern, error = %e, "skipping invalid built-in rule");
                None
            }
        })
        .collect();
    Classifier { rules }
});

/// An ordered rule table. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    /// Builds a classifier from an explicit rule list, evaluated in order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The built-in taxonomy rules.
    pub fn builtin() -> &'static Classifier {
        &DEFAULT_CLASSIFIER
    }

    /// Returns a copy of this classifier with `rule` evaluated before all
    /// existing rules.
    pub fn with_leading_rule(&self, rule: Rule) -> Self {
        let mut rules = Vec::with_capacity(self.rules.len() + 1);
        rules.push(rule);
        rules.extend(self.rules.iter().cloned());
        Self { rules }
    }

    /// Classifies the concatenation of `message` and `stack`.
    pub fn classify(&self, message: &str, stack: Option<&str>) -> ErrorKind {
        let text = match stack {
            Some(stack) => format!("{message}\n{stack}"),
            None => message.to_string(),
        };
        self.rules
            .iter()
            .find(|rule| rule.matches(&text))
            .map_or(ErrorKind::Unknown, Rule::kind)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Classifies error text with the built-in rules.
pub fn classify(message: &str, stack: Option<&str>) -> ErrorKind {
    Classifier::builtin().classify(message, stack)
}
