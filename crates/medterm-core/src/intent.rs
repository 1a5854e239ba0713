//! Intent heuristics: agent routing and modification-request detection.
//!
//! Everything here is pure string matching. Routing is behind the
//! [`QueryClassifier`] trait so the keyword policy can be swapped or tested
//! in isolation from the orchestration code.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which agent handles a query, and which agent produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Chat,
    Icd,
    Snomed,
    ConceptSet,
    ConceptSetFollowup,
    Master,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentKind::Chat => "chat",
            AgentKind::Icd => "icd",
            AgentKind::Snomed => "snomed",
            AgentKind::ConceptSet => "concept_set",
            AgentKind::ConceptSetFollowup => "concept_set_followup",
            AgentKind::Master => "master",
        };
        f.write_str(name)
    }
}

/// The kind of session modification an utterance is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationKind {
    Add,
    Remove,
    Format,
    Filter,
    Other,
}

/// Policy object deciding which retrieval agent a query belongs to.
pub trait QueryClassifier: Send + Sync {
    fn classify(&self, query: &str) -> AgentKind;
}

/// Routes between ICD and SNOMED by vocabulary keywords, falling back to
/// general chat. Matches an ICD-shaped token (`I10`, `E11.9`) even when no
/// keyword is present.
#[derive(Debug, Default, Clone)]
pub struct KeywordClassifier;

const SNOMED_KEYWORDS: &[&str] = &[
    "snomed",
    "snomed ct",
    "snomedct",
    "sct",
    "snomed code",
    "clinical term",
    "clinical terminology",
    "snomed concept",
];

const ICD_KEYWORDS: &[&str] = &[
    "icd",
    "icd-10",
    "icd10",
    "diagnosis code",
    "medical code",
    "billing code",
];

// ICD token in running text, e.g. "i10" or "e11.9" once lowercased
static ICD_ROUTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-z]\d{2}(?:\.\d+)?\b").unwrap());

impl QueryClassifier for KeywordClassifier {
    fn classify(&self, query: &str) -> AgentKind {
        let query_lower = query.to_lowercase();

        // SNOMED keywords first, they are the more specific vocabulary
        if SNOMED_KEYWORDS.iter().any(|kw| query_lower.contains(kw)) {
            debug!("SNOMED query detected: '{query}'");
            return AgentKind::Snomed;
        }

        if ICD_KEYWORDS.iter().any(|kw| query_lower.contains(kw))
            || ICD_ROUTE_RE.is_match(&query_lower)
        {
            debug!("ICD query detected: '{query}'");
            return AgentKind::Icd;
        }

        debug!("General query detected: '{query}'");
        AgentKind::Chat
    }
}

const ADD_KEYWORDS: &[&str] = &[
    "add", "include", "also show", "also include", "plus", "with", "and also", "append", "insert",
];

const REMOVE_KEYWORDS: &[&str] = &[
    "remove", "exclude", "delete", "without", "drop", "hide", "omit", "take out", "get rid of",
];

const FORMAT_KEYWORDS: &[&str] = &[
    "format as",
    "show as",
    "display as",
    "convert to",
    "in format",
    "as json",
    "as table",
    "as list",
];

const DATA_KEYWORDS: &[&str] = &[
    "snomed",
    "icd",
    "description",
    "code",
    "mapping",
    "concept",
    "relationship",
    "hierarchy",
];

const CONTEXT_REFERENCES: &[&str] = &["this", "these", "current", "existing", "shown"];

// Code tokens: ICD style (R52, E11.9) matched against the uppercased query,
// SNOMED style as a bare 6-10 digit number
static ICD_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]\d{1,3}(?:\.\d+)?\b").unwrap());
static SNOMED_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{6,10}\b").unwrap());

/// Detects whether an utterance asks to modify the session's data set.
///
/// A modifier verb alone is not enough: it must combine with a data-type
/// keyword, a back-reference to the shown data, or a recognizable code
/// token ("remove R52", "add 73211009").
pub fn is_modification_request(query: &str) -> bool {
    let query_lower = query.to_lowercase();

    let has_modifier = ADD_KEYWORDS
        .iter()
        .chain(REMOVE_KEYWORDS)
        .chain(FORMAT_KEYWORDS)
        .any(|kw| query_lower.contains(kw));
    if !has_modifier {
        return false;
    }

    if has_code_token(query) {
        return true;
    }

    let has_data_reference = DATA_KEYWORDS.iter().any(|kw| query_lower.contains(kw));
    let has_context_ref = CONTEXT_REFERENCES.iter().any(|r| query_lower.contains(r));

    has_data_reference || has_context_ref
}

/// True when the utterance contains an ICD-style or SNOMED-style code token.
pub fn has_code_token(query: &str) -> bool {
    ICD_CODE_RE.is_match(&query.to_uppercase()) || SNOMED_CODE_RE.is_match(query)
}

/// Extracts every ICD and SNOMED code token from an utterance.
pub fn extract_code_tokens(query: &str) -> Vec<String> {
    let upper = query.to_uppercase();
    let mut codes: Vec<String> = ICD_CODE_RE
        .find_iter(&upper)
        .map(|m| m.as_str().to_string())
        .collect();
    for m in SNOMED_CODE_RE.find_iter(query) {
        let code = m.as_str().to_string();
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

/// Determines which kind of modification is being requested.
pub fn detect_modification_kind(query: &str) -> ModificationKind {
    let query_lower = query.to_lowercase();

    if ["add", "include", "also show", "plus", "with"]
        .iter()
        .any(|kw| query_lower.contains(kw))
    {
        ModificationKind::Add
    } else if ["remove", "exclude", "delete", "without"]
        .iter()
        .any(|kw| query_lower.contains(kw))
    {
        ModificationKind::Remove
    } else if ["format", "show as", "display as", "convert"]
        .iter()
        .any(|kw| query_lower.contains(kw))
    {
        ModificationKind::Format
    } else if ["filter", "only show", "just", "limit to"]
        .iter()
        .any(|kw| query_lower.contains(kw))
    {
        ModificationKind::Filter
    } else {
        ModificationKind::Other
    }
}

/// Maps vocabulary keywords in the utterance to session item types.
pub fn extract_data_types(query: &str) -> Vec<String> {
    const TYPE_MAPPINGS: &[(&str, &str)] = &[
        ("snomed", "snomed_code"),
        ("icd", "icd_code"),
        ("description", "description"),
        ("name", "name"),
        ("code", "code"),
        ("mapping", "mapping"),
        ("relationship", "relationship"),
        ("hierarchy", "hierarchy"),
        ("parent", "parent_code"),
        ("child", "child_code"),
    ];

    let query_lower = query.to_lowercase();
    let mut types = Vec::new();
    for (keyword, data_type) in TYPE_MAPPINGS {
        if query_lower.contains(keyword) && !types.contains(&data_type.to_string()) {
            types.push(data_type.to_string());
        }
    }
    types
}

/// Detects queries about code relationships and hierarchies.
pub fn is_relationship_query(query: &str) -> bool {
    const RELATIONSHIP_KEYWORDS: &[&str] = &[
        "parent",
        "child",
        "hierarchy",
        "relationship",
        "related to",
        "parent code",
        "child code",
        "parent of",
        "child of",
        "snomed mapping",
        "maps to",
        "mapped to",
        "is a",
        "part of",
        "belongs to",
        "subcategory",
        "classification",
    ];

    let query_lower = query.to_lowercase();
    RELATIONSHIP_KEYWORDS.iter().any(|kw| query_lower.contains(kw))
}

/// Detects an explicit request for a fresh search while session data exists.
///
/// Requires both a search verb and a novelty word, or a "what is the code
/// for" phrasing; anything else is treated as a follow-up on stored data.
pub fn is_explicit_new_search(query: &str) -> bool {
    let query_lower = query.to_lowercase();

    let has_search_intent = ["search for", "find", "look up", "get me", "retrieve"]
        .iter()
        .any(|kw| query_lower.contains(kw));
    let wants_new = ["new", "different", "other", "more"]
        .iter()
        .any(|kw| query_lower.contains(kw));

    (has_search_intent && wants_new)
        || ["what is the code for", "find code for", "search for code"]
            .iter()
            .any(|phrase| query_lower.contains(phrase))
}
