//! Request analysis: complexity, domain, keywords, capabilities and scope.
//!
//! Everything here is a pure function of the request text, driven by fixed
//! pattern tables, so identical requests always analyze identically.
//!
//! ## Example
//!
//! ```
//! use mesh::core::Complexity;
//! use mesh::decomposer::analysis::{analyze, Domain};
//!
//! let analysis = analyze("Create a login form");
//! assert_eq!(analysis.complexity, Complexity::Simple);
//! assert_eq!(analysis.domain, Domain::General);
//! ```

use crate::agent::Capability;
use crate::core::Complexity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Keywords that mark a request as complex on their own.
static COMPLEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(full[- ]?stack|e-?commerce|enterprise|microservices?|distributed|platform|end[- ]to[- ]end|multi[- ]tenant|real[- ]time|production[- ]ready|scalable|complete (system|application|app|solution)|architecture)\b",
    )
    .unwrap()
});

/// Keywords that mark a request as at least medium.
static MEDIUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(api|rest(ful)?|graphql|database|schema|integrat\w*|authenticat\w*|dashboard|pipeline|service|crud|deploy\w*|refactor\w*|migrat\w*|test suite|optimi[sz]\w*)\b",
    )
    .unwrap()
});

/// Clause connectors that chain several pieces of work together.
static CONNECTOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(then|also|additionally|afterwards|after that|as well as|followed by|plus)\b|;")
        .unwrap()
});

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "are", "was", "were",
    "will", "would", "should", "could", "can", "have", "has", "had", "but", "not", "all", "any",
    "our", "your", "their", "its", "who", "what", "which", "when", "where", "how", "why", "then",
    "also", "some", "such", "than", "too", "very", "just", "make", "need", "needs", "want",
    "using", "use", "please", "create", "build", "implement", "write",
];

const INCREASE_WORDS: &[&str] = &[
    "complete",
    "production",
    "enterprise",
    "comprehensive",
    "scalable",
    "full",
];

const DECREASE_WORDS: &[&str] = &["simple", "basic", "quick", "minimal", "prototype"];

/// Application domain of a request.
///
/// The order of `Domain::all()` is the tie-break order for domain scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Domain {
    FullStackWeb,
    ApiDevelopment,
    DataProcessing,
    MachineLearning,
    Devops,
    MobileDevelopment,
    TestingQa,
    Documentation,
    Security,
    General,
}

impl Domain {
    pub fn slug(&self) -> &'static str {
        match self {
            Domain::FullStackWeb => "full-stack-web",
            Domain::ApiDevelopment => "api-development",
            Domain::DataProcessing => "data-processing",
            Domain::MachineLearning => "machine-learning",
            Domain::Devops => "devops",
            Domain::MobileDevelopment => "mobile-development",
            Domain::TestingQa => "testing-qa",
            Domain::Documentation => "documentation",
            Domain::Security => "security",
            Domain::General => "general",
        }
    }

    /// Keywords scored when identifying this domain.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Domain::FullStackWeb => &[
                "full-stack",
                "full stack",
                "web application",
                "web app",
                "e-commerce",
                "ecommerce",
                "frontend",
                "backend",
            ],
            Domain::ApiDevelopment => &["api", "rest", "restful", "graphql", "endpoint", "endpoints"],
            Domain::DataProcessing => &[
                "data pipeline",
                "etl",
                "csv",
                "data processing",
                "ingestion",
                "analytics",
                "batch",
            ],
            Domain::MachineLearning => &[
                "machine learning",
                "model training",
                "neural",
                "classifier",
                "prediction",
                "ml",
            ],
            Domain::Devops => &[
                "deploy",
                "deployment",
                "docker",
                "kubernetes",
                "ci/cd",
                "infrastructure",
                "terraform",
            ],
            Domain::MobileDevelopment => &["mobile", "ios", "android", "react native", "flutter"],
            Domain::TestingQa => &["test", "tests", "testing", "qa", "coverage"],
            Domain::Documentation => &["documentation", "docs", "readme", "guide", "tutorial"],
            Domain::Security => &["security", "vulnerability", "audit", "encryption", "penetration"],
            Domain::General => &[],
        }
    }

    /// Capabilities every request in this domain needs.
    fn default_capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Domain::FullStackWeb => &[Architecture, Frontend, Backend, Database],
            Domain::ApiDevelopment => &[ApiDesign, Backend],
            Domain::DataProcessing => &[DataProcessing, Database],
            Domain::MachineLearning => &[MachineLearning, DataProcessing],
            Domain::Devops => &[Devops],
            Domain::MobileDevelopment => &[Mobile],
            Domain::TestingQa => &[Testing],
            Domain::Documentation => &[Documentation],
            Domain::Security => &[Security],
            Domain::General => &[],
        }
    }

    pub fn all() -> &'static [Domain] {
        use Domain::*;
        &[
            FullStackWeb,
            ApiDevelopment,
            DataProcessing,
            MachineLearning,
            Devops,
            MobileDevelopment,
            TestingQa,
            Documentation,
            Security,
            General,
        ]
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// Terms that indicate a single capability regardless of domain.
const CAPABILITY_KEYWORDS: &[(Capability, &[&str])] = &[
    (Capability::Analysis, &["analyze", "analyse", "analysis", "research", "requirements"]),
    (Capability::Architecture, &["architecture", "design system", "system design"]),
    (Capability::Frontend, &["frontend", "ui", "form", "page", "component", "react", "css", "interface"]),
    (Capability::Backend, &["backend", "server", "service", "business logic"]),
    (Capability::Database, &["database", "schema", "sql", "postgres", "storage"]),
    (Capability::ApiDesign, &["api", "rest", "graphql", "endpoint"]),
    (Capability::Testing, &["test", "tests", "testing", "qa"]),
    (Capability::Devops, &["deploy", "deployment", "docker", "kubernetes", "ci/cd"]),
    (Capability::Security, &["security", "auth", "authentication", "login", "encryption"]),
    (Capability::Documentation, &["documentation", "docs", "readme"]),
    (Capability::DataProcessing, &["etl", "csv", "pipeline", "ingestion", "transform"]),
    (Capability::MachineLearning, &["machine learning", "model training", "classifier"]),
    (Capability::Mobile, &["mobile", "ios", "android"]),
];

/// Task-count range and duration estimate for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskScope {
    pub min_tasks: usize,
    pub max_tasks: usize,
    /// Base duration scaled by `duration_multiplier`.
    pub estimated_duration_secs: u64,
    pub duration_multiplier: f64,
}

/// Result of analyzing a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub complexity: Complexity,
    pub domain: Domain,
    pub keywords: Vec<String>,
    pub required_capabilities: Vec<Capability>,
    pub scope: TaskScope,
}

/// Analyze a request.
pub fn analyze(task: &str) -> TaskAnalysis {
    let complexity = classify_complexity(task);
    let domain = identify_domain(task);
    TaskAnalysis {
        complexity,
        domain,
        keywords: extract_keywords(task),
        required_capabilities: required_capabilities(task, domain),
        scope: estimate_scope(task, complexity),
    }
}

/// Number of whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Number of clause connectors in the text.
pub fn connector_count(text: &str) -> usize {
    CONNECTOR_RE.find_iter(text).count()
}

/// Check if the text contains a keyword that alone marks it as complex.
pub fn has_complex_keyword(text: &str) -> bool {
    COMPLEX_RE.is_match(text)
}

/// Classify a request as simple, medium, or complex.
pub fn classify_complexity(text: &str) -> Complexity {
    let words = word_count(text);
    let connectors = connector_count(text);

    if has_complex_keyword(text) || words > 30 || connectors >= 2 {
        Complexity::Complex
    } else if MEDIUM_RE.is_match(text) || words > 12 || connectors >= 1 {
        Complexity::Medium
    } else {
        Complexity::Simple
    }
}

/// Pick the domain with the most keyword hits; earlier domains win ties.
pub fn identify_domain(text: &str) -> Domain {
    let lower = text.to_lowercase();
    let mut best = (Domain::General, 0);
    for domain in Domain::all() {
        let hits = domain
            .keywords()
            .iter()
            .filter(|kw| contains_term(&lower, kw))
            .count();
        if hits > best.1 {
            best = (*domain, hits);
        }
    }
    best.0
}

/// Lower-cased content words, in first-appearance order.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|w| w.trim_matches('-'))
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(str::to_string)
        .collect()
}

/// Domain defaults plus keyword hits, in capability order.
pub fn required_capabilities(text: &str, domain: Domain) -> Vec<Capability> {
    let lower = text.to_lowercase();
    let mut caps: BTreeSet<Capability> = domain.default_capabilities().iter().copied().collect();
    for (cap, terms) in CAPABILITY_KEYWORDS {
        if terms.iter().any(|t| contains_term(&lower, t)) {
            caps.insert(*cap);
        }
    }
    if caps.is_empty() {
        caps.insert(Capability::CodeGeneration);
    }
    caps.into_iter().collect()
}

/// Task-count range and duration for the complexity, scaled by multiplier words.
pub fn estimate_scope(text: &str, complexity: Complexity) -> TaskScope {
    let (min_tasks, max_tasks, base_secs) = match complexity {
        Complexity::Simple => (1, 2, 300u64),
        Complexity::Medium => (3, 5, 1_800),
        Complexity::Complex => (5, 10, 3_600),
    };

    let lower = text.to_lowercase();
    let increases = INCREASE_WORDS.iter().filter(|w| contains_term(&lower, w)).count();
    let decreases = DECREASE_WORDS.iter().filter(|w| contains_term(&lower, w)).count();
    let multiplier =
        (1.0 + 0.5 * increases as f64 - 0.3 * decreases as f64).clamp(0.5, 3.0);

    TaskScope {
        min_tasks,
        max_tasks,
        estimated_duration_secs: (base_secs as f64 * multiplier).round() as u64,
        duration_multiplier: multiplier,
    }
}

/// Whole-term match: the term may not be glued to surrounding letters or digits.
fn contains_term(haystack: &str, term: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric();
    haystack.match_indices(term).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + term.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}
