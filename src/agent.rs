//! Agent identities, capabilities, and capability matching.
//!
//! The registry is an ordinary value handed to the decomposer; there is no
//! process-wide agent table. Matching is behind the `CapabilityMatcher`
//! trait so deployments can plug in their own scoring.

use serde::{Deserialize, Serialize};

/// Id of the agent used when no specialist matches a node.
pub const GENERIC_AGENT_ID: &str = "generic-agent";

/// Confidence assigned to the generic fallback agent.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// Identifier of a worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generic() -> Self {
        Self(GENERIC_AGENT_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability tags used for agent selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Analysis,
    Architecture,
    Frontend,
    Backend,
    Database,
    ApiDesign,
    Testing,
    Devops,
    Security,
    Documentation,
    DataProcessing,
    MachineLearning,
    Mobile,
    CodeGeneration,
}

impl Capability {
    pub fn all() -> &'static [Capability] {
        use Capability::*;
        &[
            Analysis,
            Architecture,
            Frontend,
            Backend,
            Database,
            ApiDesign,
            Testing,
            Devops,
            Security,
            Documentation,
            DataProcessing,
            MachineLearning,
            Mobile,
            CodeGeneration,
        ]
    }

    pub fn slug(&self) -> &'static str {
        match self {
            Capability::Analysis => "analysis",
            Capability::Architecture => "architecture",
            Capability::Frontend => "frontend",
            Capability::Backend => "backend",
            Capability::Database => "database",
            Capability::ApiDesign => "api-design",
            Capability::Testing => "testing",
            Capability::Devops => "devops",
            Capability::Security => "security",
            Capability::Documentation => "documentation",
            Capability::DataProcessing => "data-processing",
            Capability::MachineLearning => "machine-learning",
            Capability::Mobile => "mobile",
            Capability::CodeGeneration => "code-generation",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// A worker agent known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    pub name: String,
    pub capabilities: Vec<Capability>,
}

impl AgentProfile {
    pub fn new(id: &str, name: &str, capabilities: Vec<Capability>) -> Self {
        Self {
            id: AgentId::from(id),
            name: name.to_string(),
            capabilities,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// The set of agents available to a decomposer.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One specialist per capability plus a full-stack generalist.
    pub fn with_defaults() -> Self {
        use Capability::*;
        let mut registry = Self::new();
        registry.register(AgentProfile::new("analyst", "Requirements Analyst", vec![Analysis]));
        registry.register(AgentProfile::new(
            "architect",
            "Solution Architect",
            vec![Architecture, Analysis, ApiDesign],
        ));
        registry.register(AgentProfile::new("frontend-dev", "Frontend Developer", vec![Frontend, Mobile]));
        registry.register(AgentProfile::new(
            "backend-dev",
            "Backend Developer",
            vec![Backend, ApiDesign, Database],
        ));
        registry.register(AgentProfile::new("dba", "Database Engineer", vec![Database, DataProcessing]));
        registry.register(AgentProfile::new("qa-engineer", "QA Engineer", vec![Testing]));
        registry.register(AgentProfile::new("devops-engineer", "DevOps Engineer", vec![Devops]));
        registry.register(AgentProfile::new("security-engineer", "Security Engineer", vec![Security]));
        registry.register(AgentProfile::new("tech-writer", "Technical Writer", vec![Documentation]));
        registry.register(AgentProfile::new(
            "data-engineer",
            "Data Engineer",
            vec![DataProcessing, MachineLearning],
        ));
        registry.register(AgentProfile::new(
            "fullstack-dev",
            "Full-Stack Developer",
            vec![Frontend, Backend, CodeGeneration],
        ));
        registry
    }

    /// Add an agent, replacing any existing profile with the same id.
    pub fn register(&mut self, profile: AgentProfile) {
        self.agents.retain(|a| a.id != profile.id);
        self.agents.push(profile);
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<AgentProfile> {
        let index = self.agents.iter().position(|a| &a.id == id)?;
        Some(self.agents.remove(index))
    }

    pub fn get(&self, id: &AgentId) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| &a.id == id)
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// How strictly requirements must be covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Any overlap counts; score is the covered fraction.
    #[default]
    BestEffort,
    /// Every requirement must be covered.
    Strict,
}

/// Outcome of a capability match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub success: bool,
    pub best_match: Option<AgentProfile>,
    pub confidence: f64,
    pub score: f64,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            success: false,
            best_match: None,
            confidence: 0.0,
            score: 0.0,
        }
    }
}

/// Picks the best agent for a set of capability requirements.
pub trait CapabilityMatcher: Send + Sync {
    fn find_best_match(
        &self,
        requirements: &[Capability],
        agents: &[AgentProfile],
        mode: MatchMode,
    ) -> MatchResult;
}

/// Scores agents by the fraction of requirements they cover.
///
/// Ties go to the agent with fewer capabilities (the narrower specialist),
/// then to registration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringMatcher;

impl CapabilityMatcher for ScoringMatcher {
    fn find_best_match(
        &self,
        requirements: &[Capability],
        agents: &[AgentProfile],
        mode: MatchMode,
    ) -> MatchResult {
        if requirements.is_empty() {
            return MatchResult::no_match();
        }

        let mut best: Option<(&AgentProfile, f64)> = None;
        for agent in agents {
            let covered = requirements.iter().filter(|r| agent.has(**r)).count();
            if covered == 0 {
                continue;
            }
            if mode == MatchMode::Strict && covered < requirements.len() {
                continue;
            }
            let score = covered as f64 / requirements.len() as f64;
            let better = match best {
                None => true,
                Some((current, current_score)) => {
                    score > current_score
                        || (score == current_score
                            && agent.capabilities.len() < current.capabilities.len())
                }
            };
            if better {
                best = Some((agent, score));
            }
        }

        match best {
            Some((agent, score)) => MatchResult {
                success: true,
                best_match: Some(agent.clone()),
                confidence: 0.5 + score / 2.0,
                score,
            },
            None => MatchResult::no_match(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_display() {
        assert_eq!(AgentId::from("qa").to_string(), "qa");
        assert_eq!(AgentId::generic().as_str(), GENERIC_AGENT_ID);
    }

    #[test]
    fn test_capability_serializes_kebab_case() {
        let json = serde_json::to_string(&Capability::DataProcessing).unwrap();
        assert_eq!(json, "\"data-processing\"");
        assert_eq!(Capability::DataProcessing.slug(), "data-processing");
    }

    #[test]
    fn test_default_registry_covers_every_capability() {
        let registry = AgentRegistry::with_defaults();
        for cap in Capability::all() {
            assert!(
                registry.agents().iter().any(|a| a.has(*cap)),
                "no default agent for {}",
                cap
            );
        }
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mut registry = AgentRegistry::new();
        registry.register(AgentProfile::new("a", "A", vec![Capability::Testing]));
        registry.register(AgentProfile::new("a", "A2", vec![Capability::Frontend]));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&AgentId::from("a")).unwrap().name, "A2");
        assert!(registry.remove(&AgentId::from("a")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_scoring_matcher_prefers_full_coverage() {
        let agents = vec![
            AgentProfile::new("half", "Half", vec![Capability::Backend]),
            AgentProfile::new("full", "Full", vec![Capability::Backend, Capability::ApiDesign]),
        ];
        let result = ScoringMatcher.find_best_match(
            &[Capability::Backend, Capability::ApiDesign],
            &agents,
            MatchMode::BestEffort,
        );
        assert!(result.success);
        assert_eq!(result.best_match.unwrap().id, AgentId::from("full"));
        assert_eq!(result.score, 1.0);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_scoring_matcher_prefers_specialist_on_tie() {
        let agents = vec![
            AgentProfile::new("generalist", "G", vec![Capability::Testing, Capability::Frontend]),
            AgentProfile::new("specialist", "S", vec![Capability::Testing]),
        ];
        let result =
            ScoringMatcher.find_best_match(&[Capability::Testing], &agents, MatchMode::BestEffort);
        assert_eq!(result.best_match.unwrap().id, AgentId::from("specialist"));
    }

    #[test]
    fn test_scoring_matcher_strict_rejects_partial() {
        let agents = vec![AgentProfile::new("half", "Half", vec![Capability::Backend])];
        let result = ScoringMatcher.find_best_match(
            &[Capability::Backend, Capability::Security],
            &agents,
            MatchMode::Strict,
        );
        assert!(!result.success);
        assert!(result.best_match.is_none());
    }

    #[test]
    fn test_scoring_matcher_no_agents() {
        let result =
            ScoringMatcher.find_best_match(&[Capability::Mobile], &[], MatchMode::BestEffort);
        assert_eq!(result, MatchResult::no_match());
    }
}
