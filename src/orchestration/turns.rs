//! Turn and budget control.
//!
//! The `TurnController` tracks per-session consumption across four budget
//! dimensions (turns, tokens, wall-clock time, cost) and stops a session
//! once any of them is exhausted. Callers must check `can_continue` before
//! issuing the next turn; `run_turn` does that check for them.
//!
//! Budget events are published on a `tokio::sync::broadcast` channel.

use crate::error::{Error, Result};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

/// Capacity of the turn event channel.
const EVENT_CAPACITY: usize = 256;

/// Share of an unsplit token count assumed to be input tokens.
const INPUT_SHARE: f64 = 0.7;

/// Hard limits for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnLimits {
    pub max_turns: u32,
    pub max_tokens: u64,
    pub max_time_ms: u64,
    pub max_cost_usd: f64,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_tokens: 200_000,
            max_time_ms: 30 * 60 * 1000,
            max_cost_usd: 10.0,
        }
    }
}

/// Usage ratios at which a one-time warning is emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningThresholds {
    pub turns: f64,
    pub tokens: f64,
    pub time: f64,
    pub cost: f64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            turns: 0.8,
            tokens: 0.85,
            time: 0.9,
            cost: 0.8,
        }
    }
}

impl WarningThresholds {
    fn for_dimension(&self, dimension: BudgetDimension) -> f64 {
        match dimension {
            BudgetDimension::Turns => self.turns,
            BudgetDimension::Tokens => self.tokens,
            BudgetDimension::Time => self.time,
            BudgetDimension::Cost => self.cost,
        }
    }
}

/// USD per token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenRates {
    pub input: f64,
    pub output: f64,
}

impl Default for TokenRates {
    fn default() -> Self {
        Self {
            input: 0.000_003,
            output: 0.000_015,
        }
    }
}

impl TokenRates {
    /// Cost of a turn. Without an input/output split, 70% of the total is
    /// charged at the input rate and 30% at the output rate.
    pub fn cost(&self, data: &TurnData) -> f64 {
        match (data.input_tokens, data.output_tokens) {
            (Some(input), Some(output)) => input as f64 * self.input + output as f64 * self.output,
            _ => {
                let total = data.tokens as f64;
                total * INPUT_SHARE * self.input + total * (1.0 - INPUT_SHARE) * self.output
            }
        }
    }
}

/// One of the four budget dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetDimension {
    Turns,
    Tokens,
    Time,
    Cost,
}

impl BudgetDimension {
    pub const ALL: [BudgetDimension; 4] = [
        BudgetDimension::Turns,
        BudgetDimension::Tokens,
        BudgetDimension::Time,
        BudgetDimension::Cost,
    ];
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetDimension::Turns => write!(f, "turns"),
            BudgetDimension::Tokens => write!(f, "tokens"),
            BudgetDimension::Time => write!(f, "time"),
            BudgetDimension::Cost => write!(f, "cost"),
        }
    }
}

/// Consumption so far. Never exceeds the session's limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub turns: u32,
    pub tokens: u64,
    pub time_ms: u64,
    pub cost_usd: f64,
}

impl TurnUsage {
    /// Usage of a dimension as a fraction of its limit.
    pub fn ratio(&self, limits: &TurnLimits, dimension: BudgetDimension) -> f64 {
        let (used, limit) = match dimension {
            BudgetDimension::Turns => (self.turns as f64, limits.max_turns as f64),
            BudgetDimension::Tokens => (self.tokens as f64, limits.max_tokens as f64),
            BudgetDimension::Time => (self.time_ms as f64, limits.max_time_ms as f64),
            BudgetDimension::Cost => (self.cost_usd, limits.max_cost_usd),
        };
        if limit <= 0.0 {
            return 1.0;
        }
        used / limit
    }

    fn saturate(&mut self, limits: &TurnLimits) {
        self.turns = self.turns.min(limits.max_turns);
        self.tokens = self.tokens.min(limits.max_tokens);
        self.time_ms = self.time_ms.min(limits.max_time_ms);
        self.cost_usd = self.cost_usd.min(limits.max_cost_usd);
    }
}

/// Usage reported for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnData {
    pub tokens: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Cost reported by the provider; computed from rates when absent.
    pub cost_usd: Option<f64>,
}

impl TurnData {
    pub fn tokens(tokens: u64) -> Self {
        Self {
            tokens,
            ..Default::default()
        }
    }
}

/// Anything that can report the usage of the turn that produced it.
pub trait UsageReport {
    fn turn_data(&self) -> TurnData;
}

/// Entry in a session's turn history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub tokens: u64,
    pub cost_usd: f64,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    #[default]
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnStatus::Active => write!(f, "active"),
            TurnStatus::Paused => write!(f, "paused"),
            TurnStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Budget state of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub session_id: SessionId,
    pub limits: TurnLimits,
    pub current: TurnUsage,
    pub warnings_sent: BTreeSet<BudgetDimension>,
    pub history: Vec<TurnRecord>,
    pub status: TurnStatus,
    pub completion_reason: Option<String>,
    /// Shifted forward on resume so paused time is not counted.
    pub start_time: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

impl TurnState {
    fn new(session_id: SessionId, limits: TurnLimits) -> Self {
        Self {
            session_id,
            limits,
            current: TurnUsage::default(),
            warnings_sent: BTreeSet::new(),
            history: Vec::new(),
            status: TurnStatus::Active,
            completion_reason: None,
            start_time: Utc::now(),
            paused_at: None,
        }
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let end = self.paused_at.unwrap_or(now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }

    pub fn can_continue(&self) -> bool {
        self.status == TurnStatus::Active
    }
}

/// Result of recording a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The session still admits turns.
    pub can_continue: bool,
    pub current: TurnUsage,
    /// A turn of average size would still fit within the token budget.
    pub next_turn_allowed: bool,
    pub status: TurnStatus,
    pub completion_reason: Option<String>,
}

impl TurnOutcome {
    fn from_state(state: &TurnState) -> Self {
        let can_continue = state.can_continue();
        let average_tokens = if state.current.turns == 0 {
            0
        } else {
            state.current.tokens / state.current.turns as u64
        };
        let tokens_left = state.limits.max_tokens.saturating_sub(state.current.tokens);
        Self {
            can_continue,
            current: state.current.clone(),
            next_turn_allowed: can_continue && tokens_left >= average_tokens,
            status: state.status,
            completion_reason: state.completion_reason.clone(),
        }
    }
}

/// Budget events.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TurnRecorded {
        session_id: SessionId,
        turn: u32,
        usage: TurnUsage,
    },
    /// A dimension crossed its warning ratio. Sent once per dimension.
    Warning {
        session_id: SessionId,
        dimension: BudgetDimension,
        ratio: f64,
    },
    Completed {
        session_id: SessionId,
        reason: String,
    },
    Paused {
        session_id: SessionId,
    },
    Resumed {
        session_id: SessionId,
    },
}

/// Tracks budgets for all sessions.
///
/// Cheap to clone; clones share state and the event channel.
#[derive(Clone)]
pub struct TurnController {
    states: Arc<Mutex<HashMap<SessionId, TurnState>>>,
    warnings: WarningThresholds,
    rates: TokenRates,
    events: broadcast::Sender<TurnEvent>,
}

impl TurnController {
    pub fn new(warnings: WarningThresholds, rates: TokenRates) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            warnings,
            rates,
            events,
        }
    }

    /// Subscribe to budget events.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TurnEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Start tracking a session. Re-initializing resets its state.
    pub async fn init_session(&self, id: SessionId, limits: TurnLimits) -> TurnState {
        let state = TurnState::new(id, limits);
        debug!(session = %id, max_turns = state.limits.max_turns, "Turn budget initialized");
        self.states.lock().await.insert(id, state.clone());
        state
    }

    /// Snapshot of a session's budget state.
    pub async fn state(&self, id: &SessionId) -> Option<TurnState> {
        self.states.lock().await.get(id).cloned()
    }

    /// Record one turn and enforce the limits.
    ///
    /// Paused and completed sessions record nothing and report
    /// `can_continue = false`.
    pub async fn record_turn(&self, id: &SessionId, data: TurnData) -> Result<TurnOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let mut states = self.states.lock().await;
            let state = states
                .get_mut(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

            if !state.can_continue() {
                debug!(session = %id, status = %state.status, "Turn rejected");
                return Ok(TurnOutcome::from_state(state));
            }

            let now = Utc::now();
            let cost = data.cost_usd.unwrap_or_else(|| self.rates.cost(&data));
            state.current.turns = state.current.turns.saturating_add(1);
            state.current.tokens = state.current.tokens.saturating_add(data.tokens);
            state.current.cost_usd += cost;
            state.current.time_ms = state.elapsed_ms(now);

            let mut exhausted = Vec::new();
            for dimension in BudgetDimension::ALL {
                let ratio = state.current.ratio(&state.limits, dimension);
                if ratio >= self.warnings.for_dimension(dimension)
                    && state.warnings_sent.insert(dimension)
                {
                    events.push(TurnEvent::Warning {
                        session_id: *id,
                        dimension,
                        ratio,
                    });
                }
                if ratio >= 1.0 {
                    exhausted.push(dimension);
                }
            }

            state.current.saturate(&state.limits);
            state.history.push(TurnRecord {
                turn: state.current.turns,
                tokens: data.tokens,
                cost_usd: cost,
                elapsed_ms: state.current.time_ms,
                timestamp: now,
            });
            trace!(session = %id, turn = state.current.turns, tokens = data.tokens, cost, "Turn recorded");
            events.push(TurnEvent::TurnRecorded {
                session_id: *id,
                turn: state.current.turns,
                usage: state.current.clone(),
            });

            if !exhausted.is_empty() {
                let names: Vec<String> = exhausted.iter().map(|d| d.to_string()).collect();
                let reason = format!("budget exhausted: {}", names.join(", "));
                complete(state, &reason);
                events.push(TurnEvent::Completed {
                    session_id: *id,
                    reason,
                });
            }

            TurnOutcome::from_state(state)
        };

        for event in events {
            if let TurnEvent::Warning { dimension, ratio, .. } = &event {
                warn!(session = %id, %dimension, ratio, "Budget warning");
            }
            self.emit(event);
        }
        Ok(outcome)
    }

    /// Stop admitting turns for a session.
    pub async fn force_complete(&self, id: &SessionId, reason: &str) -> Result<TurnState> {
        let snapshot = {
            let mut states = self.states.lock().await;
            let state = states
                .get_mut(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            if state.status == TurnStatus::Completed {
                return Ok(state.clone());
            }
            complete(state, reason);
            state.clone()
        };
        self.emit(TurnEvent::Completed {
            session_id: *id,
            reason: reason.to_string(),
        });
        Ok(snapshot)
    }

    /// Freeze the session's clock and stop admitting turns.
    pub async fn pause(&self, id: &SessionId) -> Result<TurnState> {
        let snapshot = {
            let mut states = self.states.lock().await;
            let state = states
                .get_mut(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            if state.status != TurnStatus::Active {
                return Err(Error::InvalidState(format!(
                    "cannot pause session {} while {}",
                    id, state.status
                )));
            }
            state.status = TurnStatus::Paused;
            state.paused_at = Some(Utc::now());
            state.clone()
        };
        info!(session = %id, "Session paused");
        self.emit(TurnEvent::Paused { session_id: *id });
        Ok(snapshot)
    }

    /// Resume a paused session, excluding the paused interval from its time.
    pub async fn resume(&self, id: &SessionId) -> Result<TurnState> {
        let snapshot = {
            let mut states = self.states.lock().await;
            let state = states
                .get_mut(id)
                .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
            let Some(paused_at) = state.paused_at.filter(|_| state.status == TurnStatus::Paused)
            else {
                return Err(Error::InvalidState(format!(
                    "cannot resume session {} while {}",
                    id, state.status
                )));
            };
            state.start_time += Utc::now() - paused_at;
            state.paused_at = None;
            state.status = TurnStatus::Active;
            state.clone()
        };
        info!(session = %id, "Session resumed");
        self.emit(TurnEvent::Resumed { session_id: *id });
        Ok(snapshot)
    }

    /// Forget a session.
    pub async fn cleanup(&self, id: &SessionId) -> Option<TurnState> {
        self.states.lock().await.remove(id)
    }

    /// Run one budgeted turn.
    ///
    /// Refuses with `Error::BudgetExhausted` when the session no longer
    /// admits turns. A failed invocation is charged as a turn without tokens.
    pub async fn run_turn<F, T>(&self, id: &SessionId, turn: F) -> Result<(T, TurnOutcome)>
    where
        F: Future<Output = Result<T>>,
        T: UsageReport,
    {
        match self.state(id).await {
            Some(state) if state.can_continue() => {}
            Some(_) => return Err(Error::BudgetExhausted(id.to_string())),
            None => return Err(Error::SessionNotFound(id.to_string())),
        }

        match turn.await {
            Ok(value) => {
                let outcome = self.record_turn(id, value.turn_data()).await?;
                Ok((value, outcome))
            }
            Err(e) => {
                self.record_turn(id, TurnData::default()).await?;
                Err(e)
            }
        }
    }
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new(WarningThresholds::default(), TokenRates::default())
    }
}

fn complete(state: &mut TurnState, reason: &str) {
    info!(session = %state.session_id, reason, "Turn budget closed");
    state.status = TurnStatus::Completed;
    state.completion_reason = Some(reason.to_string());
    if state.paused_at.is_none() {
        state.paused_at = Some(Utc::now());
    }
}
