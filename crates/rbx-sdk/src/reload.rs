//! Reload strategies: what to do about cud packages missed while offline.

use crate::error::Result;
use crate::protocol::HistoryResponse;
use async_trait::async_trait;
use rbx_cud::{CudId, CudPackage};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// What a reconnecting databox knows about the gap it has to close.
#[derive(Clone, Debug, PartialEq)]
pub struct GapInfo {
    /// Last cud id applied before the connection dropped.
    pub last_applied: CudId,
    /// Last cud id the server reports after the reconnect.
    pub server_last: CudId,
    /// How long the databox was offline, if known.
    pub disconnected_for: Option<Duration>,
    /// Whether the server restored the previous session token.
    pub token_used: bool,
}

impl GapInfo {
    pub fn has_gap(&self) -> bool {
        self.server_last > self.last_applied
    }

    /// Number of packages missed, assuming dense ids.
    pub fn missed(&self) -> u64 {
        self.server_last.0.saturating_sub(self.last_applied.0)
    }
}

/// Outcome of a reload decision.
#[derive(Clone, Debug, PartialEq)]
pub enum ReloadDecision {
    /// Apply these packages in order.
    Replay(Vec<CudPackage>),
    /// Build a fresh reload session and swap it in.
    Resnapshot,
}

/// Source of retained cud packages.
#[async_trait]
pub trait CudHistory: Send + Sync {
    /// Packages with an id greater than `last_applied` the server still has.
    async fn missed_since(&self, last_applied: CudId) -> Result<HistoryResponse>;
}

/// Pluggable replay-or-resnapshot policy.
#[async_trait]
pub trait ReloadStrategy: Send + Sync + fmt::Debug {
    async fn decide(&self, gap: &GapInfo, history: &dyn CudHistory) -> Result<ReloadDecision>;
}

/// Replay the retained log if it covers the whole gap, otherwise resnapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryReload;

impl HistoryReload {
    /// The packages closing the gap, or `None` if the log has a hole.
    fn covering(gap: &GapInfo, history: HistoryResponse) -> Option<Vec<CudPackage>> {
        let first_needed = gap.last_applied.next();
        if history.oldest? > first_needed {
            return None;
        }

        let mut packages: Vec<CudPackage> = history
            .packages
            .into_iter()
            .filter(|p| p.id > gap.last_applied)
            .collect();
        packages.sort_by_key(|p| p.id);
        packages.dedup_by_key(|p| p.id);

        let mut expected = first_needed;
        for package in &packages {
            if package.id != expected {
                return None;
            }
            expected = expected.next();
        }
        (expected > gap.server_last).then_some(packages)
    }
}

#[async_trait]
impl ReloadStrategy for HistoryReload {
    async fn decide(&self, gap: &GapInfo, history: &dyn CudHistory) -> Result<ReloadDecision> {
        if !gap.has_gap() {
            return Ok(ReloadDecision::Replay(Vec::new()));
        }
        let retained = match history.missed_since(gap.last_applied).await {
            Ok(retained) => retained,
            Err(err) => {
                debug!(%err, "cud history unavailable");
                return Ok(ReloadDecision::Resnapshot);
            }
        };
        Ok(match Self::covering(gap, retained) {
            Some(packages) => ReloadDecision::Replay(packages),
            None => ReloadDecision::Resnapshot,
        })
    }
}

/// Replay history after short outages, resnapshot after long ones.
#[derive(Clone, Copy, Debug)]
pub struct TimeWindowReload {
    pub max_gap: Duration,
    pub history: HistoryReload,
}

impl TimeWindowReload {
    pub fn new(max_gap: Duration) -> Self {
        Self {
            max_gap,
            history: HistoryReload,
        }
    }
}

impl Default for TimeWindowReload {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl ReloadStrategy for TimeWindowReload {
    async fn decide(&self, gap: &GapInfo, history: &dyn CudHistory) -> Result<ReloadDecision> {
        if !gap.has_gap() {
            return Ok(ReloadDecision::Replay(Vec::new()));
        }
        // An unknown outage length counts as short.
        if gap.disconnected_for.unwrap_or_default() < self.max_gap {
            self.history.decide(gap, history).await
        } else {
            Ok(ReloadDecision::Resnapshot)
        }
    }
}

/// Always rebuild after a gap.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysResnapshot;

#[async_trait]
impl ReloadStrategy for AlwaysResnapshot {
    async fn decide(&self, gap: &GapInfo, _history: &dyn CudHistory) -> Result<ReloadDecision> {
        Ok(if gap.has_gap() {
            ReloadDecision::Resnapshot
        } else {
            ReloadDecision::Replay(Vec::new())
        })
    }
}
