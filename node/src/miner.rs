//! Miner coordination.
//!
//! The coordinator owns the current mining job: an immutable block
//! template plus a shared atomic stop flag. Template updates and incoming
//! solutions are reactor messages; the stop flag is the only state shared
//! with mining threads or the external solver. Every restart issues a new
//! job id, and solutions carrying a stale id are discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use veil_types::BlockHeader;

use crate::processor::BlockTemplate;

/// An immutable unit of mining work.
#[derive(Clone, Debug)]
pub struct MiningJob {
    pub job_id: u64,
    pub template: BlockTemplate,
    /// Set when the job becomes stale; workers consult it at checkpoints.
    pub stop: Arc<AtomicBool>,
}

/// Outcome of a reported solution.
#[derive(Clone, Debug, PartialEq)]
pub enum SolutionOutcome {
    /// Solution for the current job: publish this block.
    Accepted { header: BlockHeader, body: Vec<u8> },
    /// Solution for a superseded job id; discarded.
    Stale,
}

/// Block template refresh and solver arbitration.
pub struct MinerCoordinator {
    enabled: bool,
    current: Option<MiningJob>,
    next_job_id: u64,
    last_restart_ms: u64,
    soft_restart_ms: u64,
}

impl MinerCoordinator {
    pub fn new(enabled: bool, soft_restart_ms: u64) -> Self {
        Self {
            enabled,
            current: None,
            next_job_id: 1,
            last_restart_ms: 0,
            soft_restart_ms,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current(&self) -> Option<&MiningJob> {
        self.current.as_ref()
    }

    /// Whether enough time passed since the last restart for a mempool
    /// change to justify rebuilding the template. Tip changes restart
    /// unconditionally.
    pub fn may_soft_restart(&self, now_ms: u64) -> bool {
        self.enabled && now_ms.saturating_sub(self.last_restart_ms) >= self.soft_restart_ms
    }

    /// Replace the current job. The old job's stop flag is raised so
    /// in-flight workers abandon it.
    pub fn restart(&mut self, template: BlockTemplate, now_ms: u64) -> Option<&MiningJob> {
        if !self.enabled {
            return None;
        }
        if let Some(old) = self.current.take() {
            old.stop.store(true, Ordering::Relaxed);
        }
        let job = MiningJob {
            job_id: self.next_job_id,
            template,
            stop: Arc::new(AtomicBool::new(false)),
        };
        self.next_job_id += 1;
        self.last_restart_ms = now_ms;
        tracing::debug!(job_id = job.job_id, "mining template rebuilt");
        self.current = Some(job);
        self.current.as_ref()
    }

    /// Handle a solution from an internal thread or the external solver.
    pub fn on_solution(&mut self, job_id: u64, pow_nonce: u64) -> SolutionOutcome {
        match &self.current {
            Some(job) if job.job_id == job_id => {
                let job = self.current.take().expect("checked above");
                job.stop.store(true, Ordering::Relaxed);
                let mut header = job.template.header.clone();
                header.pow_nonce = pow_nonce;
                SolutionOutcome::Accepted {
                    header,
                    body: job.template.body,
                }
            }
            _ => SolutionOutcome::Stale,
        }
    }

    /// Abort the current job (shutdown, mining disabled).
    pub fn stop(&mut self) {
        if let Some(job) = self.current.take() {
            job.stop.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::{BlockHash, ChainWork, Timestamp};

    fn template(height: u64) -> BlockTemplate {
        BlockTemplate {
            header: BlockHeader {
                height,
                prev: BlockHash::new([1; 32]),
                chain_work: ChainWork(height as u128),
                timestamp: Timestamp::new(0),
                pow_nonce: 0,
            },
            body: vec![height as u8],
            fees: 100,
        }
    }

    #[test]
    fn disabled_coordinator_never_builds_jobs() {
        let mut m = MinerCoordinator::new(false, 1000);
        assert!(m.restart(template(1), 0).is_none());
        assert!(!m.may_soft_restart(10_000));
    }

    #[test]
    fn restart_raises_old_stop_flag_and_bumps_job_id() {
        let mut m = MinerCoordinator::new(true, 1000);
        m.restart(template(1), 0);
        let old_stop = m.current().unwrap().stop.clone();
        let old_id = m.current().unwrap().job_id;

        m.restart(template(2), 500);
        assert!(old_stop.load(Ordering::Relaxed));
        assert_eq!(m.current().unwrap().job_id, old_id + 1);
        assert!(!m.current().unwrap().stop.load(Ordering::Relaxed));
    }

    #[test]
    fn stale_solution_discarded_current_kept() {
        let mut m = MinerCoordinator::new(true, 1000);
        m.restart(template(1), 0);
        let current_id = m.current().unwrap().job_id;

        assert_eq!(m.on_solution(current_id + 7, 42), SolutionOutcome::Stale);
        assert!(m.current().is_some());
    }

    #[test]
    fn accepted_solution_fills_nonce_and_retires_job() {
        let mut m = MinerCoordinator::new(true, 1000);
        m.restart(template(5), 0);
        let id = m.current().unwrap().job_id;

        match m.on_solution(id, 0xFEED) {
            SolutionOutcome::Accepted { header, body } => {
                assert_eq!(header.pow_nonce, 0xFEED);
                assert_eq!(header.height, 5);
                assert_eq!(body, vec![5]);
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
        // Job retired; a late duplicate of the same id is now stale.
        assert_eq!(m.on_solution(id, 0xFEED), SolutionOutcome::Stale);
    }

    #[test]
    fn soft_restart_is_rate_limited() {
        let mut m = MinerCoordinator::new(true, 1000);
        m.restart(template(1), 0);
        assert!(!m.may_soft_restart(999));
        assert!(m.may_soft_restart(1000));
    }
}
