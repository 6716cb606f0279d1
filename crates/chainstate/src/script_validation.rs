//! Per-block signature check dispatch with barrier aggregation.

use std::sync::Arc;

use bitnode_log::log_trace;
use bitnode_primitives::transaction::Transaction;
use bitnode_script::{ScriptFlags, ScriptJob, ScriptVerifier, WorkerPool};
use rayon::prelude::*;

use crate::error::ChainError;
use crate::utxo::UtxoView;
use crate::validation::ValidationError;

/// Where queued jobs are evaluated.
#[derive(Clone)]
pub enum ScriptBackend {
    /// In-process oracle calls spread over the rayon pool.
    Inline(Arc<dyn ScriptVerifier>),
    /// External workers behind a [`WorkerPool`].
    Pool(Arc<WorkerPool>),
}

pub struct ScriptValidation {
    active: bool,
    backend: ScriptBackend,
    jobs: Vec<ScriptJob>,
}

impl ScriptValidation {
    pub fn new(backend: ScriptBackend, active: bool) -> Self {
        Self {
            active,
            backend,
            jobs: Vec::new(),
        }
    }

    pub fn inline<V: ScriptVerifier + 'static>(verifier: V) -> Self {
        Self::new(ScriptBackend::Inline(Arc::new(verifier)), true)
    }

    pub fn pool(pool: Arc<WorkerPool>) -> Self {
        Self::new(ScriptBackend::Pool(pool), true)
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn queued(&self) -> usize {
        self.jobs.len()
    }

    /// Queue one job per input of `tx`. Every spent output must be in `view`.
    pub fn queue(
        &mut self,
        view: &UtxoView,
        tx: &Arc<Transaction>,
        flags: ScriptFlags,
    ) -> Result<(), ChainError> {
        for (input_index, input) in tx.vin.iter().enumerate() {
            let utxo = view
                .fetch(&input.prevout)
                .ok_or(ValidationError::MissingInputs(input.prevout))?;
            self.jobs.push(ScriptJob {
                tx: Arc::clone(tx),
                input_index,
                script_pubkey: utxo.script_pubkey.clone(),
                amount: utxo.value,
                flags,
            });
        }
        Ok(())
    }

    /// Detach the queued jobs so the barrier can be awaited elsewhere.
    pub fn take(&mut self) -> ScriptBatch {
        ScriptBatch {
            active: self.active,
            backend: self.backend.clone(),
            jobs: std::mem::take(&mut self.jobs),
        }
    }

    /// Wait for every queued job. True when all of them verified.
    pub fn result(&mut self) -> Result<bool, ChainError> {
        self.take().wait()
    }
}

/// The jobs of one block together with the backend that resolves them.
pub struct ScriptBatch {
    active: bool,
    backend: ScriptBackend,
    jobs: Vec<ScriptJob>,
}

impl ScriptBatch {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Blocks until the batch resolves.
    pub fn wait(self) -> Result<bool, ChainError> {
        if !self.active || self.jobs.is_empty() {
            return Ok(true);
        }
        log_trace!("verifying {} script jobs", self.jobs.len());
        match &self.backend {
            ScriptBackend::Inline(verifier) => Ok(self.jobs.par_iter().all(|job| {
                verifier.verify(&job.tx, &job.script_pubkey, job.input_index, job.flags)
            })),
            ScriptBackend::Pool(pool) => Ok(pool.submit(&self.jobs)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_primitives::outpoint::OutPoint;
    use bitnode_primitives::transaction::{TxIn, TxOut};
    use bitnode_script::PoolConfig;

    use crate::utxo::{InputPartition, Utxo};

    const PASS: u8 = 0x51;
    const FAIL: u8 = 0x00;

    fn verdict(_: &Transaction, script: &[u8], _: usize, _: ScriptFlags) -> bool {
        script == [PASS]
    }

    fn spend(scripts: &[u8]) -> (UtxoView, Arc<Transaction>) {
        let vin: Vec<TxIn> = (0..scripts.len())
            .map(|i| TxIn {
                prevout: OutPoint::new([7u8; 32], i as u32),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            })
            .collect();
        let partition = InputPartition {
            external: vin.iter().map(|input| input.prevout).collect(),
            ..InputPartition::default()
        };
        let view = UtxoView::build(&partition, |outpoints| {
            Ok(outpoints
                .iter()
                .zip(scripts)
                .map(|(outpoint, script)| {
                    (
                        *outpoint,
                        Utxo {
                            value: 10,
                            script_pubkey: vec![*script],
                            height: 1,
                            is_coinbase: false,
                        },
                    )
                })
                .collect())
        })
        .expect("view");
        let tx = Transaction {
            version: 1,
            vin,
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![PASS],
            }],
            lock_time: 0,
        };
        (view, Arc::new(tx))
    }

    #[test]
    fn one_failure_fails_the_batch() {
        let mut scripts = ScriptValidation::inline(verdict);
        let (view, tx) = spend(&[PASS, FAIL, PASS]);
        scripts.queue(&view, &tx, 0).expect("queue");
        assert_eq!(scripts.queued(), 3);
        assert!(!scripts.result().expect("result"));
        assert_eq!(scripts.queued(), 0);
    }

    #[test]
    fn empty_batch_succeeds() {
        let mut scripts = ScriptValidation::inline(verdict);
        assert!(scripts.result().expect("result"));
    }

    #[test]
    fn inactive_validation_ignores_jobs() {
        let mut scripts = ScriptValidation::inline(verdict);
        scripts.set_active(false);
        let (view, tx) = spend(&[FAIL]);
        scripts.queue(&view, &tx, 0).expect("queue");
        assert!(scripts.result().expect("result"));
    }

    #[test]
    fn pool_backend_aggregates() {
        let pool = WorkerPool::local(2, verdict, PoolConfig::default()).expect("pool");
        let mut scripts = ScriptValidation::pool(Arc::new(pool));
        let (view, tx) = spend(&[PASS, PASS]);
        scripts.queue(&view, &tx, 0).expect("queue");
        assert!(scripts.result().expect("result"));
        let (view, tx) = spend(&[PASS, FAIL]);
        scripts.queue(&view, &tx, 0).expect("queue");
        assert!(!scripts.result().expect("result"));
    }

    #[test]
    fn queue_requires_resolved_inputs() {
        let mut scripts = ScriptValidation::inline(verdict);
        let (_, tx) = spend(&[PASS]);
        let err = scripts.queue(&UtxoView::default(), &tx, 0).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Validation(ValidationError::MissingInputs(_))
        ));
    }
}
