use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::entity::fold_surface;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("Similarity oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("Similarity oracle unavailable: {0}")]
    Unavailable(String),
}

pub type OracleResult<T> = Result<T, OracleError>;

/// Black-box textual similarity. Implementations must be symmetric and
/// return a score in `[0, 1]`.
pub trait SimilarityOracle: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> OracleResult<f64>;
}

impl<T: SimilarityOracle + ?Sized> SimilarityOracle for Arc<T> {
    fn similarity(&self, a: &str, b: &str) -> OracleResult<f64> {
        (**self).similarity(a, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Levenshtein,
    JaroWinkler,
    SorensenDice,
}

/// Edit-distance based oracle over normalized names.
#[derive(Debug, Clone)]
pub struct StringSimilarity {
    metric: Metric,
    ignored_prefixes: Vec<String>,
}

impl StringSimilarity {
    #[must_use]
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            ignored_prefixes: Vec::new(),
        }
    }

    /// Leading tokens dropped before comparing, e.g. vendor names.
    #[must_use]
    pub fn with_ignored_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored_prefixes = prefixes
            .into_iter()
            .map(|p| fold_surface(&p.into()))
            .collect();
        self
    }

    fn prepare(&self, raw: &str) -> String {
        let folded = fold_surface(raw);
        for prefix in &self.ignored_prefixes {
            if let Some(rest) = folded.strip_prefix(prefix.as_str()) {
                if let Some(rest) = rest.strip_prefix(' ') {
                    if !rest.is_empty() {
                        return rest.to_string();
                    }
                }
            }
        }
        folded
    }
}

impl Default for StringSimilarity {
    fn default() -> Self {
        Self::new(Metric::Levenshtein).with_ignored_prefixes(["aws", "amazon"])
    }
}

impl SimilarityOracle for StringSimilarity {
    fn similarity(&self, a: &str, b: &str) -> OracleResult<f64> {
        let (a, b) = (self.prepare(a), self.prepare(b));
        let score = match self.metric {
            Metric::Levenshtein => strsim::normalized_levenshtein(&a, &b),
            Metric::JaroWinkler => strsim::jaro_winkler(&a, &b),
            Metric::SorensenDice => strsim::sorensen_dice(&a, &b),
        };
        Ok(score.clamp(0.0, 1.0))
    }
}

type Job = (String, String, mpsc::SyncSender<OracleResult<f64>>);

/// Imposes a deadline on every call to the inner oracle. Calls run one at a
/// time on a single worker thread. While a timed-out call is still running
/// the oracle reports itself unavailable instead of queueing behind it.
pub struct TimeoutOracle<O> {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    busy: Arc<AtomicBool>,
    timeout: Duration,
    _inner: PhantomData<fn() -> O>,
}

impl<O: SimilarityOracle + 'static> TimeoutOracle<O> {
    #[must_use]
    pub fn new(inner: O, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = Arc::clone(&busy);

        let spawned = std::thread::Builder::new()
            .name("similarity-oracle".into())
            .spawn(move || {
                for (a, b, reply) in rx {
                    let result = inner.similarity(&a, &b);
                    worker_busy.store(false, Ordering::SeqCst);
                    let _ = reply.send(result);
                }
            });
        let jobs = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                tracing::warn!("Failed to start similarity oracle worker: {}", e);
                None
            }
        };

        Self {
            jobs: Mutex::new(jobs),
            busy,
            timeout,
            _inner: PhantomData,
        }
    }
}

impl<O: SimilarityOracle + 'static> SimilarityOracle for TimeoutOracle<O> {
    fn similarity(&self, a: &str, b: &str) -> OracleResult<f64> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| OracleError::Unavailable("oracle lock poisoned".into()))?;
        let Some(jobs) = jobs.as_ref() else {
            return Err(OracleError::Unavailable("oracle worker not running".into()));
        };
        if self.busy.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("oracle still busy with a timed-out call".into()));
        }

        let (reply, answer) = mpsc::sync_channel(1);
        self.busy.store(true, Ordering::SeqCst);
        if jobs.send((a.to_string(), b.to_string(), reply)).is_err() {
            self.busy.store(false, Ordering::SeqCst);
            return Err(OracleError::Unavailable("oracle worker exited".into()));
        }

        match answer.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!("Similarity oracle call exceeded {:?}", self.timeout);
                Err(OracleError::Timeout(self.timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(OracleError::Unavailable("oracle worker exited".into()))
            }
        }
    }
}
