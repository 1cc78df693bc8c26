use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug)]
pub struct JobOutcome {
    pub label: &'static str,
    pub result: anyhow::Result<()>,
}

/// One background worker thread fed over a channel, with results drained
/// from the tick loop once per tick. The worker never touches networking
/// or snapshot state; anything it produces comes back through the result
/// channel.
pub struct JobQueue {
    tx: Option<Sender<(&'static str, Job)>>,
    results: Receiver<JobOutcome>,
    worker: Option<JoinHandle<()>>,
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::<(&'static str, Job)>();
        let (result_tx, results) = channel();
        let worker = std::thread::Builder::new()
            .name("jobs".to_string())
            .spawn(move || {
                for (label, job) in rx {
                    let result = job();
                    if result_tx.send(JobOutcome { label, result }).is_err() {
                        break;
                    }
                }
            })
            .expect("spawning the job worker");
        Self {
            tx: Some(tx),
            results,
            worker: Some(worker),
        }
    }

    pub fn push<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            if tx.send((label, Box::new(job))).is_err() {
                log::error!("job worker is gone, dropping job '{label}'");
            }
        }
    }

    /// Collects finished jobs without blocking.
    pub fn drain(&self) -> Vec<JobOutcome> {
        self.results.try_iter().collect()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_jobs_complete_and_report() {
        let jobs = JobQueue::new();
        jobs.push("ok", || Ok(()));
        jobs.push("fail", || anyhow::bail!("deliberate"));

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut outcomes = Vec::new();
        while outcomes.len() < 2 && Instant::now() < deadline {
            outcomes.extend(jobs.drain());
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.label == "ok" && o.result.is_ok()));
        assert!(outcomes.iter().any(|o| o.label == "fail" && o.result.is_err()));
    }
}
