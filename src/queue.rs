//! The build execution queue: a pool of worker lanes that runs command
//! bodies.  The queue knows nothing about the build graph; jobs are opaque
//! closures that report back to the engine over its completion channel.

use crate::smallmap::SmallMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Worker-side handle passed to a running job.  The only operations valid
/// on a lane are process execution, filesystem reads, and sending the final
/// completion record.
pub struct JobContext {
    pub lane: usize,
}

impl JobContext {
    /// Run an argv directly.  A non-empty environment replaces the inherited
    /// one.  Child stdio is inherited, so command output interleaves with
    /// ours without any replumbing.
    pub fn execute_process(&self, argv: &[String], env: &SmallMap<String, String>) -> bool {
        let Some((program, args)) = argv.split_first() else {
            return false;
        };
        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        if !env.is_empty() {
            cmd.env_clear();
            for (k, v) in env.iter() {
                cmd.env(k, v);
            }
        }
        match cmd.status() {
            Ok(status) => status.success(),
            Err(err) => {
                eprintln!("llb: {}: {}", program, err);
                false
            }
        }
    }

    /// Run a command line via `/bin/sh -c`.
    pub fn execute_shell_command(&self, command: &str) -> bool {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.execute_process(&argv, &SmallMap::new())
    }
}

pub struct QueueJob {
    pub work: Box<dyn FnOnce(&JobContext) + Send>,
}

impl QueueJob {
    pub fn new(work: impl FnOnce(&JobContext) + Send + 'static) -> QueueJob {
        QueueJob {
            work: Box::new(work),
        }
    }
}

/// The queue exists only while a build is in progress.  Dropping it closes
/// the job channel and joins every lane, so in-flight jobs finish and their
/// completion records are already in the engine's channel by the time the
/// drop returns.
pub trait ExecutionQueue {
    fn add_job(&mut self, job: QueueJob);
}

pub struct LaneBasedExecutionQueue {
    tx: Option<mpsc::Sender<QueueJob>>,
    lanes: Vec<thread::JoinHandle<()>>,
}

impl LaneBasedExecutionQueue {
    pub fn new(parallelism: usize) -> LaneBasedExecutionQueue {
        let (tx, rx) = mpsc::channel::<QueueJob>();
        let rx = Arc::new(Mutex::new(rx));
        let lanes = (0..parallelism.max(1))
            .map(|lane| {
                let rx = Arc::clone(&rx);
                thread::spawn(move || {
                    let ctx = JobContext { lane };
                    loop {
                        // Holding the lock only while receiving keeps other
                        // lanes free to pick up jobs during execution.
                        let job = match rx.lock().unwrap().recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        };
                        (job.work)(&ctx);
                    }
                })
            })
            .collect();
        LaneBasedExecutionQueue {
            tx: Some(tx),
            lanes,
        }
    }
}

impl ExecutionQueue for LaneBasedExecutionQueue {
    fn add_job(&mut self, job: QueueJob) {
        if let Some(tx) = &self.tx {
            // Send fails only if every lane has panicked.
            let _ = tx.send(job);
        }
    }
}

impl Drop for LaneBasedExecutionQueue {
    fn drop(&mut self) {
        self.tx.take();
        for lane in self.lanes.drain(..) {
            let _ = lane.join();
        }
    }
}
