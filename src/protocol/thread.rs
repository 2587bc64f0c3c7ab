use std::{
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, error};
use parking_lot::Mutex;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads serving one connection each.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            match Worker::new(i, Arc::clone(&receiver)) {
                Ok(worker) => workers.push(worker),
                Err(e) => error!("failed to start connection worker {i}: {e}"),
            }
        }

        Self { workers, sender }
    }

    /// Queues `f`; it runs once a worker is free. Returns false when the pool is
    /// shutting down.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(job).is_ok())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down connection worker {}", worker.id);

            if worker.thread.join().is_err() {
                error!("connection worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("connection-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver.lock().recv();
                    match msg {
                        Ok(job) => {
                            debug!("worker {id} handling a connection");
                            job();
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}
