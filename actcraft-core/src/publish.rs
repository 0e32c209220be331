//! Program publication
//!
//! The optimizer side holds a [`ProgramPublisher`]; each agent holds a
//! [`ProgramSubscription`] and checks it between steps. A `watch` channel
//! keeps only the latest program, so a slow agent skips straight to it.

use crate::program::{Program, ProgramModule};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ProgramPublisher {
    tx: Arc<watch::Sender<Arc<Program>>>,
}

impl ProgramPublisher {
    pub fn new(initial: Program) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Replace the published program; subscribers see it on their next check
    pub fn publish(&self, program: Program) -> Arc<Program> {
        let program = Arc::new(program);
        tracing::info!(
            program = %program.name(),
            version = program.version(),
            generation = program.meta().generation,
            subscribers = self.tx.receiver_count(),
            "published program"
        );
        self.tx.send_replace(Arc::clone(&program));
        program
    }

    pub fn current(&self) -> Arc<Program> {
        Arc::clone(&self.tx.borrow())
    }

    /// Subscribe; the program current at this point counts as already seen
    pub fn subscribe(&self) -> ProgramSubscription {
        ProgramSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct ProgramSubscription {
    rx: watch::Receiver<Arc<Program>>,
}

impl ProgramSubscription {
    /// The program published since the last call, if any
    pub fn take_update(&mut self) -> Option<Arc<Program>> {
        match self.rx.has_changed() {
            Ok(true) => Some(Arc::clone(&self.rx.borrow_and_update())),
            _ => None,
        }
    }

    pub fn current(&self) -> Arc<Program> {
        Arc::clone(&self.rx.borrow())
    }

    /// Wait for the next publication; false once the publisher is gone
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
