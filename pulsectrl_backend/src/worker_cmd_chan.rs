use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::error::{CtrlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    Load,
    Start,
    Abort,
    Close,
}

/// Latest posted command and how many commands were posted so far.
struct Board {
    posted: Mutex<(usize, WorkerCmd)>,
    bell: Condvar,
}

/// Broadcasts one command at a time to every receiver.
pub struct CmdChan {
    board: Arc<Board>,
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdChan {
    pub fn new() -> Self {
        CmdChan {
            board: Arc::new(Board {
                posted: Mutex::new((0, WorkerCmd::Close)),
                bell: Condvar::new(),
            }),
        }
    }

    /// A receiver reacts to commands posted after its creation only.
    pub fn new_recvr(&self) -> CmdRecvr {
        let seen = self.board.posted.lock().0;
        CmdRecvr {
            board: Arc::clone(&self.board),
            seen,
        }
    }

    pub fn send(&self, cmd: WorkerCmd) {
        let mut posted = self.board.posted.lock();
        *posted = (posted.0 + 1, cmd);
        self.board.bell.notify_all();
    }
}

pub struct CmdRecvr {
    board: Arc<Board>,
    seen: usize,
}

impl CmdRecvr {
    /// Blocks until the next command is posted.
    ///
    /// Fails if more than one command was posted since the last call: the receiver
    /// would have missed one.
    pub fn recv(&mut self) -> Result<WorkerCmd> {
        let mut posted = self.board.posted.lock();
        while posted.0 == self.seen {
            self.board.bell.wait(&mut posted);
        }
        let (count, cmd) = *posted;
        if count != self.seen + 1 {
            return Err(CtrlError::Worker(format!(
                "receiver saw {} commands but {count} were posted",
                self.seen
            )));
        }
        self.seen = count;
        Ok(cmd)
    }
}
