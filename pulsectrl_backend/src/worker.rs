//! Long-lived per-device workers driven by a [`CmdChan`].
//!
//! Each worker owns the compiled program of one device and a handle to the sink. A
//! command is broadcast to all workers at once; the pool then waits until every worker
//! has acknowledged it before the next command can be sent, so receivers never fall
//! more than one message behind.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use indexmap::IndexMap;

use pulsecompiler_backend::CompiledProgram;

use crate::error::{CtrlError, Result, SinkError};
use crate::sink::HardwareSink;
use crate::worker_cmd_chan::{CmdChan, CmdRecvr, WorkerCmd};

/// A worker's report on one command.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack {
    pub device: String,
    pub cmd: WorkerCmd,
    pub outcome: Result<(), SinkError>,
}

pub struct WorkerPool {
    chan: CmdChan,
    acks: Receiver<Ack>,
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

fn run_worker(
    name: String,
    program: CompiledProgram,
    sink: Arc<dyn HardwareSink>,
    mut recvr: CmdRecvr,
    acks: Sender<Ack>,
) -> Result<()> {
    loop {
        let cmd = recvr.recv()?;
        let outcome = match cmd {
            WorkerCmd::Load => sink.load_program(&name, &program),
            WorkerCmd::Start => sink.start(&name),
            WorkerCmd::Abort => sink.abort(&name),
            WorkerCmd::Close => return Ok(()),
        };
        log::debug!("worker {name}: {cmd:?} done");
        let ack = Ack {
            device: name.clone(),
            cmd,
            outcome,
        };
        if acks.send(ack).is_err() {
            return Err(CtrlError::Worker(format!("worker {name}: pool is gone")));
        }
    }
}

/// Spawns one worker thread per compiled program.
pub fn spawn_device_workers(
    programs: &IndexMap<String, CompiledProgram>,
    sink: Arc<dyn HardwareSink>,
) -> Result<WorkerPool> {
    let chan = CmdChan::new();
    let (ack_send, acks) = unbounded();
    let mut pool = WorkerPool {
        chan,
        acks,
        handles: Vec::with_capacity(programs.len()),
    };
    for (name, program) in programs {
        let recvr = pool.chan.new_recvr();
        let (name_, program, sink, ack_send) = (name.clone(), program.clone(), sink.clone(), ack_send.clone());
        let handle = thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || run_worker(name_, program, sink, recvr, ack_send))
            .map_err(|err| CtrlError::Worker(format!("cannot spawn worker for {name}: {err}")))?;
        pool.handles.push((name.clone(), handle));
    }
    Ok(pool)
}

impl WorkerPool {
    pub fn devices(&self) -> Vec<&str> {
        self.handles.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Sends `cmd` to every worker and waits for all acknowledgements.
    ///
    /// Acks are returned in device order. If any worker failed, the first failure (in
    /// device order) is returned instead.
    pub fn broadcast(&self, cmd: WorkerCmd) -> Result<Vec<Ack>> {
        if cmd == WorkerCmd::Close {
            return Err(CtrlError::Worker("use close() to stop the workers".to_string()));
        }
        self.chan.send(cmd);
        let mut acks = Vec::with_capacity(self.handles.len());
        for _ in 0..self.handles.len() {
            let ack = self
                .acks
                .recv()
                .map_err(|_| CtrlError::Worker(format!("workers exited before acknowledging {cmd:?}")))?;
            acks.push(ack);
        }
        let position = |device: &str| self.handles.iter().position(|(name, _)| name == device);
        acks.sort_by_key(|ack| position(&ack.device));
        if let Some(err) = acks.iter().find_map(|ack| ack.outcome.clone().err()) {
            return Err(err.into());
        }
        Ok(acks)
    }

    /// Stops every worker and joins its thread.
    pub fn close(mut self) -> Result<()> {
        self.chan.send(WorkerCmd::Close);
        for (name, handle) in std::mem::take(&mut self.handles) {
            handle
                .join()
                .map_err(|_| CtrlError::Worker(format!("worker {name} panicked")))??;
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.chan.send(WorkerCmd::Close);
        }
    }
}
