//! Cancellation and distributed read task exchange of a running query.
//!
//! [`QueryControl`] is shared between the connection thread, which reads packets
//! from the client, and the pipeline threads of the query. Pipeline threads ask the
//! initiator for work through it and block until the connection thread delivers the
//! answer, the query is cancelled, or the query ends.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::{
    engine::{EngineError, ReadTaskSource},
    protocol::{
        InitialRangesAnnouncement, ParallelReadRequest, ParallelReadResponse, Request, Response,
    },
    settings::CancelPolicy,
    telemetry::{ProfileCounters, events},
};

use super::{error::UnexpectedPacket, state::CancellationStatus, streaming::PacketSender};

const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Task,
    Ranges,
}

enum Reply {
    Task(Option<String>),
    Ranges(ParallelReadResponse),
}

#[derive(Default)]
struct ControlState {
    status: CancellationStatus,
    read_cancelled_at: Option<Instant>,
    awaiting: Option<Awaiting>,
    reply: Option<Reply>,
    closed: bool,
}

pub struct QueryControl {
    state: Mutex<ControlState>,
    answered: Condvar,
    /// One outstanding request at a time, across all pipeline threads.
    turn: Mutex<()>,
    sender: PacketSender,
    parallel_replicas: bool,
    profile: Arc<ProfileCounters>,
}

impl QueryControl {
    /// `parallel_replicas` tells whether the client understands the merge tree
    /// range packets.
    pub fn new(sender: PacketSender, parallel_replicas: bool, profile: Arc<ProfileCounters>) -> Self {
        Self {
            state: Mutex::new(ControlState::default()),
            answered: Condvar::new(),
            turn: Mutex::new(()),
            sender,
            parallel_replicas,
            profile,
        }
    }

    pub fn status(&self) -> CancellationStatus {
        self.state.lock().status
    }

    /// Handles a Cancel packet: the first one stops reading, any further one stops
    /// everything. Returns the new status.
    pub fn cancel(&self) -> CancellationStatus {
        let mut state = self.state.lock();
        state.status = match state.status {
            CancellationStatus::NotCancelled => {
                state.read_cancelled_at = Some(Instant::now());
                CancellationStatus::ReadCancelled
            }
            _ => CancellationStatus::FullyCancelled,
        };
        self.answered.notify_all();
        state.status
    }

    pub fn escalate_fully(&self) {
        self.state.lock().status = CancellationStatus::FullyCancelled;
        self.answered.notify_all();
    }

    /// Escalates a read-cancelled query whose grace period ran out.
    pub fn check_grace(&self, policy: &CancelPolicy) -> CancellationStatus {
        let mut state = self.state.lock();
        if state.status == CancellationStatus::ReadCancelled
            && state
                .read_cancelled_at
                .is_some_and(|at| policy.expired(at.elapsed()))
        {
            debug!("cancel grace period expired, cancelling the query fully");
            state.status = CancellationStatus::FullyCancelled;
            self.answered.notify_all();
        }
        state.status
    }

    /// Ends the exchange. Pending and future requests fail, and nothing more is
    /// sent to the client on behalf of the query.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.awaiting = None;
        self.answered.notify_all();
    }

    /// Hands a read task answer from the client to the waiting pipeline thread.
    pub fn deliver(&self, request: Request) -> Result<(), UnexpectedPacket> {
        let kind = request.kind();
        let mut state = self.state.lock();
        let reply = match (state.awaiting, request) {
            (Some(Awaiting::Task), Request::ReadTaskResponse(response)) => Reply::Task(response.task),
            (Some(Awaiting::Ranges), Request::MergeTreeReadTaskResponse(response)) => {
                Reply::Ranges(response)
            }
            _ => return Err(UnexpectedPacket::UnsolicitedReadTaskResponse(kind)),
        };
        state.awaiting = None;
        state.reply = Some(reply);
        self.answered.notify_all();
        Ok(())
    }

    /// Sends `packet` and waits for the matching answer. `None` means the query was
    /// cancelled before the answer arrived.
    fn exchange(&self, awaiting: Awaiting, packet: Response) -> Result<Option<Reply>, EngineError> {
        let _turn = self.turn.lock();
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::ReadTask("query has finished".to_string()));
        }
        if state.status != CancellationStatus::NotCancelled {
            return Ok(None);
        }

        state.reply = None;
        state.awaiting = Some(awaiting);
        self.sender
            .send(packet)
            .map_err(|e| EngineError::ReadTask(e.to_string()))?;

        loop {
            if let Some(reply) = state.reply.take() {
                return Ok(Some(reply));
            }
            if state.closed {
                return Err(EngineError::ReadTask("query has finished".to_string()));
            }
            if state.status != CancellationStatus::NotCancelled {
                return Ok(None);
            }
            self.answered.wait_for(&mut state, WAIT_SLICE);
        }
    }
}

impl ReadTaskSource for QueryControl {
    fn next_task(&self) -> Result<Option<String>, EngineError> {
        self.profile.increment(events::READ_TASK_REQUESTS, 1);
        match self.exchange(Awaiting::Task, Response::ReadTaskRequest)? {
            Some(Reply::Task(task)) => Ok(task),
            _ => Ok(None),
        }
    }

    fn announce_ranges(&self, announcement: InitialRangesAnnouncement) -> Result<(), EngineError> {
        if !self.parallel_replicas {
            return Err(EngineError::ReadTask(
                "client does not support parallel replicas".to_string(),
            ));
        }
        let state = self.state.lock();
        if state.closed {
            return Err(EngineError::ReadTask("query has finished".to_string()));
        }
        self.sender
            .send(Response::MergeTreeAllRangesAnnouncement(announcement))
            .map_err(|e| EngineError::ReadTask(e.to_string()))
    }

    fn request_ranges(
        &self,
        request: ParallelReadRequest,
    ) -> Result<Option<ParallelReadResponse>, EngineError> {
        if !self.parallel_replicas {
            return Err(EngineError::ReadTask(
                "client does not support parallel replicas".to_string(),
            ));
        }
        self.profile
            .increment(events::MERGE_TREE_READ_TASK_REQUESTS, 1);
        match self.exchange(Awaiting::Ranges, Response::MergeTreeReadTaskRequest(request))? {
            Some(Reply::Ranges(response)) => Ok(Some(response)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        thread,
    };

    use super::*;
    use crate::protocol::{CoordinationMode, Framing, ReadTaskResponse};

    struct Discard;

    impl Write for Discard {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn control(parallel_replicas: bool) -> Arc<QueryControl> {
        let sender = PacketSender::with_writer(Discard, Framing::Plain, || {}).unwrap();
        Arc::new(QueryControl::new(sender, parallel_replicas, Arc::default()))
    }

    fn task(name: &str) -> Request {
        Request::ReadTaskResponse(ReadTaskResponse {
            task: Some(name.to_string()),
        })
    }

    /// Delivers `reply` once a request is outstanding.
    fn answer_when_asked(control: &Arc<QueryControl>, reply: Request) -> thread::JoinHandle<()> {
        let control = Arc::clone(control);
        thread::spawn(move || {
            while control.deliver(reply.clone()).is_err() {
                thread::sleep(Duration::from_millis(5));
            }
        })
    }

    #[test]
    fn cancellation_only_escalates() {
        let control = control(false);

        assert_eq!(control.cancel(), CancellationStatus::ReadCancelled);
        assert_eq!(control.cancel(), CancellationStatus::FullyCancelled);
        assert_eq!(control.cancel(), CancellationStatus::FullyCancelled);
        assert_eq!(control.status(), CancellationStatus::FullyCancelled);
    }

    #[test]
    fn grace_period_escalates_read_cancel() {
        let control = control(false);
        let policy = CancelPolicy {
            grace_period: Some(Duration::from_millis(20)),
        };

        assert_eq!(control.check_grace(&policy), CancellationStatus::NotCancelled);
        control.cancel();
        assert_eq!(control.check_grace(&policy), CancellationStatus::ReadCancelled);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(control.check_grace(&policy), CancellationStatus::FullyCancelled);
        assert_eq!(
            control.check_grace(&CancelPolicy::default()),
            CancellationStatus::FullyCancelled
        );
    }

    #[test]
    fn unsolicited_answers_are_rejected() {
        let control = control(true);

        assert_eq!(
            control.deliver(task("a")),
            Err(UnexpectedPacket::UnsolicitedReadTaskResponse(
                crate::protocol::PacketKind::ReadTaskResponse
            ))
        );
    }

    #[test]
    fn task_is_delivered_to_the_waiting_reader() {
        let control = control(false);
        let answer = answer_when_asked(&control, task("part-1"));

        assert_eq!(control.next_task().unwrap(), Some("part-1".to_string()));
        answer.join().unwrap();
    }

    fn wait_until_asked(control: &QueryControl) {
        while control.state.lock().awaiting.is_none() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn mismatched_answer_is_rejected_while_waiting() {
        let control = control(true);
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.next_task())
        };
        wait_until_asked(&control);

        let ranges = Request::MergeTreeReadTaskResponse(ParallelReadResponse {
            finish: true,
            description: Vec::new(),
        });
        assert!(control.deliver(ranges).is_err());

        control.cancel();
        assert_eq!(waiter.join().unwrap().unwrap(), None);
    }

    #[test]
    fn close_fails_pending_and_future_requests() {
        let control = control(true);
        let waiter = {
            let control = Arc::clone(&control);
            thread::spawn(move || control.next_task())
        };
        wait_until_asked(&control);

        control.close();

        assert!(waiter.join().unwrap().is_err());
        assert!(control.next_task().is_err());
        assert!(
            control
                .request_ranges(ParallelReadRequest {
                    replica_num: 0,
                    mode: CoordinationMode::Default,
                    min_number_of_marks: 1,
                    description: Vec::new(),
                })
                .is_err()
        );
    }

    #[test]
    fn ranges_need_client_support() {
        let control = control(false);

        assert!(
            control
                .announce_ranges(InitialRangesAnnouncement {
                    replica_num: 0,
                    mode: CoordinationMode::Default,
                    description: Vec::new(),
                })
                .is_err()
        );
    }
}
