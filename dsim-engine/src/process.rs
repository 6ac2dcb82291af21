//! Processes: shared state and the receive loop.
//!
//! [`ProcessShared`] is the part of a process visible to the network, the
//! transport tasks and the controller. [`ProcessRunner`] owns the algorithm
//! value and runs on the process's dedicated OS thread.

use std::{
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
};

use dsim_common::{wire, ChannelId, Message, ProcessId};
use log::{debug, info, trace, warn};
use tokio::{sync::Notify, task::JoinHandle as TaskHandle};

use crate::{
    algorithm::{Action, Algorithm, ProcessContext},
    breakpoint::{Breakpoint, BreakpointHit, BreakpointTarget, EvaluationMode, NetworkInfo, ProcessInfo},
    channel::Channel,
    clock::LogicalClock,
    error::{Result, SimError},
    events::{EventKey, EventTables, TargetSelection, TriggerPoint},
    observer::Observer,
    queue::MessageQueue,
    runlog::RunLog,
    signal::ReleaseSignal,
    termination::{TerminationProtocol, TerminationStatus, TerminationTrigger},
    topology::ProcessSpec,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Execution units whose liveness the network monitor polls.
#[derive(Debug, Default)]
struct TaskLedger {
    thread: Option<JoinHandle<()>>,
    listener: Option<TaskHandle<()>>,
    readers: Vec<TaskHandle<()>>,
}

impl TaskLedger {
    fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
            || self.listener.as_ref().is_some_and(|t| !t.is_finished())
            || self.readers.iter().any(|t| !t.is_finished())
    }
}

#[derive(Debug)]
pub struct ProcessShared {
    id: ProcessId,
    name: String,
    initiator: bool,
    round: AtomicI64,
    receive_port: AtomicU16,
    queue: MessageQueue,
    incoming: Vec<Arc<Channel>>,
    outgoing: Vec<Arc<Channel>>,
    termination: TerminationProtocol,
    clock: LogicalClock,
    breakpoint: Breakpoint,
    message_breakpoint: Breakpoint,
    activation: ReleaseSignal,
    breakpoint_release: ReleaseSignal,
    held: Mutex<Vec<BreakpointHit>>,
    pending_replay: Mutex<Vec<(ProcessId, Message)>>,
    tasks: Mutex<TaskLedger>,
    listener: Mutex<Option<TcpListener>>,
    listener_stop: Notify,
    stopped: AtomicBool,
}

impl ProcessShared {
    #[must_use]
    pub fn new(spec: &ProcessSpec, incoming: Vec<Arc<Channel>>, outgoing: Vec<Arc<Channel>>) -> Self {
        Self {
            id: spec.id,
            name: spec.name.clone(),
            initiator: spec.initiator,
            round: AtomicI64::new(0),
            receive_port: AtomicU16::new(spec.receive_port),
            queue: MessageQueue::new(),
            incoming,
            outgoing,
            termination: TerminationProtocol::new(spec.id),
            clock: LogicalClock::new(),
            breakpoint: Breakpoint::new(BreakpointTarget::Process(spec.id)),
            message_breakpoint: Breakpoint::new(BreakpointTarget::Message(spec.id)),
            activation: ReleaseSignal::new(),
            breakpoint_release: ReleaseSignal::new(),
            held: Mutex::new(Vec::new()),
            pending_replay: Mutex::new(Vec::new()),
            tasks: Mutex::new(TaskLedger::default()),
            listener: Mutex::new(None),
            listener_stop: Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ProcessId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_initiator(&self) -> bool {
        self.initiator
    }

    #[must_use]
    pub fn round(&self) -> i64 {
        self.round.load(Ordering::Acquire)
    }

    pub fn set_round(&self, round: i64) {
        self.round.store(round, Ordering::Release);
    }

    #[must_use]
    pub fn receive_port(&self) -> u16 {
        self.receive_port.load(Ordering::Acquire)
    }

    pub fn set_receive_port(&self, port: u16) {
        self.receive_port.store(port, Ordering::Release);
    }

    #[must_use]
    pub const fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    #[must_use]
    pub fn incoming(&self) -> &[Arc<Channel>] {
        &self.incoming
    }

    #[must_use]
    pub fn outgoing(&self) -> &[Arc<Channel>] {
        &self.outgoing
    }

    #[must_use]
    pub fn incoming_channel(&self, id: ChannelId) -> Option<&Arc<Channel>> {
        self.incoming.iter().find(|c| c.id() == id)
    }

    /// Outgoing channels ending at `dest`.
    #[must_use]
    pub fn outgoing_to(&self, dest: ProcessId) -> Vec<Arc<Channel>> {
        self.outgoing
            .iter()
            .filter(|c| c.dest() == dest)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn neighbours(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self
            .outgoing
            .iter()
            .filter(|c| !c.is_self())
            .map(|c| c.dest())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[must_use]
    pub fn inbound_neighbours(&self) -> Vec<ProcessId> {
        let mut ids: Vec<ProcessId> = self
            .incoming
            .iter()
            .filter(|c| !c.is_self())
            .map(|c| c.source())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[must_use]
    pub fn termination_status(&self) -> TerminationStatus {
        self.termination.status()
    }

    #[must_use]
    pub const fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    #[must_use]
    pub const fn breakpoint(&self) -> &Breakpoint {
        &self.breakpoint
    }

    #[must_use]
    pub const fn message_breakpoint(&self) -> &Breakpoint {
        &self.message_breakpoint
    }

    #[must_use]
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id,
            name: self.name.clone(),
            initiator: self.initiator,
            round: self.round(),
            termination_status: self.termination_status(),
            queue_len: self.queue.len(),
        }
    }

    pub fn release_activation(&self) {
        self.activation.release();
    }

    pub fn release_breakpoint(&self) {
        self.breakpoint_release.release();
    }

    /// Breakpoints the process is currently held on.
    #[must_use]
    pub fn held_breakpoints(&self) -> Vec<BreakpointHit> {
        lock(&self.held).clone()
    }

    fn set_held(&self, hits: Vec<BreakpointHit>) {
        *lock(&self.held) = hits;
    }

    /// Queues an outbound message to be sent on activation instead of running
    /// the initiation logic.
    pub fn queue_replay(&self, dest: ProcessId, message: Message) {
        lock(&self.pending_replay).push((dest, message));
    }

    #[must_use]
    pub fn has_pending_replay(&self) -> bool {
        !lock(&self.pending_replay).is_empty()
    }

    fn take_pending_replay(&self) -> Vec<(ProcessId, Message)> {
        std::mem::take(&mut *lock(&self.pending_replay))
    }

    /// Runs the NotTerminated step of the termination protocol.
    pub fn request_termination(&self) -> Result<()> {
        debug!("p{}: termination requested", self.id);
        self.termination
            .step(
                TerminationTrigger::Request,
                &self.incoming,
                &self.outgoing,
                &self.clock,
            )
            .map(|_| ())
    }

    fn receive_terminate(&self, channel: ChannelId) -> Result<bool> {
        self.termination.step(
            TerminationTrigger::Received(channel),
            &self.incoming,
            &self.outgoing,
            &self.clock,
        )
    }

    pub fn stash_listener(&self, listener: TcpListener) {
        *lock(&self.listener) = Some(listener);
    }

    #[must_use]
    pub fn take_listener(&self) -> Option<TcpListener> {
        lock(&self.listener).take()
    }

    #[must_use]
    pub const fn listener_stop(&self) -> &Notify {
        &self.listener_stop
    }

    pub fn track_thread(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).thread = Some(handle);
    }

    pub fn track_listener(&self, handle: TaskHandle<()>) {
        lock(&self.tasks).listener = Some(handle);
    }

    pub fn track_reader(&self, handle: TaskHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.readers.retain(|t| !t.is_finished());
        tasks.readers.push(handle);
    }

    /// True while the process thread, the listener or any reader is running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        lock(&self.tasks).is_alive()
    }

    /// Releases every wait point and asks the listener to stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.queue.close();
        self.activation.release();
        self.breakpoint_release.release();
        self.listener_stop.notify_one();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Waits for the process thread to exit.
    pub fn join(&self) {
        let handle = lock(&self.tasks).thread.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("p{}: process thread panicked", self.id);
            }
        }
    }

    /// Closes every outgoing link once the receive loop is done.
    fn finish(&self) {
        for channel in &self.outgoing {
            channel.close();
        }
        self.listener_stop.notify_one();
    }
}

/// Receive loop and send path of one process.
pub(crate) struct ProcessRunner {
    shared: Arc<ProcessShared>,
    algorithm: Box<dyn Algorithm>,
    events: Arc<EventTables>,
    network: NetworkInfo,
    network_breakpoint: Arc<Breakpoint>,
    observer: Arc<dyn Observer>,
    run: Arc<RunLog>,
}

impl ProcessRunner {
    pub(crate) fn new(
        shared: Arc<ProcessShared>,
        algorithm: Box<dyn Algorithm>,
        events: Arc<EventTables>,
        network: NetworkInfo,
        network_breakpoint: Arc<Breakpoint>,
        observer: Arc<dyn Observer>,
        run: Arc<RunLog>,
    ) -> Self {
        Self {
            shared,
            algorithm,
            events,
            network,
            network_breakpoint,
            observer,
            run,
        }
    }

    /// Runs initiation (or replay), then the receive loop until the process
    /// terminates or is stopped.
    ///
    /// Breakpoints are evaluated only on a real head. The empty sentinel that
    /// `take_next` returns when the processing condition rejects the head goes
    /// straight back to waiting and never counts as a dequeue.
    pub(crate) fn run(mut self) {
        let id = self.shared.id();
        info!("[run {}] p{id}: started", self.run.run());

        let replay = self.shared.take_pending_replay();
        if !replay.is_empty() {
            info!("[run {}] p{id}: replaying {} message(s)", self.run.run(), replay.len());
            for (dest, message) in replay {
                self.send(dest, message, false);
            }
        } else if self.shared.is_initiator() {
            debug!("[run {}] p{id}: waiting for activation", self.run.run());
            self.shared.activation.wait();
            if !self.shared.is_stopped() {
                let (result, actions) = self.invoke(|alg, ctx| alg.run_algorithm(ctx));
                if let Err(e) = result {
                    self.report(&e);
                }
                self.perform(actions, true);
            }
        }

        while !self.shared.is_stopped() {
            let head = self.shared.queue.take_next(self.algorithm.as_mut());
            if head.is_empty() {
                continue;
            }

            self.hold_on_breakpoints(&head);
            if self.shared.is_stopped() {
                break;
            }

            let Some(message) = self.shared.queue.remove_first() else {
                continue;
            };
            self.shared.clock.merge(message.logical_clock());

            if message.is_terminate() {
                if self.handle_terminate(&message) {
                    break;
                }
                continue;
            }

            let other_end = message.source_process().unwrap_or(id);
            self.fire(TriggerPoint::BeforeReceive, &message, other_end);
            let (result, actions) = self.invoke(|alg, ctx| alg.receive_handling(ctx, &message));
            if let Err(e) = result {
                self.report(&e);
            }
            self.perform(actions, true);
            self.fire(TriggerPoint::AfterReceive, &message, other_end);

            let step = self.run.record_step();
            trace!("[run {}] p{id}: step {step} handled {message}", self.run.run());
            self.observer.step_finished(id);
        }

        self.shared.finish();
        info!(
            "[run {}] p{id}: stopped ({})",
            self.run.run(),
            self.shared.termination_status()
        );
    }

    /// Returns true once the protocol has finished.
    fn handle_terminate(&self, message: &Message) -> bool {
        let Some(channel) = message.arrived_on else {
            self.report(&SimError::protocol(
                "Terminate without an arrival channel",
                Some(self.shared.id()),
            ));
            return false;
        };
        match self.shared.receive_terminate(channel) {
            Ok(finished) => finished,
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    fn invoke<R>(
        &mut self,
        f: impl FnOnce(&mut dyn Algorithm, &mut ProcessContext<'_>) -> R,
    ) -> (R, Vec<Action>) {
        let mut ctx = ProcessContext::new(&self.shared, self.observer.as_ref());
        let out = f(self.algorithm.as_mut(), &mut ctx);
        (out, ctx.into_actions())
    }

    fn perform(&mut self, actions: Vec<Action>, events: bool) {
        for action in actions {
            match action {
                Action::Send {
                    dest,
                    message,
                    events: own,
                } => self.send(dest, message, events && own),
                Action::SendToTargets {
                    message,
                    targets,
                    events: own,
                } => self.send_to_targets(message, &targets, events && own),
                Action::Terminate => {
                    if let Err(e) = self.shared.request_termination() {
                        self.report(&e);
                    }
                }
            }
        }
    }

    fn report(&self, error: &SimError) {
        warn!("[run {}] p{}: {error}", self.run.run(), self.shared.id());
        self.observer.protocol_error(self.shared.id(), error);
    }

    fn send_to_targets(&mut self, message: Message, targets: &TargetSelection, events: bool) {
        let id = self.shared.id();
        let resolved = targets.resolve(&self.shared.neighbours(), id);
        if resolved.is_empty() {
            debug!("[run {}] p{id}: no target selected for {message}", self.run.run());
        }
        for dest in resolved {
            self.send(dest, message.clone(), events);
        }
    }

    fn send(&mut self, dest: ProcessId, message: Message, events: bool) {
        let id = self.shared.id();
        let terminate = message.is_terminate();
        let channels = self.shared.outgoing_to(dest);

        if channels.is_empty() {
            self.report(&SimError::protocol(
                format!("cannot send {} to p{dest}: no outgoing channel", message.message_type),
                Some(id),
            ));
            return;
        }
        if dest == id && !terminate {
            self.report(&SimError::protocol(
                format!("self-channel only carries Terminate, dropped {}", message.message_type),
                Some(id),
            ));
            return;
        }
        if let Err(e) = wire::validate(&message) {
            self.report(&SimError::from(e));
            return;
        }

        // Terminate never re-enters algorithm code
        let events = events && !terminate;
        for channel in channels {
            let mut message = message.clone();
            message.header.apply_route(channel.route());
            if message.header.round.is_none() {
                message.header.round = Some(self.shared.round());
            }
            message.position_in_queue = None;
            message.arrived_on = None;

            if events {
                self.fire(TriggerPoint::BeforeSend, &message, dest);
            }
            if !terminate {
                let ((), actions) =
                    self.invoke(|alg, ctx| alg.before_send_operation(ctx, &mut message));
                self.perform(actions, false);
            }

            // The hook may have written a field the wire cannot carry
            if let Err(e) = wire::validate(&message) {
                self.report(&SimError::from(e));
                continue;
            }
            message.header.logical_clock = Some(self.shared.clock.tick());
            if let Err(e) = channel.transmit(message.clone()) {
                warn!("[run {}] p{id}: {e}", self.run.run());
                continue;
            }
            self.run.record_send();
            trace!("[run {}] p{id}: sent {message}", self.run.run());

            if !terminate {
                let ((), actions) = self.invoke(|alg, ctx| alg.after_send_operation(ctx, &message));
                self.perform(actions, false);
            }
            if events {
                self.fire(TriggerPoint::AfterSend, &message, dest);
            }
        }
    }

    fn fire(&mut self, point: TriggerPoint, message: &Message, other_end: ProcessId) {
        let events = Arc::clone(&self.events);
        let key = EventKey {
            process: self.shared.id(),
            point,
            round: self.shared.round(),
            message_type: message.message_type.clone(),
            other_end,
        };

        for template in events.base_events(&key) {
            let targets = template
                .targets
                .resolve(&self.shared.neighbours(), self.shared.id());
            for target in targets {
                let (triggered, actions) =
                    self.invoke(|alg, ctx| alg.build_message(ctx, template, target));
                self.perform(actions, false);
                debug!(
                    "[run {}] p{}: {point} sends {triggered} to p{target}",
                    self.run.run(),
                    self.shared.id()
                );
                self.send(target, triggered, false);
            }
        }

        for callback in events.internal_events(&key) {
            debug!(
                "[run {}] p{}: {point} runs internal event {callback}",
                self.run.run(),
                self.shared.id()
            );
            let ((), actions) = self.invoke(|alg, ctx| alg.internal_event(ctx, callback, message));
            self.perform(actions, false);
        }
    }

    fn breakpoint_hits(&self, message: &Message) -> Vec<BreakpointHit> {
        let process = self.shared.info();
        let channel = message
            .arrived_on
            .and_then(|id| self.shared.incoming_channel(id));
        let channel_info = channel.map(|c| c.info());
        let candidates = [
            Some(self.network_breakpoint.as_ref()),
            Some(self.shared.breakpoint()),
            channel.map(|c| c.breakpoint()),
            Some(self.shared.message_breakpoint()),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter_map(|bp| {
                bp.check(
                    EvaluationMode::Running,
                    &self.network,
                    &process,
                    channel_info.as_ref(),
                    message,
                )
            })
            .collect()
    }

    /// Holds the process while any breakpoint evaluates true.
    fn hold_on_breakpoints(&self, message: &Message) {
        let id = self.shared.id();
        loop {
            let hits = self.breakpoint_hits(message);
            if hits.is_empty() || self.shared.is_stopped() {
                break;
            }
            info!(
                "[run {}] p{id}: held by {} breakpoint(s) on {message}",
                self.run.run(),
                hits.len()
            );
            // Only a release issued after `held` is published may end this hold
            self.shared.breakpoint_release.reset();
            self.shared.set_held(hits.clone());
            self.observer.process_awaiting_breakpoint(id, &hits);
            self.shared.breakpoint_release.wait();
            self.shared.set_held(Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: ProcessId) -> ProcessSpec {
        ProcessSpec {
            id,
            name: format!("p{id}"),
            initiator: id == 0,
            receive_port: 0,
        }
    }

    #[test]
    fn test_neighbours_exclude_self_channel() {
        let outgoing = vec![
            Arc::new(Channel::new(0, 0, 0)),
            Arc::new(Channel::new(1, 0, 2)),
            Arc::new(Channel::new(2, 0, 1)),
        ];
        let incoming = vec![
            Arc::clone(&outgoing[0]),
            Arc::new(Channel::new(3, 1, 0)),
        ];
        let shared = ProcessShared::new(&spec(0), incoming, outgoing);
        assert_eq!(shared.neighbours(), vec![1, 2]);
        assert_eq!(shared.inbound_neighbours(), vec![1]);
        assert_eq!(shared.outgoing_to(0).len(), 1);
        assert!(shared.outgoing_to(7).is_empty());
        assert_eq!(shared.incoming_channel(3).map(|c| c.source()), Some(1));
    }

    #[test]
    fn test_replay_is_taken_once() {
        let shared = ProcessShared::new(&spec(1), Vec::new(), Vec::new());
        assert!(!shared.has_pending_replay());
        shared.queue_replay(0, Message::new(dsim_common::MessageType::Forwarded));
        assert!(shared.has_pending_replay());
        assert_eq!(shared.take_pending_replay().len(), 1);
        assert!(shared.take_pending_replay().is_empty());
    }

    struct Idle;

    impl crate::queue::QueueDiscipline for Idle {}

    impl Algorithm for Idle {
        fn run_algorithm(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<()> {
            Ok(())
        }

        fn receive_handling(&mut self, _ctx: &mut ProcessContext<'_>, _message: &Message) -> Result<()> {
            Ok(())
        }
    }

    fn runner(shared: &Arc<ProcessShared>) -> ProcessRunner {
        ProcessRunner::new(
            Arc::clone(shared),
            Box::new(Idle),
            Arc::new(EventTables::new()),
            NetworkInfo {
                directed: false,
                centralized: true,
                process_count: 1,
                channel_count: 1,
            },
            Arc::new(Breakpoint::new(BreakpointTarget::Network)),
            Arc::new(crate::observer::LogObserver),
            Arc::new(RunLog::new(1)),
        )
    }

    #[test]
    fn test_leftover_release_does_not_end_next_hold() {
        use std::{thread, time::Duration};

        let shared = Arc::new(ProcessShared::new(&spec(0), Vec::new(), Vec::new()));
        let runner = runner(&shared);
        let holding = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&holding);
        shared
            .breakpoint()
            .set_condition("hold", move |_| flag.load(Ordering::Acquire));

        // Left behind by a controller that released twice
        shared.release_breakpoint();

        let message = Message::new(dsim_common::MessageType::Forwarded).with_round(1);
        let handle = thread::spawn(move || {
            runner.hold_on_breakpoints(&message);
            runner
        });

        thread::sleep(Duration::from_millis(150));
        assert!(!handle.is_finished());
        assert_eq!(shared.held_breakpoints().len(), 1);

        holding.store(false, Ordering::Release);
        shared.release_breakpoint();
        handle.join().unwrap();
        assert!(shared.held_breakpoints().is_empty());
    }

    #[test]
    fn test_unencodable_messages_are_not_transmitted() {
        use dsim_common::MessageType;
        use tokio::sync::mpsc;

        let channel = Arc::new(Channel::new(0, 0, 1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.attach(tx);
        let shared = Arc::new(ProcessShared::new(&spec(0), Vec::new(), vec![channel]));
        let mut runner = runner(&shared);

        runner.send(1, Message::new(MessageType::Algorithm("Terminate".into())), true);
        runner.send(1, Message::new(MessageType::Forwarded).with_field("w", f64::NAN), true);
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.run.messages_sent(), 0);

        runner.send(1, Message::new(MessageType::Algorithm("Probe".into())), true);
        let sent = rx.try_recv().unwrap();
        assert_eq!(sent.message_type, MessageType::Algorithm("Probe".into()));
        assert_eq!(sent.dest_process(), Some(1));
        assert_eq!(runner.run.messages_sent(), 1);
    }

    #[test]
    fn test_not_alive_before_activation_and_stop_closes_queue() {
        let shared = ProcessShared::new(&spec(0), Vec::new(), Vec::new());
        assert!(!shared.is_alive());
        shared.stop();
        assert!(shared.is_stopped());
        assert!(shared.queue().is_closed());
    }
}
