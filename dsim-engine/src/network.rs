//! The network: owner of every process and channel of a simulation.
//!
//! Lifecycle: [`Network::new`] takes a topology that passed the check phase,
//! [`instantiate`](Network::instantiate) binds the process listeners and assigns
//! ports, [`activate`](Network::activate) starts the transport, the process
//! threads and the liveness monitor. The controller then releases initiators,
//! holds and releases breakpoints, and waits for the run to finish.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use dsim::TopologyConfig;
use dsim_common::{constants::DSIM_MONITOR_INTERVAL_MS, ChannelId, Message, ProcessId};
use log::{debug, info, warn};

use crate::{
    algorithm::{AlgorithmFactory, AlgorithmRegistry, Params},
    breakpoint::{Breakpoint, BreakpointHit, BreakpointTarget, ChannelInfo, NetworkInfo, ProcessInfo},
    channel::Channel,
    error::{Result, SimError},
    events::EventTables,
    observer::Observer,
    process::{ProcessRunner, ProcessShared},
    runlog::RunLog,
    termination::TerminationStatus,
    topology::{Topology, TopologyIssue},
    transport::{self, Transport},
};

/// Runtime knobs of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Interval between two liveness polls of the monitor.
    pub monitor_interval: Duration,
    /// Worker threads of the transport runtime.
    pub worker_threads: usize,
    /// Time given to transport tasks to finish at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(DSIM_MONITOR_INTERVAL_MS),
            worker_threads: num_cpus::get(),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl NetworkOptions {
    #[must_use]
    pub fn from_config(config: &TopologyConfig) -> Self {
        Self {
            monitor_interval: Duration::from_millis(config.monitor_interval_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Built,
    Instantiated,
    Running,
    Stopped,
}

/// Set once by the monitor when every process is dead.
#[derive(Debug, Default)]
struct Completion {
    finished: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn finish(&self) {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        while !*finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            finished = self
                .cond
                .wait_timeout(finished, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

pub struct Network {
    topology: Topology,
    info: NetworkInfo,
    factory: Arc<dyn AlgorithmFactory>,
    params: Params,
    events: EventTables,
    observer: Arc<dyn Observer>,
    options: NetworkOptions,
    breakpoint: Arc<Breakpoint>,
    processes: Vec<Arc<ProcessShared>>,
    channels: Vec<Arc<Channel>>,
    lifecycle: Lifecycle,
    transport: Option<Transport>,
    run: Option<Arc<RunLog>>,
    completion: Arc<Completion>,
    monitor: Option<JoinHandle<()>>,
    monitor_stop: Arc<AtomicBool>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("algorithm", &self.factory.name())
            .field("info", &self.info)
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

impl Network {
    /// Check-phase issues of `topology`, generic ones first.
    #[must_use]
    pub fn check(topology: &Topology, factory: &dyn AlgorithmFactory) -> Vec<TopologyIssue> {
        let mut issues = topology.check();
        issues.extend(factory.check_topology(topology));
        issues
    }

    /// Builds a network from a topology that passes the check phase.
    pub fn new(
        topology: Topology,
        factory: Arc<dyn AlgorithmFactory>,
        params: Params,
        observer: Arc<dyn Observer>,
        options: NetworkOptions,
    ) -> Result<Self> {
        let issues = Self::check(&topology, factory.as_ref());
        if !issues.is_empty() {
            let listed: Vec<String> = issues.iter().map(ToString::to_string).collect();
            return Err(SimError::topology(format!(
                "{} unresolved issue(s): {}",
                issues.len(),
                listed.join("; ")
            )));
        }

        let channels: Vec<Arc<Channel>> = topology
            .channels()
            .iter()
            .map(|c| Arc::new(Channel::new(c.id, c.source, c.dest)))
            .collect();
        let processes = topology
            .processes()
            .iter()
            .map(|spec| {
                let incoming = channels.iter().filter(|c| c.dest() == spec.id).cloned().collect();
                let outgoing = channels.iter().filter(|c| c.source() == spec.id).cloned().collect();
                Arc::new(ProcessShared::new(spec, incoming, outgoing))
            })
            .collect();
        let info = NetworkInfo {
            directed: topology.directed(),
            centralized: topology.centralized(),
            process_count: topology.processes().len(),
            channel_count: topology.channels().len(),
        };
        let events = factory.event_tables(&topology, &params);

        info!(
            "Built {} network with {} processes and {} channels",
            factory.name(),
            info.process_count,
            info.channel_count
        );
        Ok(Self {
            topology,
            info,
            factory,
            params,
            events,
            observer,
            options,
            breakpoint: Arc::new(Breakpoint::new(BreakpointTarget::Network)),
            processes,
            channels,
            lifecycle: Lifecycle::Built,
            transport: None,
            run: None,
            completion: Arc::new(Completion::default()),
            monitor: None,
            monitor_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Builds a network from a configuration, resolving its algorithm in
    /// `registry`.
    pub fn from_config(
        config: &TopologyConfig,
        registry: &AlgorithmRegistry,
        observer: Arc<dyn Observer>,
    ) -> Result<Self> {
        let topology = Topology::from_config(config)?;
        let factory = registry.resolve(&config.algorithm)?;
        Self::new(
            topology,
            factory,
            config.params.clone(),
            observer,
            NetworkOptions::from_config(config),
        )
    }

    #[must_use]
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub const fn info(&self) -> &NetworkInfo {
        &self.info
    }

    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.factory.name()
    }

    #[must_use]
    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.iter().map(|p| p.id()).collect()
    }

    /// Replaces the event tables. Only allowed before activation.
    pub fn set_event_tables(&mut self, events: EventTables) -> Result<()> {
        self.require_not_started("set event tables")?;
        self.events = events;
        Ok(())
    }

    fn require_not_started(&self, what: &str) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Built | Lifecycle::Instantiated => Ok(()),
            state => Err(SimError::invalid_state(format!("cannot {what} while {state:?}"))),
        }
    }

    fn require_running(&self, what: &str) -> Result<()> {
        if self.lifecycle == Lifecycle::Running {
            Ok(())
        } else {
            Err(SimError::invalid_state(format!(
                "cannot {what} while {:?}",
                self.lifecycle
            )))
        }
    }

    fn process(&self, id: ProcessId) -> Result<&Arc<ProcessShared>> {
        self.processes
            .iter()
            .find(|p| p.id() == id)
            .ok_or(SimError::unknown_process(id))
    }

    fn channel(&self, id: ChannelId) -> Result<&Arc<Channel>> {
        self.channels
            .iter()
            .find(|c| c.id() == id)
            .ok_or(SimError::unknown_channel(id))
    }

    /// Binds every process listener and assigns the channel ports.
    pub fn instantiate(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Built {
            return Err(SimError::invalid_state(format!(
                "cannot instantiate while {:?}",
                self.lifecycle
            )));
        }
        for process in &self.processes {
            let listener = transport::create_listener(process.receive_port())?;
            let port = listener.local_addr()?.port();
            process.set_receive_port(port);
            process.stash_listener(listener);
            debug!("p{}: receive port {port}", process.id());
        }
        for channel in &self.channels {
            let port = self.process(channel.dest())?.receive_port();
            channel.set_dest_port(port);
        }
        self.lifecycle = Lifecycle::Instantiated;
        Ok(())
    }

    /// Starts the simulation.
    ///
    /// Initiators stay blocked until [`release_activation`](Self::release_activation).
    pub fn activate(&mut self) -> Result<()> {
        if self.lifecycle == Lifecycle::Built {
            self.instantiate()?;
        }
        if self.lifecycle != Lifecycle::Instantiated {
            return Err(SimError::invalid_state(format!(
                "cannot activate while {:?}",
                self.lifecycle
            )));
        }

        // Create every algorithm first so a factory error starts nothing
        let mut algorithms = Vec::with_capacity(self.processes.len());
        for spec in self.topology.processes() {
            algorithms.push(self.factory.create(spec, &self.params)?);
        }

        let run_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let run = Arc::new(RunLog::new(run_id));
        let transport = Transport::new(self.options.worker_threads)?;

        for process in &self.processes {
            let listener = process.take_listener().ok_or_else(|| {
                SimError::internal(format!("p{} has no bound listener", process.id()))
            })?;
            transport.start_listening(listener, Arc::clone(process));
        }
        for channel in &self.channels {
            transport.start_sending(Arc::clone(channel));
        }
        self.transport = Some(transport);

        info!(
            "[run {run_id}] Activating {} with {} processes",
            self.factory.name(),
            self.processes.len()
        );
        self.observer.run_started();

        let events = Arc::new(self.events.clone());
        for (process, algorithm) in self.processes.iter().zip(algorithms) {
            let runner = ProcessRunner::new(
                Arc::clone(process),
                algorithm,
                Arc::clone(&events),
                self.info,
                Arc::clone(&self.breakpoint),
                Arc::clone(&self.observer),
                Arc::clone(&run),
            );
            let handle = thread::Builder::new()
                .name(format!("dsim-p{}", process.id()))
                .spawn(move || runner.run())?;
            process.track_thread(handle);
        }

        self.monitor = Some(self.spawn_monitor(Arc::clone(&run))?);
        self.run = Some(run);
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn spawn_monitor(&self, run: Arc<RunLog>) -> Result<JoinHandle<()>> {
        let processes = self.processes.clone();
        let observer = Arc::clone(&self.observer);
        let completion = Arc::clone(&self.completion);
        let stop = Arc::clone(&self.monitor_stop);
        let interval = self.options.monitor_interval;

        let handle = thread::Builder::new()
            .name("dsim-monitor".to_owned())
            .spawn(move || loop {
                thread::sleep(interval);
                if stop.load(Ordering::Acquire) {
                    return;
                }
                if processes.iter().all(|p| !p.is_alive()) {
                    info!(
                        "[run {}] All processes stopped after {:?}: {} steps, {} messages sent",
                        run.run(),
                        run.elapsed(),
                        run.steps(),
                        run.messages_sent()
                    );
                    observer.run_finished();
                    completion.finish();
                    return;
                }
            })?;
        Ok(handle)
    }

    /// Releases the activation wait of an initiator.
    pub fn release_activation(&self, id: ProcessId) -> Result<()> {
        let process = self.process(id)?;
        if !process.is_initiator() {
            return Err(SimError::invalid_state(format!("p{id} is not an initiator")));
        }
        process.release_activation();
        Ok(())
    }

    /// Releases every initiator; returns how many were released.
    pub fn release_all_initiators(&self) -> usize {
        let initiators: Vec<_> = self.processes.iter().filter(|p| p.is_initiator()).collect();
        for process in &initiators {
            process.release_activation();
        }
        initiators.len()
    }

    /// Lets a process held on breakpoints re-evaluate them.
    pub fn release_breakpoint(&self, id: ProcessId) -> Result<()> {
        let process = self.process(id)?;
        if process.held_breakpoints().is_empty() {
            return Err(SimError::invalid_state(format!("p{id} is not held")));
        }
        process.release_breakpoint();
        Ok(())
    }

    /// Starts the termination protocol of a process from the controller.
    pub fn terminate(&self, id: ProcessId) -> Result<()> {
        self.require_running("terminate")?;
        self.process(id)?.request_termination()
    }

    /// Queues a message a resuming process sends on activation instead of
    /// running its initiation logic.
    pub fn queue_replay(&self, id: ProcessId, dest: ProcessId, message: Message) -> Result<()> {
        self.require_not_started("queue replay")?;
        self.process(dest)?;
        self.process(id)?.queue_replay(dest, message);
        Ok(())
    }

    /// Makes a process re-run its queue hooks, e.g. after its processing
    /// condition changed without a new message arriving.
    pub fn wake(&self, id: ProcessId) -> Result<()> {
        self.process(id)?.queue().wake();
        Ok(())
    }

    #[must_use]
    pub fn breakpoint(&self) -> &Breakpoint {
        &self.breakpoint
    }

    pub fn process_breakpoint(&self, id: ProcessId) -> Result<&Breakpoint> {
        Ok(self.process(id)?.breakpoint())
    }

    pub fn message_breakpoint(&self, id: ProcessId) -> Result<&Breakpoint> {
        Ok(self.process(id)?.message_breakpoint())
    }

    pub fn channel_breakpoint(&self, id: ChannelId) -> Result<&Breakpoint> {
        Ok(self.channel(id)?.breakpoint())
    }

    pub fn held_breakpoints(&self, id: ProcessId) -> Result<Vec<BreakpointHit>> {
        Ok(self.process(id)?.held_breakpoints())
    }

    pub fn process_info(&self, id: ProcessId) -> Result<ProcessInfo> {
        Ok(self.process(id)?.info())
    }

    pub fn process_status(&self, id: ProcessId) -> Result<TerminationStatus> {
        Ok(self.process(id)?.termination_status())
    }

    pub fn process_round(&self, id: ProcessId) -> Result<i64> {
        Ok(self.process(id)?.round())
    }

    pub fn receive_port(&self, id: ProcessId) -> Result<u16> {
        Ok(self.process(id)?.receive_port())
    }

    pub fn queue_snapshot(&self, id: ProcessId) -> Result<Vec<Message>> {
        Ok(self.process(id)?.queue().snapshot())
    }

    pub fn is_alive(&self, id: ProcessId) -> Result<bool> {
        Ok(self.process(id)?.is_alive())
    }

    pub fn channel_info(&self, id: ChannelId) -> Result<ChannelInfo> {
        Ok(self.channel(id)?.info())
    }

    #[must_use]
    pub fn run_log(&self) -> Option<&Arc<RunLog>> {
        self.run.as_ref()
    }

    /// True once the monitor has seen every process dead.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    /// Waits up to `timeout` for the run to finish.
    #[must_use]
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.completion.wait(timeout)
    }

    /// Stops every process and the transport. Idempotent.
    pub fn shutdown(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            self.lifecycle = Lifecycle::Stopped;
            return;
        }
        debug!("Shutting down network");
        for process in &self.processes {
            process.stop();
        }
        for process in &self.processes {
            process.join();
        }
        self.monitor_stop.store(true, Ordering::Release);
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                warn!("Monitor thread panicked");
            }
        }
        for channel in &self.channels {
            channel.close();
        }
        if let Some(transport) = self.transport.take() {
            transport.shutdown(self.options.shutdown_timeout);
        }
        if let Some(run) = self.run.take() {
            info!(
                "[run {}] Network shut down: {} steps, {} messages sent",
                run.run(),
                run.steps(),
                run.messages_sent()
            );
        }
        self.lifecycle = Lifecycle::Stopped;
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{algorithms::PingPongFactory, observer::LogObserver};

    fn two_process_topology() -> Topology {
        let mut t = Topology::new(false, true);
        t.add_process(0).unwrap();
        t.add_process(1).unwrap();
        t.set_initiator(0, true).unwrap();
        t.connect(0, 1).unwrap();
        t.connect(1, 0).unwrap();
        t.connect(0, 0).unwrap();
        t.connect(1, 1).unwrap();
        t
    }

    fn build(topology: Topology) -> Result<Network> {
        Network::new(
            topology,
            Arc::new(PingPongFactory),
            Params::new(),
            Arc::new(LogObserver),
            NetworkOptions::default(),
        )
    }

    #[test]
    fn test_new_rejects_unchecked_topology() {
        let mut t = two_process_topology();
        t.remove_channel(3).unwrap();
        let err = build(t).unwrap_err();
        assert!(matches!(err, SimError::Topology { .. }));
        assert!(err.to_string().contains("self-channel"));
    }

    #[test]
    fn test_instantiate_assigns_ports_to_channels() {
        let mut network = build(two_process_topology()).unwrap();
        network.instantiate().unwrap();
        let port0 = network.receive_port(0).unwrap();
        let port1 = network.receive_port(1).unwrap();
        assert_ne!(port0, 0);
        assert_ne!(port0, port1);
        assert_eq!(network.channel(0).unwrap().dest_port(), port1);
        assert_eq!(network.channel(1).unwrap().dest_port(), port0);
        assert!(network.instantiate().is_err());
    }

    #[test]
    fn test_controls_validate_state() {
        let network = build(two_process_topology()).unwrap();
        assert!(network.terminate(0).is_err());
        assert!(network.release_activation(1).is_err());
        assert!(network.release_breakpoint(0).is_err());
        assert!(network.process_status(9).is_err());
        assert!(network.queue_replay(1, 0, Message::new(dsim_common::MessageType::Forwarded)).is_ok());
        assert!(!network.is_finished());
    }
}
