//! Startup ordering and the one-shot teardown of the loaded classifier.
//!
//! ```text
//!   Uninitialized ──load──▶ Loaded ──attach──▶ Attached ──open channel──▶ Running
//!         ▲                   │                                             │
//!         └── attach failed ──┘                signal / channel fault ──────┤
//!                                                                           ▼
//!                                                                      Terminated
//! ```
//!
//! Teardown releases the channel, then the attachment, then the program. Each
//! step runs even if the one before it failed, and the whole sequence runs at
//! most once: `Terminated` is absorbing.

use std::time::Duration;

use pingwall_common::PacketEvent;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    attach::{Attachment, LoadedProgram, Loader},
    consumer::EventChannel,
    error::{ChannelError, DatapathError},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Loaded,
    Attached,
    Running,
    Terminated,
}

type ChannelOf<L> = <<L as Loader>::Program as LoadedProgram>::Channel;

/// Sole owner of the loaded program, its attachment and the event channel.
pub struct Lifecycle<L: Loader> {
    loader: L,
    state: LifecycleState,
    program: Option<L::Program>,
    attachment: Option<Attachment>,
    channel: Option<ChannelOf<L>>,
    delivered: u64,
}

impl<L: Loader> Lifecycle<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            state: LifecycleState::Uninitialized,
            program: None,
            attachment: None,
            channel: None,
            delivered: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// Records handed to the consumer callback so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Loads the classifier, attaches it and opens the event channel.
    ///
    /// A failed attach releases the program and leaves the lifecycle in
    /// `Uninitialized`. A failed channel open runs the full teardown.
    pub fn start(&mut self, attachment: Attachment) -> Result<(), DatapathError> {
        if self.state != LifecycleState::Uninitialized {
            return Err(DatapathError::InvalidState(self.state));
        }

        let mut program = self.loader.load()?;
        self.state = LifecycleState::Loaded;

        if let Err(e) = program.attach(&attachment) {
            if let Err(destroy_err) = program.destroy() {
                warn!(error = %destroy_err, "failed to release program after attach failure");
            }
            self.state = LifecycleState::Uninitialized;
            return Err(e);
        }
        info!(
            iface = %attachment.iface,
            if_index = attachment.if_index,
            mode = %attachment.mode,
            "XDP program attached"
        );
        self.attachment = Some(attachment);
        let program = self.program.insert(program);
        self.state = LifecycleState::Attached;

        match program.open_channel() {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = LifecycleState::Running;
                Ok(())
            }
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    /// Polls the event channel until `shutdown` flips to `true` or the
    /// channel faults.
    ///
    /// The flag is checked before every poll and also interrupts a poll in
    /// progress. Returns immediately if the lifecycle is not running.
    pub async fn run<F>(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        poll_timeout: Duration,
        mut on_event: F,
    ) -> Result<(), ChannelError>
    where
        F: FnMut(PacketEvent),
    {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let Some(channel) = self.channel.as_mut() else {
                return Ok(());
            };

            let polled = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("shutdown signal source went away, stopping");
                        return Ok(());
                    }
                    continue;
                }
                polled = channel.poll(poll_timeout, &mut on_event) => polled,
            };

            match polled {
                Ok(handed_over) => self.delivered += handed_over as u64,
                Err(e) => {
                    error!(error = %e, "event channel failed, shutting down");
                    return Err(e);
                }
            }
        }
    }

    /// Releases everything `start` acquired. Safe to call any number of
    /// times and from any state.
    pub fn teardown(&mut self) {
        let previous = self.state;
        if previous == LifecycleState::Terminated {
            debug!("teardown already ran");
            return;
        }
        self.state = LifecycleState::Terminated;

        if self.channel.take().is_some() {
            debug!("event channel released");
        }

        if let Some(program) = self.program.as_mut() {
            match program.detach() {
                Ok(true) => {
                    if let Some(attachment) = &self.attachment {
                        info!(iface = %attachment.iface, "XDP program detached");
                    }
                }
                Ok(false) => debug!("XDP program was not attached"),
                Err(e) => warn!(error = %e, "failed to detach XDP program"),
            }
        }
        self.attachment = None;

        if let Some(program) = self.program.take() {
            if let Err(e) = program.destroy() {
                warn!(error = %e, "failed to release XDP program");
            }
        }

        if previous != LifecycleState::Uninitialized {
            debug!(delivered = self.delivered, "teardown complete");
        }
    }
}

impl<L: Loader> Drop for Lifecycle<L> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

    use super::*;
    use crate::attach::AttachMode;

    type Journal = Rc<RefCell<Vec<&'static str>>>;

    #[derive(Default)]
    struct Script {
        fail_attach: bool,
        fail_detach: bool,
        fail_channel: bool,
        polls: VecDeque<Result<Vec<PacketEvent>, ChannelError>>,
    }

    struct FakeLoader {
        journal: Journal,
        script: Option<Script>,
    }

    impl FakeLoader {
        fn new(script: Script) -> (Self, Journal) {
            let journal = Journal::default();
            let loader = Self {
                journal: journal.clone(),
                script: Some(script),
            };
            (loader, journal)
        }
    }

    impl Loader for FakeLoader {
        type Program = FakeProgram;

        fn load(&mut self) -> Result<FakeProgram, DatapathError> {
            self.journal.borrow_mut().push("load");
            Ok(FakeProgram {
                journal: self.journal.clone(),
                script: self.script.take().unwrap_or_default(),
                attached: false,
            })
        }
    }

    struct FakeProgram {
        journal: Journal,
        script: Script,
        attached: bool,
    }

    impl LoadedProgram for FakeProgram {
        type Channel = FakeChannel;

        fn attach(&mut self, attachment: &Attachment) -> Result<(), DatapathError> {
            self.journal.borrow_mut().push("attach");
            if self.script.fail_attach {
                return Err(DatapathError::Attach {
                    iface: attachment.iface.clone(),
                    if_index: attachment.if_index,
                    mode: attachment.mode,
                    source: "operation not supported".into(),
                });
            }
            self.attached = true;
            Ok(())
        }

        fn detach(&mut self) -> Result<bool, DatapathError> {
            if !self.attached {
                return Ok(false);
            }
            self.attached = false;
            self.journal.borrow_mut().push("detach");
            if self.script.fail_detach {
                return Err(DatapathError::Detach {
                    iface: "test0".into(),
                    if_index: 7,
                    source: "no such device".into(),
                });
            }
            Ok(true)
        }

        fn open_channel(&mut self) -> Result<FakeChannel, DatapathError> {
            self.journal.borrow_mut().push("open_channel");
            if self.script.fail_channel {
                return Err(DatapathError::Channel {
                    map: "EVENTS",
                    source: "map not found".into(),
                });
            }
            Ok(FakeChannel {
                journal: self.journal.clone(),
                polls: std::mem::take(&mut self.script.polls),
            })
        }

        fn destroy(self) -> Result<(), DatapathError> {
            self.journal.borrow_mut().push("destroy");
            Ok(())
        }
    }

    struct FakeChannel {
        journal: Journal,
        polls: VecDeque<Result<Vec<PacketEvent>, ChannelError>>,
    }

    impl EventChannel for FakeChannel {
        async fn poll(
            &mut self,
            timeout: Duration,
            on_event: &mut dyn FnMut(PacketEvent),
        ) -> Result<usize, ChannelError> {
            match self.polls.pop_front() {
                Some(Ok(events)) => {
                    let handed_over = events.len();
                    events.into_iter().for_each(&mut *on_event);
                    Ok(handed_over)
                }
                Some(Err(e)) => Err(e),
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(0)
                }
            }
        }
    }

    impl Drop for FakeChannel {
        fn drop(&mut self) {
            self.journal.borrow_mut().push("close_channel");
        }
    }

    fn attachment() -> Attachment {
        Attachment {
            iface: "test0".into(),
            if_index: 7,
            mode: AttachMode::FastPath,
        }
    }

    fn event(subtype: u8) -> PacketEvent {
        PacketEvent {
            source_address: [192, 168, 1, 10],
            destination_address: [10, 0, 0, 1],
            protocol: 1,
            subtype,
        }
    }

    fn fault() -> ChannelError {
        ChannelError::Fault(io::Error::new(io::ErrorKind::BrokenPipe, "mapping lost"))
    }

    #[test]
    fn start_walks_to_running() {
        let (loader, journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);

        lifecycle.start(attachment()).unwrap();

        assert_eq!(lifecycle.state(), LifecycleState::Running);
        assert_eq!(lifecycle.attachment(), Some(&attachment()));
        assert_eq!(*journal.borrow(), ["load", "attach", "open_channel"]);
    }

    #[test]
    fn attach_failure_releases_program_and_stays_uninitialized() {
        let (loader, journal) = FakeLoader::new(Script {
            fail_attach: true,
            ..Script::default()
        });
        let mut lifecycle = Lifecycle::new(loader);

        let err = lifecycle.start(attachment()).unwrap_err();

        assert!(matches!(
            err,
            DatapathError::Attach { mode: AttachMode::FastPath, .. }
        ));
        assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
        assert_eq!(lifecycle.attachment(), None);
        assert_eq!(*journal.borrow(), ["load", "attach", "destroy"]);

        lifecycle.teardown();
        assert_eq!(*journal.borrow(), ["load", "attach", "destroy"]);
    }

    #[test]
    fn channel_failure_tears_everything_down() {
        let (loader, journal) = FakeLoader::new(Script {
            fail_channel: true,
            ..Script::default()
        });
        let mut lifecycle = Lifecycle::new(loader);

        let err = lifecycle.start(attachment()).unwrap_err();

        assert!(matches!(err, DatapathError::Channel { .. }));
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        assert_eq!(
            *journal.borrow(),
            ["load", "attach", "open_channel", "detach", "destroy"]
        );
    }

    #[test]
    fn teardown_releases_in_order() {
        let (loader, journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();
        journal.borrow_mut().clear();

        lifecycle.teardown();

        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        assert_eq!(lifecycle.attachment(), None);
        assert_eq!(*journal.borrow(), ["close_channel", "detach", "destroy"]);
    }

    #[test]
    fn teardown_twice_is_teardown_once() {
        let (loader, journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();

        lifecycle.teardown();
        let after_first = journal.borrow().clone();
        lifecycle.teardown();
        drop(lifecycle);

        assert_eq!(*journal.borrow(), after_first);
    }

    #[test]
    fn failed_detach_still_destroys_program() {
        let (loader, journal) = FakeLoader::new(Script {
            fail_detach: true,
            ..Script::default()
        });
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();

        lifecycle.teardown();

        assert_eq!(
            *journal.borrow(),
            ["load", "attach", "open_channel", "close_channel", "detach", "destroy"]
        );
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[test]
    fn start_is_refused_after_termination() {
        let (loader, _journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();
        lifecycle.teardown();

        let err = lifecycle.start(attachment()).unwrap_err();

        assert!(matches!(
            err,
            DatapathError::InvalidState(LifecycleState::Terminated)
        ));
    }

    #[test]
    fn drop_runs_teardown() {
        let (loader, journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();

        drop(lifecycle);

        assert_eq!(
            *journal.borrow(),
            ["load", "attach", "open_channel", "close_channel", "detach", "destroy"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_delivers_until_channel_fault() {
        let (loader, _journal) = FakeLoader::new(Script {
            polls: VecDeque::from([Ok(vec![event(8), event(0)]), Ok(vec![]), Err(fault())]),
            ..Script::default()
        });
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();
        let (_tx, mut shutdown) = watch::channel(false);
        let mut seen = Vec::new();

        let result = lifecycle
            .run(&mut shutdown, Duration::from_millis(100), |e| seen.push(e))
            .await;

        assert!(matches!(result, Err(ChannelError::Fault(_))));
        assert_eq!(seen, [event(8), event(0)]);
        assert_eq!(lifecycle.delivered(), 2);
        assert_eq!(lifecycle.state(), LifecycleState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_immediately_when_already_cancelled() {
        let (loader, _journal) = FakeLoader::new(Script {
            polls: VecDeque::from([Ok(vec![event(8)])]),
            ..Script::default()
        });
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();
        let (_tx, mut shutdown) = watch::channel(true);
        let mut seen = Vec::new();

        lifecycle
            .run(&mut shutdown, Duration::from_millis(100), |e| seen.push(e))
            .await
            .unwrap();

        assert!(seen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_waiting_poll() {
        let (loader, journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        lifecycle.start(attachment()).unwrap();
        let (tx, mut shutdown) = watch::channel(false);

        let (result, ()) = tokio::join!(
            lifecycle.run(&mut shutdown, Duration::from_secs(3600), |_| {}),
            async {
                tokio::task::yield_now().await;
                tx.send(true).unwrap();
            }
        );
        result.unwrap();
        lifecycle.teardown();

        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        assert_eq!(journal.borrow().last(), Some(&"destroy"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_without_start_is_a_no_op() {
        let (loader, journal) = FakeLoader::new(Script::default());
        let mut lifecycle = Lifecycle::new(loader);
        let (_tx, mut shutdown) = watch::channel(false);

        lifecycle
            .run(&mut shutdown, Duration::from_millis(10), |_| {})
            .await
            .unwrap();

        assert!(journal.borrow().is_empty());
    }
}
