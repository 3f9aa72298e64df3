//! Actor wiring and lifecycle.
//!
//! Three cooperative tasks share the engine state: the trigger-stream actor
//! (metric intake + tick evaluation + emission flushing), the trigger-mailbox
//! actor (rule management) and the configurator (asset feed + templates).
//! Shutdown is signalled through a watch channel; each actor drains its
//! in-flight work and exits. Nothing needs flushing on the way out: durable
//! state is already on disk after every mutating operation.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_core::config::Config;
use vigil_core::error::EngineError;
use vigil_rules::store::RuleStore;
use vigil_rules::templates::TemplateLibrary;
use vigil_transport::bus::Request;
use vigil_transport::events::{topics, AssetEvent, LicensingUpdate, MetricUnavailable, MetricUpdate};
use vigil_transport::{Bus, MailboxRegistry, Message};

use crate::configurator::{ConfigCommand, Configurator, Control, CONFIG_MAILBOX};
use crate::mailbox::{RuleApi, RuleCommand, RuleResponse, TRIGGER_MAILBOX};
use crate::trigger::{flush_emissions, now_secs, EngineState, RuleChangeQueue, Trigger};

/// Running actor set; dropping it without [`ActorSet::shutdown`] detaches
/// the tasks.
pub struct ActorSet {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    state: EngineState,
}

impl ActorSet {
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Signal every actor and wait for them to drain and exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("engine stopped");
    }
}

/// Build the shared state and spawn the three actors.
///
/// Fails when the rule directory cannot be created or scanned; everything
/// after that is handled inside the actors.
pub fn spawn_engine(
    config: &Config,
    bus: Bus,
    mailboxes: MailboxRegistry,
) -> Result<ActorSet, EngineError> {
    let changes = RuleChangeQueue::new();
    let store = RuleStore::new(&config.server.rules)?;
    let state = EngineState::new(store, changes.clone());
    state
        .store
        .lock()
        .expect("rule store lock poisoned")
        .load_all()?;

    let mut templates = TemplateLibrary::new(&config.server.templates);
    let loaded = templates.load_all();
    info!(count = loaded, "templates loaded");

    let tick = Duration::from_millis(config.server.timeout_ms.max(1));
    let tick_secs = (config.server.timeout_ms / 1000).max(1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (control_tx, control_rx) = mpsc::channel::<Control>(64);

    let stream_rx = bus.subscribe("metrics", 1024);
    let licensing_rx = bus.subscribe(topics::LICENSING, 16);
    let assets_rx = bus.subscribe(topics::ASSETS, 256);
    let trigger_mb_rx = mailboxes.register(TRIGGER_MAILBOX, 64);
    let config_mb_rx = mailboxes.register(CONFIG_MAILBOX, 16);

    let trigger = Trigger::new(state.clone(), changes, tick_secs);
    let configurator = Configurator::new(state.clone(), templates, control_tx);
    let api = RuleApi::new(state.clone());

    let handles = vec![
        tokio::spawn(trigger_stream_actor(
            trigger,
            bus.clone(),
            stream_rx,
            licensing_rx,
            control_rx,
            tick,
            shutdown_rx.clone(),
        )),
        tokio::spawn(trigger_mailbox_actor(
            api,
            state.clone(),
            bus.clone(),
            trigger_mb_rx,
            shutdown_rx.clone(),
        )),
        tokio::spawn(configurator_actor(
            configurator,
            assets_rx,
            config_mb_rx,
            shutdown_rx,
        )),
    ];

    Ok(ActorSet {
        handles,
        shutdown: shutdown_tx,
        state,
    })
}

// ── Trigger stream actor ────────────────────────────────────────────

async fn trigger_stream_actor(
    mut trigger: Trigger,
    bus: Bus,
    mut stream_rx: mpsc::Receiver<Message>,
    mut licensing_rx: mpsc::Receiver<Message>,
    mut control_rx: mpsc::Receiver<Control>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(tick_ms = tick.as_millis() as u64, "trigger stream actor running");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                trigger.tick(now_secs());
                flush_emissions(trigger.state(), &bus);
            }
            Some(message) = stream_rx.recv() => handle_stream_message(&mut trigger, &message),
            Some(message) = licensing_rx.recv() => handle_stream_message(&mut trigger, &message),
            Some(control) = control_rx.recv() => {
                match control {
                    Control::Reevaluate => {
                        trigger.tick(now_secs());
                    }
                    Control::ResolveElement(element) => {
                        trigger.state().resolve_element_alerts(&element, now_secs());
                    }
                }
                flush_emissions(trigger.state(), &bus);
            }
        }
    }
    // Emit whatever the last tick produced before exiting.
    flush_emissions(trigger.state(), &bus);
    debug!("trigger stream actor stopped");
}

fn handle_stream_message(trigger: &mut Trigger, message: &Message) {
    match message.topic.as_str() {
        topics::METRICS_UNAVAILABLE => match message.decode::<MetricUnavailable>() {
            Ok(outage) => trigger.handle_unavailable(&outage.key),
            Err(e) => warn!(error = %e, "bad unavailability message"),
        },
        topics::METRICS => match message.decode::<MetricUpdate>() {
            Ok(update) => trigger.handle_metric(&update, now_secs()),
            Err(e) => warn!(error = %e, "bad metric message"),
        },
        topics::LICENSING => match message.decode::<LicensingUpdate>() {
            Ok(licensing) => trigger.set_enabled(licensing.enabled),
            Err(e) => warn!(error = %e, "bad licensing message"),
        },
        other => debug!(topic = %other, "ignoring stream message"),
    }
}

// ── Trigger mailbox actor ───────────────────────────────────────────

async fn trigger_mailbox_actor(
    api: RuleApi,
    state: EngineState,
    bus: Bus,
    mut requests: mpsc::Receiver<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("trigger mailbox actor running");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(request) = requests.recv() => {
                let response = match request.message.decode::<RuleCommand>() {
                    Ok(command) => api.handle(command),
                    Err(e) => RuleResponse::Error { code: -1, message: e.to_string() },
                };
                match request.message.reply_to(&response) {
                    Ok(reply) => {
                        let _ = request.reply.send(reply);
                    }
                    Err(e) => warn!(error = %e, "cannot encode mailbox reply"),
                }
                // TOUCH and ACK queue transitions; get them out promptly.
                flush_emissions(&state, &bus);
            }
        }
    }
    debug!("trigger mailbox actor stopped");
}

// ── Configurator actor ──────────────────────────────────────────────

async fn configurator_actor(
    configurator: Configurator,
    mut assets_rx: mpsc::Receiver<Message>,
    mut requests: mpsc::Receiver<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("configurator actor running");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(message) = assets_rx.recv() => {
                match message.decode::<AssetEvent>() {
                    Ok(event) => configurator.handle_event(&event),
                    Err(e) => warn!(error = %e, "bad asset message"),
                }
            }
            Some(request) = requests.recv() => {
                let response = match request.message.decode::<ConfigCommand>() {
                    Ok(command) => configurator.handle_command(command),
                    Err(e) => {
                        warn!(error = %e, "bad configurator command");
                        continue;
                    }
                };
                match request.message.reply_to(&response) {
                    Ok(reply) => {
                        let _ = request.reply.send(reply);
                    }
                    Err(e) => warn!(error = %e, "cannot encode mailbox reply"),
                }
            }
        }
    }
    debug!("configurator actor stopped");
}
