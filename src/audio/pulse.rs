//! PulseAudio facade.
//!
//! A single background thread owns the libpulse `Mainloop` + `Context`
//! (they are not `Send`); async callers issue commands over an mpsc
//! channel and await oneshot replies. A second thread owns the event
//! subscription (the subscribe call monopolizes its connection) and
//! restarts itself with capped backoff when PulseAudio goes away.
//!
//! Sample specifications are read by parsing a `pactl list sinks` text
//! dump: the native C-struct deserialization returns garbage for the
//! sample_spec of bluez cards.

use crate::store::AudioProfile;
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::introspect::{CardInfo, SinkInfo};
use libpulse_binding::context::subscribe::{Facility, InterestMaskSet, Operation as SubOp};
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{Retval, SinkState as PaSinkState};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::State as OperationState;
use libpulse_binding::volume::{ChannelVolumes, Volume};
use log::{debug, info, warn};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

const CLIENT_NAME: &str = "bt-audio-manager";
const EVENTS_CLIENT_NAME: &str = "bt-audio-events";

/// Socket paths probed in order when no server address is injected.
const FALLBACK_SERVERS: [&str; 2] = ["unix:/run/audio/pulse.sock", "unix:/run/audio/native"];

const RECONNECT_RETRIES: u32 = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const SUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

pub fn sink_prefix_for_address(address: &str) -> String {
    format!("bluez_sink.{}", address.replace(':', "_"))
}

pub fn card_name_for_address(address: &str) -> String {
    format!("bluez_card.{}", address.replace(':', "_"))
}

/// `bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink` → `AA:BB:CC:DD:EE:01`.
pub fn address_from_sink_name(sink_name: &str) -> Option<String> {
    let mut parts = sink_name.split('.');
    if parts.next() != Some("bluez_sink") {
        return None;
    }
    parts.next().map(|p| p.replace('_', ":"))
}

/// Profile names to try in order, newest naming first.
pub fn profile_candidates(profile: AudioProfile) -> &'static [&'static str] {
    match profile {
        AudioProfile::A2dp => &["a2dp_sink", "a2dp-sink"],
        AudioProfile::Hfp => &[
            "handsfree_head_unit",
            "handsfree-head-unit",
            "headset_head_unit",
            "headset-head-unit",
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkRunState {
    Running,
    Idle,
    Suspended,
}

impl From<PaSinkState> for SinkRunState {
    fn from(state: PaSinkState) -> Self {
        match state {
            PaSinkState::Running => SinkRunState::Running,
            PaSinkState::Idle => SinkRunState::Idle,
            _ => SinkRunState::Suspended,
        }
    }
}

/// One Bluetooth sink as reported to the control plane.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BtSink {
    pub name: String,
    pub description: String,
    pub state: SinkRunState,
    pub volume: u32,
    pub mute: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
struct RawSink {
    name: String,
    description: String,
    state: SinkRunState,
    volume_pct: u32,
    mute: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleSpec {
    pub format: Option<String>,
    pub rate: Option<u32>,
    pub channels: Option<u32>,
}

/// Events produced by the subscription connection, in arrival order.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    VolumeChange { sink: String, volume: u32, mute: bool },
    /// Sink state entered `running`.
    Running { sink: String },
    /// Sink state left `running`.
    Idle { sink: String },
}

enum AudioCommand {
    ListBtSinks { reply: tokio::sync::oneshot::Sender<Option<Vec<RawSink>>> },
    GetSinkForAddress { address: String, reply: tokio::sync::oneshot::Sender<Option<String>> },
    GetSinkState {
        sink: String,
        reply: tokio::sync::oneshot::Sender<Option<(u32, SinkRunState)>>,
    },
    SetSinkVolume { sink: String, volume_pct: u32, reply: tokio::sync::oneshot::Sender<bool> },
    SuspendSink { sink: String, suspend: bool, reply: tokio::sync::oneshot::Sender<bool> },
    SetDefaultSink { sink: String, reply: tokio::sync::oneshot::Sender<bool> },
    ActivateCardProfile {
        address: String,
        profile: AudioProfile,
        reply: tokio::sync::oneshot::Sender<bool>,
    },
    Reconnect { reply: tokio::sync::oneshot::Sender<bool> },
}

/// Cloneable handle to the PulseAudio threads.
#[derive(Clone)]
pub struct PulseFacade {
    cmd_tx: std::sync::mpsc::Sender<AudioCommand>,
}

impl PulseFacade {
    /// Connect the primary command connection and start the event
    /// subscription. Returns the facade plus the sink-event stream.
    pub async fn connect(
        server: Option<String>,
    ) -> crate::errors::Result<(Self, tokio::sync::mpsc::UnboundedReceiver<SinkEvent>)> {
        let candidates = server_candidates(server.as_deref());

        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<AudioCommand>();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<String, String>>();
        let thread_candidates = candidates.clone();
        std::thread::Builder::new()
            .name("pa-commands".into())
            .spawn(move || command_thread(thread_candidates, cmd_rx, ready_tx))
            .map_err(|e| crate::errors::Error::PulseUnavailable(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(server)) => info!("Connected to PulseAudio via {server}"),
            Ok(Err(e)) => return Err(crate::errors::Error::PulseUnavailable(e)),
            Err(_) => {
                return Err(crate::errors::Error::PulseUnavailable(
                    "PulseAudio thread exited during connect".into(),
                ));
            }
        }

        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("pa-events".into())
            .spawn(move || subscription_thread(candidates, event_tx))
            .map_err(|e| crate::errors::Error::PulseUnavailable(e.to_string()))?;

        Ok((Self { cmd_tx }, event_rx))
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<T>) -> AudioCommand,
        fallback: T,
    ) -> T {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if self.cmd_tx.send(build(reply_tx)).is_err() {
            return fallback;
        }
        reply_rx.await.unwrap_or(fallback)
    }

    /// All bluez sinks with sample specs merged in from the pactl dump.
    pub async fn list_bt_sinks(&self) -> Vec<BtSink> {
        let raw = self.send(|reply| AudioCommand::ListBtSinks { reply }, None).await;
        let Some(raw) = raw else { return Vec::new() };
        let specs = pactl_sample_specs().await;
        raw.into_iter()
            .map(|s| {
                let spec = specs.get(&s.name);
                BtSink {
                    description: s.description,
                    state: s.state,
                    volume: s.volume_pct,
                    mute: s.mute,
                    sample_rate: spec.and_then(|s| s.rate),
                    channels: spec.and_then(|s| s.channels),
                    format: spec.and_then(|s| s.format.clone()),
                    name: s.name,
                }
            })
            .collect()
    }

    pub async fn get_sink_for_address(&self, address: &str) -> Option<String> {
        self.send(
            |reply| AudioCommand::GetSinkForAddress { address: address.to_string(), reply },
            None,
        )
        .await
    }

    pub async fn get_sink_volume(&self, sink: &str) -> Option<(u32, SinkRunState)> {
        self.send(|reply| AudioCommand::GetSinkState { sink: sink.to_string(), reply }, None).await
    }

    /// Clamped 0..100. On bluez sinks PulseAudio forwards this as AVRCP
    /// absolute volume, moving the speaker's own level.
    pub async fn set_sink_volume(&self, sink: &str, volume_pct: u32) -> bool {
        let volume_pct = volume_pct.min(100);
        self.send(
            |reply| AudioCommand::SetSinkVolume { sink: sink.to_string(), volume_pct, reply },
            false,
        )
        .await
    }

    pub async fn suspend_sink(&self, sink: &str) -> bool {
        self.send(
            |reply| AudioCommand::SuspendSink { sink: sink.to_string(), suspend: true, reply },
            false,
        )
        .await
    }

    pub async fn resume_sink(&self, sink: &str) -> bool {
        self.send(
            |reply| AudioCommand::SuspendSink { sink: sink.to_string(), suspend: false, reply },
            false,
        )
        .await
    }

    pub async fn set_default_sink(&self, sink: &str) -> bool {
        self.send(|reply| AudioCommand::SetDefaultSink { sink: sink.to_string(), reply }, false)
            .await
    }

    pub async fn activate_bt_card_profile(&self, address: &str, profile: AudioProfile) -> bool {
        self.send(
            |reply| AudioCommand::ActivateCardProfile {
                address: address.to_string(),
                profile,
                reply,
            },
            false,
        )
        .await
    }

    /// Bounded reconnect for use after an audio-service restart.
    pub async fn reconnect(&self) -> bool {
        self.send(|reply| AudioCommand::Reconnect { reply }, false).await
    }

    /// Poll until a `bluez_sink.<mac-underscored>` sink appears, bailing
    /// out early when the device is no longer connected.
    pub async fn wait_for_bt_sink<F, Fut>(
        &self,
        address: &str,
        timeout: Duration,
        still_connected: F,
    ) -> Option<String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(sink) = self.get_sink_for_address(address).await {
                info!("BT sink ready: {sink}");
                return Some(sink);
            }
            if !still_connected().await {
                warn!("Device {address} disconnected while waiting for BT sink");
                return None;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!("BT sink for {address} did not appear within {}s", timeout.as_secs());
        None
    }
}

fn server_candidates(injected: Option<&str>) -> Vec<Option<String>> {
    match injected {
        // An explicit address is authoritative; no fallback probing.
        Some(server) => vec![Some(server.to_string())],
        None => FALLBACK_SERVERS.iter().map(|s| Some(s.to_string())).collect(),
    }
}

// ── Command thread ──

struct PaSession {
    mainloop: Mainloop,
    context: Context,
}

fn pa_connect(client_name: &str, candidates: &[Option<String>]) -> Result<(PaSession, String), String> {
    let mut last_error = String::from("no server candidates");
    for server in candidates {
        let Some(mut mainloop) = Mainloop::new() else {
            return Err("failed to create PulseAudio mainloop".into());
        };
        let Some(mut context) = Context::new(&mainloop, client_name) else {
            return Err("failed to create PulseAudio context".into());
        };
        if context.connect(server.as_deref(), ContextFlagSet::NOAUTOSPAWN, None).is_err() {
            last_error = format!("connect refused at {}", server.as_deref().unwrap_or("(default)"));
            continue;
        }
        let mut failed = false;
        loop {
            match mainloop.iterate(true) {
                IterateResult::Err(_) | IterateResult::Quit(_) => {
                    failed = true;
                    break;
                }
                IterateResult::Success(_) => {}
            }
            match context.get_state() {
                ContextState::Ready => break,
                ContextState::Failed | ContextState::Terminated => {
                    failed = true;
                    break;
                }
                _ => {}
            }
        }
        if failed {
            last_error =
                format!("handshake failed at {}", server.as_deref().unwrap_or("(default)"));
            continue;
        }
        let label = server.clone().unwrap_or_else(|| "(default)".into());
        return Ok((PaSession { mainloop, context }, label));
    }
    Err(format!("PulseAudio not reachable at any known address ({last_error})"))
}

fn command_thread(
    candidates: Vec<Option<String>>,
    rx: std::sync::mpsc::Receiver<AudioCommand>,
    ready_tx: tokio::sync::oneshot::Sender<Result<String, String>>,
) {
    let mut session = match pa_connect(CLIENT_NAME, &candidates) {
        Ok((session, label)) => {
            let _ = ready_tx.send(Ok(label));
            Some(session)
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(cmd) = rx.recv() {
        // A dead context means PA restarted. One cheap reattach per
        // command; the bounded-retry path is the Reconnect command.
        if let Some(s) = &session {
            if s.context.get_state() != ContextState::Ready {
                session = None;
            }
        }
        if session.is_none() {
            if let Ok((new_session, label)) = pa_connect(CLIENT_NAME, &candidates) {
                info!("Reattached to PulseAudio via {label}");
                session = Some(new_session);
            }
        }

        match cmd {
            AudioCommand::Reconnect { reply } => {
                if let Some(mut old) = session.take() {
                    old.context.disconnect();
                    old.mainloop.quit(Retval(0));
                }
                let mut ok = false;
                for attempt in 1..=RECONNECT_RETRIES {
                    match pa_connect(CLIENT_NAME, &candidates) {
                        Ok((new_session, label)) => {
                            info!("Reconnected to PulseAudio via {label} (attempt {attempt})");
                            session = Some(new_session);
                            ok = true;
                            break;
                        }
                        Err(_) if attempt < RECONNECT_RETRIES => {
                            std::thread::sleep(RECONNECT_DELAY)
                        }
                        Err(e) => warn!("PulseAudio reconnect failed: {e}"),
                    }
                }
                let _ = reply.send(ok);
            }
            AudioCommand::ListBtSinks { reply } => {
                let result = session
                    .as_mut()
                    .map(|s| pa_list_bt_sinks(&mut s.mainloop, &s.context));
                let _ = reply.send(result);
            }
            AudioCommand::GetSinkForAddress { address, reply } => {
                let result = session.as_mut().and_then(|s| {
                    let prefix = sink_prefix_for_address(&address);
                    pa_list_bt_sinks(&mut s.mainloop, &s.context)
                        .into_iter()
                        .find(|sink| sink.name.contains(&prefix))
                        .map(|sink| sink.name)
                });
                let _ = reply.send(result);
            }
            AudioCommand::GetSinkState { sink, reply } => {
                let result = session
                    .as_mut()
                    .and_then(|s| pa_get_sink_state(&mut s.mainloop, &s.context, &sink));
                let _ = reply.send(result);
            }
            AudioCommand::SetSinkVolume { sink, volume_pct, reply } => {
                let ok = session
                    .as_mut()
                    .map(|s| pa_set_sink_volume(&mut s.mainloop, &mut s.context, &sink, volume_pct))
                    .unwrap_or(false);
                let _ = reply.send(ok);
            }
            AudioCommand::SuspendSink { sink, suspend, reply } => {
                let ok = session
                    .as_mut()
                    .map(|s| pa_suspend_sink(&mut s.mainloop, &mut s.context, &sink, suspend))
                    .unwrap_or(false);
                let _ = reply.send(ok);
            }
            AudioCommand::SetDefaultSink { sink, reply } => {
                let ok = session
                    .as_mut()
                    .map(|s| {
                        let op = s.context.set_default_sink(&sink, |_| {});
                        wait_op(&mut s.mainloop, &op);
                        info!("Default audio output set to {sink}");
                        true
                    })
                    .unwrap_or(false);
                let _ = reply.send(ok);
            }
            AudioCommand::ActivateCardProfile { address, profile, reply } => {
                let ok = session
                    .as_mut()
                    .map(|s| pa_activate_card_profile(&mut s.mainloop, &mut s.context, &address, profile))
                    .unwrap_or(false);
                let _ = reply.send(ok);
            }
        }
    }

    if let Some(mut s) = session {
        s.context.disconnect();
        s.mainloop.quit(Retval(0));
    }
    info!("PulseAudio command thread exiting");
}

fn wait_op<T: ?Sized>(mainloop: &mut Mainloop, op: &libpulse_binding::operation::Operation<T>) {
    while op.get_state() == OperationState::Running {
        if let IterateResult::Err(_) | IterateResult::Quit(_) = mainloop.iterate(true) {
            return;
        }
    }
}

fn pa_list_bt_sinks(mainloop: &mut Mainloop, context: &Context) -> Vec<RawSink> {
    let introspector = context.introspect();
    let collected = Rc::new(RefCell::new(Vec::new()));
    let op = introspector.get_sink_info_list({
        let collected = collected.clone();
        move |result: ListResult<&SinkInfo>| {
            if let ListResult::Item(item) = result {
                let name = item.name.as_ref().map(|n| n.to_string()).unwrap_or_default();
                if !name.to_lowercase().contains("bluez") {
                    return;
                }
                collected.borrow_mut().push(RawSink {
                    name,
                    description: item
                        .description
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    state: item.state.into(),
                    volume_pct: volume_pct(&item.volume),
                    mute: item.mute,
                });
            }
        }
    });
    wait_op(mainloop, &op);
    let mut sinks = collected.borrow().clone();
    sinks.sort_by(|a, b| a.name.cmp(&b.name));
    sinks
}

fn pa_get_sink_state(
    mainloop: &mut Mainloop,
    context: &Context,
    sink_name: &str,
) -> Option<(u32, SinkRunState)> {
    let introspector = context.introspect();
    let found = Rc::new(RefCell::new(None));
    let op = introspector.get_sink_info_by_name(sink_name, {
        let found = found.clone();
        move |result: ListResult<&SinkInfo>| {
            if let ListResult::Item(item) = result {
                *found.borrow_mut() = Some((volume_pct(&item.volume), item.state.into()));
            }
        }
    });
    wait_op(mainloop, &op);
    let result = *found.borrow();
    result
}

fn pa_set_sink_volume(
    mainloop: &mut Mainloop,
    context: &mut Context,
    sink_name: &str,
    volume_pct: u32,
) -> bool {
    let introspector = context.introspect();
    let channels = Rc::new(RefCell::new(None));
    let op = introspector.get_sink_info_by_name(sink_name, {
        let channels = channels.clone();
        move |result: ListResult<&SinkInfo>| {
            if let ListResult::Item(item) = result {
                *channels.borrow_mut() = Some(item.volume.len());
            }
        }
    });
    wait_op(mainloop, &op);
    let Some(channel_count) = *channels.borrow() else {
        warn!("Sink not found for volume set: {sink_name}");
        return false;
    };

    let raw = ((volume_pct as f64 / 100.0) * Volume::NORMAL.0 as f64).round() as u32;
    let mut volumes = ChannelVolumes::default();
    volumes.set(channel_count, Volume(raw));

    let mut introspector = context.introspect();
    let op = introspector.set_sink_volume_by_name(sink_name, &volumes, None);
    wait_op(mainloop, &op);
    info!("PA sink volume set: {sink_name} -> {volume_pct}%");
    true
}

fn pa_suspend_sink(
    mainloop: &mut Mainloop,
    context: &mut Context,
    sink_name: &str,
    suspend: bool,
) -> bool {
    let success = Rc::new(RefCell::new(false));
    let mut introspector = context.introspect();
    let op = introspector.suspend_sink_by_name(sink_name, suspend, Some(Box::new({
        let success = success.clone();
        move |ok| *success.borrow_mut() = ok
    })));
    wait_op(mainloop, &op);
    let ok = *success.borrow();
    if ok {
        info!("{} PA sink: {sink_name}", if suspend { "Suspended" } else { "Resumed" });
    } else {
        warn!("Failed to {} sink {sink_name}", if suspend { "suspend" } else { "resume" });
    }
    ok
}

#[derive(Clone)]
struct CardSnapshot {
    index: u32,
    profiles: Vec<(String, bool)>, // (name, available)
}

fn pa_get_card(mainloop: &mut Mainloop, context: &Context, card_name: &str) -> Option<CardSnapshot> {
    let introspector = context.introspect();
    let found = Rc::new(RefCell::new(None));
    let wanted = card_name.to_string();
    let op = introspector.get_card_info_list({
        let found = found.clone();
        move |result: ListResult<&CardInfo>| {
            if let ListResult::Item(item) = result {
                let name = item.name.as_ref().map(|n| n.to_string()).unwrap_or_default();
                if name == wanted {
                    *found.borrow_mut() = Some(CardSnapshot {
                        index: item.index,
                        profiles: item
                            .profiles
                            .iter()
                            .map(|p| {
                                (
                                    p.name.as_ref().map(|n| n.to_string()).unwrap_or_default(),
                                    p.available,
                                )
                            })
                            .collect(),
                    });
                }
            }
        }
    });
    wait_op(mainloop, &op);
    let result = found.borrow().clone();
    result
}

fn pa_set_card_profile(
    mainloop: &mut Mainloop,
    context: &mut Context,
    card_index: u32,
    profile: &str,
) -> bool {
    let success = Rc::new(RefCell::new(false));
    let mut introspector = context.introspect();
    let op = introspector.set_card_profile_by_index(card_index, profile, Some(Box::new({
        let success = success.clone();
        move |ok| *success.borrow_mut() = ok
    })));
    wait_op(mainloop, &op);
    let ok = *success.borrow();
    ok
}

/// Activate an A2DP or HFP profile on a device's bluez card, trying
/// candidate profile names in order. A2DP falls back to cycling through
/// `off`; for HFP an `available=no` profile is still attempted once
/// since PA sometimes accepts it anyway.
fn pa_activate_card_profile(
    mainloop: &mut Mainloop,
    context: &mut Context,
    address: &str,
    profile: AudioProfile,
) -> bool {
    let card_name = card_name_for_address(address);
    let Some(card) = pa_get_card(mainloop, context, &card_name) else {
        warn!("PA card {card_name} not found");
        return false;
    };

    for candidate in profile_candidates(profile) {
        let Some((name, available)) =
            card.profiles.iter().find(|(name, _)| name == candidate).cloned()
        else {
            continue;
        };
        if !available {
            warn!(
                "PA card {card_name} profile {name} exists but available=no — \
                 HFP RFCOMM transport not connected"
            );
        }
        if pa_set_card_profile(mainloop, context, card.index, &name) {
            info!("PA card profile set: {card_name} -> {name}");
            return true;
        }
        warn!("card_profile_set {card_name} {name} failed");
        break; // correct profile found, activation failed
    }

    if profile == AudioProfile::Hfp {
        warn!("PA card {card_name} HFP profile activation failed");
        return false;
    }

    // A2DP: cycle off -> target. Helps cards stuck half-configured
    // after a bluez module reload.
    info!("Cycling PA card profile for {card_name} (off -> a2dp)...");
    if card.profiles.iter().any(|(name, _)| name == "off") {
        let _ = pa_set_card_profile(mainloop, context, card.index, "off");
        std::thread::sleep(Duration::from_secs(1));
        if let Some(card) = pa_get_card(mainloop, context, &card_name) {
            for candidate in profile_candidates(profile) {
                if card.profiles.iter().any(|(name, _)| name == candidate)
                    && pa_set_card_profile(mainloop, context, card.index, candidate)
                {
                    info!("PA card profile cycled: {card_name} -> {candidate}");
                    return true;
                }
            }
        }
    }
    warn!("PA card {card_name} profile activation failed");
    false
}

fn volume_pct(volume: &ChannelVolumes) -> u32 {
    let channels = volume.len();
    if channels == 0 {
        return 0;
    }
    let total: f64 = volume.get().iter().take(channels as usize).map(|v| v.0 as f64).sum();
    ((total / channels as f64) / Volume::NORMAL.0 as f64 * 100.0).round() as u32
}

// ── Subscription thread ──

fn subscription_thread(
    candidates: Vec<Option<String>>,
    tx: tokio::sync::mpsc::UnboundedSender<SinkEvent>,
) {
    let mut retry_delay = Duration::from_secs(2);
    loop {
        match subscription_session(&candidates, &tx) {
            SessionEnd::Shutdown => {
                info!("PA event subscription stopped");
                return;
            }
            SessionEnd::Failed(e) => {
                if tx.is_closed() {
                    return;
                }
                warn!(
                    "PA event subscription error: {e} — restarting in {}s",
                    retry_delay.as_secs()
                );
                std::thread::sleep(retry_delay);
                retry_delay = (retry_delay * 2).min(SUBSCRIBE_BACKOFF_MAX);
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(String),
}

fn subscription_session(
    candidates: &[Option<String>],
    tx: &tokio::sync::mpsc::UnboundedSender<SinkEvent>,
) -> SessionEnd {
    let (mut session, label) = match pa_connect(EVENTS_CLIENT_NAME, candidates) {
        Ok(ok) => ok,
        Err(e) => return SessionEnd::Failed(e),
    };
    info!("PA event subscription started via {label} (sink events)");

    let pending: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    session.context.set_subscribe_callback(Some(Box::new({
        let pending = pending.clone();
        move |facility, operation, index| {
            if facility == Some(Facility::Sink) && operation == Some(SubOp::Changed) {
                pending.borrow_mut().push(index);
            } else if facility == Some(Facility::Sink) {
                debug!("PA sink {operation:?}: index={index}");
            }
        }
    })));
    let op = session.context.subscribe(InterestMaskSet::SINK | InterestMaskSet::SERVER, |_| {});
    wait_op(&mut session.mainloop, &op);

    // State per sink so running/idle events fire only on transitions.
    let mut sink_states: HashMap<String, SinkRunState> = HashMap::new();

    loop {
        match session.mainloop.iterate(true) {
            IterateResult::Err(_) | IterateResult::Quit(_) => {
                return SessionEnd::Failed("mainloop iteration failed".into());
            }
            IterateResult::Success(_) => {}
        }
        if session.context.get_state() != ContextState::Ready {
            return SessionEnd::Failed("context lost".into());
        }

        let indexes: Vec<u32> = pending.borrow_mut().drain(..).collect();
        for index in indexes {
            let Some(sink) = pa_sink_by_index(&mut session.mainloop, &session.context, index)
            else {
                continue;
            };
            if !sink.name.to_lowercase().contains("bluez") {
                continue;
            }
            debug!(
                "PA sink change: {} vol={}% mute={} state={:?}",
                sink.name, sink.volume_pct, sink.mute, sink.state
            );
            if tx
                .send(SinkEvent::VolumeChange {
                    sink: sink.name.clone(),
                    volume: sink.volume_pct,
                    mute: sink.mute,
                })
                .is_err()
            {
                return SessionEnd::Shutdown;
            }
            let previous = sink_states.insert(sink.name.clone(), sink.state);
            let was_running = previous == Some(SinkRunState::Running);
            let event = if sink.state == SinkRunState::Running && !was_running {
                info!("BT sink {} -> running (was {previous:?})", sink.name);
                Some(SinkEvent::Running { sink: sink.name.clone() })
            } else if sink.state != SinkRunState::Running && was_running {
                info!("BT sink {} -> {:?} (was running)", sink.name, sink.state);
                Some(SinkEvent::Idle { sink: sink.name.clone() })
            } else {
                None
            };
            if let Some(event) = event {
                if tx.send(event).is_err() {
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

fn pa_sink_by_index(mainloop: &mut Mainloop, context: &Context, index: u32) -> Option<RawSink> {
    let introspector = context.introspect();
    let found = Rc::new(RefCell::new(None));
    let op = introspector.get_sink_info_by_index(index, {
        let found = found.clone();
        move |result: ListResult<&SinkInfo>| {
            if let ListResult::Item(item) = result {
                *found.borrow_mut() = Some(RawSink {
                    name: item.name.as_ref().map(|n| n.to_string()).unwrap_or_default(),
                    description: item
                        .description
                        .as_ref()
                        .map(|d| d.to_string())
                        .unwrap_or_default(),
                    state: item.state.into(),
                    volume_pct: volume_pct(&item.volume),
                    mute: item.mute,
                });
            }
        }
    });
    wait_op(mainloop, &op);
    let result = found.borrow().clone();
    result
}

/// Unload and reload PulseAudio's bluez discovery module. Used when
/// the HFP escalation chain needs PA to re-probe a card, and after
/// unregistering the null HFP handler (PA must re-install its own HFP
/// handler).
pub async fn reload_bluez_module() -> bool {
    let list = match tokio::process::Command::new("pactl")
        .arg("list")
        .arg("modules")
        .arg("short")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).to_string()
        }
        _ => return false,
    };
    let Some(module) = list
        .lines()
        .find(|line| line.contains("module-bluez5-discover"))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
    else {
        warn!("module-bluez5-discover not loaded — nothing to reload");
        return false;
    };
    let unloaded = tokio::process::Command::new("pactl")
        .arg("unload-module")
        .arg(&module)
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false);
    if !unloaded {
        return false;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    let loaded = tokio::process::Command::new("pactl")
        .arg("load-module")
        .arg("module-bluez5-discover")
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false);
    if loaded {
        info!("PulseAudio bluez module reloaded");
    }
    loaded
}

// ── pactl sample-spec dump ──

async fn pactl_sample_specs() -> HashMap<String, SampleSpec> {
    let output = match tokio::process::Command::new("pactl")
        .arg("list")
        .arg("sinks")
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        Ok(_) => return HashMap::new(),
        Err(e) => {
            debug!("pactl not available: {e}");
            return HashMap::new();
        }
    };
    parse_pactl_sinks(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `Name:` / `Sample Specification:` pairs out of a
/// `pactl list sinks` dump. The value reads like `s16le 2ch 44100Hz`.
pub fn parse_pactl_sinks(dump: &str) -> HashMap<String, SampleSpec> {
    let mut specs = HashMap::new();
    let mut current_name: Option<String> = None;
    for line in dump.lines() {
        let trimmed = line.trim();
        if let Some(name) = trimmed.strip_prefix("Name:") {
            current_name = Some(name.trim().to_string());
        } else if let Some(spec_str) = trimmed.strip_prefix("Sample Specification:") {
            let Some(name) = current_name.clone() else { continue };
            let mut spec = SampleSpec { format: None, rate: None, channels: None };
            for part in spec_str.split_whitespace() {
                if let Some(rate) = part.strip_suffix("Hz") {
                    spec.rate = rate.parse().ok().or(spec.rate);
                } else if let Some(ch) = part.strip_suffix("ch") {
                    spec.channels = ch.parse().ok().or(spec.channels);
                } else {
                    spec.format = Some(part.to_string());
                }
            }
            specs.insert(name, spec);
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pactl_dump() {
        let dump = "\
Sink #4
\tState: RUNNING
\tName: bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink
\tDescription: Soundbar
\tSample Specification: s16le 2ch 44100Hz
Sink #5
\tName: alsa_output.pci-0000_00_1f.3.analog-stereo
\tSample Specification: s32le 2ch 48000Hz
";
        let specs = parse_pactl_sinks(dump);
        let bt = &specs["bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink"];
        assert_eq!(bt.format.as_deref(), Some("s16le"));
        assert_eq!(bt.rate, Some(44_100));
        assert_eq!(bt.channels, Some(2));
        assert_eq!(specs.len(), 2);
    }

    #[test]
    fn ignores_spec_without_name() {
        let specs = parse_pactl_sinks("Sample Specification: s16le 2ch 44100Hz\n");
        assert!(specs.is_empty());
    }

    #[test]
    fn sink_and_card_naming() {
        assert_eq!(
            sink_prefix_for_address("AA:BB:CC:DD:EE:01"),
            "bluez_sink.AA_BB_CC_DD_EE_01"
        );
        assert_eq!(
            card_name_for_address("AA:BB:CC:DD:EE:01"),
            "bluez_card.AA_BB_CC_DD_EE_01"
        );
        assert_eq!(
            address_from_sink_name("bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink").as_deref(),
            Some("AA:BB:CC:DD:EE:01")
        );
        assert_eq!(address_from_sink_name("alsa_output.pci.analog-stereo"), None);
    }

    #[test]
    fn profile_candidate_order() {
        assert_eq!(profile_candidates(AudioProfile::A2dp)[0], "a2dp_sink");
        let hfp = profile_candidates(AudioProfile::Hfp);
        assert_eq!(hfp.len(), 4);
        assert_eq!(hfp[0], "handsfree_head_unit");
    }
}
