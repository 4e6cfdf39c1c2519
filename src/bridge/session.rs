//! # Call Session Coordinator
//!
//! One `CallSession` per Twilio connection. It opens the agent connection, sends the
//! settings, runs the three duties, and tears everything down when any of them ends.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: the agent connection is being opened (bounded by the connect timeout)
//! 2. **ConfigNegotiating**: the `Settings` message is sent, before any audio
//! 3. **Active**: reader, uplink and downlink run as separate tasks
//! 4. **Closing**: the first duty to end decides the outcome; the others are asked to stop
//! 5. **Closed**: terminal, a `SessionReport` is returned
//!
//! A failure while connecting or negotiating jumps straight to Closing with
//! `UpstreamUnavailable`; no duty is ever started in that case.
//!
//! ## Ownership:
//! The session moves each socket half, the audio queue ends and the handoff cell ends into
//! the duty that uses them. Each duty closes the write half it owns when it exits, so each
//! socket is closed exactly once however the call ends.
//!
//! A duty still running when the teardown grace period runs out is aborted. The socket half
//! it owned is dropped without a close handshake.

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::downlink::{AgentDownlink, DownlinkOutcome, DownlinkStats};
use super::handoff::correlation_cell;
use super::reader::{InboundReader, ReaderOutcome, ReaderStats};
use super::socket::{Frame, SocketPair};
use super::teardown::teardown_signal;
use super::uplink::{run_uplink, UplinkOutcome, UplinkStats};
use super::DutyExit;
use crate::agent::protocol::AgentSettings;
use crate::config::AppConfig;
use crate::error::{BridgeError, BridgeResult, Peer};

/// Opens the agent side of a call.
///
/// The production implementation is `agent::client::AgentClient`; tests substitute
/// in-memory links.
pub trait AgentConnector {
    fn connect(&self) -> impl Future<Output = BridgeResult<SocketPair>> + Send;
}

/// Lifecycle state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    ConfigNegotiating,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::ConfigNegotiating => "config_negotiating",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Allowed transitions. Nothing skips `ConfigNegotiating` on the way to `Active`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, ConfigNegotiating)
                | (Connecting, Closing)
                | (ConfigNegotiating, Active)
                | (ConfigNegotiating, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Twilio sent `stop`.
    Completed,
    ProtocolViolation(String),
    UpstreamUnavailable(String),
    PeerClosed(Peer),
    /// A duty panicked or was aborted before reporting.
    Aborted(String),
}

impl SessionEnd {
    pub fn is_failure(&self) -> bool {
        !matches!(self, SessionEnd::Completed | SessionEnd::PeerClosed(_))
    }
}

impl From<BridgeError> for SessionEnd {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::ProtocolViolation(msg) => SessionEnd::ProtocolViolation(msg),
            BridgeError::UpstreamUnavailable(msg) => SessionEnd::UpstreamUnavailable(msg),
            BridgeError::PeerClosed(peer) => SessionEnd::PeerClosed(peer),
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::Completed => write!(f, "completed"),
            SessionEnd::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            SessionEnd::UpstreamUnavailable(msg) => write!(f, "agent unavailable: {}", msg),
            SessionEnd::PeerClosed(peer) => write!(f, "{} closed", peer),
            SessionEnd::Aborted(msg) => write!(f, "aborted: {}", msg),
        }
    }
}

/// Per-call tuning, copied out of the configuration when the call starts.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub block_size: usize,
    pub queue_capacity: usize,
    pub connect_timeout: Duration,
    pub teardown_grace: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            block_size: config.audio.block_size(),
            queue_capacity: config.performance.audio_queue_capacity,
            connect_timeout: config.connect_timeout(),
            teardown_grace: config.teardown_grace(),
        }
    }
}

/// Summary of a finished call.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub stream_sid: Option<String>,
    pub end: SessionEnd,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub reader: ReaderStats,
    pub uplink: UplinkStats,
    pub downlink: DownlinkStats,
}

enum DutyOutcome {
    Reader(ReaderOutcome),
    Uplink(UplinkOutcome),
    Downlink(DownlinkOutcome),
}

pub struct CallSession {
    id: Uuid,
    state: SessionState,
    options: SessionOptions,
    settings: AgentSettings,
    started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(options: SessionOptions, settings: AgentSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Connecting,
            options,
            settings,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = self.state.as_str(), to = next.as_str(), "Session state change");
        self.state = next;
    }

    /// Run the call to completion.
    pub async fn run<R, W, C>(
        self,
        telephony_reader: R,
        telephony_writer: W,
        connector: &C,
    ) -> SessionReport
    where
        R: Stream<Item = Result<Frame, BridgeError>> + Send + Unpin + 'static,
        W: Sink<Frame, Error = BridgeError> + Send + Unpin + 'static,
        C: AgentConnector + Sync,
    {
        let span = tracing::info_span!("call_session", session_id = %self.id);
        self.run_inner(telephony_reader, telephony_writer, connector)
            .instrument(span)
            .await
    }

    async fn run_inner<R, W, C>(
        mut self,
        telephony_reader: R,
        mut telephony_writer: W,
        connector: &C,
    ) -> SessionReport
    where
        R: Stream<Item = Result<Frame, BridgeError>> + Send + Unpin + 'static,
        W: Sink<Frame, Error = BridgeError> + Send + Unpin + 'static,
        C: AgentConnector + Sync,
    {
        let clock = Instant::now();
        info!("Call session opened, connecting to agent");

        let agent = match tokio::time::timeout(self.options.connect_timeout, connector.connect()).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return self.fail_before_active(err, &mut telephony_writer, clock).await,
            Err(_) => {
                let err = BridgeError::UpstreamUnavailable(format!(
                    "no connection within {} ms",
                    self.options.connect_timeout.as_millis()
                ));
                return self.fail_before_active(err, &mut telephony_writer, clock).await;
            }
        };

        self.advance(SessionState::ConfigNegotiating);
        let SocketPair {
            reader: agent_reader,
            writer: mut agent_writer,
        } = agent;

        if let Err(err) = self.send_settings(&mut agent_writer).await {
            let _ = agent_writer.close().await;
            return self.fail_before_active(err, &mut telephony_writer, clock).await;
        }
        info!("Agent settings sent");

        self.advance(SessionState::Active);

        let (queue_tx, queue_rx) = mpsc::channel(self.options.queue_capacity);
        let (sid_writer, sid_reader) = correlation_cell();
        let sid_probe = sid_reader.clone();
        let (trigger, listener) = teardown_signal();

        let mut duties = JoinSet::new();
        let reader = InboundReader::new(
            telephony_reader,
            self.options.block_size,
            queue_tx,
            sid_writer,
            listener,
        );
        duties.spawn(async move { DutyOutcome::Reader(reader.run().await) }.in_current_span());
        duties.spawn(
            async move { DutyOutcome::Uplink(run_uplink(queue_rx, agent_writer).await) }
                .in_current_span(),
        );
        let downlink =
            AgentDownlink::new(agent_reader, telephony_writer, sid_reader, trigger.listener());
        duties.spawn(async move { DutyOutcome::Downlink(downlink.run().await) }.in_current_span());

        let mut report = self.report(SessionEnd::Completed, clock);
        let mut end = None;

        if let Some(first) = duties.join_next().await {
            end = record(&mut report, first);
        }

        self.advance(SessionState::Closing);
        trigger.trigger();

        let grace = self.options.teardown_grace;
        if tokio::time::timeout(grace, drain(&mut duties, &mut report, &mut end))
            .await
            .is_err()
        {
            warn!(grace_ms = grace.as_millis() as u64, "Duties did not stop in time, aborting");
            duties.abort_all();
            drain(&mut duties, &mut report, &mut end).await;
        }

        self.advance(SessionState::Closed);
        report.end = end.unwrap_or_else(|| SessionEnd::Aborted("no duty reported".to_string()));
        report.stream_sid = sid_probe.get();
        report.duration = clock.elapsed();

        log_report(&report);
        report
    }

    async fn send_settings<S>(&self, agent: &mut S) -> BridgeResult<()>
    where
        S: Sink<Frame, Error = BridgeError> + Unpin,
    {
        let json = self
            .settings
            .to_json()
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("settings not serializable: {}", e)))?;
        agent
            .send(Frame::Text(json))
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("settings not delivered: {}", e)))
    }

    async fn fail_before_active<W>(
        mut self,
        err: BridgeError,
        telephony: &mut W,
        clock: Instant,
    ) -> SessionReport
    where
        W: Sink<Frame, Error = BridgeError> + Unpin,
    {
        warn!(error = %err, "Agent unavailable, ending call");
        self.advance(SessionState::Closing);
        if let Err(close_err) = telephony.close().await {
            debug!(error = %close_err, "Telephony socket already closed");
        }
        self.advance(SessionState::Closed);

        let report = self.report(SessionEnd::from(err), clock);
        log_report(&report);
        report
    }

    fn report(&self, end: SessionEnd, clock: Instant) -> SessionReport {
        SessionReport {
            session_id: self.id,
            stream_sid: None,
            end,
            started_at: self.started_at,
            duration: clock.elapsed(),
            reader: ReaderStats::default(),
            uplink: UplinkStats::default(),
            downlink: DownlinkStats::default(),
        }
    }
}

/// Fold one finished duty into the report and return what it says about why the call ended.
///
/// Exits that only follow from another duty ending (a cancelled duty, or the uplink draining
/// a queue the reader closed) say nothing and return `None`.
fn record(report: &mut SessionReport, joined: Result<DutyOutcome, JoinError>) -> Option<SessionEnd> {
    let (duty, result) = match joined {
        Ok(DutyOutcome::Reader(outcome)) => {
            report.reader = outcome.stats;
            ("reader", outcome.result)
        }
        Ok(DutyOutcome::Uplink(outcome)) => {
            report.uplink = outcome.stats;
            ("uplink", outcome.result)
        }
        Ok(DutyOutcome::Downlink(outcome)) => {
            report.downlink = outcome.stats;
            ("downlink", outcome.result)
        }
        Err(err) => {
            warn!(error = %err, "Duty task failed");
            return Some(SessionEnd::Aborted(err.to_string()));
        }
    };

    match result {
        Ok(DutyExit::Completed) if duty == "reader" => {
            debug!(duty, "Duty finished");
            Some(SessionEnd::Completed)
        }
        Ok(exit) => {
            debug!(duty, exit = ?exit, "Duty finished");
            None
        }
        Err(err) => {
            debug!(duty, error = %err, "Duty ended with error");
            Some(SessionEnd::from(err))
        }
    }
}

async fn drain(
    duties: &mut JoinSet<DutyOutcome>,
    report: &mut SessionReport,
    end: &mut Option<SessionEnd>,
) {
    while let Some(joined) = duties.join_next().await {
        let cause = record(report, joined);
        if end.is_none() {
            *end = cause;
        }
    }
}

fn log_report(report: &SessionReport) {
    debug!(
        session_id = %report.session_id,
        started_at = %report.started_at.to_rfc3339(),
        media_events = report.reader.media_events,
        bytes_received = report.reader.bytes_received,
        blocks_enqueued = report.reader.blocks_enqueued,
        bytes_discarded = report.reader.bytes_discarded,
        agent_events = report.downlink.events_received,
        "Call session statistics"
    );

    let stream_sid = report.stream_sid.as_deref().unwrap_or("-");
    let duration_ms = report.duration.as_millis() as u64;
    if report.end.is_failure() {
        warn!(
            stream_sid,
            duration_ms,
            blocks_forwarded = report.uplink.blocks_sent,
            media_sent = report.downlink.media_sent,
            end = %report.end,
            "Call session closed"
        );
    } else {
        info!(
            stream_sid,
            duration_ms,
            blocks_forwarded = report.uplink.blocks_sent,
            media_sent = report.downlink.media_sent,
            barge_ins = report.downlink.clears_sent,
            end = %report.end,
            "Call session closed"
        );
    }
}
