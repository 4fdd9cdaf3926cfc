//! Offer/answer and trickle-ICE exchange over a persistent text channel.
//!
//! Messages are JSON objects tagged by `__message_type__`: `1` carries a
//! session description, `2` an ICE candidate. Anything else ends the
//! channel.

use crate::error::{Error, Result};
use crate::rtc::CandidateHandler;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

const TYPE_FIELD: &str = "__message_type__";
const OFFER: u64 = 1;
const CANDIDATE: u64 = 2;

/// Transport state reported by the negotiated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

/// The connection a signaling channel negotiates.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Apply a remote offer and return the local answer.
    async fn handle_offer(&self, sdp: String) -> Result<SessionDescriptionMessage>;

    async fn handle_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Idempotent.
    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionMessage {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMessage {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidateMessage {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateMessage> for RTCIceCandidateInit {
    fn from(msg: CandidateMessage) -> Self {
        Self {
            candidate: msg.candidate,
            sdp_mid: msg.sdp_mid,
            sdp_mline_index: msg.sdp_mline_index,
            username_fragment: msg.username_fragment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Description(SessionDescriptionMessage),
    Candidate(CandidateMessage),
}

impl Message {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("malformed message: {e}")))?;
        let kind = value
            .get(TYPE_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Protocol(format!("missing {TYPE_FIELD}")))?;
        let invalid = |e: serde_json::Error| Error::Protocol(format!("invalid message {kind}: {e}"));
        match kind {
            OFFER => Ok(Self::Description(serde_json::from_value(value).map_err(invalid)?)),
            CANDIDATE => Ok(Self::Candidate(serde_json::from_value(value).map_err(invalid)?)),
            other => Err(Error::Protocol(format!("unknown message type {other}"))),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let (kind, mut value) = match self {
            Self::Description(m) => (OFFER, serde_json::to_value(m)?),
            Self::Candidate(m) => (CANDIDATE, serde_json::to_value(m)?),
        };
        if let Value::Object(map) = &mut value {
            map.insert(TYPE_FIELD.to_string(), kind.into());
        }
        Ok(value.to_string())
    }
}

/// Write half of a channel. A failed write cancels the channel.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    pub fn send(&self, msg: &Message) {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "failed to encode signaling message");
                self.cancel.cancel();
                return;
            }
        };
        if self.tx.send(text).is_err() {
            debug!("signaling writer gone");
            self.cancel.cancel();
        }
    }

    /// Forward locally discovered candidates to the browser.
    pub fn candidate_handler(&self) -> CandidateHandler {
        let outbound = self.clone();
        Arc::new(move |init: RTCIceCandidateInit| outbound.send(&Message::Candidate(init.into())))
    }
}

pub struct SignalingChannel {
    negotiator: Arc<dyn Negotiator>,
    outbound: Outbound,
    cancel: CancellationToken,
    state: ChannelState,
}

impl SignalingChannel {
    pub fn new(negotiator: Arc<dyn Negotiator>, outbound: Outbound, cancel: CancellationToken) -> Self {
        Self {
            negotiator,
            outbound,
            cancel,
            state: ChannelState::Open,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn transition(&mut self, next: ChannelState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "signaling state");
            self.state = next;
        }
    }

    /// Process inbound messages in order until the channel ends, then close
    /// the connection. Returns the error that ended the channel, if any.
    pub async fn run<S>(&mut self, mut inbound: S) -> Result<()>
    where
        S: Stream<Item = Result<String>> + Unpin + Send,
    {
        let mut link = self.negotiator.link_state();
        let mut link_alive = true;

        let outcome = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                changed = link.changed(), if link_alive => {
                    if changed.is_err() {
                        link_alive = false;
                        continue;
                    }
                    let state = *link.borrow_and_update();
                    match state {
                        LinkState::Connected => self.transition(ChannelState::Connected),
                        LinkState::Failed => {
                            self.transition(ChannelState::Failed);
                            break Err(Error::Protocol("peer connection failed".into()));
                        }
                        LinkState::Closed => break Ok(()),
                        LinkState::New => {}
                    }
                }
                next = inbound.next() => match next {
                    None => {
                        info!("signaling channel closed by peer");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e),
                    Some(Ok(text)) => {
                        if let Err(e) = self.handle(&text).await {
                            break Err(e);
                        }
                    }
                },
            }
        };

        if let Err(e) = &outcome {
            warn!(err = %e, "closing signaling channel");
        }
        self.cancel.cancel();
        self.negotiator.close().await;
        self.transition(ChannelState::Closed);
        outcome
    }

    /// Errors returned here are fatal to the channel.
    async fn handle(&mut self, text: &str) -> Result<()> {
        if self.state == ChannelState::Open {
            self.transition(ChannelState::Negotiating);
        }
        match Message::parse(text)? {
            Message::Description(offer) => {
                if offer.kind != "offer" {
                    return Err(Error::Protocol(format!("unexpected {} description", offer.kind)));
                }
                match self.negotiator.handle_offer(offer.sdp).await {
                    Ok(answer) => self.outbound.send(&Message::Description(answer)),
                    Err(e) => warn!(err = %e, "failed to answer offer"),
                }
            }
            Message::Candidate(candidate) => {
                debug!(candidate = %candidate.candidate, "remote candidate");
                self.negotiator.handle_candidate(candidate.into()).await?;
            }
        }
        Ok(())
    }
}
