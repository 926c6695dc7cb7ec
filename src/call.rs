// Per-call supervisor: one task owning signaling state, the media session
// and the AI bridge for a single call

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::{answer_challenge, parse_digest_challenge};
use crate::bridge::{BridgeCallInfo, BridgeOut, BridgeSession};
use crate::config::ServerConfig;
use crate::dialog::{Dialog, DialogManager};
use crate::endpoint::CallGuard;
use crate::media::{MediaOut, MediaSession, MediaSessionConfig, MediaStatsSnapshot};
use crate::message::response_for;
use crate::ports::{PortAllocator, PortPair};
use crate::sdp::{negotiate_offer, MediaDirection, NegotiatedAudio, SdpParser};
use crate::transaction::{Transaction, TransactionEvent, TransactionManager};
use crate::transport::Transport;
use crate::trunks::TrunkCredentials;
use crate::{
    generate_branch, generate_tag, CallDirection, CallId, CallState, EndReason, Error, EventBus,
    HeaderName, Result, ServerEvent, SipMessage, SipMethod, SipUri, ViaHeader,
};

/// Call detail record emitted when a call reaches `ended`.
#[derive(Debug, Clone, Serialize)]
pub struct Cdr {
    pub call_id: String,
    pub sip_call_id: String,
    pub from: String,
    pub to: String,
    pub direction: &'static str,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: String,
    pub codec: Option<String>,
    pub media: Option<MediaStatsSnapshot>,
    pub bridge_dropped_frames: u64,
}

/// Commands the endpoint routes into a running call.
#[derive(Debug)]
pub enum CallCommand {
    /// An in-dialog request (ACK, BYE, re-INVITE) with its server
    /// transaction when one exists (ACK has none).
    Request {
        request: SipMessage,
        transaction: Option<Arc<Transaction>>,
    },
    /// A response matched to this call's outbound leg.
    Response(SipMessage),
    /// CANCEL arrived for the pending INVITE.
    Cancel,
    /// Administrative or shutdown teardown.
    Hangup { reason: EndReason },
}

/// Everything a call task needs from the process-wide context.
#[derive(Clone)]
pub struct CallContext {
    pub config: Arc<ServerConfig>,
    pub transactions: Arc<TransactionManager>,
    pub dialogs: Arc<DialogManager>,
    pub transport: Arc<dyn Transport>,
    pub ports: Arc<PortAllocator>,
    pub events: Arc<EventBus>,
}

impl CallContext {
    /// Host we put into Via and Contact headers.
    fn local_host(&self) -> IpAddr {
        let addr = self.transport.local_addr();
        if addr.ip().is_unspecified() {
            self.config.media.media_ip
        } else {
            addr.ip()
        }
    }

    fn local_port(&self) -> u16 {
        self.transport.local_addr().port()
    }

    fn contact_uri(&self) -> SipUri {
        let mut uri = SipUri::new(&self.local_host().to_string()).with_user("voicebridge");
        uri.port = Some(self.local_port());
        uri
    }
}

/// The endpoint's handle to a running call.
#[derive(Clone)]
pub struct CallHandle {
    pub id: CallId,
    pub sip_call_id: String,
    pub from: String,
    pub to: String,
    pub direction: CallDirection,
    pub created_at: DateTime<Utc>,
    pub state: Arc<RwLock<CallState>>,
    cmd_tx: mpsc::Sender<CallCommand>,
}

impl CallHandle {
    pub async fn command(&self, command: CallCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| Error::InvalidState("call task gone".to_string()))
    }

    pub async fn current_state(&self) -> CallState {
        *self.state.read().await
    }
}

pub struct InboundCallSetup {
    pub call_id: CallId,
    pub invite: SipMessage,
    pub transaction: Arc<Transaction>,
    pub dialog: Arc<RwLock<Dialog>>,
    pub negotiated: NegotiatedAudio,
    pub ports: PortPair,
    pub answer_sdp: String,
    pub from_number: String,
    pub to_number: String,
}

pub struct OutboundCallSetup {
    pub call_id: CallId,
    pub invite: SipMessage,
    pub target: SocketAddr,
    pub ports: PortPair,
    pub from_number: String,
    pub to_number: String,
    pub credentials: Option<TrunkCredentials>,
}

struct CallTask {
    ctx: CallContext,
    id: CallId,
    sip_call_id: String,
    direction: CallDirection,
    from_number: String,
    to_number: String,
    created_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    state: Arc<RwLock<CallState>>,
    ports: PortPair,
    cmd_rx: mpsc::Receiver<CallCommand>,
    dialog: Option<Arc<RwLock<Dialog>>>,
    media: Option<Arc<MediaSession>>,
    bridge: Option<Arc<BridgeSession>>,
    codec_name: Option<String>,
    _guard: CallGuard,
}

/// Start the supervisor for an inbound (caller-to-AI) call. The endpoint
/// has already authenticated, admitted and negotiated the call.
pub fn spawn_inbound(ctx: CallContext, setup: InboundCallSetup, guard: CallGuard) -> CallHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let state = Arc::new(RwLock::new(CallState::Init));

    let handle = CallHandle {
        id: setup.call_id.clone(),
        sip_call_id: setup
            .invite
            .get_call_id()
            .cloned()
            .unwrap_or_default(),
        from: setup.from_number.clone(),
        to: setup.to_number.clone(),
        direction: CallDirection::Inbound,
        created_at: Utc::now(),
        state: state.clone(),
        cmd_tx,
    };

    let task = CallTask {
        sip_call_id: handle.sip_call_id.clone(),
        id: setup.call_id.clone(),
        direction: CallDirection::Inbound,
        from_number: setup.from_number.clone(),
        to_number: setup.to_number.clone(),
        created_at: handle.created_at,
        answered_at: None,
        state,
        ports: setup.ports,
        cmd_rx,
        dialog: Some(setup.dialog.clone()),
        media: None,
        bridge: None,
        codec_name: Some(setup.negotiated.codec.name().to_string()),
        ctx,
        _guard: guard,
    };

    tokio::spawn(task.run_inbound(setup));
    handle
}

/// Start the supervisor for an outbound (AI-to-callee) call placed through
/// a trunk.
pub fn spawn_outbound(ctx: CallContext, setup: OutboundCallSetup, guard: CallGuard) -> CallHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let state = Arc::new(RwLock::new(CallState::Init));

    let handle = CallHandle {
        id: setup.call_id.clone(),
        sip_call_id: setup
            .invite
            .get_call_id()
            .cloned()
            .unwrap_or_default(),
        from: setup.from_number.clone(),
        to: setup.to_number.clone(),
        direction: CallDirection::Outbound,
        created_at: Utc::now(),
        state: state.clone(),
        cmd_tx,
    };

    let task = CallTask {
        sip_call_id: handle.sip_call_id.clone(),
        id: setup.call_id.clone(),
        direction: CallDirection::Outbound,
        from_number: setup.from_number.clone(),
        to_number: setup.to_number.clone(),
        created_at: handle.created_at,
        answered_at: None,
        state,
        ports: setup.ports,
        cmd_rx,
        dialog: None,
        media: None,
        bridge: None,
        codec_name: None,
        ctx,
        _guard: guard,
    };

    tokio::spawn(task.run_outbound(setup));
    handle
}

impl CallTask {
    async fn set_state(&self, new_state: CallState) {
        *self.state.write().await = new_state;
        self.ctx
            .events
            .publish(ServerEvent::CallStateChanged {
                call_id: self.id.clone(),
                state: new_state,
            })
            .await;
        if let Some(ref bridge) = self.bridge {
            bridge.send_call_state(new_state.as_str(), None);
        }
    }

    // Inbound call: ring, answer, then bridge until torn down.
    async fn run_inbound(mut self, setup: InboundCallSetup) {
        self.ctx
            .events
            .publish(ServerEvent::CallStarted {
                call_id: self.id.clone(),
                from: self.from_number.clone(),
                to: self.to_number.clone(),
                direction: self.direction.as_str(),
            })
            .await;

        let local_tag = setup.dialog.read().await.id.local_tag.clone();

        // 180, then answer straight away: the AI side is always ready
        let ringing = response_for(&setup.invite, 180, Some(&local_tag));
        let _ = setup
            .transaction
            .event_tx
            .send(TransactionEvent::SendResponse(ringing))
            .await;
        self.set_state(CallState::Ringing).await;

        let mut ok = response_for(&setup.invite, 200, Some(&local_tag));
        ok.headers.set(
            HeaderName::new(HeaderName::CONTACT),
            format!("<{}>", self.ctx.contact_uri()),
        );
        ok.set_body("application/sdp", setup.answer_sdp.clone().into_bytes());
        let _ = setup
            .transaction
            .event_tx
            .send(TransactionEvent::SendResponse(ok.clone()))
            .await;

        // The call is answered when the ACK lands
        let ring_deadline = Instant::now()
            + Duration::from_secs(self.ctx.config.limits.ring_timeout_secs);
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(CallCommand::Request { request, transaction }) => {
                        match request.method() {
                            Some(SipMethod::Ack) => break,
                            Some(SipMethod::Bye) => {
                                if let Some(txn) = transaction {
                                    let bye_ok = response_for(&request, 200, None);
                                    let _ = txn.event_tx
                                        .send(TransactionEvent::SendResponse(bye_ok)).await;
                                }
                                self.finish(EndReason::Normal).await;
                                return;
                            }
                            Some(SipMethod::Invite) => {
                                // Retransmitted INVITE is replayed by the txn
                            }
                            _ => {}
                        }
                    }
                    Some(CallCommand::Cancel) => {
                        let terminated = response_for(&setup.invite, 487, Some(&local_tag));
                        let _ = setup.transaction.event_tx
                            .send(TransactionEvent::SendResponse(terminated)).await;
                        self.finish(EndReason::Cancelled).await;
                        return;
                    }
                    Some(CallCommand::Hangup { reason }) => {
                        self.finish(reason).await;
                        return;
                    }
                    Some(CallCommand::Response(_)) => {}
                    None => {
                        self.finish(EndReason::Shutdown).await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(ring_deadline) => {
                    warn!(call_id = %self.id, "no ACK within ring timeout");
                    self.finish(EndReason::RingTimeout).await;
                    return;
                }
            }
        }

        self.answered_at = Some(Utc::now());
        self.set_state(CallState::Answered).await;
        self.ctx
            .events
            .publish(ServerEvent::CallAnswered {
                call_id: self.id.clone(),
            })
            .await;

        let remote_addr = setup.negotiated.remote_addr;
        match self.start_media_and_bridge(setup.negotiated, remote_addr).await {
            Ok((media_rx, bridge_rx)) => self.supervise(media_rx, bridge_rx).await,
            Err(e) => {
                warn!(call_id = %self.id, error = %e, "failed to start media/bridge");
                self.send_bye().await;
                self.finish(EndReason::MediaSocketError).await;
            }
        }
    }

    // Outbound call: drive the UAC INVITE through the trunk, then bridge.
    async fn run_outbound(mut self, mut setup: OutboundCallSetup) {
        self.ctx
            .events
            .publish(ServerEvent::CallStarted {
                call_id: self.id.clone(),
                from: self.from_number.clone(),
                to: self.to_number.clone(),
                direction: self.direction.as_str(),
            })
            .await;

        let transaction = match self
            .ctx
            .transactions
            .create_client(setup.invite.clone(), self.ctx.transport.clone(), setup.target)
            .await
        {
            Ok(txn) => txn,
            Err(e) => {
                warn!(call_id = %self.id, error = %e, "could not start INVITE transaction");
                self.finish(EndReason::Rejected(500)).await;
                return;
            }
        };
        let _ = transaction.event_tx.send(TransactionEvent::SendRequest).await;

        let ring_deadline = Instant::now()
            + Duration::from_secs(self.ctx.config.limits.ring_timeout_secs);
        let mut auth_retried = false;
        let negotiated;

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(CallCommand::Response(response)) => {
                        let status = response.status_code().unwrap_or(0);
                        match status {
                            100..=179 => {}
                            180..=199 => self.set_state(CallState::Ringing).await,
                            200..=299 => {
                                match self.accept_outbound_answer(&setup.invite, &response, setup.target).await {
                                    Ok(n) => {
                                        negotiated = n;
                                        break;
                                    }
                                    Err(e) => {
                                        warn!(call_id = %self.id, error = %e, "unusable 2xx answer");
                                        self.send_bye().await;
                                        self.finish(EndReason::Rejected(488)).await;
                                        return;
                                    }
                                }
                            }
                            401 | 407 if !auth_retried && setup.credentials.is_some() => {
                                auth_retried = true;
                                match self.retry_with_credentials(&mut setup, &response).await {
                                    Ok(()) => {}
                                    Err(e) => {
                                        warn!(call_id = %self.id, error = %e, "trunk auth failed");
                                        self.finish(EndReason::AuthFailed).await;
                                        return;
                                    }
                                }
                            }
                            300..=699 => {
                                self.finish(EndReason::Rejected(status)).await;
                                return;
                            }
                            _ => {}
                        }
                    }
                    Some(CallCommand::Hangup { reason }) => {
                        self.finish(reason).await;
                        return;
                    }
                    Some(_) => {}
                    None => {
                        self.finish(EndReason::Shutdown).await;
                        return;
                    }
                },
                _ = tokio::time::sleep_until(ring_deadline) => {
                    self.finish(EndReason::RingTimeout).await;
                    return;
                }
            }
        }

        self.answered_at = Some(Utc::now());
        self.set_state(CallState::Answered).await;
        self.ctx
            .events
            .publish(ServerEvent::CallAnswered {
                call_id: self.id.clone(),
            })
            .await;

        let remote_addr = negotiated.remote_addr;
        match self.start_media_and_bridge(negotiated, remote_addr).await {
            Ok((media_rx, bridge_rx)) => self.supervise(media_rx, bridge_rx).await,
            Err(e) => {
                warn!(call_id = %self.id, error = %e, "failed to start media/bridge");
                self.send_bye().await;
                self.finish(EndReason::MediaSocketError).await;
            }
        }
    }

    /// Process the 2xx answer to our INVITE: dialog, ACK, negotiated codec.
    async fn accept_outbound_answer(
        &mut self,
        invite: &SipMessage,
        response: &SipMessage,
        source: SocketAddr,
    ) -> Result<NegotiatedAudio> {
        let body = response
            .body
            .as_ref()
            .ok_or_else(|| Error::Parse("2xx without SDP".to_string()))?;
        let answer = SdpParser::parse(body.as_str()?)?;
        let negotiated = negotiate_offer(&answer)?;
        self.codec_name = Some(negotiated.codec.name().to_string());

        let dialog = Dialog::from_response(invite, response, source)?;
        let dialog_id = dialog.id.clone();
        let entry = self.ctx.dialogs.insert(dialog).await;
        self.dialog = Some(entry);

        // ACK for a 2xx is its own transaction-less message
        let ack = build_ack_for_2xx(invite, response, &self.ctx);
        self.ctx.transport.send(&ack, source).await?;
        debug!(call_id = %self.id, dialog = ?dialog_id, "outbound dialog confirmed");

        Ok(negotiated)
    }

    async fn retry_with_credentials(
        &self,
        setup: &mut OutboundCallSetup,
        challenge_response: &SipMessage,
    ) -> Result<()> {
        let creds = setup.credentials.as_ref().expect("checked by caller");
        let status = challenge_response.status_code().unwrap_or(401);
        let (challenge_header, answer_header) = if status == 407 {
            ("proxy-authenticate", "Proxy-Authorization")
        } else {
            ("www-authenticate", "Authorization")
        };

        let challenge_value = challenge_response
            .headers
            .get(challenge_header)
            .ok_or_else(|| Error::InvalidHeader("challenge without header".to_string()))?;
        let challenge = parse_digest_challenge(challenge_value)?;

        let uri = setup
            .invite
            .request_uri()
            .map(|u| u.to_string())
            .unwrap_or_default();
        let authorization =
            answer_challenge(&creds.username, &creds.password, "INVITE", &uri, &challenge)?;

        // Same call, fresh branch and CSeq
        let mut retry = setup.invite.clone();
        let cseq = retry
            .get_cseq()
            .ok_or_else(|| Error::InvalidHeader("INVITE without CSeq".to_string()))?;
        retry.headers.set(
            HeaderName::new(HeaderName::CSEQ),
            format!("{} INVITE", cseq.sequence + 1),
        );
        retry.headers.remove(HeaderName::VIA);
        retry.add_via(&ViaHeader::new(
            "UDP",
            &self.ctx.local_host().to_string(),
            self.ctx.local_port(),
            &generate_branch(),
        ));
        retry
            .headers
            .set(HeaderName::new(answer_header), authorization);
        setup.invite = retry.clone();

        let transaction = self
            .ctx
            .transactions
            .create_client(retry, self.ctx.transport.clone(), setup.target)
            .await?;
        let _ = transaction.event_tx.send(TransactionEvent::SendRequest).await;
        Ok(())
    }

    async fn start_media_and_bridge(
        &mut self,
        negotiated: NegotiatedAudio,
        remote_addr: SocketAddr,
    ) -> Result<(mpsc::Receiver<MediaOut>, mpsc::Receiver<BridgeOut>)> {
        let (media_tx, media_rx) = mpsc::channel(64);
        let media = MediaSession::start(
            MediaSessionConfig {
                local_ip: self.ctx.config.media.media_ip,
                ports: self.ports,
                remote_addr,
                codec: negotiated.codec,
                dtmf_payload_type: negotiated.dtmf_payload_type,
                jitter_target_ms: self.ctx.config.media.jitter_target_ms,
                jitter_max_late_ms: self.ctx.config.media.jitter_max_late_ms,
                rtp_timeout: Duration::from_secs(self.ctx.config.media.rtp_timeout_secs),
            },
            media_tx,
        )
        .await?;
        self.media = Some(media);

        let (bridge_tx, bridge_rx) = mpsc::channel(64);
        let bridge = BridgeSession::spawn(
            self.ctx.config.bridge.clone(),
            BridgeCallInfo {
                call_id: self.id.clone(),
                from_number: self.from_number.clone(),
                to_number: self.to_number.clone(),
                direction: self.direction,
                codec: negotiated.codec.name().to_string(),
            },
            bridge_tx,
        );
        self.bridge = Some(bridge);

        Ok((media_rx, bridge_rx))
    }

    // Steady state: relay frames between RTP and the AI until teardown.
    async fn supervise(
        mut self,
        mut media_rx: mpsc::Receiver<MediaOut>,
        mut bridge_rx: mpsc::Receiver<BridgeOut>,
    ) {
        let stale_deadline =
            Instant::now() + Duration::from_secs(self.ctx.config.media.max_call_secs);

        loop {
            tokio::select! {
                event = media_rx.recv() => match event {
                    Some(MediaOut::Audio16k(frame)) => {
                        if let Some(ref bridge) = self.bridge {
                            bridge.send_audio(&frame);
                        }
                    }
                    Some(MediaOut::Dtmf(dtmf)) => {
                        let method = match dtmf.method {
                            crate::dtmf::DtmfMethod::Rfc2833 => "rfc2833",
                            crate::dtmf::DtmfMethod::Inband => "inband",
                        };
                        info!(call_id = %self.id, digit = %dtmf.digit.as_char(), method, "DTMF");
                        if let Some(ref bridge) = self.bridge {
                            bridge.send_dtmf(dtmf.digit.as_char(), dtmf.duration_ms, method);
                        }
                        self.ctx.events.publish(ServerEvent::DtmfDetected {
                            call_id: self.id.clone(),
                            digit: dtmf.digit.as_char(),
                            method,
                        }).await;
                    }
                    Some(MediaOut::RtpTimeout) => {
                        warn!(call_id = %self.id, "no RTP ingress; ending call");
                        self.send_bye().await;
                        self.finish(EndReason::RtpTimeout).await;
                        return;
                    }
                    Some(MediaOut::Fatal(reason)) => {
                        warn!(call_id = %self.id, reason, "media failure");
                        self.send_bye().await;
                        self.finish(EndReason::MediaSocketError).await;
                        return;
                    }
                    None => {
                        self.send_bye().await;
                        self.finish(EndReason::MediaSocketError).await;
                        return;
                    }
                },

                event = bridge_rx.recv() => match event {
                    Some(BridgeOut::Streaming) => {
                        if self.current_state().await != CallState::Holding {
                            self.set_state(CallState::Bridged).await;
                        }
                        self.ctx.events.publish(ServerEvent::BridgeStateChanged {
                            call_id: self.id.clone(),
                            state: "streaming",
                        }).await;
                    }
                    Some(BridgeOut::Reconnecting) => {
                        self.ctx.events.publish(ServerEvent::BridgeStateChanged {
                            call_id: self.id.clone(),
                            state: "reconnecting",
                        }).await;
                    }
                    Some(BridgeOut::EgressAudio(pcm)) => {
                        if let Some(ref media) = self.media {
                            media.push_egress_pcm16_16k(&pcm);
                        }
                    }
                    Some(BridgeOut::Hangup) => {
                        info!(call_id = %self.id, "AI requested hangup");
                        self.send_bye().await;
                        self.finish(EndReason::Normal).await;
                        return;
                    }
                    Some(BridgeOut::Transfer(target)) => {
                        // Blind transfer is not part of the media core; the
                        // AI gets a hangup-equivalent completion instead
                        warn!(call_id = %self.id, transfer_to = %target, "transfer requested; not supported, ending");
                        self.send_bye().await;
                        self.finish(EndReason::Normal).await;
                        return;
                    }
                    Some(BridgeOut::DtmfRequest(digit)) => {
                        debug!(call_id = %self.id, %digit, "AI DTMF send request ignored (no egress DTMF)");
                    }
                    Some(BridgeOut::Control(value)) => {
                        debug!(call_id = %self.id, ?value, "control frame");
                    }
                    Some(BridgeOut::AuthFailed) => {
                        warn!(call_id = %self.id, "bridge authentication failed");
                        self.send_bye().await;
                        self.finish(EndReason::AuthFailed).await;
                        return;
                    }
                    Some(BridgeOut::Unrecoverable(reason)) => {
                        warn!(call_id = %self.id, reason, "bridge unrecoverable");
                        self.send_bye().await;
                        self.finish(EndReason::BridgeUnrecoverable).await;
                        return;
                    }
                    Some(BridgeOut::Closed) | None => {
                        self.send_bye().await;
                        self.finish(EndReason::BridgeUnrecoverable).await;
                        return;
                    }
                },

                command = self.cmd_rx.recv() => match command {
                    Some(CallCommand::Request { request, transaction }) => {
                        if self.handle_in_dialog_request(request, transaction).await {
                            return;
                        }
                    }
                    Some(CallCommand::Hangup { reason }) => {
                        self.send_bye().await;
                        self.finish(reason).await;
                        return;
                    }
                    Some(CallCommand::Cancel) | Some(CallCommand::Response(_)) => {}
                    None => {
                        self.send_bye().await;
                        self.finish(EndReason::Shutdown).await;
                        return;
                    }
                },

                _ = tokio::time::sleep_until(stale_deadline) => {
                    warn!(call_id = %self.id, "maximum call duration reached");
                    self.send_bye().await;
                    self.finish(EndReason::Stale).await;
                    return;
                }
            }
        }
    }

    /// Returns true when the call is finished and the task must exit.
    async fn handle_in_dialog_request(
        &mut self,
        request: SipMessage,
        transaction: Option<Arc<Transaction>>,
    ) -> bool {
        match request.method() {
            Some(SipMethod::Bye) => {
                if let Some(txn) = transaction {
                    let ok = response_for(&request, 200, None);
                    let _ = txn.event_tx.send(TransactionEvent::SendResponse(ok)).await;
                }
                self.finish(EndReason::Normal).await;
                true
            }
            Some(SipMethod::Invite) => {
                // re-INVITE: hold / resume via the SDP direction attribute
                self.handle_reinvite(request, transaction).await;
                false
            }
            Some(SipMethod::Ack) => false,
            Some(other) => {
                if let Some(txn) = transaction {
                    let response = response_for(&request, 501, None);
                    let _ = txn
                        .event_tx
                        .send(TransactionEvent::SendResponse(response))
                        .await;
                }
                debug!(call_id = %self.id, method = %other, "in-dialog request not handled");
                false
            }
            None => false,
        }
    }

    async fn handle_reinvite(
        &mut self,
        request: SipMessage,
        transaction: Option<Arc<Transaction>>,
    ) {
        let txn = match transaction {
            Some(t) => t,
            None => return,
        };

        let offer = request
            .body
            .as_ref()
            .and_then(|b| b.as_str().ok())
            .and_then(|s| SdpParser::parse(s).ok());
        let direction = offer
            .as_ref()
            .and_then(|o| o.audio())
            .map(|a| a.direction)
            .unwrap_or(MediaDirection::SendRecv);

        let hold = direction.is_hold();
        if let Some(ref media) = self.media {
            media.set_hold(hold);
        }
        if hold {
            info!(call_id = %self.id, "call holding");
            self.set_state(CallState::Holding).await;
        } else if self.current_state().await == CallState::Holding {
            info!(call_id = %self.id, "call resumed");
            self.set_state(CallState::Bridged).await;
        }

        // Answer with our existing media description, direction mirrored
        let mut answer = crate::sdp::build_answer(
            self.ctx.config.media.media_ip,
            self.ports.rtp,
            &NegotiatedAudio {
                codec: self
                    .codec_name
                    .as_deref()
                    .and_then(crate::codec::CodecKind::from_name)
                    .unwrap_or(crate::codec::CodecKind::Pcmu),
                dtmf_payload_type: None,
                remote_addr: "0.0.0.0:0".parse().unwrap(),
                direction,
            },
        );
        if let Some(media) = answer.media.first_mut() {
            media.direction = match direction {
                MediaDirection::SendOnly => MediaDirection::RecvOnly,
                MediaDirection::Inactive => MediaDirection::Inactive,
                _ => MediaDirection::SendRecv,
            };
        }

        let local_tag = match self.dialog {
            Some(ref dialog) => dialog.read().await.id.local_tag.clone(),
            None => generate_tag(),
        };
        let mut ok = response_for(&request, 200, Some(&local_tag));
        ok.headers.set(
            HeaderName::new(HeaderName::CONTACT),
            format!("<{}>", self.ctx.contact_uri()),
        );
        ok.set_body("application/sdp", answer.to_sdp().into_bytes());
        let _ = txn.event_tx.send(TransactionEvent::SendResponse(ok)).await;
    }

    async fn current_state(&self) -> CallState {
        *self.state.read().await
    }

    /// Send BYE inside the dialog, when one exists.
    async fn send_bye(&self) {
        let dialog = match self.dialog {
            Some(ref d) => d,
            None => return,
        };
        let (bye, remote_addr) = {
            let mut dialog = dialog.write().await;
            let bye = dialog.build_request(
                SipMethod::Bye,
                &self.ctx.local_host().to_string(),
                self.ctx.local_port(),
                &self.ctx.contact_uri(),
            );
            (bye, dialog.remote_addr)
        };

        match self
            .ctx
            .transactions
            .create_client(bye, self.ctx.transport.clone(), remote_addr)
            .await
        {
            Ok(txn) => {
                let _ = txn.event_tx.send(TransactionEvent::SendRequest).await;
            }
            Err(e) => warn!(call_id = %self.id, error = %e, "could not send BYE"),
        }
    }

    // Teardown in reverse construction order: bridge, media (ports), dialog.
    // Runs exactly once; every exit path funnels here.
    async fn finish(&mut self, reason: EndReason) {
        self.set_state(CallState::Ending).await;
        info!(call_id = %self.id, reason = reason.as_str(), "call ending");

        let bridge_dropped = if let Some(bridge) = self.bridge.take() {
            bridge.send_call_state("ended", Some(reason.as_str().to_string()));
            bridge.close();
            bridge.dropped_audio_frames()
        } else {
            0
        };

        let media_stats = if let Some(media) = self.media.take() {
            let stats = media.stats();
            media.stop().await;
            Some(stats)
        } else {
            None
        };

        self.ctx.ports.release(self.ports.rtp);

        if let Some(dialog) = self.dialog.take() {
            let id = dialog.read().await.id.clone();
            self.ctx.dialogs.remove(&id).await;
        }

        let cdr = Cdr {
            call_id: self.id.0.clone(),
            sip_call_id: self.sip_call_id.clone(),
            from: self.from_number.clone(),
            to: self.to_number.clone(),
            direction: self.direction.as_str(),
            created_at: self.created_at,
            answered_at: self.answered_at,
            ended_at: Utc::now(),
            end_reason: reason.as_str().to_string(),
            codec: self.codec_name.clone(),
            media: media_stats,
            bridge_dropped_frames: bridge_dropped,
        };

        *self.state.write().await = CallState::Ended;
        self.ctx
            .events
            .publish(ServerEvent::CallEnded {
                call_id: self.id.clone(),
                cdr: Box::new(cdr),
            })
            .await;
    }
}

/// ACK acknowledging a 2xx: a standalone request in the new dialog.
fn build_ack_for_2xx(invite: &SipMessage, response: &SipMessage, ctx: &CallContext) -> SipMessage {
    let target = response
        .get_contact()
        .map(|c| c.uri)
        .or_else(|| invite.request_uri().cloned())
        .unwrap_or_else(|| SipUri::new("invalid"));

    let mut ack = SipMessage::new_request(SipMethod::Ack, target);
    ack.add_via(&ViaHeader::new(
        "UDP",
        &ctx.local_host().to_string(),
        ctx.local_port(),
        &generate_branch(),
    ));
    if let Some(from) = invite.get_from() {
        ack.headers.set(HeaderName::new(HeaderName::FROM), from.clone());
    }
    if let Some(to) = response.get_to() {
        ack.headers.set(HeaderName::new(HeaderName::TO), to.clone());
    }
    if let Some(call_id) = invite.get_call_id() {
        ack.headers
            .set(HeaderName::new(HeaderName::CALL_ID), call_id.clone());
    }
    if let Some(cseq) = invite.get_cseq() {
        ack.headers.set(
            HeaderName::new(HeaderName::CSEQ),
            format!("{} ACK", cseq.sequence),
        );
    }
    ack.headers
        .set(HeaderName::new(HeaderName::CONTENT_LENGTH), "0".to_string());
    ack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdr_serializes_for_the_audit_sink() {
        let cdr = Cdr {
            call_id: "c1".to_string(),
            sip_call_id: "sip-c1".to_string(),
            from: "+15550100".to_string(),
            to: "+15550001".to_string(),
            direction: "inbound",
            created_at: Utc::now(),
            answered_at: Some(Utc::now()),
            ended_at: Utc::now(),
            end_reason: "normal".to_string(),
            codec: Some("PCMU".to_string()),
            media: None,
            bridge_dropped_frames: 0,
        };
        let json = serde_json::to_value(&cdr).unwrap();
        assert_eq!(json["call_id"], "c1");
        assert_eq!(json["end_reason"], "normal");
        assert_eq!(json["direction"], "inbound");
    }

    #[test]
    fn test_ack_for_2xx_shape() {
        let raw_invite = b"INVITE sip:+15550001@peer SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKout1\r\n\
            From: <sip:vb@10.0.0.1>;tag=ours\r\n\
            To: <sip:+15550001@peer>\r\n\
            Call-ID: out-call-1\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\
            \r\n";
        let raw_ok = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKout1\r\n\
            From: <sip:vb@10.0.0.1>;tag=ours\r\n\
            To: <sip:+15550001@peer>;tag=theirs\r\n\
            Call-ID: out-call-1\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:+15550001@192.0.2.7:5060>\r\n\
            Content-Length: 0\r\n\
            \r\n";
        let invite = crate::SipParser::parse(raw_invite).unwrap().0;
        let ok = crate::SipParser::parse(raw_ok).unwrap().0;

        // A minimal context for header construction only
        // (covered end-to-end in the endpoint tests)
        let cseq = invite.get_cseq().unwrap();
        assert_eq!(cseq.sequence, 1);
        let to_tag = crate::extract_tag(ok.get_to().unwrap());
        assert_eq!(to_tag.as_deref(), Some("theirs"));
    }
}
