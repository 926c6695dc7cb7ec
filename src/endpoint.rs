// Server endpoint: transports, dispatch, routing, admission and the
// process-wide component registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::auth::{build_challenge, DigestCredentials, NonceAuthority, NonceStatus};
use crate::call::{
    spawn_inbound, spawn_outbound, CallCommand, CallContext, CallHandle, InboundCallSetup,
    OutboundCallSetup,
};
use crate::config::ServerConfig;
use crate::dialog::{Dialog, DialogManager};
use crate::message::response_for;
use crate::ports::PortAllocator;
use crate::registrar::{AuthOutcome, BlockedNumbers, LocationStore, UserStore};
use crate::sdp::{build_offer, negotiate_offer, SdpParser};
use crate::transaction::{Transaction, TransactionEvent, TransactionManager, TransactionUser};
use crate::transport::{MessageHandler, Transport, UdpTransport};
use crate::trunks::TrunkStore;
use crate::{
    extract_tag, extract_uri, generate_branch, generate_call_id, generate_tag, CallId, CallState,
    EndReason, Error, EventBus, HeaderName, Result, ServerEvent, SipMessage, SipMethod, SipUri,
    TransactionId, ViaHeader,
};

const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER, MESSAGE";

// Global and per-user concurrent call accounting. Admission failures never
// touch the counters; the guard decrements exactly once on drop.
pub struct CallCounters {
    global: AtomicUsize,
    total_handled: AtomicU64,
    per_user: StdMutex<HashMap<String, u32>>,
}

impl CallCounters {
    fn new() -> Arc<Self> {
        Arc::new(CallCounters {
            global: AtomicUsize::new(0),
            total_handled: AtomicU64::new(0),
            per_user: StdMutex::new(HashMap::new()),
        })
    }

    pub fn active(&self) -> usize {
        self.global.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total_handled.load(Ordering::Relaxed)
    }

    pub fn active_for(&self, username: &str) -> u32 {
        self.per_user
            .lock()
            .unwrap()
            .get(username)
            .copied()
            .unwrap_or(0)
    }
}

/// RAII admission token for one call.
pub struct CallGuard {
    counters: Arc<CallCounters>,
    username: Option<String>,
    trunk: Option<crate::trunks::TrunkLease>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.counters.global.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref username) = self.username {
            let mut per_user = self.counters.per_user.lock().unwrap();
            if let Some(count) = per_user.get_mut(username) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    per_user.remove(username);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub direction: &'static str,
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub active_calls: usize,
    pub total_calls: u64,
    pub ports_in_use: usize,
    pub open_transactions: usize,
    pub open_dialogs: usize,
}

// Endpoint builder, mirroring the configuration surface
pub struct EndpointBuilder {
    config: ServerConfig,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            config: ServerConfig::default(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn udp_port(mut self, port: u16) -> Self {
        self.config.transport.udp_port = port;
        self
    }

    pub fn media_ip(mut self, ip: std::net::IpAddr) -> Self {
        self.config.media.media_ip = ip;
        self
    }

    pub fn port_range(mut self, range: (u16, u16)) -> Self {
        self.config.media.port_range = range;
        self
    }

    pub fn bridge_url(mut self, url: &str) -> Self {
        self.config.bridge.endpoint_url = url.to_string();
        self
    }

    pub async fn build(self) -> Result<Arc<Endpoint>> {
        Endpoint::new(self.config).await
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Endpoint {
    pub config: Arc<ServerConfig>,
    pub users: Arc<UserStore>,
    pub locations: Arc<LocationStore>,
    pub blocklist: Arc<BlockedNumbers>,
    pub trunks: Arc<TrunkStore>,
    pub events: Arc<EventBus>,
    counters: Arc<CallCounters>,
    transactions: Arc<TransactionManager>,
    dialogs: Arc<DialogManager>,
    ports: Arc<PortAllocator>,
    nonces: NonceAuthority,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    calls: RwLock<HashMap<CallId, CallHandle>>,
    by_sip_call_id: RwLock<HashMap<String, CallId>>,
}

// Incoming messages land here from the transports
struct EndpointMessageHandler {
    endpoint: RwLock<Option<Arc<Endpoint>>>,
}

#[async_trait]
impl MessageHandler for EndpointMessageHandler {
    async fn handle_message(
        &self,
        message: SipMessage,
        source: SocketAddr,
        transport: Arc<dyn Transport>,
    ) {
        let endpoint = self.endpoint.read().await.clone();
        if let Some(endpoint) = endpoint {
            if message.is_request() {
                if let Err(e) = endpoint.handle_request(message, source, transport).await {
                    debug!(error = %e, "request handling failed");
                }
            } else {
                endpoint.handle_response(message).await;
            }
        }
    }
}

// Responses and transaction timeouts route back into calls
struct EndpointTransactionUser {
    endpoint: RwLock<Option<Arc<Endpoint>>>,
}

#[async_trait]
impl TransactionUser for EndpointTransactionUser {
    async fn on_response(&self, _transaction_id: TransactionId, response: SipMessage) {
        let endpoint = self.endpoint.read().await.clone();
        if let Some(endpoint) = endpoint {
            if let Some(call) = endpoint.call_for_message(&response).await {
                let _ = call.command(CallCommand::Response(response)).await;
            }
        }
    }

    async fn on_timeout(&self, transaction_id: TransactionId) {
        debug!(txn = %transaction_id.0, "transaction timed out");
    }
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    async fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let transaction_user = Arc::new(EndpointTransactionUser {
            endpoint: RwLock::new(None),
        });

        let endpoint = Arc::new(Endpoint {
            users: Arc::new(UserStore::new(
                config.auth.max_failed_attempts,
                config.auth.lockout_secs,
            )),
            locations: Arc::new(LocationStore::new()),
            blocklist: Arc::new(BlockedNumbers::new()),
            trunks: Arc::new(TrunkStore::new()),
            events: Arc::new(EventBus::new()),
            counters: CallCounters::new(),
            transactions: TransactionManager::new(transaction_user.clone()),
            dialogs: Arc::new(DialogManager::new()),
            ports: Arc::new(PortAllocator::new(config.media.port_range)),
            nonces: NonceAuthority::new(&config.auth.nonce_secret, config.auth.nonce_window_secs),
            transport: RwLock::new(None),
            calls: RwLock::new(HashMap::new()),
            by_sip_call_id: RwLock::new(HashMap::new()),
            config: Arc::new(config),
        });

        *transaction_user.endpoint.write().await = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Bind the signaling transports and start housekeeping.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let handler = Arc::new(EndpointMessageHandler {
            endpoint: RwLock::new(Some(self.clone())),
        });

        let bind = SocketAddr::new(self.config.transport.bind_ip, self.config.transport.udp_port);
        let udp = UdpTransport::bind(bind).await?;
        udp.clone().start(handler.clone()).await;
        *self.transport.write().await = Some(udp as Arc<dyn Transport>);

        if self.config.transport.tcp_enabled {
            let tcp_bind =
                SocketAddr::new(self.config.transport.bind_ip, self.config.transport.tcp_port);
            let tcp = crate::transport::TcpTransport::bind(tcp_bind).await?;
            tcp.clone().start(handler).await;
        }

        // Reap call handles once their supervisor reports ended
        let endpoint = self.clone();
        let (mut events, _) = self.events.subscribe(256).await;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ServerEvent::CallEnded { call_id, .. } = event {
                    endpoint.forget_call(&call_id).await;
                }
            }
        });

        // Registrar binding sweep
        let locations = self.locations.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(60)).await;
                let removed = locations.sweep().await;
                if removed > 0 {
                    debug!(removed, "expired registrations swept");
                }
            }
        });

        info!(
            udp = %bind,
            media_ip = %self.config.media.media_ip,
            "voicebridge endpoint started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        let calls: Vec<CallHandle> = self.calls.read().await.values().cloned().collect();
        for call in calls {
            let _ = call
                .command(CallCommand::Hangup {
                    reason: EndReason::Shutdown,
                })
                .await;
        }
        if let Some(transport) = self.transport.read().await.clone() {
            transport.stop().await;
        }
        info!("endpoint stopped");
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidState("endpoint not started".to_string()))
    }

    fn call_context(&self, transport: Arc<dyn Transport>) -> CallContext {
        CallContext {
            config: self.config.clone(),
            transactions: self.transactions.clone(),
            dialogs: self.dialogs.clone(),
            transport,
            ports: self.ports.clone(),
            events: self.events.clone(),
        }
    }

    // Request dispatch

    async fn handle_request(
        &self,
        request: SipMessage,
        source: SocketAddr,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        // Retransmissions replay through their existing transaction
        if let Some(existing) = self.transactions.find_for_request(&request).await {
            let _ = existing
                .event_tx
                .send(TransactionEvent::ReceivedRequest(request))
                .await;
            return Ok(());
        }

        let method = match request.method() {
            Some(m) => m,
            None => return Ok(()),
        };

        if !method.is_supported() {
            let transaction = self
                .transactions
                .create_server(request.clone(), transport, source)
                .await?;
            let response = response_for(&request, 501, None);
            let _ = transaction
                .event_tx
                .send(TransactionEvent::SendResponse(response))
                .await;
            return Ok(());
        }

        match method {
            SipMethod::Ack => self.route_to_call(request, None).await,
            SipMethod::Cancel => self.handle_cancel(request, source, transport).await,
            SipMethod::Invite => {
                let transaction = self
                    .transactions
                    .create_server(request.clone(), transport.clone(), source)
                    .await?;
                let trying = response_for(&request, 100, None);
                let _ = transaction
                    .event_tx
                    .send(TransactionEvent::SendResponse(trying))
                    .await;

                let in_dialog = request.get_to().and_then(|t| extract_tag(t)).is_some();
                if in_dialog {
                    self.route_to_call(request, Some(transaction)).await
                } else {
                    self.handle_new_invite(request, source, transport, transaction)
                        .await
                }
            }
            SipMethod::Bye => {
                let transaction = self
                    .transactions
                    .create_server(request.clone(), transport, source)
                    .await?;
                self.route_to_call(request, Some(transaction)).await
            }
            SipMethod::Options => {
                let transaction = self
                    .transactions
                    .create_server(request.clone(), transport, source)
                    .await?;
                let mut response = response_for(&request, 200, None);
                response
                    .headers
                    .set(HeaderName::new(HeaderName::ALLOW), ALLOWED_METHODS.to_string());
                response.headers.set(
                    HeaderName::new(HeaderName::SUPPORTED),
                    ALLOWED_METHODS.to_string(),
                );
                response.headers.set(
                    HeaderName::new("Accept"),
                    "application/sdp".to_string(),
                );
                let _ = transaction
                    .event_tx
                    .send(TransactionEvent::SendResponse(response))
                    .await;
                Ok(())
            }
            SipMethod::Register => {
                let transaction = self
                    .transactions
                    .create_server(request.clone(), transport, source)
                    .await?;
                self.handle_register(request, source, transaction).await
            }
            SipMethod::Message => {
                let transaction = self
                    .transactions
                    .create_server(request.clone(), transport, source)
                    .await?;
                self.handle_message_request(request, transaction).await
            }
            _ => Ok(()),
        }
    }

    async fn handle_response(&self, response: SipMessage) {
        if let Some(transaction) = self.transactions.find_for_response(&response).await {
            let _ = transaction
                .event_tx
                .send(TransactionEvent::ReceivedResponse(response))
                .await;
        } else {
            // 2xx retransmissions for terminated INVITE transactions still
            // need their ACK; the owning call sees them by Call-ID
            if response.get_cseq().map(|c| c.method) == Some(SipMethod::Invite) {
                if let Some(call) = self.call_for_message(&response).await {
                    let _ = call.command(CallCommand::Response(response)).await;
                    return;
                }
            }
            debug!("response without matching transaction dropped");
        }
    }

    async fn handle_cancel(
        &self,
        request: SipMessage,
        source: SocketAddr,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        let transaction = self
            .transactions
            .create_server(request.clone(), transport, source)
            .await?;

        // Does the CANCEL match a pending INVITE transaction?
        let branch = request.get_via().map(|v| v.branch).unwrap_or_default();
        let invite_txn = self
            .transactions
            .find(&TransactionId::new(&SipMethod::Invite, &branch))
            .await;

        let status = if invite_txn.is_some() { 200 } else { 481 };
        let response = response_for(&request, status, None);
        let _ = transaction
            .event_tx
            .send(TransactionEvent::SendResponse(response))
            .await;

        if invite_txn.is_some() {
            if let Some(call) = self.call_for_message(&request).await {
                let _ = call.command(CallCommand::Cancel).await;
            }
        }
        Ok(())
    }

    async fn handle_new_invite(
        &self,
        request: SipMessage,
        source: SocketAddr,
        transport: Arc<dyn Transport>,
        transaction: Arc<Transaction>,
    ) -> Result<()> {
        let from_user = request
            .get_from()
            .and_then(|f| extract_uri(f).ok())
            .and_then(|u| u.user)
            .unwrap_or_default();
        let to_user = request
            .request_uri()
            .and_then(|u| u.user.clone())
            .or_else(|| {
                request
                    .get_to()
                    .and_then(|t| extract_uri(t).ok())
                    .and_then(|u| u.user)
            })
            .unwrap_or_default();

        // Policy gate before anything else
        if self.blocklist.is_blocked(&from_user).await || self.blocklist.is_blocked(&to_user).await
        {
            warn!(from = %from_user, to = %to_user, "blocked number");
            reject_with(&transaction, &request, 403).await;
            return Ok(());
        }

        // Routing: local caller legs are redirected; external callers reach
        // the AI bridge
        if self.users.get(&from_user).await.is_some() {
            return self
                .handle_local_caller_invite(request, transaction, &from_user, &to_user)
                .await;
        }

        // Admission for the AI leg
        let guard = match self.admit(None).await {
            Ok(guard) => guard,
            Err(e) => {
                reject_with(&transaction, &request, e.sip_status()).await;
                return Ok(());
            }
        };

        // Offer/answer
        let offer = match request
            .body
            .as_ref()
            .filter(|b| b.content_type.contains("application/sdp"))
            .and_then(|b| b.as_str().ok())
            .map(SdpParser::parse)
        {
            Some(Ok(offer)) => offer,
            Some(Err(_)) | None => {
                reject_with(&transaction, &request, 400).await;
                return Ok(());
            }
        };
        let negotiated = match negotiate_offer(&offer) {
            Ok(n) => n,
            Err(_) => {
                reject_with(&transaction, &request, 488).await;
                return Ok(());
            }
        };

        let ports = match self.ports.acquire() {
            Ok(pair) => pair,
            Err(_) => {
                warn!("media port range exhausted");
                reject_with(&transaction, &request, 503).await;
                return Ok(());
            }
        };

        let local_tag = generate_tag();
        let dialog = match Dialog::from_request(&request, &local_tag, source) {
            Ok(d) => d,
            Err(_) => {
                self.ports.release(ports.rtp);
                reject_with(&transaction, &request, 400).await;
                return Ok(());
            }
        };
        let dialog = self.dialogs.insert(dialog).await;

        let answer = crate::sdp::build_answer(self.config.media.media_ip, ports.rtp, &negotiated);
        let call_id = CallId(generate_call_id());

        self.counters.total_handled.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_inbound(
            self.call_context(transport),
            InboundCallSetup {
                call_id: call_id.clone(),
                invite: request,
                transaction,
                dialog,
                negotiated,
                ports,
                answer_sdp: answer.to_sdp(),
                from_number: from_user,
                to_number: to_user,
            },
            guard,
        );
        self.remember_call(handle).await;
        info!(call_id = %call_id, "inbound call admitted");
        Ok(())
    }

    /// A provisioned local user is calling: authenticate, then redirect to
    /// the registered contact (local callee) or out through a trunk.
    async fn handle_local_caller_invite(
        &self,
        request: SipMessage,
        transaction: Arc<Transaction>,
        from_user: &str,
        to_user: &str,
    ) -> Result<()> {
        let respond = |response: SipMessage| {
            let transaction = transaction.clone();
            async move {
                let _ = transaction
                    .event_tx
                    .send(TransactionEvent::SendResponse(response))
                    .await;
            }
        };

        match self.authenticate(&request, "INVITE").await {
            AuthResult::Authorized(_) => {}
            AuthResult::Challenge { stale } => {
                let mut response = response_for(&request, 401, Some(&generate_tag()));
                response.headers.set(
                    HeaderName::new(HeaderName::WWW_AUTHENTICATE),
                    build_challenge(&self.config.auth.realm, &self.nonces.mint(), stale),
                );
                respond(response).await;
                return Ok(());
            }
            AuthResult::Forbidden => {
                respond(response_for(&request, 403, Some(&generate_tag()))).await;
                return Ok(());
            }
        }

        // Registered local callee: redirect the caller to the binding
        if let Some(contact) = self.locations.contact_for(to_user).await {
            let mut response = response_for(&request, 302, Some(&generate_tag()));
            response.headers.set(
                HeaderName::new(HeaderName::CONTACT),
                format!("<{}>", contact),
            );
            respond(response).await;
            debug!(from = from_user, to = to_user, "local call redirected to binding");
            return Ok(());
        }

        // Otherwise egress through a trunk, subject to its caps and rate
        match self.trunks.select_outbound().await {
            Ok(lease) => {
                let mut target = SipUri::new(&lease.trunk.proxy_address).with_user(to_user);
                target.port = Some(lease.trunk.proxy_port);
                let mut response = response_for(&request, 302, Some(&generate_tag()));
                response.headers.set(
                    HeaderName::new(HeaderName::CONTACT),
                    format!("<{}>", target),
                );
                respond(response).await;
                debug!(trunk = %lease.trunk.id, to = to_user, "outbound call redirected to trunk");
            }
            Err(_) => {
                let mut response = response_for(&request, 503, Some(&generate_tag()));
                response
                    .headers
                    .set(HeaderName::new(HeaderName::RETRY_AFTER), "60".to_string());
                respond(response).await;
            }
        }
        Ok(())
    }

    async fn handle_register(
        &self,
        request: SipMessage,
        source: SocketAddr,
        transaction: Arc<Transaction>,
    ) -> Result<()> {
        let respond = |response: SipMessage| {
            let transaction = transaction.clone();
            async move {
                let _ = transaction
                    .event_tx
                    .send(TransactionEvent::SendResponse(response))
                    .await;
            }
        };

        let aor = match request
            .get_to()
            .and_then(|t| extract_uri(t).ok())
            .and_then(|u| u.user)
        {
            Some(user) => user,
            None => {
                respond(response_for(&request, 400, None)).await;
                return Ok(());
            }
        };

        let username = match self.authenticate(&request, "REGISTER").await {
            AuthResult::Authorized(username) => username,
            AuthResult::Challenge { stale } => {
                let mut response = response_for(&request, 401, None);
                response.headers.set(
                    HeaderName::new(HeaderName::WWW_AUTHENTICATE),
                    build_challenge(&self.config.auth.realm, &self.nonces.mint(), stale),
                );
                respond(response).await;
                return Ok(());
            }
            AuthResult::Forbidden => {
                respond(response_for(&request, 403, None)).await;
                return Ok(());
            }
        };

        // Third-party registration is not allowed
        if username != aor {
            respond(response_for(&request, 403, None)).await;
            return Ok(());
        }

        let default_expires = request
            .headers
            .get(HeaderName::EXPIRES)
            .and_then(|e| e.parse::<u32>().ok())
            .unwrap_or(self.config.auth.registration_max_expires);

        let contacts = request
            .headers
            .get_all(HeaderName::CONTACT)
            .cloned()
            .unwrap_or_default();

        if contacts.iter().any(|c| c.trim() == "*") {
            if default_expires == 0 {
                self.locations.clear(&aor).await;
            } else {
                // `Contact: *` is only valid for full deregistration
                respond(response_for(&request, 400, None)).await;
                return Ok(());
            }
        } else {
            for contact_value in &contacts {
                let contact = match crate::ContactHeader::parse(contact_value) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let expires = contact
                    .expires
                    .unwrap_or(default_expires)
                    .min(self.config.auth.registration_max_expires);
                self.locations
                    .update(
                        &aor,
                        &contact.uri.to_string(),
                        expires,
                        request.headers.get(HeaderName::USER_AGENT).cloned(),
                        source.ip(),
                    )
                    .await;
            }
        }

        let bindings = self.locations.lookup(&aor).await;
        let mut response = response_for(&request, 200, None);
        for binding in &bindings {
            let remaining = (binding.expires_at - Utc::now()).num_seconds().max(0);
            response.headers.add(
                HeaderName::new(HeaderName::CONTACT),
                format!("<{}>;expires={}", binding.contact_uri, remaining),
            );
        }
        respond(response).await;

        self.events
            .publish(ServerEvent::RegistrationUpdated {
                aor: aor.clone(),
                contacts: bindings.len(),
            })
            .await;
        Ok(())
    }

    async fn handle_message_request(
        &self,
        request: SipMessage,
        transaction: Arc<Transaction>,
    ) -> Result<()> {
        let from = request
            .get_from()
            .and_then(|f| extract_uri(f).ok())
            .and_then(|u| u.user)
            .unwrap_or_default();
        let to = request
            .request_uri()
            .and_then(|u| u.user.clone())
            .unwrap_or_default();

        if self.blocklist.is_blocked(&from).await {
            let response = response_for(&request, 403, None);
            let _ = transaction
                .event_tx
                .send(TransactionEvent::SendResponse(response))
                .await;
            return Ok(());
        }

        // Local senders must authenticate, like any origination
        if self.users.get(&from).await.is_some() {
            match self.authenticate(&request, "MESSAGE").await {
                AuthResult::Authorized(_) => {}
                AuthResult::Challenge { stale } => {
                    let mut response = response_for(&request, 401, None);
                    response.headers.set(
                        HeaderName::new(HeaderName::WWW_AUTHENTICATE),
                        build_challenge(&self.config.auth.realm, &self.nonces.mint(), stale),
                    );
                    let _ = transaction
                        .event_tx
                        .send(TransactionEvent::SendResponse(response))
                        .await;
                    return Ok(());
                }
                AuthResult::Forbidden => {
                    let response = response_for(&request, 403, None);
                    let _ = transaction
                        .event_tx
                        .send(TransactionEvent::SendResponse(response))
                        .await;
                    return Ok(());
                }
            }
        }

        let body = request
            .body
            .as_ref()
            .and_then(|b| b.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let response = response_for(&request, 202, None);
        let _ = transaction
            .event_tx
            .send(TransactionEvent::SendResponse(response))
            .await;

        self.events
            .publish(ServerEvent::SmsReceived {
                from: from.clone(),
                to: to.clone(),
                body: body.clone(),
            })
            .await;

        // Delivery out rides the same trunk selection as calls
        if self.users.get(&to).await.is_none() {
            if let Ok(lease) = self.trunks.select_outbound().await {
                if let Err(e) = self.forward_message(&to, &from, &body, &lease).await {
                    warn!(error = %e, "MESSAGE forward failed");
                }
            }
        }
        Ok(())
    }

    async fn forward_message(
        &self,
        to: &str,
        from: &str,
        body: &str,
        lease: &crate::trunks::TrunkLease,
    ) -> Result<()> {
        let transport = self.transport().await?;
        let local = transport.local_addr();

        let mut target_uri = SipUri::new(&lease.trunk.proxy_address).with_user(to);
        target_uri.port = Some(lease.trunk.proxy_port);

        let mut message = SipMessage::new_request(SipMethod::Message, target_uri);
        message.add_via(&ViaHeader::new(
            "UDP",
            &local.ip().to_string(),
            local.port(),
            &generate_branch(),
        ));
        message.headers.set(
            HeaderName::new(HeaderName::FROM),
            format!("<sip:{}@{}>;tag={}", from, self.config.auth.realm, generate_tag()),
        );
        message.headers.set(
            HeaderName::new(HeaderName::TO),
            format!("<sip:{}@{}>", to, lease.trunk.proxy_address),
        );
        message
            .headers
            .set(HeaderName::new(HeaderName::CALL_ID), generate_call_id());
        message
            .headers
            .set(HeaderName::new(HeaderName::CSEQ), "1 MESSAGE".to_string());
        message.set_body("text/plain", body.as_bytes().to_vec());

        let target: SocketAddr = tokio::net::lookup_host(lease.trunk.proxy_target())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .next()
            .ok_or_else(|| Error::Transport("trunk address unresolvable".to_string()))?;

        let transaction = self
            .transactions
            .create_client(message, transport, target)
            .await?;
        let _ = transaction.event_tx.send(TransactionEvent::SendRequest).await;
        Ok(())
    }

    // Authentication (digest, with lockout semantics)

    async fn authenticate(&self, request: &SipMessage, method: &str) -> AuthResult {
        let credentials = request
            .headers
            .get(HeaderName::AUTHORIZATION)
            .and_then(|h| DigestCredentials::parse(h).ok());

        let credentials = match credentials {
            Some(c) => c,
            None => return AuthResult::Challenge { stale: false },
        };

        match self.users.admission(&credentials.username).await {
            AuthOutcome::Locked => return AuthResult::Forbidden,
            AuthOutcome::UnknownUser => return AuthResult::Challenge { stale: false },
            _ => {}
        }

        let user = match self.users.get(&credentials.username).await {
            Some(u) => u,
            None => return AuthResult::Challenge { stale: false },
        };

        let nonce_status = self.nonces.verify(&credentials.nonce);
        if nonce_status == NonceStatus::Invalid {
            return AuthResult::Challenge { stale: false };
        }

        if !credentials.verify(&user.ha1, method) {
            // The attempt that trips the lock still gets its 401; only the
            // next one sees 403
            return match self.users.record_auth_failure(&credentials.username).await {
                AuthOutcome::Locked => AuthResult::Forbidden,
                _ => AuthResult::Challenge { stale: false },
            };
        }

        // Correct credentials on an expired nonce: fresh challenge, stale
        if nonce_status == NonceStatus::Stale {
            return AuthResult::Challenge { stale: true };
        }

        self.users.record_auth_success(&credentials.username).await;
        AuthResult::Authorized(credentials.username)
    }

    // Admission control

    async fn admit(&self, username: Option<&str>) -> Result<CallGuard> {
        let active = self.counters.global.load(Ordering::Relaxed);
        if active >= self.config.limits.max_calls {
            return Err(Error::CapacityExceeded("global call limit".to_string()));
        }

        if let Some(username) = username {
            let user = self
                .users
                .get(username)
                .await
                .ok_or_else(|| Error::Policy("unknown user".to_string()))?;
            let mut per_user = self.counters.per_user.lock().unwrap();
            let count = per_user.entry(username.to_string()).or_insert(0);
            if *count >= user.max_concurrent_calls {
                return Err(Error::Policy(format!("user {} at call limit", username)));
            }
            *count += 1;
        }

        self.counters.global.fetch_add(1, Ordering::Relaxed);
        Ok(CallGuard {
            counters: self.counters.clone(),
            username: username.map(|s| s.to_string()),
            trunk: None,
        })
    }

    // Call registry plumbing

    async fn remember_call(&self, handle: CallHandle) {
        self.by_sip_call_id
            .write()
            .await
            .insert(handle.sip_call_id.clone(), handle.id.clone());
        self.calls.write().await.insert(handle.id.clone(), handle);
    }

    async fn forget_call(&self, call_id: &CallId) {
        if let Some(handle) = self.calls.write().await.remove(call_id) {
            self.by_sip_call_id.write().await.remove(&handle.sip_call_id);
        }
    }

    async fn call_for_message(&self, message: &SipMessage) -> Option<CallHandle> {
        let sip_call_id = message.get_call_id()?;
        let call_id = self.by_sip_call_id.read().await.get(sip_call_id).cloned()?;
        self.calls.read().await.get(&call_id).cloned()
    }

    async fn route_to_call(
        &self,
        request: SipMessage,
        transaction: Option<Arc<Transaction>>,
    ) -> Result<()> {
        match self.call_for_message(&request).await {
            Some(call) => {
                // In-dialog CSeq ordering is enforced before delivery
                if let (Some(dialog), Some(cseq)) = (
                    self.dialogs.find_for_request(&request).await,
                    request.get_cseq(),
                ) {
                    if request.method() != Some(SipMethod::Ack) {
                        let mut dialog = dialog.write().await;
                        if dialog.check_remote_cseq(cseq.sequence).is_err() {
                            if let Some(txn) = transaction {
                                let response = response_for(&request, 500, None);
                                let _ = txn
                                    .event_tx
                                    .send(TransactionEvent::SendResponse(response))
                                    .await;
                            }
                            return Ok(());
                        }
                    }
                }
                call.command(CallCommand::Request { request, transaction })
                    .await
            }
            None => {
                if let Some(txn) = transaction {
                    let response = response_for(&request, 481, None);
                    let _ = txn
                        .event_tx
                        .send(TransactionEvent::SendResponse(response))
                        .await;
                }
                Ok(())
            }
        }
    }

    // Administrative surface (consumed by the external REST collaborator)

    /// Place an outbound call through a trunk and bridge it to the AI.
    pub async fn initiate_call(
        &self,
        from_number: &str,
        to_number: &str,
    ) -> Result<CallId> {
        self.blocklist.check(to_number).await?;

        // Calls placed on behalf of a provisioned user count against that
        // user's concurrency cap
        let username = if self.users.get(from_number).await.is_some() {
            Some(from_number)
        } else {
            None
        };

        let lease = self.trunks.select_outbound().await?;
        let mut guard = self.admit(username).await?;
        guard.trunk = Some(lease);
        let lease_trunk = guard.trunk.as_ref().unwrap().trunk.clone();

        let ports = self.ports.acquire()?;
        let transport = self.transport().await?;
        let local = transport.local_addr();
        let local_ip = if local.ip().is_unspecified() {
            self.config.media.media_ip
        } else {
            local.ip()
        };

        let mut request_uri = SipUri::new(&lease_trunk.proxy_address).with_user(to_number);
        request_uri.port = Some(lease_trunk.proxy_port);

        let mut invite = SipMessage::new_request(SipMethod::Invite, request_uri);
        invite.add_via(&ViaHeader::new(
            "UDP",
            &local_ip.to_string(),
            local.port(),
            &generate_branch(),
        ));
        invite.headers.set(
            HeaderName::new(HeaderName::FROM),
            format!(
                "<sip:{}@{}>;tag={}",
                from_number,
                self.config.auth.realm,
                generate_tag()
            ),
        );
        invite.headers.set(
            HeaderName::new(HeaderName::TO),
            format!("<sip:{}@{}>", to_number, lease_trunk.proxy_address),
        );
        let sip_call_id = generate_call_id();
        invite
            .headers
            .set(HeaderName::new(HeaderName::CALL_ID), sip_call_id);
        invite
            .headers
            .set(HeaderName::new(HeaderName::CSEQ), "1 INVITE".to_string());
        invite.headers.set(
            HeaderName::new(HeaderName::CONTACT),
            format!("<sip:voicebridge@{}:{}>", local_ip, local.port()),
        );
        let offer = build_offer(self.config.media.media_ip, ports.rtp);
        invite.set_body("application/sdp", offer.to_sdp().into_bytes());

        let target: SocketAddr = tokio::net::lookup_host(lease_trunk.proxy_target())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .next()
            .ok_or_else(|| Error::Transport("trunk address unresolvable".to_string()))?;

        let call_id = CallId(generate_call_id());
        self.counters.total_handled.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_outbound(
            self.call_context(transport),
            OutboundCallSetup {
                call_id: call_id.clone(),
                invite,
                target,
                ports,
                from_number: from_number.to_string(),
                to_number: to_number.to_string(),
                credentials: lease_trunk.credentials.clone(),
            },
            guard,
        );
        self.remember_call(handle).await;
        info!(call_id = %call_id, to = to_number, "outbound call started");
        Ok(call_id)
    }

    pub async fn terminate_call(&self, call_id: &CallId) -> Result<()> {
        let call = self
            .calls
            .read()
            .await
            .get(call_id)
            .cloned()
            .ok_or_else(|| Error::InvalidState("no such call".to_string()))?;
        call.command(CallCommand::Hangup {
            reason: EndReason::Normal,
        })
        .await
    }

    pub async fn list_calls(&self) -> Vec<CallSummary> {
        let calls = self.calls.read().await;
        let mut out = Vec::with_capacity(calls.len());
        for handle in calls.values() {
            out.push(CallSummary {
                call_id: handle.id.0.clone(),
                from: handle.from.clone(),
                to: handle.to.clone(),
                direction: handle.direction.as_str(),
                state: handle.current_state().await.as_str(),
                created_at: handle.created_at,
            });
        }
        out
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            active_calls: self.calls.read().await.len(),
            total_calls: self.counters.total(),
            ports_in_use: self.ports.in_use_count(),
            open_transactions: self.transactions.count().await,
            open_dialogs: self.dialogs.count().await,
        }
    }

    pub async fn get_call_state(&self, call_id: &CallId) -> Option<CallState> {
        let calls = self.calls.read().await;
        let handle = calls.get(call_id)?;
        Some(handle.current_state().await)
    }
}

async fn reject_with(transaction: &Arc<Transaction>, request: &SipMessage, status: u16) {
    let response = response_for(request, status, Some(&generate_tag()));
    let _ = transaction
        .event_tx
        .send(TransactionEvent::SendResponse(response))
        .await;
}

enum AuthResult {
    Authorized(String),
    Challenge { stale: bool },
    Forbidden,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::compute_ha1;
    use crate::message::SipParser;
    use crate::registrar::SipUser;
    use tokio::net::UdpSocket;

    async fn test_endpoint() -> Arc<Endpoint> {
        let endpoint = Endpoint::builder()
            .udp_port(0)
            .media_ip("127.0.0.1".parse().unwrap())
            .port_range((40_000, 40_020))
            .build()
            .await
            .unwrap();
        endpoint.clone().start().await.unwrap();
        endpoint
    }

    async fn endpoint_addr(endpoint: &Endpoint) -> SocketAddr {
        let addr = endpoint.transport().await.unwrap().local_addr();
        SocketAddr::new("127.0.0.1".parse().unwrap(), addr.port())
    }

    struct TestUa {
        socket: UdpSocket,
        server: SocketAddr,
    }

    impl TestUa {
        async fn new(server: SocketAddr) -> Self {
            TestUa {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                server,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn send(&self, data: &[u8]) {
            self.socket.send_to(data, self.server).await.unwrap();
        }

        async fn recv(&self) -> SipMessage {
            let mut buf = vec![0u8; 65_535];
            let (size, _) = tokio::time::timeout(
                Duration::from_secs(2),
                self.socket.recv_from(&mut buf),
            )
            .await
            .expect("no response within deadline")
            .unwrap();
            SipParser::parse(&buf[..size]).unwrap().0
        }

        /// Receive until a response with this status arrives.
        async fn recv_status(&self, status: u16) -> SipMessage {
            loop {
                let msg = self.recv().await;
                if msg.status_code() == Some(status) {
                    return msg;
                }
            }
        }
    }

    fn register_request(ua: &TestUa, username: &str, authorization: Option<&str>) -> Vec<u8> {
        let mut raw = format!(
            "REGISTER sip:voicebridge SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:{user}@voicebridge>;tag=regtag\r\n\
             To: <sip:{user}@voicebridge>\r\n\
             Call-ID: reg-{user}-{branch}\r\n\
             CSeq: 1 REGISTER\r\n\
             Contact: <sip:{user}@{addr}>\r\n\
             Expires: 3600\r\n",
            addr = ua.addr(),
            branch = generate_branch(),
            user = username,
        );
        if let Some(auth) = authorization {
            raw.push_str(&format!("Authorization: {}\r\n", auth));
        }
        raw.push_str("Content-Length: 0\r\n\r\n");
        raw.into_bytes()
    }

    fn digest_authorization(
        username: &str,
        password: &str,
        realm: &str,
        nonce: &str,
        method: &str,
        uri: &str,
    ) -> String {
        let ha1 = compute_ha1(username, realm, password);
        let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
        let response = format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)));
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            username, realm, nonce, uri, response
        )
    }

    fn extract_nonce(response: &SipMessage) -> String {
        let challenge = response
            .headers
            .get(HeaderName::WWW_AUTHENTICATE)
            .expect("challenge expected");
        let start = challenge.find("nonce=\"").unwrap() + 7;
        let end = challenge[start..].find('"').unwrap();
        challenge[start..start + end].to_string()
    }

    #[tokio::test]
    async fn test_options_advertises_methods() {
        let endpoint = test_endpoint().await;
        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        let raw = format!(
            "OPTIONS sip:voicebridge SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:probe@elsewhere>;tag=1\r\n\
             To: <sip:voicebridge>\r\n\
             Call-ID: options-1\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n",
            addr = ua.addr(),
            branch = generate_branch(),
        );
        ua.send(raw.as_bytes()).await;

        let response = ua.recv_status(200).await;
        assert!(response.headers.get(HeaderName::ALLOW).unwrap().contains("INVITE"));
        let supported = response.headers.get(HeaderName::SUPPORTED).unwrap();
        assert!(supported.contains("REGISTER"));
        assert!(supported.contains("MESSAGE"));
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_register_digest_flow() {
        let endpoint = test_endpoint().await;
        let realm = endpoint.config.auth.realm.clone();
        endpoint
            .users
            .upsert(SipUser::new("alice", &realm, &compute_ha1("alice", &realm, "secret")))
            .await;

        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        // No credentials: 401 with a fresh challenge
        ua.send(&register_request(&ua, "alice", None)).await;
        let challenge = ua.recv_status(401).await;
        let nonce = extract_nonce(&challenge);
        assert!(!challenge
            .headers
            .get(HeaderName::WWW_AUTHENTICATE)
            .unwrap()
            .contains("stale=true"));

        // Wrong password: 401 again, failure recorded
        let bad = digest_authorization("alice", "wrong", &realm, &nonce, "REGISTER", "sip:voicebridge");
        ua.send(&register_request(&ua, "alice", Some(&bad))).await;
        let challenge2 = ua.recv_status(401).await;
        let nonce2 = extract_nonce(&challenge2);
        assert_eq!(endpoint.users.get("alice").await.unwrap().failed_auth_attempts, 1);

        // Correct password: 200 listing the binding, counter reset
        let good =
            digest_authorization("alice", "secret", &realm, &nonce2, "REGISTER", "sip:voicebridge");
        ua.send(&register_request(&ua, "alice", Some(&good))).await;
        let ok = ua.recv_status(200).await;
        assert!(ok.headers.get(HeaderName::CONTACT).unwrap().contains("alice"));
        assert_eq!(endpoint.users.get("alice").await.unwrap().failed_auth_attempts, 0);

        assert!(!endpoint.locations.lookup("alice").await.is_empty());
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_account_lockout_after_repeated_failures() {
        let endpoint = test_endpoint().await;
        let realm = endpoint.config.auth.realm.clone();
        endpoint
            .users
            .upsert(SipUser::new("bob", &realm, &compute_ha1("bob", &realm, "right")))
            .await;

        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        ua.send(&register_request(&ua, "bob", None)).await;
        let mut nonce = extract_nonce(&ua.recv_status(401).await);

        // Five wrong attempts; the fifth locks the account
        for _ in 0..5 {
            let bad =
                digest_authorization("bob", "wrong", &realm, &nonce, "REGISTER", "sip:voicebridge");
            ua.send(&register_request(&ua, "bob", Some(&bad))).await;
            let response = ua.recv().await;
            match response.status_code() {
                Some(401) => nonce = extract_nonce(&response),
                Some(403) => break,
                other => panic!("unexpected status {:?}", other),
            }
        }

        // Locked now: even correct credentials get 403, no nonce refresh
        let good = digest_authorization("bob", "right", &realm, &nonce, "REGISTER", "sip:voicebridge");
        ua.send(&register_request(&ua, "bob", Some(&good))).await;
        let response = ua.recv_status(403).await;
        assert!(response.headers.get(HeaderName::WWW_AUTHENTICATE).is_none());
        endpoint.stop().await;
    }

    fn invite_request(ua: &TestUa, to: &str, formats: &str, rtpmaps: &str) -> (Vec<u8>, String) {
        let call_id = format!("inv-{}", generate_branch());
        let sdp = format!(
            "v=0\r\n\
             o=ua 1 1 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             c=IN IP4 127.0.0.1\r\n\
             t=0 0\r\n\
             m=audio {} RTP/AVP {}\r\n\
             {}a=sendrecv\r\n",
            ua.addr().port(),
            formats,
            rtpmaps,
        );
        let raw = format!(
            "INVITE sip:{to}@voicebridge SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:+15550100@elsewhere>;tag=callertag\r\n\
             To: <sip:{to}@voicebridge>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:+15550100@{addr}>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {len}\r\n\r\n{sdp}",
            to = to,
            addr = ua.addr(),
            branch = generate_branch(),
            call_id = call_id,
            len = sdp.len(),
            sdp = sdp,
        );
        (raw.into_bytes(), call_id)
    }

    #[tokio::test]
    async fn test_invite_without_g711_rejected_488() {
        let endpoint = test_endpoint().await;
        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        let (raw, _) = invite_request(
            &ua,
            "+15550001",
            "111",
            "a=rtpmap:111 opus/48000/2\r\n",
        );
        ua.send(&raw).await;

        // 100 comes first, then the rejection
        let response = ua.recv_status(488).await;
        assert_eq!(response.status_code(), Some(488));
        assert_eq!(endpoint.ports.in_use_count(), 0);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_blocked_caller_rejected_403() {
        let endpoint = test_endpoint().await;
        endpoint.blocklist.block("+15550100").await;
        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        let (raw, _) = invite_request(&ua, "+15550001", "0", "a=rtpmap:0 PCMU/8000\r\n");
        ua.send(&raw).await;
        ua.recv_status(403).await;
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_port_exhaustion_yields_503() {
        let endpoint = Endpoint::builder()
            .udp_port(0)
            .media_ip("127.0.0.1".parse().unwrap())
            .port_range((41_000, 41_004))
            .build()
            .await
            .unwrap();
        endpoint.clone().start().await.unwrap();
        let server = endpoint_addr(&endpoint).await;

        // Two calls fit in the range; the third must get 503
        let ua1 = TestUa::new(server).await;
        let (raw, _) = invite_request(&ua1, "+15550001", "0", "a=rtpmap:0 PCMU/8000\r\n");
        ua1.send(&raw).await;
        ua1.recv_status(200).await;

        let ua2 = TestUa::new(server).await;
        let (raw, _) = invite_request(&ua2, "+15550001", "0", "a=rtpmap:0 PCMU/8000\r\n");
        ua2.send(&raw).await;
        ua2.recv_status(200).await;

        let ua3 = TestUa::new(server).await;
        let (raw, _) = invite_request(&ua3, "+15550001", "0", "a=rtpmap:0 PCMU/8000\r\n");
        ua3.send(&raw).await;
        ua3.recv_status(503).await;

        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_call_signaling_lifecycle() {
        let endpoint = test_endpoint().await;
        let server = endpoint_addr(&endpoint).await;
        let ua = TestUa::new(server).await;

        let (raw, call_id) = invite_request(&ua, "+15550001", "0 101",
            "a=rtpmap:0 PCMU/8000\r\na=rtpmap:101 telephone-event/8000\r\n");
        ua.send(&raw).await;

        // 100 Trying, 180 Ringing, then 200 with our SDP answer
        let trying = ua.recv().await;
        assert_eq!(trying.status_code(), Some(100));
        let ringing = ua.recv().await;
        assert_eq!(ringing.status_code(), Some(180));
        let ok = ua.recv().await;
        assert_eq!(ok.status_code(), Some(200));

        let answer = SdpParser::parse(ok.body.as_ref().unwrap().as_str().unwrap()).unwrap();
        let audio = answer.audio().unwrap();
        assert!(audio.formats.contains(&"0".to_string()));
        let to_tag = extract_tag(ok.get_to().unwrap()).unwrap();

        // ACK establishes the call
        let ack = format!(
            "ACK sip:voicebridge@{server} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:+15550100@elsewhere>;tag=callertag\r\n\
             To: <sip:+15550001@voicebridge>;tag={to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 ACK\r\n\
             Content-Length: 0\r\n\r\n",
            server = server,
            addr = ua.addr(),
            branch = generate_branch(),
            to_tag = to_tag,
            call_id = call_id,
        );
        ua.send(ack.as_bytes()).await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(endpoint.list_calls().await.len(), 1);
        assert_eq!(endpoint.stats().await.ports_in_use, 1);

        // BYE ends it; resources drain
        let bye = format!(
            "BYE sip:voicebridge@{server} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:+15550100@elsewhere>;tag=callertag\r\n\
             To: <sip:+15550001@voicebridge>;tag={to_tag}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 2 BYE\r\n\
             Content-Length: 0\r\n\r\n",
            server = server,
            addr = ua.addr(),
            branch = generate_branch(),
            to_tag = to_tag,
            call_id = call_id,
        );
        ua.send(bye.as_bytes()).await;
        ua.recv_status(200).await;

        sleep(Duration::from_millis(200)).await;
        assert_eq!(endpoint.list_calls().await.len(), 0);
        assert_eq!(endpoint.stats().await.ports_in_use, 0);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_before_ack_yields_487() {
        let endpoint = test_endpoint().await;
        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        let (raw, call_id) = invite_request(&ua, "+15550001", "0", "a=rtpmap:0 PCMU/8000\r\n");
        // Remember the INVITE branch for the CANCEL
        let invite_text = String::from_utf8(raw.clone()).unwrap();
        let branch_line = invite_text.lines().find(|l| l.starts_with("Via")).unwrap();
        let branch = branch_line.split("branch=").nth(1).unwrap().trim();
        ua.send(&raw).await;
        ua.recv_status(200).await; // answered quickly (100/180 skipped over)

        let cancel = format!(
            "CANCEL sip:+15550001@voicebridge SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:+15550100@elsewhere>;tag=callertag\r\n\
             To: <sip:+15550001@voicebridge>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 CANCEL\r\n\
             Content-Length: 0\r\n\r\n",
            addr = ua.addr(),
            branch = branch,
            call_id = call_id,
        );
        ua.send(cancel.as_bytes()).await;

        // 200 for the CANCEL and 487 for the INVITE, in either order
        let mut saw_ok = false;
        let mut saw_terminated = false;
        for _ in 0..4 {
            let msg = ua.recv().await;
            match msg.status_code() {
                Some(200) => saw_ok = true,
                Some(487) => saw_terminated = true,
                _ => {}
            }
            if saw_ok && saw_terminated {
                break;
            }
        }
        assert!(saw_ok && saw_terminated);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(endpoint.stats().await.ports_in_use, 0);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_unsupported_method_gets_501() {
        let endpoint = test_endpoint().await;
        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        let raw = format!(
            "SUBSCRIBE sip:voicebridge SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:probe@elsewhere>;tag=1\r\n\
             To: <sip:voicebridge>\r\n\
             Call-ID: sub-1\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             Content-Length: 0\r\n\r\n",
            addr = ua.addr(),
            branch = generate_branch(),
        );
        ua.send(raw.as_bytes()).await;
        ua.recv_status(501).await;
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_message_accepted_and_published() {
        let endpoint = test_endpoint().await;
        let (mut events, _) = endpoint.events.subscribe(16).await;
        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        let body = "hello from the PSTN";
        let raw = format!(
            "MESSAGE sip:+15550001@voicebridge SIP/2.0\r\n\
             Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
             From: <sip:+15550100@elsewhere>;tag=sms1\r\n\
             To: <sip:+15550001@voicebridge>\r\n\
             Call-ID: sms-call-1\r\n\
             CSeq: 1 MESSAGE\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {len}\r\n\r\n{body}",
            addr = ua.addr(),
            branch = generate_branch(),
            len = body.len(),
            body = body,
        );
        ua.send(raw.as_bytes()).await;
        ua.recv_status(202).await;

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match events.recv().await {
                    Some(ServerEvent::SmsReceived { from, body, .. }) => break (from, body),
                    Some(_) => continue,
                    None => panic!("bus closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.0, "+15550100");
        assert_eq!(event.1, body);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_outbound_call_and_per_user_cap() {
        let endpoint = test_endpoint().await;
        let realm = endpoint.config.auth.realm.clone();
        let mut carol = SipUser::new("carol", &realm, &compute_ha1("carol", &realm, "pw"));
        carol.max_concurrent_calls = 1;
        endpoint.users.upsert(carol).await;

        // A trunk whose proxy is a local test socket
        let trunk_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let trunk_addr = trunk_sock.local_addr().unwrap();
        endpoint
            .trunks
            .add(crate::trunks::Trunk {
                id: "test-trunk".to_string(),
                proxy_address: "127.0.0.1".to_string(),
                proxy_port: trunk_addr.port(),
                transport: "udp".to_string(),
                credentials: None,
                supports_inbound: true,
                supports_outbound: true,
                max_concurrent_calls: 10,
                calls_per_second_limit: 100.0,
                preferred_codecs: vec![crate::codec::CodecKind::Pcmu],
            })
            .await;

        let call_id = endpoint.initiate_call("carol", "+15557777").await.unwrap();

        // The INVITE with our SDP offer reaches the trunk
        let mut buf = vec![0u8; 65_535];
        let (size, _) = tokio::time::timeout(Duration::from_secs(2), trunk_sock.recv_from(&mut buf))
            .await
            .expect("trunk saw no INVITE")
            .unwrap();
        let (invite, _) = SipParser::parse(&buf[..size]).unwrap();
        assert_eq!(invite.method(), Some(SipMethod::Invite));
        let offer = SdpParser::parse(invite.body.as_ref().unwrap().as_str().unwrap()).unwrap();
        assert!(offer.audio().unwrap().formats.contains(&"0".to_string()));

        // The same user cannot exceed their concurrency cap
        assert!(endpoint.initiate_call("carol", "+15558888").await.is_err());
        assert_eq!(endpoint.counters.active_for("carol"), 1);

        endpoint.terminate_call(&call_id).await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(endpoint.counters.active_for("carol"), 0);
        assert!(endpoint.initiate_call("carol", "+15559999").await.is_ok());
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn test_local_caller_redirected_to_binding() {
        let endpoint = test_endpoint().await;
        let realm = endpoint.config.auth.realm.clone();
        endpoint
            .users
            .upsert(SipUser::new("alice", &realm, &compute_ha1("alice", &realm, "pw")))
            .await;
        endpoint
            .locations
            .update("bob", "sip:bob@192.0.2.44:5060", 600, None, "192.0.2.44".parse().unwrap())
            .await;

        let ua = TestUa::new(endpoint_addr(&endpoint).await).await;

        // First INVITE draws a challenge
        let invite = |auth: Option<String>| {
            let mut raw = format!(
                "INVITE sip:bob@voicebridge SIP/2.0\r\n\
                 Via: SIP/2.0/UDP {addr};branch={branch}\r\n\
                 From: <sip:alice@voicebridge>;tag=alicetag\r\n\
                 To: <sip:bob@voicebridge>\r\n\
                 Call-ID: local-call-1\r\n\
                 CSeq: 1 INVITE\r\n\
                 Contact: <sip:alice@{addr}>\r\n",
                addr = ua.addr(),
                branch = generate_branch(),
            );
            if let Some(a) = auth {
                raw.push_str(&format!("Authorization: {}\r\n", a));
            }
            raw.push_str("Content-Length: 0\r\n\r\n");
            raw.into_bytes()
        };

        ua.send(&invite(None)).await;
        let challenge = ua.recv_status(401).await;
        let nonce = extract_nonce(&challenge);

        let auth =
            digest_authorization("alice", "pw", &realm, &nonce, "INVITE", "sip:bob@voicebridge");
        ua.send(&invite(Some(auth))).await;
        let moved = ua.recv_status(302).await;
        assert!(moved
            .headers
            .get(HeaderName::CONTACT)
            .unwrap()
            .contains("192.0.2.44"));
        endpoint.stop().await;
    }
}
