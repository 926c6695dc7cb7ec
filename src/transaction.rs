// RFC 3261 transaction layer: the four FSMs and their timers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::{Error, Result, SipMessage, SipMethod, TimerType, TransactionId, Transport, T2_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    // Client
    Calling,
    // Server non-INVITE
    Trying,
    Proceeding,
    Completed,
    /// Server INVITE after a 2xx (RFC 6026): 2xx retransmissions replay here
    /// until Timer L fires.
    Accepted,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

#[derive(Debug)]
pub enum TransactionEvent {
    /// Client: transmit the initial request.
    SendRequest,
    /// Server: the TU supplies a response.
    SendResponse(SipMessage),
    /// Server: a request with this transaction's ID arrived again (or the
    /// ACK to a negative final response).
    ReceivedRequest(SipMessage),
    /// Client: a response matched this transaction.
    ReceivedResponse(SipMessage),
    TimerFired(TimerType),
    Terminate,
}

/// Upcalls to the transaction user (the endpoint / call layer).
#[async_trait]
pub trait TransactionUser: Send + Sync {
    /// A non-retransmitted response reached a client transaction.
    async fn on_response(&self, transaction_id: TransactionId, response: SipMessage);
    /// Timer B/F/H expired without resolution.
    async fn on_timeout(&self, transaction_id: TransactionId);
}

pub struct Transaction {
    pub id: TransactionId,
    pub transaction_type: TransactionType,
    pub request: SipMessage,
    pub remote_addr: SocketAddr,
    pub event_tx: mpsc::Sender<TransactionEvent>,
    state: RwLock<TransactionState>,
    last_response: RwLock<Option<SipMessage>>,
    transport: Arc<dyn Transport>,
    retransmit_count: RwLock<u32>,
    timers: RwLock<HashMap<TimerType, oneshot::Sender<()>>>,
    user: Arc<dyn TransactionUser>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("transaction_type", &self.transaction_type)
            .field("request", &self.request)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state)
            .field("last_response", &self.last_response)
            .field("retransmit_count", &self.retransmit_count)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        request: SipMessage,
        transport: Arc<dyn Transport>,
        remote_addr: SocketAddr,
        event_tx: mpsc::Sender<TransactionEvent>,
        user: Arc<dyn TransactionUser>,
    ) -> Result<Arc<Self>> {
        let method = request
            .method()
            .ok_or_else(|| Error::InvalidState("transaction needs a request".to_string()))?;
        let branch = request
            .get_via()
            .map(|v| v.branch)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::InvalidHeader("request without Via branch".to_string()))?;

        let initial_state = match transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionState::Calling
            }
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };

        Ok(Arc::new(Transaction {
            id: TransactionId::new(&method, &branch),
            transaction_type,
            request,
            remote_addr,
            event_tx,
            state: RwLock::new(initial_state),
            last_response: RwLock::new(None),
            transport,
            retransmit_count: RwLock::new(0),
            timers: RwLock::new(HashMap::new()),
            user,
        }))
    }

    pub async fn state(&self) -> TransactionState {
        *self.state.read().await
    }

    pub async fn is_terminated(&self) -> bool {
        self.state().await == TransactionState::Terminated
    }

    pub async fn last_response(&self) -> Option<SipMessage> {
        self.last_response.read().await.clone()
    }

    async fn handle_event(&self, event: TransactionEvent) -> Result<()> {
        match self.transaction_type {
            TransactionType::ClientInvite => self.client_invite(event).await,
            TransactionType::ClientNonInvite => self.client_non_invite(event).await,
            TransactionType::ServerInvite => self.server_invite(event).await,
            TransactionType::ServerNonInvite => self.server_non_invite(event).await,
        }
    }

    async fn client_invite(&self, event: TransactionEvent) -> Result<()> {
        let state = self.state().await;
        match (state, event) {
            (TransactionState::Calling, TransactionEvent::SendRequest) => {
                self.transport.send(&self.request, self.remote_addr).await?;
                if !self.transport.is_reliable() {
                    self.start_timer(TimerType::TimerA).await;
                }
                self.start_timer(TimerType::TimerB).await;
            }
            (TransactionState::Calling, TransactionEvent::TimerFired(TimerType::TimerA)) => {
                self.retransmit_request(TimerType::TimerA, false).await?;
            }
            (
                TransactionState::Calling | TransactionState::Proceeding,
                TransactionEvent::TimerFired(TimerType::TimerB),
            ) => {
                self.terminate().await;
                self.user.on_timeout(self.id.clone()).await;
            }
            (
                TransactionState::Calling | TransactionState::Proceeding,
                TransactionEvent::ReceivedResponse(response),
            ) => {
                let status = response.status_code().unwrap_or(0);
                self.cancel_timer(TimerType::TimerA).await;
                match status {
                    100..=199 => {
                        self.set_state(TransactionState::Proceeding).await;
                    }
                    200..=299 => {
                        // ACK for a 2xx belongs to the dialog layer
                        self.cancel_timer(TimerType::TimerB).await;
                        self.terminate().await;
                    }
                    _ => {
                        self.cancel_timer(TimerType::TimerB).await;
                        self.send_ack_for(&response).await?;
                        self.set_state(TransactionState::Completed).await;
                        if self.transport.is_reliable() {
                            self.terminate().await;
                        } else {
                            self.start_timer(TimerType::TimerD).await;
                        }
                    }
                }
                self.user.on_response(self.id.clone(), response).await;
            }
            (TransactionState::Completed, TransactionEvent::ReceivedResponse(response)) => {
                // Final response retransmission: re-ACK, no upcall
                self.send_ack_for(&response).await?;
            }
            (TransactionState::Completed, TransactionEvent::TimerFired(TimerType::TimerD)) => {
                self.terminate().await;
            }
            (_, TransactionEvent::Terminate) => self.terminate().await,
            (state, event) => {
                debug!(txn = %self.id.0, ?state, ?event, "event ignored in this state");
            }
        }
        Ok(())
    }

    async fn client_non_invite(&self, event: TransactionEvent) -> Result<()> {
        let state = self.state().await;
        match (state, event) {
            (TransactionState::Calling, TransactionEvent::SendRequest) => {
                self.transport.send(&self.request, self.remote_addr).await?;
                if !self.transport.is_reliable() {
                    self.start_timer(TimerType::TimerE).await;
                }
                self.start_timer(TimerType::TimerF).await;
            }
            (
                TransactionState::Calling | TransactionState::Proceeding,
                TransactionEvent::TimerFired(TimerType::TimerE),
            ) => {
                self.retransmit_request(TimerType::TimerE, true).await?;
            }
            (
                TransactionState::Calling | TransactionState::Proceeding,
                TransactionEvent::TimerFired(TimerType::TimerF),
            ) => {
                self.terminate().await;
                self.user.on_timeout(self.id.clone()).await;
            }
            (
                TransactionState::Calling | TransactionState::Proceeding,
                TransactionEvent::ReceivedResponse(response),
            ) => {
                let status = response.status_code().unwrap_or(0);
                if (100..200).contains(&status) {
                    self.set_state(TransactionState::Proceeding).await;
                } else {
                    self.cancel_timer(TimerType::TimerE).await;
                    self.cancel_timer(TimerType::TimerF).await;
                    self.set_state(TransactionState::Completed).await;
                    if self.transport.is_reliable() {
                        self.terminate().await;
                    } else {
                        self.start_timer(TimerType::TimerK).await;
                    }
                }
                self.user.on_response(self.id.clone(), response).await;
            }
            (TransactionState::Completed, TransactionEvent::TimerFired(TimerType::TimerK)) => {
                self.terminate().await;
            }
            (TransactionState::Completed, TransactionEvent::ReceivedResponse(_)) => {
                // Retransmitted final response; already reported
            }
            (_, TransactionEvent::Terminate) => self.terminate().await,
            (state, event) => {
                debug!(txn = %self.id.0, ?state, ?event, "event ignored in this state");
            }
        }
        Ok(())
    }

    async fn server_invite(&self, event: TransactionEvent) -> Result<()> {
        let state = self.state().await;
        match (state, event) {
            (TransactionState::Proceeding, TransactionEvent::SendResponse(response)) => {
                let status = response.status_code().unwrap_or(0);
                self.transport.send(&response, self.remote_addr).await?;
                *self.last_response.write().await = Some(response);
                match status {
                    100..=199 => {}
                    200..=299 => {
                        self.set_state(TransactionState::Accepted).await;
                        self.start_timer(TimerType::TimerL).await;
                    }
                    _ => {
                        self.set_state(TransactionState::Completed).await;
                        if !self.transport.is_reliable() {
                            self.start_timer(TimerType::TimerG).await;
                        }
                        self.start_timer(TimerType::TimerH).await;
                    }
                }
            }
            (TransactionState::Accepted, TransactionEvent::SendResponse(response)) => {
                // 2xx retransmission driven by the TU
                self.transport.send(&response, self.remote_addr).await?;
            }
            (
                TransactionState::Proceeding | TransactionState::Accepted,
                TransactionEvent::ReceivedRequest(request),
            ) => {
                if request.method() == Some(SipMethod::Invite) {
                    self.replay_last_response().await?;
                }
            }
            (TransactionState::Completed, TransactionEvent::ReceivedRequest(request)) => {
                match request.method() {
                    Some(SipMethod::Ack) => {
                        self.cancel_timer(TimerType::TimerG).await;
                        self.cancel_timer(TimerType::TimerH).await;
                        if self.transport.is_reliable() {
                            self.terminate().await;
                        } else {
                            self.set_state(TransactionState::Confirmed).await;
                            self.start_timer(TimerType::TimerI).await;
                        }
                    }
                    _ => self.replay_last_response().await?,
                }
            }
            (TransactionState::Completed, TransactionEvent::TimerFired(TimerType::TimerG)) => {
                self.retransmit_response(TimerType::TimerG).await?;
            }
            (TransactionState::Completed, TransactionEvent::TimerFired(TimerType::TimerH)) => {
                // The ACK never came
                self.terminate().await;
                self.user.on_timeout(self.id.clone()).await;
            }
            (TransactionState::Confirmed, TransactionEvent::TimerFired(TimerType::TimerI)) => {
                self.terminate().await;
            }
            (TransactionState::Accepted, TransactionEvent::TimerFired(TimerType::TimerL)) => {
                self.terminate().await;
            }
            (_, TransactionEvent::Terminate) => self.terminate().await,
            (state, event) => {
                debug!(txn = %self.id.0, ?state, ?event, "event ignored in this state");
            }
        }
        Ok(())
    }

    async fn server_non_invite(&self, event: TransactionEvent) -> Result<()> {
        let state = self.state().await;
        match (state, event) {
            (
                TransactionState::Trying | TransactionState::Proceeding,
                TransactionEvent::SendResponse(response),
            ) => {
                let status = response.status_code().unwrap_or(0);
                self.transport.send(&response, self.remote_addr).await?;
                *self.last_response.write().await = Some(response);
                if (100..200).contains(&status) {
                    self.set_state(TransactionState::Proceeding).await;
                } else {
                    self.set_state(TransactionState::Completed).await;
                    if self.transport.is_reliable() {
                        self.terminate().await;
                    } else {
                        self.start_timer(TimerType::TimerJ).await;
                    }
                }
            }
            (TransactionState::Trying, TransactionEvent::ReceivedRequest(_)) => {
                // Retransmission before any response exists is absorbed
            }
            (
                TransactionState::Proceeding | TransactionState::Completed,
                TransactionEvent::ReceivedRequest(_),
            ) => {
                self.replay_last_response().await?;
            }
            (TransactionState::Completed, TransactionEvent::TimerFired(TimerType::TimerJ)) => {
                self.terminate().await;
            }
            (_, TransactionEvent::Terminate) => self.terminate().await,
            (state, event) => {
                debug!(txn = %self.id.0, ?state, ?event, "event ignored in this state");
            }
        }
        Ok(())
    }

    async fn retransmit_request(&self, timer: TimerType, cap_at_t2: bool) -> Result<()> {
        let mut count = self.retransmit_count.write().await;
        *count += 1;
        self.transport.send(&self.request, self.remote_addr).await?;
        let mut interval = timer.duration_ms().saturating_mul(1 << *count);
        if cap_at_t2 {
            interval = interval.min(T2_MS);
        }
        drop(count);
        self.start_timer_with(timer, Duration::from_millis(interval)).await;
        Ok(())
    }

    async fn retransmit_response(&self, timer: TimerType) -> Result<()> {
        self.replay_last_response().await?;
        let mut count = self.retransmit_count.write().await;
        *count += 1;
        let interval = (timer.duration_ms().saturating_mul(1 << *count)).min(T2_MS);
        drop(count);
        self.start_timer_with(timer, Duration::from_millis(interval)).await;
        Ok(())
    }

    async fn replay_last_response(&self) -> Result<()> {
        if let Some(ref response) = *self.last_response.read().await {
            self.transport.send(response, self.remote_addr).await?;
        }
        Ok(())
    }

    // ACK for a non-2xx final response stays inside the INVITE transaction
    async fn send_ack_for(&self, response: &SipMessage) -> Result<()> {
        use crate::HeaderName;

        let uri = self
            .request
            .request_uri()
            .ok_or_else(|| Error::InvalidState("client txn without request URI".to_string()))?
            .clone();
        let mut ack = SipMessage::new_request(SipMethod::Ack, uri);

        if let Some(via) = self.request.headers.get(HeaderName::VIA) {
            ack.headers.add(HeaderName::new(HeaderName::VIA), via.clone());
        }
        if let Some(from) = self.request.get_from() {
            ack.headers.set(HeaderName::new(HeaderName::FROM), from.clone());
        }
        if let Some(to) = response.get_to() {
            ack.headers.set(HeaderName::new(HeaderName::TO), to.clone());
        }
        if let Some(call_id) = self.request.get_call_id() {
            ack.headers
                .set(HeaderName::new(HeaderName::CALL_ID), call_id.clone());
        }
        if let Some(cseq) = self.request.get_cseq() {
            ack.headers.set(
                HeaderName::new(HeaderName::CSEQ),
                format!("{} ACK", cseq.sequence),
            );
        }
        ack.headers
            .set(HeaderName::new(HeaderName::CONTENT_LENGTH), "0".to_string());

        self.transport.send(&ack, self.remote_addr).await
    }

    async fn set_state(&self, new_state: TransactionState) {
        *self.state.write().await = new_state;
    }

    async fn terminate(&self) {
        self.cancel_all_timers().await;
        self.set_state(TransactionState::Terminated).await;
    }

    async fn start_timer(&self, timer: TimerType) {
        self.start_timer_with(timer, Duration::from_millis(timer.duration_ms()))
            .await;
    }

    async fn start_timer_with(&self, timer: TimerType, duration: Duration) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some(previous) = self.timers.write().await.insert(timer, cancel_tx) {
            let _ = previous.send(());
        }

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(duration) => {
                    let _ = event_tx.send(TransactionEvent::TimerFired(timer)).await;
                }
                _ = cancel_rx => {}
            }
        });
    }

    async fn cancel_timer(&self, timer: TimerType) {
        if let Some(tx) = self.timers.write().await.remove(&timer) {
            let _ = tx.send(());
        }
    }

    async fn cancel_all_timers(&self) {
        for (_, tx) in self.timers.write().await.drain() {
            let _ = tx.send(());
        }
    }
}

// Transaction Manager
pub struct TransactionManager {
    transactions: Arc<RwLock<HashMap<TransactionId, Arc<Transaction>>>>,
    user: Arc<dyn TransactionUser>,
}

impl TransactionManager {
    pub fn new(user: Arc<dyn TransactionUser>) -> Arc<Self> {
        let manager = Arc::new(TransactionManager {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            user,
        });

        // Reap terminated transactions
        let transactions = manager.transactions.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(10)).await;
                let mut reaped = Vec::new();
                {
                    let map = transactions.read().await;
                    for (id, txn) in map.iter() {
                        if txn.is_terminated().await {
                            reaped.push(id.clone());
                        }
                    }
                }
                if !reaped.is_empty() {
                    let mut map = transactions.write().await;
                    for id in &reaped {
                        map.remove(id);
                    }
                    debug!(count = reaped.len(), "reaped terminated transactions");
                }
            }
        });

        manager
    }

    async fn spawn(
        &self,
        transaction_type: TransactionType,
        request: SipMessage,
        transport: Arc<dyn Transport>,
        remote_addr: SocketAddr,
    ) -> Result<Arc<Transaction>> {
        let (event_tx, mut event_rx) = mpsc::channel(32);
        let transaction = Transaction::new(
            transaction_type,
            request,
            transport,
            remote_addr,
            event_tx,
            self.user.clone(),
        )?;

        self.transactions
            .write()
            .await
            .insert(transaction.id.clone(), transaction.clone());

        // One task owns the FSM; events from the transport, the TU and the
        // timers are serialized through its channel
        let txn = transaction.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if let Err(e) = txn.handle_event(event).await {
                    warn!(txn = %txn.id.0, error = %e, "transaction event failed");
                }
                if txn.is_terminated().await {
                    break;
                }
            }
        });

        Ok(transaction)
    }

    /// Client transaction; the caller still has to push `SendRequest`.
    pub async fn create_client(
        &self,
        request: SipMessage,
        transport: Arc<dyn Transport>,
        remote_addr: SocketAddr,
    ) -> Result<Arc<Transaction>> {
        let transaction_type = if request.method() == Some(SipMethod::Invite) {
            TransactionType::ClientInvite
        } else {
            TransactionType::ClientNonInvite
        };
        self.spawn(transaction_type, request, transport, remote_addr)
            .await
    }

    pub async fn create_server(
        &self,
        request: SipMessage,
        transport: Arc<dyn Transport>,
        remote_addr: SocketAddr,
    ) -> Result<Arc<Transaction>> {
        let transaction_type = if request.method() == Some(SipMethod::Invite) {
            TransactionType::ServerInvite
        } else {
            TransactionType::ServerNonInvite
        };
        self.spawn(transaction_type, request, transport, remote_addr)
            .await
    }

    pub async fn find(&self, id: &TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.read().await.get(id).cloned()
    }

    /// Match an incoming request against an existing server transaction.
    pub async fn find_for_request(&self, request: &SipMessage) -> Option<Arc<Transaction>> {
        let method = request.method()?;
        let branch = request.get_via().map(|v| v.branch)?;
        // The ACK for a negative final response matches the INVITE txn
        let lookup_method = if method == SipMethod::Ack {
            SipMethod::Invite
        } else {
            method
        };
        self.find(&TransactionId::new(&lookup_method, &branch)).await
    }

    /// Match a response against the client transaction that sent it.
    pub async fn find_for_response(&self, response: &SipMessage) -> Option<Arc<Transaction>> {
        let branch = response.get_via().map(|v| v.branch)?;
        let method = response.get_cseq()?.method;
        self.find(&TransactionId::new(&method, &branch)).await
    }

    pub async fn count(&self) -> usize {
        self.transactions.read().await.len()
    }
}
