// SIP dialog state and in-dialog request construction

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    extract_tag, extract_uri, generate_branch, DialogId, Error, HeaderName, Result, SipMessage,
    SipMethod, SipUri, ViaHeader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

// One established SIP dialog (RFC 3261 §12). UAS dialogs are created from
// the INVITE and confirmed when we send the 2xx; UAC dialogs confirm on the
// 2xx we receive.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    /// Where in-dialog requests go (peer's Contact).
    pub remote_target: SipUri,
    /// Route set from Record-Route; already ordered for sending.
    pub route_set: Vec<SipUri>,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    /// Transport address the dialog peer answers on.
    pub remote_addr: SocketAddr,
    pub is_uas: bool,
}

impl Dialog {
    /// UAS side: build from an incoming INVITE plus our freshly minted tag.
    pub fn from_request(request: &SipMessage, local_tag: &str, source: SocketAddr) -> Result<Self> {
        let from = request
            .get_from()
            .ok_or_else(|| Error::InvalidHeader("missing From".to_string()))?;
        let to = request
            .get_to()
            .ok_or_else(|| Error::InvalidHeader("missing To".to_string()))?;
        let call_id = request
            .get_call_id()
            .ok_or_else(|| Error::InvalidHeader("missing Call-ID".to_string()))?;
        let cseq = request
            .get_cseq()
            .ok_or_else(|| Error::InvalidHeader("missing CSeq".to_string()))?;
        let remote_tag =
            extract_tag(from).ok_or_else(|| Error::InvalidHeader("From without tag".to_string()))?;

        // For a UAS the route set is the Record-Route list as received
        let route_set = request
            .record_routes()
            .iter()
            .filter_map(|rr| extract_uri(rr).ok())
            .collect();

        let remote_target = request
            .get_contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| extract_uri(from).unwrap_or_else(|_| SipUri::new("invalid")));

        Ok(Dialog {
            id: DialogId {
                call_id: call_id.clone(),
                local_tag: local_tag.to_string(),
                remote_tag,
            },
            state: DialogState::Early,
            local_uri: extract_uri(to)?,
            remote_uri: extract_uri(from)?,
            remote_target,
            route_set,
            local_cseq: 0,
            remote_cseq: cseq.sequence,
            remote_addr: source,
            is_uas: true,
        })
    }

    /// UAC side: build from our INVITE and the peer's dialog-establishing
    /// response.
    pub fn from_response(
        request: &SipMessage,
        response: &SipMessage,
        source: SocketAddr,
    ) -> Result<Self> {
        let from = request
            .get_from()
            .ok_or_else(|| Error::InvalidHeader("missing From".to_string()))?;
        let to = response
            .get_to()
            .ok_or_else(|| Error::InvalidHeader("missing To".to_string()))?;
        let call_id = request
            .get_call_id()
            .ok_or_else(|| Error::InvalidHeader("missing Call-ID".to_string()))?;
        let cseq = request
            .get_cseq()
            .ok_or_else(|| Error::InvalidHeader("missing CSeq".to_string()))?;

        let local_tag =
            extract_tag(from).ok_or_else(|| Error::InvalidHeader("From without tag".to_string()))?;
        let remote_tag =
            extract_tag(to).ok_or_else(|| Error::InvalidHeader("2xx To without tag".to_string()))?;

        // For a UAC the Record-Route set is reversed
        let mut route_set: Vec<SipUri> = response
            .record_routes()
            .iter()
            .filter_map(|rr| extract_uri(rr).ok())
            .collect();
        route_set.reverse();

        let remote_target = response
            .get_contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| extract_uri(to).unwrap_or_else(|_| SipUri::new("invalid")));

        Ok(Dialog {
            id: DialogId {
                call_id: call_id.clone(),
                local_tag,
                remote_tag,
            },
            state: DialogState::Confirmed,
            local_uri: extract_uri(from)?,
            remote_uri: extract_uri(to)?,
            remote_target,
            route_set,
            local_cseq: cseq.sequence,
            remote_cseq: 0,
            remote_addr: source,
            is_uas: false,
        })
    }

    /// Enforce strictly increasing CSeq for in-dialog requests.
    pub fn check_remote_cseq(&mut self, sequence: u32) -> Result<()> {
        if self.remote_cseq != 0 && sequence <= self.remote_cseq {
            return Err(Error::InvalidState(format!(
                "CSeq {} not above {}",
                sequence, self.remote_cseq
            )));
        }
        self.remote_cseq = sequence;
        Ok(())
    }

    /// Build an in-dialog request with loose routing applied.
    pub fn build_request(
        &mut self,
        method: SipMethod,
        via_host: &str,
        via_port: u16,
        contact: &SipUri,
    ) -> SipMessage {
        self.local_cseq += 1;

        // Loose routing: a route set whose first hop carries ;lr keeps the
        // remote target in the request URI; otherwise the first route is the
        // request URI and the target is appended to the route set
        let (request_uri, routes) = match self.route_set.split_first() {
            None => (self.remote_target.clone(), Vec::new()),
            Some((first, _)) if first.parameters.contains_key("lr") => {
                (self.remote_target.clone(), self.route_set.clone())
            }
            Some((first, rest)) => {
                let mut routes: Vec<SipUri> = rest.to_vec();
                routes.push(self.remote_target.clone());
                (first.clone(), routes)
            }
        };

        let mut request = SipMessage::new_request(method, request_uri);
        request.add_via(&ViaHeader::new("UDP", via_host, via_port, &generate_branch()));
        request.headers.set(
            HeaderName::new(HeaderName::FROM),
            format!("<{}>;tag={}", self.local_uri, self.id.local_tag),
        );
        request.headers.set(
            HeaderName::new(HeaderName::TO),
            format!("<{}>;tag={}", self.remote_uri, self.id.remote_tag),
        );
        request
            .headers
            .set(HeaderName::new(HeaderName::CALL_ID), self.id.call_id.clone());
        request.headers.set(
            HeaderName::new(HeaderName::CSEQ),
            format!("{} {}", self.local_cseq, method),
        );
        request.headers.set(
            HeaderName::new(HeaderName::CONTACT),
            format!("<{}>", contact),
        );
        for route in routes {
            request
                .headers
                .add(HeaderName::new(HeaderName::ROUTE), format!("<{}>", route));
        }
        request
            .headers
            .set(HeaderName::new(HeaderName::CONTENT_LENGTH), "0".to_string());
        request
    }
}

// Dialog registry, keyed by (call-id, local-tag, remote-tag)
#[derive(Default)]
pub struct DialogManager {
    dialogs: RwLock<HashMap<DialogId, Arc<RwLock<Dialog>>>>,
}

impl DialogManager {
    pub fn new() -> Self {
        DialogManager::default()
    }

    pub async fn insert(&self, dialog: Dialog) -> Arc<RwLock<Dialog>> {
        let id = dialog.id.clone();
        let entry = Arc::new(RwLock::new(dialog));
        self.dialogs.write().await.insert(id, entry.clone());
        entry
    }

    pub async fn find(&self, id: &DialogId) -> Option<Arc<RwLock<Dialog>>> {
        self.dialogs.read().await.get(id).cloned()
    }

    /// Locate the dialog an in-dialog request belongs to. The server's tag
    /// is in To for requests we receive as UAS.
    pub async fn find_for_request(&self, request: &SipMessage) -> Option<Arc<RwLock<Dialog>>> {
        let call_id = request.get_call_id()?;
        let from_tag = request.get_from().and_then(|f| extract_tag(f))?;
        let to_tag = request.get_to().and_then(|t| extract_tag(t))?;

        // Try both orientations; the dialog may be UAS or UAC on our side
        let as_uas = DialogId {
            call_id: call_id.clone(),
            local_tag: to_tag.clone(),
            remote_tag: from_tag.clone(),
        };
        if let Some(found) = self.find(&as_uas).await {
            return Some(found);
        }
        let as_uac = DialogId {
            call_id: call_id.clone(),
            local_tag: from_tag,
            remote_tag: to_tag,
        };
        self.find(&as_uac).await
    }

    pub async fn remove(&self, id: &DialogId) {
        if self.dialogs.write().await.remove(id).is_some() {
            debug!(call_id = %id.call_id, "dialog removed");
        }
    }

    pub async fn count(&self) -> usize {
        self.dialogs.read().await.len()
    }
}
