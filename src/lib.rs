//! voicebridge: a SIP/RTP session border controller that answers telephone
//! calls and bridges their audio to a conversational AI backend over a
//! WebSocket.
//!
//! The crate is organized as one module per subsystem: SIP message and SDP
//! handling, transports, the RFC 3261 transaction and dialog layers, digest
//! authentication and the registrar, G.711 codecs with the 8/16 kHz
//! resampler, the per-call RTP media pipeline, DTMF detection, the AI
//! WebSocket bridge, and the endpoint that supervises calls.

mod auth;
mod bridge;
mod call;
mod codec;
mod config;
mod dialog;
mod dtmf;
mod endpoint;
mod error;
mod events;
mod media;
mod message;
mod ports;
mod registrar;
mod rtp;
mod sdp;
mod trunks;
mod types;

pub mod transaction;
pub mod transport;

pub use crate::auth::{
    answer_challenge, build_challenge, compute_ha1, parse_digest_challenge, DigestChallenge,
    DigestCredentials, NonceAuthority, NonceStatus,
};
pub use crate::bridge::{sign_auth, BridgeCallInfo, BridgeOut, BridgeSession, BridgeState};
pub use crate::call::{
    spawn_inbound, spawn_outbound, CallCommand, CallContext, CallHandle, Cdr, InboundCallSetup,
    OutboundCallSetup,
};
pub use crate::codec::{
    alaw_to_linear, linear_to_alaw, linear_to_ulaw, ulaw_to_linear, CodecKind, Resampler,
    FRAME_16K, FRAME_8K, PTIME_MS,
};
pub use crate::config::{
    AuthConfig, BridgeConfig, LimitsConfig, MediaConfig, ServerConfig, TransportConfig,
};
pub use crate::dialog::{Dialog, DialogManager, DialogState};
pub use crate::dtmf::{DtmfDigit, DtmfEvent, DtmfMethod, GoertzelDetector, Rfc2833Decoder};
pub use crate::endpoint::{
    CallCounters, CallGuard, CallSummary, Endpoint, EndpointBuilder, ServerStats,
};
pub use crate::error::{Error, Result};
pub use crate::events::{EventBus, ServerEvent};
pub use crate::media::{MediaOut, MediaSession, MediaSessionConfig, MediaStatsSnapshot};
pub use crate::message::{
    reason_phrase, response_for, HeaderMap, MessageBody, RequestLine, SipMessage, SipParser,
    StartLine, StatusLine,
};
pub use crate::ports::{PortAllocator, PortPair};
pub use crate::registrar::{AuthOutcome, Binding, BlockedNumbers, LocationStore, SipUser, UserStore};
pub use crate::rtp::{
    JitterBuffer, JitterInsert, JitterPop, RtpHeader, RtpInput, RtpPacket, RtpSession, RtpStats,
    RtpStatsSnapshot, TELEPHONE_EVENT_PT,
};
pub use crate::sdp::{
    build_answer, build_offer, negotiate_offer, MediaDirection, NegotiatedAudio, SdpParser, Session,
};
pub use crate::transaction::{
    Transaction, TransactionEvent, TransactionManager, TransactionState, TransactionType,
    TransactionUser,
};
pub use crate::transport::{MessageHandler, TcpTransport, Transport, UdpTransport};
pub use crate::trunks::{Trunk, TrunkCredentials, TrunkLease, TrunkStore};
pub use crate::types::{
    extract_tag, extract_uri, generate_branch, generate_call_id, generate_tag, CSeqHeader, CallId,
    CallDirection, CallState, ContactHeader, DialogId, EndReason, HeaderName, SipMethod, SipUri,
    TimerType, TransactionId, ViaHeader, T1_MS, T2_MS, T4_MS,
};

// Convenient imports for embedders
pub mod prelude {
    pub use crate::{
        CallDirection, CallId, CallState, CodecKind, Endpoint, EndpointBuilder, EndReason, Error,
        EventBus, Result, ServerConfig, ServerEvent, SipMessage, SipMethod, SipParser, SipUri,
        SipUser, Trunk,
    };
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_builds_and_starts() {
        let endpoint = Endpoint::builder().udp_port(0).build().await.unwrap();
        endpoint.clone().start().await.unwrap();
        assert_eq!(endpoint.stats().await.active_calls, 0);
        endpoint.stop().await;
    }
}
