//! Message handlers
//!
//! Handlers run on the receive loop, one message at a time. They must not
//! wait on the network: replies go out with [`Conn::reply`] and anything
//! long-running is spawned.

use std::net::SocketAddr;
use std::sync::Arc;

use nextgtp_codec::v1::{ExtHeader, Gtpv1MessageType};
use nextgtp_codec::v2::Gtpv2MessageType;
use nextgtp_codec::{GtpMessage, Gtpv1Message, Message};
use nextgtp_common::GtpVersion;
use tracing::{debug, warn};

use crate::conn::{Conn, UserPacket};
use crate::error::HandlerError;

/// Message handler: connection, sender address and the decoded message
pub type Handler =
    Arc<dyn Fn(&Conn, SocketAddr, GtpMessage) -> Result<(), HandlerError> + Send + Sync>;

/// Handlers installed on every new connection, keyed by message type
pub(crate) fn defaults(version: GtpVersion) -> Vec<(u8, Handler)> {
    match version {
        GtpVersion::V1 => vec![
            (Gtpv1MessageType::EchoRequest as u8, Arc::new(handle_echo_request) as Handler),
            (Gtpv1MessageType::EchoResponse as u8, Arc::new(handle_echo_response)),
            (Gtpv1MessageType::GPdu as u8, Arc::new(handle_g_pdu)),
            (Gtpv1MessageType::ErrorIndication as u8, Arc::new(handle_error_indication)),
        ],
        GtpVersion::V2 => vec![
            (Gtpv2MessageType::EchoRequest as u8, Arc::new(handle_echo_request) as Handler),
            (Gtpv2MessageType::EchoResponse as u8, Arc::new(handle_echo_response)),
        ],
    }
}

/// Fallback for message types without a registered handler
pub(crate) fn default_handler() -> Handler {
    Arc::new(|_conn: &Conn, peer: SocketAddr, msg: GtpMessage| {
        debug!(
            peer = %peer,
            msg_type = msg.message_type(),
            name = msg.name(),
            "no handler for message, ignoring"
        );
        Ok(())
    })
}

/// Echo Request: answer with our Restart Counter and check the peer's
pub fn handle_echo_request(conn: &Conn, peer: SocketAddr, msg: GtpMessage) -> Result<(), HandlerError> {
    if let Some(counter) = msg.recovery() {
        conn.note_recovery(peer, counter);
    }

    let seq = msg.sequence().unwrap_or(0);
    let response = GtpMessage::echo_response(conn.version(), seq, conn.restart_counter());
    conn.reply(peer, &response)?;
    Ok(())
}

/// Echo Response that matched no transaction: a late or duplicate answer
pub fn handle_echo_response(_conn: &Conn, peer: SocketAddr, msg: GtpMessage) -> Result<(), HandlerError> {
    debug!(peer = %peer, seq = ?msg.sequence(), "unsolicited Echo Response ignored");
    Ok(())
}

/// G-PDU: relay, deliver to the user-plane queue, or answer Error Indication
pub fn handle_g_pdu(conn: &Conn, peer: SocketAddr, msg: GtpMessage) -> Result<(), HandlerError> {
    let GtpMessage::V1(pdu) = msg else {
        return Err(HandlerError::Rejected("G-PDU outside GTPv1".into()));
    };
    let teid = pdu.teid;

    if let Some((target, teid_out, to)) = conn.relay_for(teid) {
        let mut out = pdu;
        out.teid = teid_out;
        target.reply(to, &GtpMessage::V1(out))?;
        return Ok(());
    }

    if conn.tunnel(teid).is_some() {
        conn.deliver(UserPacket {
            teid,
            peer,
            payload: pdu.payload,
        });
        return Ok(());
    }

    debug!(peer = %peer, teid, "G-PDU for unknown TEID");
    let indication = Gtpv1Message::error_indication(teid, conn.local_addr().ip())
        .with_sequence_number(0)
        .with_extension_header(ExtHeader::UdpPort { port: peer.port() });
    conn.reply(peer, &GtpMessage::V1(indication))?;
    Ok(())
}

/// Error Indication: the peer lost the tunnel, so tear ours down too
pub fn handle_error_indication(conn: &Conn, peer: SocketAddr, msg: GtpMessage) -> Result<(), HandlerError> {
    let GtpMessage::V1(indication) = msg else {
        return Err(HandlerError::Rejected("Error Indication outside GTPv1".into()));
    };
    let peer_teid = indication
        .teid_data_i()
        .ok_or_else(|| HandlerError::Rejected("Error Indication without TEID Data I".into()))?;
    let peer_ip = indication.gsn_address().unwrap_or(peer.ip());

    let Some(tunnel) = conn.tunnels().find_by_peer_teid(peer_ip, peer_teid) else {
        debug!(peer = %peer, peer_teid, "Error Indication for unknown tunnel");
        return Ok(());
    };

    warn!(
        peer = %peer,
        teid = tunnel.local_teid,
        "Error Indication received, removing tunnel"
    );
    let conn = conn.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.del_tunnel_by_teid(tunnel.local_teid).await {
            warn!(teid = tunnel.local_teid, error = %e, "tunnel removal after Error Indication failed");
        }
    });
    Ok(())
}
