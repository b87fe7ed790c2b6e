//! Session table
//!
//! A session groups the tunnels of one subscriber with its signalling
//! metadata. Sessions reference tunnels by local TEID only; the tunnel table
//! stays the owner of the tunnels themselves.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use nextgtp_codec::v2::{ie_type, Gtpv2MessageType};
use nextgtp_codec::{CodecError, Gtpv2Message};

use crate::error::TunnelError;

/// Subscriber session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Identifier assigned by the session table (0 until added)
    pub id: u64,
    /// Subscriber identity
    pub imsi: Option<String>,
    /// Control-plane peer
    pub peer_addr: SocketAddr,
    /// Control-plane TEID of the peer
    pub peer_control_teid: Option<u32>,
    /// Address allocated to the subscriber
    pub ms_addr: Option<IpAddr>,
    /// Default bearer
    pub ebi: Option<u8>,
    /// User-plane TEID announced by the peer for the default bearer
    pub peer_user_teid: Option<u32>,
    /// Local TEIDs of the tunnels belonging to this session
    pub teids: Vec<u32>,
}

impl Session {
    /// Create an empty session towards a control-plane peer
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: 0,
            imsi: None,
            peer_addr,
            peer_control_teid: None,
            ms_addr: None,
            ebi: None,
            peer_user_teid: None,
            teids: Vec::new(),
        }
    }

    /// Set the subscriber identity
    pub fn with_imsi(mut self, imsi: impl Into<String>) -> Self {
        self.imsi = Some(imsi.into());
        self
    }

    /// Set the subscriber address
    pub fn with_ms_addr(mut self, ms_addr: IpAddr) -> Self {
        self.ms_addr = Some(ms_addr);
        self
    }

    /// Attach a tunnel
    pub fn with_teid(mut self, teid: u32) -> Self {
        self.teids.push(teid);
        self
    }

    /// Build a session from a received Create Session Request.
    ///
    /// IMSI is mandatory. The sender F-TEID, PAA and the first Bearer
    /// Context (EBI and its F-TEID) are picked up when present.
    pub fn from_create_session_request(
        msg: &Gtpv2Message,
        peer_addr: SocketAddr,
    ) -> Result<Self, CodecError> {
        if msg.kind() != Some(Gtpv2MessageType::CreateSessionRequest) {
            return Err(CodecError::InvalidIeValue {
                ie_type: 0,
                reason: format!("message type {} is not Create Session Request", msg.message_type),
            });
        }

        let imsi = msg
            .ie(ie_type::IMSI, 0)
            .ok_or(CodecError::MissingIe("IMSI"))?
            .as_imsi()?;

        let mut session = Session::new(peer_addr).with_imsi(imsi);

        if let Some(fteid) = msg.ie(ie_type::F_TEID, 0) {
            session.peer_control_teid = Some(fteid.as_fteid()?.teid);
        }
        if let Some(paa) = msg.ie(ie_type::PAA, 0) {
            let paa = paa.as_paa()?;
            session.ms_addr = paa.ipv4().map(IpAddr::V4);
        }
        if let Some(bearer) = msg.ie(ie_type::BEARER_CONTEXT, 0) {
            for child in bearer.children()? {
                match child.ie_type {
                    ie_type::EBI => session.ebi = Some(child.as_ebi()?),
                    ie_type::F_TEID => session.peer_user_teid = Some(child.as_fteid()?.teid),
                    _ => {}
                }
            }
        }

        Ok(session)
    }
}

#[derive(Debug, Default)]
struct Index {
    sessions: HashMap<u64, Session>,
    by_imsi: HashMap<String, u64>,
    by_teid: HashMap<u32, u64>,
}

impl Index {
    fn unlink(&mut self, session: &Session) {
        if let Some(imsi) = &session.imsi {
            self.by_imsi.remove(imsi);
        }
        for teid in &session.teids {
            self.by_teid.remove(teid);
        }
    }

    fn check(&self, session: &Session) -> Result<(), TunnelError> {
        if let Some(imsi) = &session.imsi {
            if self.by_imsi.get(imsi).is_some_and(|id| *id != session.id) {
                return Err(TunnelError::DuplicateSession(imsi.clone()));
            }
        }
        for teid in &session.teids {
            if self.by_teid.get(teid).is_some_and(|id| *id != session.id) {
                return Err(TunnelError::DuplicateTeid(*teid));
            }
        }
        Ok(())
    }

    fn link(&mut self, session: Session) {
        if let Some(imsi) = &session.imsi {
            self.by_imsi.insert(imsi.clone(), session.id);
        }
        for teid in &session.teids {
            self.by_teid.insert(*teid, session.id);
        }
        self.sessions.insert(session.id, session);
    }
}

/// Session table with IMSI and TEID indices kept in step under one lock
#[derive(Debug)]
pub struct SessionTable {
    index: RwLock<Index>,
    next_id: AtomicU64,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a session and return its identifier
    pub fn insert(&self, mut session: Session) -> Result<u64, TunnelError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        session.id = 0;
        index.check(&session)?;
        session.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = session.id;
        index.link(session);
        Ok(id)
    }

    /// Apply a change to a session, re-indexing IMSI and TEIDs.
    ///
    /// The change is discarded if it would collide with another session.
    pub fn modify(&self, id: u64, f: impl FnOnce(&mut Session)) -> Result<Session, TunnelError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = index
            .sessions
            .get(&id)
            .cloned()
            .ok_or(TunnelError::SessionNotFound(id))?;
        f(&mut updated);
        updated.id = id;
        index.check(&updated)?;

        if let Some(old) = index.sessions.remove(&id) {
            index.unlink(&old);
        }
        index.link(updated.clone());
        Ok(updated)
    }

    /// Remove a session
    pub fn remove(&self, id: u64) -> Result<Session, TunnelError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let session = index
            .sessions
            .remove(&id)
            .ok_or(TunnelError::SessionNotFound(id))?;
        index.unlink(&session);
        Ok(session)
    }

    /// Remove every session whose control-plane peer is `ip`
    pub fn remove_by_peer(&self, ip: IpAddr) -> Vec<Session> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<u64> = index
            .sessions
            .values()
            .filter(|s| s.peer_addr.ip() == ip)
            .map(|s| s.id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = index.sessions.remove(&id) {
                index.unlink(&session);
                removed.push(session);
            }
        }
        removed
    }

    /// Whether any session has `ip` as its control-plane peer
    pub fn has_peer(&self, ip: IpAddr) -> bool {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.sessions.values().any(|s| s.peer_addr.ip() == ip)
    }

    /// Look up by identifier
    pub fn get(&self, id: u64) -> Option<Session> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.sessions.get(&id).cloned()
    }

    /// Look up by IMSI
    pub fn by_imsi(&self, imsi: &str) -> Option<Session> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_imsi
            .get(imsi)
            .and_then(|id| index.sessions.get(id))
            .cloned()
    }

    /// Look up by the local TEID of one of the session's tunnels
    pub fn by_teid(&self, teid: u32) -> Option<Session> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .by_teid
            .get(&teid)
            .and_then(|id| index.sessions.get(id))
            .cloned()
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
