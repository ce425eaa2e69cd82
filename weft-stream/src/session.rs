//! Peer session handshake

use rust_fsm::*;

use weft::types::*;
use weft::utils::peer_hash;
use weft_net::errors::*;

state_machine! {
    derive(Debug)
    SessionProtocol(Start)

    Start => {
        HelloSent => HelloSent,
        HelloReceived => HelloReceived,
    },
    HelloSent(HelloReceived) => Established,
    HelloReceived(HelloSent) => Established,
    Established(GoodbyeReceived) => Closed,
}

/// One directly connected peer
///
/// Both sides send a signed Hello when the link comes up; data from a
/// session that has not completed the exchange is dropped.
pub struct PeerSession {
    peer: PeerId,
    hash: PeerHash,
    machine: StateMachine<SessionProtocol>,
}

impl PeerSession {
    pub fn new(peer: PeerId) -> PeerSession {
        PeerSession {
            peer,
            hash: peer_hash(&peer),
            machine: StateMachine::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn hash(&self) -> &PeerHash {
        &self.hash
    }

    pub fn hello_sent(&mut self) -> Result<(), ProtocolError> {
        self.machine
            .consume(&SessionProtocolInput::HelloSent)
            .map_err(|_e| ProtocolError::InvalidState)?;
        Ok(())
    }

    /// Consume the peer's Hello; the announced key must match the
    /// transport-level identity of the link
    pub fn hello_received(&mut self, announced: &PeerId) -> Result<(), ProtocolError> {
        if *announced != self.peer {
            return Err(ProtocolError::AccessDenied);
        }
        self.machine
            .consume(&SessionProtocolInput::HelloReceived)
            .map_err(|_e| ProtocolError::InvalidState)?;
        Ok(())
    }

    pub fn goodbye_received(&mut self) -> Result<(), ProtocolError> {
        self.machine
            .consume(&SessionProtocolInput::GoodbyeReceived)
            .map_err(|_e| ProtocolError::InvalidState)?;
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        matches!(self.machine.state(), &SessionProtocolState::Established)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.machine.state(), &SessionProtocolState::Closed)
    }
}

#[cfg(test)]
mod test {
    use crate::session::*;
    use weft::utils::generate_keypair;

    #[test]
    pub fn test_handshake_both_orders() {
        let peer = generate_keypair().1;

        let mut ours_first = PeerSession::new(peer);
        ours_first.hello_sent().unwrap();
        assert!(!ours_first.is_established());
        ours_first.hello_received(&peer).unwrap();
        assert!(ours_first.is_established());

        let mut theirs_first = PeerSession::new(peer);
        theirs_first.hello_received(&peer).unwrap();
        theirs_first.hello_sent().unwrap();
        assert!(theirs_first.is_established());
    }

    #[test]
    pub fn test_wrong_identity_rejected() {
        let peer = generate_keypair().1;
        let other = generate_keypair().1;
        let mut session = PeerSession::new(peer);
        assert_eq!(
            session.hello_received(&other).err().unwrap(),
            ProtocolError::AccessDenied
        );
        assert!(!session.is_established());
    }

    #[test]
    pub fn test_goodbye_closes() {
        let peer = generate_keypair().1;
        let mut session = PeerSession::new(peer);
        session.hello_sent().unwrap();
        session.hello_received(&peer).unwrap();
        session.goodbye_received().unwrap();
        assert!(session.is_closed());
    }
}
