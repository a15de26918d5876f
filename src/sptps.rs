//! SPTPS: the mutually authenticated, forward-secret record layer that
//! protects all meta traffic on a connection.
//!
//! The session is sans-I/O: callers feed wire bytes into `receive_data` and
//! drain wire bytes from `take_outgoing`; the connection layer moves them
//! over the actual transport.
//!
//! Handshake (A initiates, B responds):
//!
//! 1. A -> B  HANDSHAKE  epkA
//! 2. B -> A  HANDSHAKE  epkB || Sign_B(epkA || epkB)
//! 3. A -> B  HANDSHAKE  Sign_A(epkB || epkA)
//!
//! Each side then derives per-direction ChaCha20-Poly1305 keys and 96-bit
//! nonce bases from HMAC-SHA512 over the shared secret and both ephemeral
//! keys. Message 3 is not acknowledged; the first authenticated
//! APPLICATION record a side receives confirms key agreement.

use hmac::{Hmac, Mac};
use sha2::Sha512;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{Ecdh, Keypair, PublicKey, X25519, ECDH_SIZE, SIGNATURE_SIZE};

/// Ceiling on the record length field.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;
/// ChaCha20-Poly1305 authenticator length.
pub const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = 4;

const MSG2_SIZE: usize = ECDH_SIZE + SIGNATURE_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RecordType {
    Handshake = 0,
    Application = 1,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<RecordType> {
        match b {
            0 => Some(RecordType::Handshake),
            1 => Some(RecordType::Application),
            _ => None,
        }
    }
}

/// Handshake progress. `Kex`: ephemeral keys outstanding. `Sig`: signatures
/// outstanding. `Ack`: keys derived, first authenticated record pending.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Kex,
    Sig,
    Ack,
    Established,
    Dead,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("record length {0} exceeds the record size ceiling")]
    RecordTooLarge(usize),
    #[error("malformed record")]
    MalformedRecord,
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
    #[error("record authentication failed")]
    Decrypt,
    #[error("signature failure")]
    SignatureFailure,
    #[error("handshake message out of order")]
    HandshakeOutOfOrder,
    #[error("application record before key agreement")]
    EarlyApplicationRecord,
    #[error("replayed record counter {0}")]
    Replay(u64),
    #[error("session is dead")]
    Dead,
    #[error("key agreement failed: {0}")]
    KeyAgreement(#[from] crate::crypto::CryptoError),
}

struct Direction {
    cipher: ChaCha20Poly1305,
    nonce_base: [u8; NONCE_SIZE],
    counter: u64,
    last_accepted: Option<u64>,
}

impl Direction {
    fn nonce(&self, counter: u64) -> Nonce {
        let mut nonce = self.nonce_base;
        let ctr = counter.to_be_bytes();
        for (n, c) in nonce[NONCE_SIZE - 8..].iter_mut().zip(ctr) {
            *n ^= c;
        }
        Nonce::from(nonce)
    }
}

pub struct Session {
    state: SessionState,
    initiator: bool,
    label: Vec<u8>,
    keypair: Keypair,
    peer_public: PublicKey,
    ecdh: Option<X25519>,
    our_eph: [u8; ECDH_SIZE],
    peer_eph: Option<[u8; ECDH_SIZE]>,
    send: Option<Direction>,
    recv: Option<Direction>,
    /// Application payloads queued before key derivation.
    pending: Vec<Vec<u8>>,
    inbuf: Vec<u8>,
    outgoing: Vec<u8>,
}

impl Session {
    /// Starts a session. The initiator immediately queues handshake
    /// message 1 for the wire.
    pub fn new(keypair: Keypair, peer_public: PublicKey, initiator: bool, label: &[u8]) -> Self {
        let mut our_eph = [0u8; ECDH_SIZE];
        let ecdh = X25519::generate_public(&mut our_eph);
        let mut session = Session {
            state: SessionState::Kex,
            initiator,
            label: label.to_vec(),
            keypair,
            peer_public,
            ecdh: Some(ecdh),
            our_eph,
            peer_eph: None,
            send: None,
            recv: None,
            pending: Vec::new(),
            inbuf: Vec::new(),
            outgoing: Vec::new(),
        };
        if initiator {
            let eph = session.our_eph;
            session.queue_record(RecordType::Handshake, &eph);
        }
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn alive(&self) -> bool {
        self.state != SessionState::Dead
    }

    /// An incomplete record is buffered; fatal if the peer half-closes now.
    pub fn has_partial_record(&self) -> bool {
        !self.inbuf.is_empty()
    }

    /// Wire bytes waiting to be written to the transport.
    pub fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        self.state = SessionState::Dead;
        self.send = None;
        self.recv = None;
        self.pending.clear();
        err
    }

    /// Queues an APPLICATION record. Payloads sent before key derivation
    /// are held back and flushed the moment keys are agreed.
    pub fn send_record(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        if self.state == SessionState::Dead {
            return Err(SessionError::Dead);
        }
        if payload.len() + 1 > MAX_RECORD_SIZE {
            return Err(SessionError::RecordTooLarge(payload.len() + 1));
        }
        if self.send.is_some() {
            self.seal_record(RecordType::Application, payload)
        } else {
            self.pending.push(payload.to_vec());
            Ok(())
        }
    }

    /// Plaintext framing, used for handshake records before keys exist.
    fn queue_record(&mut self, rtype: RecordType, payload: &[u8]) {
        let len = (payload.len() + 1) as u32;
        self.outgoing.extend_from_slice(&len.to_be_bytes());
        self.outgoing.push(rtype as u8);
        self.outgoing.extend_from_slice(payload);
    }

    /// AEAD framing: the length field stays in the clear and covers
    /// type + payload; the tag follows the ciphertext.
    fn seal_record(&mut self, rtype: RecordType, payload: &[u8]) -> Result<(), SessionError> {
        let send = self.send.as_mut().ok_or(SessionError::EarlyApplicationRecord)?;
        let mut plain = Vec::with_capacity(payload.len() + 1);
        plain.push(rtype as u8);
        plain.extend_from_slice(payload);

        let nonce = send.nonce(send.counter);
        let sealed = send
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: &plain,
                    aad: &[],
                },
            )
            .map_err(|_| SessionError::Decrypt)?;
        send.counter += 1;

        let len = plain.len() as u32;
        self.outgoing.extend_from_slice(&len.to_be_bytes());
        self.outgoing.extend_from_slice(&sealed);
        Ok(())
    }

    /// Feeds wire bytes in. Complete APPLICATION payloads are appended to
    /// `app`. Any error is fatal to the session.
    pub fn receive_data(&mut self, data: &[u8], app: &mut Vec<Vec<u8>>) -> Result<(), SessionError> {
        if self.state == SessionState::Dead {
            return Err(SessionError::Dead);
        }
        self.inbuf.extend_from_slice(data);

        loop {
            if self.inbuf.len() < HEADER_SIZE {
                return Ok(());
            }
            let len = u32::from_be_bytes([
                self.inbuf[0],
                self.inbuf[1],
                self.inbuf[2],
                self.inbuf[3],
            ]) as usize;
            if len > MAX_RECORD_SIZE {
                return Err(self.fail(SessionError::RecordTooLarge(len)));
            }
            if len == 0 {
                return Err(self.fail(SessionError::MalformedRecord));
            }
            let body_len = if self.recv.is_some() { len + TAG_SIZE } else { len };
            if self.inbuf.len() < HEADER_SIZE + body_len {
                return Ok(());
            }

            let body = self.inbuf[HEADER_SIZE..HEADER_SIZE + body_len].to_vec();
            self.inbuf.drain(..HEADER_SIZE + body_len);

            let plain = if self.recv.is_some() {
                let (res, counter) = {
                    let recv = self.recv.as_mut().unwrap();
                    let counter = recv.counter;
                    let nonce = recv.nonce(counter);
                    let res = recv.cipher.decrypt(
                        &nonce,
                        Payload {
                            msg: &body,
                            aad: &[],
                        },
                    );
                    (res, counter)
                };
                let plain = match res {
                    Ok(plain) => plain,
                    Err(_) => return Err(self.fail(SessionError::Decrypt)),
                };
                let replayed = {
                    let recv = self.recv.as_mut().unwrap();
                    match recv.last_accepted {
                        Some(last) if counter <= last => true,
                        _ => {
                            recv.last_accepted = Some(counter);
                            recv.counter = counter + 1;
                            false
                        }
                    }
                };
                if replayed {
                    return Err(self.fail(SessionError::Replay(counter)));
                }
                plain
            } else {
                body
            };

            let Some(&type_byte) = plain.first() else {
                return Err(self.fail(SessionError::MalformedRecord));
            };
            let payload = &plain[1..];
            match RecordType::from_byte(type_byte) {
                Some(RecordType::Handshake) => {
                    self.handle_handshake(payload)?;
                }
                Some(RecordType::Application) => {
                    if self.recv.is_none() {
                        return Err(self.fail(SessionError::EarlyApplicationRecord));
                    }
                    if self.state == SessionState::Ack {
                        // implicit confirmation of key agreement
                        self.state = SessionState::Established;
                        debug!("session established");
                    }
                    app.push(payload.to_vec());
                }
                None => {
                    return Err(self.fail(SessionError::UnknownRecordType(type_byte)));
                }
            }
        }
    }

    fn handle_handshake(&mut self, payload: &[u8]) -> Result<(), SessionError> {
        match (self.state, self.initiator) {
            // responder: message 1, the initiator's ephemeral key
            (SessionState::Kex, false) => {
                if payload.len() != ECDH_SIZE {
                    return Err(self.fail(SessionError::MalformedRecord));
                }
                let mut peer_eph = [0u8; ECDH_SIZE];
                peer_eph.copy_from_slice(payload);
                self.peer_eph = Some(peer_eph);
                self.state = SessionState::Sig;

                // message 2: epkB || Sign_B(epkA || epkB)
                let mut signed = Vec::with_capacity(2 * ECDH_SIZE);
                signed.extend_from_slice(&peer_eph);
                signed.extend_from_slice(&self.our_eph);
                let sig = self.keypair.sign(&signed);
                let mut msg = Vec::with_capacity(MSG2_SIZE);
                msg.extend_from_slice(&self.our_eph);
                msg.extend_from_slice(&sig);
                self.queue_record(RecordType::Handshake, &msg);
                Ok(())
            }
            // initiator: message 2, responder's ephemeral key plus signature
            (SessionState::Kex, true) => {
                if payload.len() != MSG2_SIZE {
                    return Err(self.fail(SessionError::MalformedRecord));
                }
                let mut peer_eph = [0u8; ECDH_SIZE];
                peer_eph.copy_from_slice(&payload[..ECDH_SIZE]);
                self.peer_eph = Some(peer_eph);
                self.state = SessionState::Sig;

                let mut signed = Vec::with_capacity(2 * ECDH_SIZE);
                signed.extend_from_slice(&self.our_eph);
                signed.extend_from_slice(&peer_eph);
                if !self.peer_public.verify(&signed, &payload[ECDH_SIZE..]) {
                    return Err(self.fail(SessionError::SignatureFailure));
                }

                // message 3: Sign_A(epkB || epkA)
                let mut signed = Vec::with_capacity(2 * ECDH_SIZE);
                signed.extend_from_slice(&peer_eph);
                signed.extend_from_slice(&self.our_eph);
                let sig = self.keypair.sign(&signed);
                self.queue_record(RecordType::Handshake, &sig);

                self.derive_keys()
            }
            // responder: message 3, the initiator's signature
            (SessionState::Sig, false) => {
                if payload.len() != SIGNATURE_SIZE {
                    return Err(self.fail(SessionError::MalformedRecord));
                }
                let Some(peer_eph) = self.peer_eph else {
                    return Err(self.fail(SessionError::HandshakeOutOfOrder));
                };
                let mut signed = Vec::with_capacity(2 * ECDH_SIZE);
                signed.extend_from_slice(&self.our_eph);
                signed.extend_from_slice(&peer_eph);
                if !self.peer_public.verify(&signed, payload) {
                    return Err(self.fail(SessionError::SignatureFailure));
                }
                self.derive_keys()
            }
            _ => Err(self.fail(SessionError::HandshakeOutOfOrder)),
        }
    }

    /// Computes the shared secret and splits it into independent
    /// send/receive subkeys and nonce bases, so neither direction collides.
    fn derive_keys(&mut self) -> Result<(), SessionError> {
        let (Some(ecdh), Some(peer_eph)) = (self.ecdh.take(), self.peer_eph) else {
            return Err(self.fail(SessionError::HandshakeOutOfOrder));
        };

        let mut shared = [0u8; ECDH_SIZE];
        if let Err(e) = ecdh.compute_shared(&peer_eph, &mut shared) {
            return Err(self.fail(SessionError::KeyAgreement(e)));
        }

        let (eph_initiator, eph_responder) = if self.initiator {
            (self.our_eph, peer_eph)
        } else {
            (peer_eph, self.our_eph)
        };

        // One 64-byte block per direction: 32-byte key || 12-byte nonce base.
        let block = |dir: u8| -> Direction {
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&shared)
                .expect("HMAC accepts any key length");
            mac.update(&self.label);
            mac.update(&eph_initiator);
            mac.update(&eph_responder);
            mac.update(&[dir]);
            let out = mac.finalize().into_bytes();
            let mut nonce_base = [0u8; NONCE_SIZE];
            nonce_base.copy_from_slice(&out[32..32 + NONCE_SIZE]);
            Direction {
                cipher: ChaCha20Poly1305::new_from_slice(&out[..32])
                    .expect("32-byte ChaCha20-Poly1305 key"),
                nonce_base,
                counter: 0,
                last_accepted: None,
            }
        };

        let (send, recv) = if self.initiator {
            (block(0), block(1))
        } else {
            (block(1), block(0))
        };
        self.send = Some(send);
        self.recv = Some(recv);
        self.state = SessionState::Ack;
        debug!("session keys derived, awaiting confirmation");

        for payload in std::mem::take(&mut self.pending) {
            self.seal_record(RecordType::Application, &payload)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Session, Session) {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let a = Session::new(ka.clone(), kb.public(), true, b"test");
        let b = Session::new(kb, ka.public(), false, b"test");
        (a, b)
    }

    fn shuttle(a: &mut Session, b: &mut Session) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let (mut to_a, mut to_b) = (Vec::new(), Vec::new());
        for _ in 0..4 {
            let out = a.take_outgoing();
            if !out.is_empty() {
                b.receive_data(&out, &mut to_b).unwrap();
            }
            let out = b.take_outgoing();
            if !out.is_empty() {
                a.receive_data(&out, &mut to_a).unwrap();
            }
        }
        (to_a, to_b)
    }

    #[test]
    fn handshake_and_records() {
        let (mut a, mut b) = pair();
        a.send_record(b"from a").unwrap();
        b.send_record(b"from b").unwrap();
        let (to_a, to_b) = shuttle(&mut a, &mut b);
        assert_eq!(to_b, vec![b"from a".to_vec()]);
        assert_eq!(to_a, vec![b"from b".to_vec()]);
        assert!(a.established());
        assert!(b.established());
    }

    #[test]
    fn oversized_length_is_fatal() {
        let (mut a, mut b) = pair();
        shuttle(&mut a, &mut b);
        let mut bogus = ((MAX_RECORD_SIZE + 1) as u32).to_be_bytes().to_vec();
        bogus.push(1);
        let mut app = Vec::new();
        assert!(matches!(
            b.receive_data(&bogus, &mut app),
            Err(SessionError::RecordTooLarge(_))
        ));
        assert!(!b.alive());
    }

    #[test]
    fn unknown_record_type_is_fatal() {
        let (_a, mut b) = pair();
        // plaintext record of type 9 before any handshake progress on b
        let mut bogus = 2u32.to_be_bytes().to_vec();
        bogus.extend_from_slice(&[9, 0]);
        let mut app = Vec::new();
        assert!(matches!(
            b.receive_data(&bogus, &mut app),
            Err(SessionError::UnknownRecordType(9))
        ));
        assert!(!b.alive());
    }
}
