//! Session-transport tests: handshake, record flow, and the fatal error
//! policy.

use meshlink::crypto::Keypair;
use meshlink::sptps::{Session, SessionError, SessionState, MAX_RECORD_SIZE};

fn new_pair() -> (Session, Session) {
    let ka = Keypair::generate();
    let kb = Keypair::generate();
    let a = Session::new(ka.clone(), kb.public(), true, b"meshlink meta");
    let b = Session::new(kb, ka.public(), false, b"meshlink meta");
    (a, b)
}

/// Moves queued wire bytes between the sessions until both go quiet,
/// collecting delivered application payloads.
fn shuttle(a: &mut Session, b: &mut Session) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut to_a = Vec::new();
    let mut to_b = Vec::new();
    for _ in 0..6 {
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
fn test_handshake_establishes_both_sides() {
    let (mut a, mut b) = new_pair();
    // records queued before key agreement flush with the handshake and
    // double as the implicit confirmation
    a.send_record(b"hello from a").unwrap();
    b.send_record(b"hello from b").unwrap();

    let (to_a, to_b) = shuttle(&mut a, &mut b);

    assert_eq!(to_b, vec![b"hello from a".to_vec()]);
    assert_eq!(to_a, vec![b"hello from b".to_vec()]);
    assert_eq!(a.state(), SessionState::Established);
    assert_eq!(b.state(), SessionState::Established);
}

#[test]
fn test_records_flow_both_ways_in_order() {
    let (mut a, mut b) = new_pair();
    shuttle(&mut a, &mut b);

    for n in 0..5u8 {
        a.send_record(&[n; 3]).unwrap();
        b.send_record(&[n; 5]).unwrap();
    }
    let (to_a, to_b) = shuttle(&mut a, &mut b);
    assert_eq!(to_b, (0..5u8).map(|n| vec![n; 3]).collect::<Vec<_>>());
    assert_eq!(to_a, (0..5u8).map(|n| vec![n; 5]).collect::<Vec<_>>());
}

#[test]
fn test_signature_mismatch_is_fatal() {
    // B signs with its real key, but A was told B's key is a different one
    let ka = Keypair::generate();
    let kb = Keypair::generate();
    let imposter = Keypair::generate();
    let mut a = Session::new(ka.clone(), imposter.public(), true, b"meshlink meta");
    let mut b = Session::new(kb, ka.public(), false, b"meshlink meta");

    let mut app = Vec::new();
    let msg1 = a.take_outgoing();
    b.receive_data(&msg1, &mut app).unwrap();
    let msg2 = b.take_outgoing();

    assert!(matches!(
        a.receive_data(&msg2, &mut app),
        Err(SessionError::SignatureFailure)
    ));
    assert_eq!(a.state(), SessionState::Dead);

    // no subsequent record is processed
    assert!(matches!(
        a.receive_data(b"anything", &mut app),
        Err(SessionError::Dead)
    ));
    assert!(app.is_empty());
}

#[test]
fn test_oversized_length_field_is_fatal() {
    let (mut a, mut b) = new_pair();
    shuttle(&mut a, &mut b);

    let mut wire = ((MAX_RECORD_SIZE + 1) as u32).to_be_bytes().to_vec();
    wire.push(1);
    let mut app = Vec::new();
    assert!(matches!(
        b.receive_data(&wire, &mut app),
        Err(SessionError::RecordTooLarge(_))
    ));
    assert!(!b.alive());
}

#[test]
fn test_replayed_record_is_rejected() {
    let (mut a, mut b) = new_pair();
    shuttle(&mut a, &mut b);

    a.send_record(b"once").unwrap();
    let wire = a.take_outgoing();
    let mut app = Vec::new();
    b.receive_data(&wire, &mut app).unwrap();
    assert_eq!(app, vec![b"once".to_vec()]);

    // the same bytes again: the receive counter has moved on, so the
    // record no longer authenticates
    let mut app = Vec::new();
    assert!(b.receive_data(&wire, &mut app).is_err());
    assert!(!b.alive());
    assert!(app.is_empty());
}

#[test]
fn test_tampered_record_is_fatal() {
    let (mut a, mut b) = new_pair();
    shuttle(&mut a, &mut b);

    a.send_record(b"payload").unwrap();
    let mut wire = a.take_outgoing();
    let last = wire.len() - 1;
    wire[last] ^= 0x01;
    let mut app = Vec::new();
    assert!(matches!(
        b.receive_data(&wire, &mut app),
        Err(SessionError::Decrypt)
    ));
    assert!(!b.alive());
}

#[test]
fn test_application_record_before_keys_is_fatal() {
    let (_a, mut b) = new_pair();
    // plaintext APPLICATION record straight at a fresh responder
    let mut wire = 2u32.to_be_bytes().to_vec();
    wire.extend_from_slice(&[1, 0x55]);
    let mut app = Vec::new();
    assert!(matches!(
        b.receive_data(&wire, &mut app),
        Err(SessionError::EarlyApplicationRecord)
    ));
    assert!(!b.alive());
}

#[test]
fn test_partial_record_is_visible() {
    let (mut a, mut b) = new_pair();
    shuttle(&mut a, &mut b);

    a.send_record(b"split across reads").unwrap();
    let wire = a.take_outgoing();
    let mut app = Vec::new();
    b.receive_data(&wire[..5], &mut app).unwrap();
    assert!(b.has_partial_record());
    assert!(app.is_empty());

    b.receive_data(&wire[5..], &mut app).unwrap();
    assert!(!b.has_partial_record());
    assert_eq!(app, vec![b"split across reads".to_vec()]);
}
