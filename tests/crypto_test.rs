//! Unit tests for the identity key and ECDH primitives.

use meshlink::crypto::{
    signature_size, CryptoError, Ecdh, Keypair, PublicKey, X25519, ECDH_SIZE,
    PUBLIC_KEY_BASE64_LEN, SIGNATURE_SIZE,
};

#[test]
fn test_sign_verify() {
    let kp = Keypair::generate();
    let msg = [0x42u8; 32];
    let sig = kp.sign(&msg);
    assert_eq!(sig.len(), SIGNATURE_SIZE);
    assert!(kp.public().verify(&msg, &sig));
}

#[test]
fn test_sign_verify_various_lengths() {
    let kp = Keypair::generate();
    for len in [0usize, 1, 17, 63, 255, 4096] {
        let msg = vec![0xa5u8; len];
        let sig = kp.sign(&msg);
        assert!(kp.public().verify(&msg, &sig), "length {}", len);
    }
}

#[test]
fn test_verify_wrong_message() {
    let kp = Keypair::generate();
    let sig = kp.sign(b"original");
    assert!(!kp.public().verify(b"tampered", &sig));
}

#[test]
fn test_verify_wrong_key() {
    let kp1 = Keypair::generate();
    let kp2 = Keypair::generate();
    let sig = kp1.sign(b"message");
    assert!(!kp2.public().verify(b"message", &sig));
}

#[test]
fn test_signature_size() {
    assert_eq!(signature_size(), 64);
}

#[test]
fn test_base64_roundtrip() {
    let kp = Keypair::generate();
    let encoded = kp.public().to_base64();
    assert_eq!(encoded.len(), PUBLIC_KEY_BASE64_LEN);
    let decoded = PublicKey::from_base64(&encoded).unwrap();
    assert_eq!(decoded, kp.public());
    assert_eq!(decoded.to_base64(), encoded);
}

#[test]
fn test_base64_wrong_length_rejected() {
    assert!(matches!(
        PublicKey::from_base64("AAAA"),
        Err(CryptoError::InvalidBase64Length(4))
    ));
    let kp = Keypair::generate();
    let mut padded = kp.public().to_base64();
    padded.push('=');
    assert!(PublicKey::from_base64(&padded).is_err());
}

#[test]
fn test_private_bytes_roundtrip() {
    let kp = Keypair::generate();
    let bytes = kp.to_private_bytes();
    let restored = Keypair::from_private_bytes(&bytes).unwrap();
    assert_eq!(restored.public(), kp.public());
    assert_eq!(restored.sign(b"x"), kp.sign(b"x"));
}

#[test]
fn test_key_file_roundtrip() {
    let kp = Keypair::generate();
    let blob = kp.to_key_file();
    let restored = Keypair::from_key_file(&blob).unwrap();
    assert_eq!(restored.public(), kp.public());
}

#[test]
fn test_key_file_mismatched_public_rejected() {
    let kp = Keypair::generate();
    let mut blob = kp.to_key_file();
    blob[95] ^= 0xff;
    assert!(Keypair::from_key_file(&blob).is_err());
}

#[test]
fn test_ecdh_agreement() {
    let mut pub_a = [0u8; ECDH_SIZE];
    let mut pub_b = [0u8; ECDH_SIZE];
    let state_a = X25519::generate_public(&mut pub_a);
    let state_b = X25519::generate_public(&mut pub_b);
    assert_ne!(pub_a, pub_b);

    let mut shared_a = [0u8; 32];
    let mut shared_b = [0u8; 32];
    state_a.compute_shared(&pub_b, &mut shared_a).unwrap();
    state_b.compute_shared(&pub_a, &mut shared_b).unwrap();
    assert_eq!(shared_a, shared_b);
}

#[test]
fn test_ecdh_rejects_zero_point() {
    let mut pub_a = [0u8; ECDH_SIZE];
    let state = X25519::generate_public(&mut pub_a);
    let mut shared = [0u8; 32];
    assert!(state.compute_shared(&[0u8; ECDH_SIZE], &mut shared).is_err());
}
