// tests/crypto_keys.rs
use ouro_validator::chain::Transaction;
use ouro_validator::crypto::{self, keys};

#[test]
fn key_sign_verify() {
    let seed: [u8; 32] = [42u8; 32];

    let pubkey = keys::public_from_seed(&seed).expect("should derive pubkey");
    assert_eq!(pubkey.len(), 32, "pubkey should be 32 bytes");

    let sk = keys::signing_key_from_seed(&seed);
    let msg = b"hello validator";
    let sig = crypto::sign_bytes(&sk, msg);
    assert_eq!(sig.len(), 64, "signature should be 64 bytes");

    assert!(crypto::verify_bytes(&pubkey, msg, &sig), "signature should verify");
    assert!(
        !crypto::verify_bytes(&pubkey, b"wrong message", &sig),
        "signature should not verify with wrong message"
    );
    let wrong_pubkey = keys::public_from_seed(&[99u8; 32]).expect("pubkey");
    assert!(
        !crypto::verify_bytes(&wrong_pubkey, msg, &sig),
        "signature should not verify with wrong pubkey"
    );
}

#[test]
fn hex_keys_round_trip_to_same_address() {
    let sk = keys::signing_key_from_seed(&[5u8; 32]);
    let parsed = keys::signing_key_from_hex(&format!("0x{}", hex::encode(sk.to_bytes())))
        .expect("seed hex parses");
    assert_eq!(crypto::address_of(&sk), crypto::address_of(&parsed));

    let vk = keys::verifying_key_from_hex(&crypto::pubkey_hex(&sk)).expect("pubkey hex parses");
    assert_eq!(crypto::address_from_pubkey(vk.as_bytes()), crypto::address_of(&sk));

    assert!(keys::signing_key_from_hex("abcd").is_err());
    assert!(keys::verifying_key_from_hex("zz").is_err());
}

#[test]
fn transaction_signature_binds_every_field() {
    let sk = keys::signing_key_from_seed(&[1u8; 32]);
    let to = crypto::address_of(&keys::signing_key_from_seed(&[2u8; 32]));
    let tx = Transaction::new_signed(&sk, &to, 250, 3, 7);
    assert!(tx.validate().is_ok());

    let mut raised = tx.clone();
    raised.gas_price = 8;
    assert!(raised.validate().is_err(), "gas price is covered by the hash");

    // re-hashing does not help without the key
    let mut rehashed = tx.clone();
    rehashed.value = 10_000;
    rehashed.hash = rehashed.compute_hash();
    assert_eq!(rehashed.validate().unwrap_err(), "bad signature");

    let mut stolen = tx;
    stolen.from = to;
    assert!(stolen.validate().is_err(), "sender must match the public key");
}
