use coinshuffle_keypair::Keypair;
use coinshuffle_privacy::{AnonymouslyEncryptedData, LAYER_OVERHEAD, key_seed};

const NONCE: &[u8] = &42u64.to_le_bytes();

/// Wraps `payload` for `hops`, farthest hop first, the way a shuffling
/// participant builds its token.
fn wrap(payload: &[u8], sender: &Keypair, hops: &[&Keypair]) -> Vec<u8> {
    let mut bytes = payload.to_vec();
    for hop in hops.iter().rev() {
        bytes = AnonymouslyEncryptedData::encrypt(
            &bytes,
            &sender.secret_bytes(),
            &hop.public_key(),
            NONCE,
        )
        .expect("encryption failed")
        .to_bytes();
    }
    bytes
}

#[test]
fn each_hop_peels_one_layer() {
    let sender = Keypair::from_passphrase("sender");
    let hops = [
        Keypair::from_passphrase("hop-1"),
        Keypair::from_passphrase("hop-2"),
        Keypair::from_passphrase("hop-3"),
    ];
    let refs: Vec<&Keypair> = hops.iter().collect();
    let recipient = Keypair::from_passphrase("recipient").public_key();

    let mut bytes = wrap(&recipient, &sender, &refs);
    assert_eq!(bytes.len(), 32 + 3 * LAYER_OVERHEAD);

    for hop in &hops {
        let layer = AnonymouslyEncryptedData::from_bytes(&bytes).expect("layer");
        bytes = layer.decrypt(&hop.secret_bytes()).expect("hop decrypt");
    }
    assert_eq!(bytes, recipient);
}

#[test]
fn revealed_seeds_open_the_whole_chain() {
    let sender = Keypair::from_passphrase("sender");
    let hops = [
        Keypair::from_passphrase("hop-1"),
        Keypair::from_passphrase("hop-2"),
    ];
    let refs: Vec<&Keypair> = hops.iter().collect();
    let recipient = Keypair::from_passphrase("recipient").public_key();

    let mut bytes = wrap(&recipient, &sender, &refs);
    for hop in &hops {
        let seed = key_seed(&sender.secret_bytes(), &hop.public_key(), NONCE);
        let layer = AnonymouslyEncryptedData::from_bytes(&bytes).expect("layer");
        bytes = layer
            .decrypt_with_seed(&seed, &hop.public_key())
            .expect("seed decrypt");
    }
    assert_eq!(bytes, recipient);
}

#[test]
fn skipping_a_hop_fails() {
    let sender = Keypair::from_passphrase("sender");
    let hops = [
        Keypair::from_passphrase("hop-1"),
        Keypair::from_passphrase("hop-2"),
    ];
    let refs: Vec<&Keypair> = hops.iter().collect();
    let bytes = wrap(b"payload", &sender, &refs);

    let layer = AnonymouslyEncryptedData::from_bytes(&bytes).expect("layer");
    assert!(layer.decrypt(&hops[1].secret_bytes()).is_err());
}
