//! Generate test vectors for web client interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use std::sync::Arc;

use protocol::{codec, Handshake, Identity, Jwk, MessagePayload, PeerPublicKey, WireFrame};

fn main() {
    // Numeric id derivation for fixed public keys
    print_id_vector("zero_key", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
    print_id_vector("ff_key", "__________________________________________8");
    print_id_vector("counting_key", "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA");

    // A complete exchange between two fresh identities
    let alice = Arc::new(Identity::generate());
    let bob = Arc::new(Identity::generate());

    println!("export const aliceCredential = {:?};", alice.login_credential());
    println!("export const bobCredential = {:?};", bob.login_credential());

    let mut dialer = Handshake::new_initiator(alice.clone(), bob.numeric_id().clone());
    let mut listener = Handshake::new_responder(bob.clone(), alice.numeric_id().clone());

    let syn = dialer.start().expect("start failed");
    print_frame("syn", &syn);

    let accepted = listener.receive(&syn).expect("syn rejected");
    let ack = accepted.reply.clone().expect("responder must reply");
    print_frame("ack", &ack);

    let completed = dialer.receive(&ack).expect("ack rejected");
    println!(
        "export const sharedSecretFingerprint = {:?};",
        completed.secret.fingerprint()
    );

    let text = codec::seal_message(&completed.secret, &MessagePayload::text("Hello"))
        .expect("seal failed");
    print_frame("text_msg", &text);
}

fn print_id_vector(name: &str, x: &str) {
    let jwk = Jwk {
        kty: "OKP".to_string(),
        crv: "X25519".to_string(),
        x: x.to_string(),
        d: None,
    };
    let key = PeerPublicKey::import(&jwk).expect("invalid vector key");
    println!(
        "export const {} = {{ x: {:?}, id: {:?} }};",
        name,
        x,
        key.numeric_id().as_str()
    );
}

fn print_frame(name: &str, frame: &WireFrame) {
    let json = frame.to_json().expect("serialization failed");
    println!("export const {} = {};", name, json);
}
