//! Both parties run the KEM legs independently and must land on the same session.

use sage_crypto::hpke::{self, build_export_context, build_info, combine_secrets};
use sage_crypto::schedule::{
    ack_key, compute_session_id, make_ack_tag, transcript_hash, verify_ack_tag,
};
use sage_crypto::{KeyAlgorithm, KeyPair, Role, SessionConfig, SessionManager};

const CTX: &str = "ctx-integration";
const CLIENT: &str = "did:sage:ethereum:0xclient";
const SERVER: &str = "did:sage:ethereum:0xserver";

struct Derived {
    shared: [u8; 32],
    exporter: [u8; 32],
}

fn client_side(eph_c: &KeyPair, server_kem_pub: &[u8], eph_s_pub: &[u8]) -> Derived {
    let info = build_info(CTX, CLIENT, SERVER);
    let export = build_export_context(CTX);

    let static_leg = hpke::derive(eph_c, server_kem_pub, info.as_bytes()).unwrap();
    let eph_leg = hpke::open(eph_c, eph_s_pub, info.as_bytes()).unwrap();

    let shared = combine_secrets(
        &[static_leg.secrets.shared_secret(), eph_leg.shared_secret()],
        export.as_bytes(),
    )
    .unwrap();
    let exporter = combine_secrets(
        &[static_leg.secrets.exporter_secret(), eph_leg.exporter_secret()],
        export.as_bytes(),
    )
    .unwrap();
    Derived {
        shared: *shared,
        exporter: *exporter,
    }
}

fn server_side(server_kem: &KeyPair, eph_s: &KeyPair, eph_c_pub: &[u8]) -> Derived {
    let info = build_info(CTX, CLIENT, SERVER);
    let export = build_export_context(CTX);

    let static_leg = hpke::open(server_kem, eph_c_pub, info.as_bytes()).unwrap();
    let eph_leg = hpke::derive(eph_s, eph_c_pub, info.as_bytes()).unwrap();

    let shared = combine_secrets(
        &[static_leg.shared_secret(), eph_leg.secrets.shared_secret()],
        export.as_bytes(),
    )
    .unwrap();
    let exporter = combine_secrets(
        &[static_leg.exporter_secret(), eph_leg.secrets.exporter_secret()],
        export.as_bytes(),
    )
    .unwrap();
    Derived {
        shared: *shared,
        exporter: *exporter,
    }
}

#[tokio::test]
async fn test_two_leg_exchange_agrees() {
    let server_kem = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
    let eph_c = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
    let eph_s = KeyPair::generate(KeyAlgorithm::X25519).unwrap();

    let client = client_side(
        &eph_c,
        &server_kem.public_key_bytes().unwrap(),
        &eph_s.public_key_bytes().unwrap(),
    );
    let server = server_side(&server_kem, &eph_s, &eph_c.public_key_bytes().unwrap());

    assert_eq!(client.shared, server.shared);
    assert_eq!(client.exporter, server.exporter);

    let client_sid = compute_session_id(&client.exporter, CTX, CLIENT, SERVER);
    let server_sid = compute_session_id(&server.exporter, CTX, CLIENT, SERVER);
    assert_eq!(client_sid, server_sid);
    assert_eq!(client_sid.as_str().len(), 22);

    let client_mgr = SessionManager::new(SessionConfig::default());
    let server_mgr = SessionManager::new(SessionConfig::default());
    let c = client_mgr
        .create_session(client_sid, &client.exporter, Role::Initiator, None)
        .unwrap();
    let s = server_mgr
        .create_session(server_sid, &server.exporter, Role::Responder, None)
        .unwrap();

    let ct = c.encrypt(b"nineteen bytes long").unwrap();
    assert_eq!(ct.len(), 47);
    assert_eq!(s.decrypt(&ct).unwrap(), b"nineteen bytes long");
}

#[tokio::test]
async fn test_wrong_static_key_breaks_ack_tag() {
    let real_kem = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
    let wrong_kem = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
    let eph_c = KeyPair::generate(KeyAlgorithm::X25519).unwrap();
    let eph_s = KeyPair::generate(KeyAlgorithm::X25519).unwrap();

    // client encapsulates to a key the server does not hold
    let client = client_side(
        &eph_c,
        &wrong_kem.public_key_bytes().unwrap(),
        &eph_s.public_key_bytes().unwrap(),
    );
    let server = server_side(&real_kem, &eph_s, &eph_c.public_key_bytes().unwrap());

    let th = transcript_hash(&[b"transcript"]);
    let server_tag = make_ack_tag(&ack_key(&server.shared).unwrap(), Role::Responder, &th).unwrap();
    let err = verify_ack_tag(&ack_key(&client.shared).unwrap(), Role::Responder, &th, &server_tag)
        .unwrap_err();
    assert_eq!(err.to_string(), "ack tag mismatch");
}
