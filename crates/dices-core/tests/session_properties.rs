//! Session state machine properties: handshake, ratcheting, skipped keys,
//! and the DoS guard.

use dices_core::{
    MAX_MESSAGE_SKIP, OverlayError, SKIPPED_KEY_MAX_AGE_MS, SessionState,
};
use dices_crypto::{CipherData, KEM_CIPHERTEXT_SIZE, Keys, PreKeys};
use dices_proto::{Envelope, EnvelopeFields};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

const NOW: u64 = 1_700_000_000_000;

struct Conversation {
    alice_keys: Keys,
    bob_keys: Keys,
    alice: SessionState,
    bob: SessionState,
    rng: StdRng,
}

/// Run the handshake: Alice initiates with `first`, Bob consumes it.
fn establish(seed: u64, first: &[u8]) -> Conversation {
    let mut rng = StdRng::seed_from_u64(seed);
    let alice_keys = Keys::generate(&mut rng);
    let bob_keys = Keys::generate(&mut rng);
    let bob_prekeys = PreKeys::generate(&mut rng);

    let (envelope, alice) = SessionState::initialize_as_initiator(
        &alice_keys.node_id(),
        &bob_keys.node_id(),
        &bob_prekeys.public(),
        first,
        &alice_keys,
        NOW,
        &mut rng,
    )
    .unwrap();

    assert_eq!(envelope.message_number(), 0);
    assert!(envelope.kem_ciphertext().is_some(), "first message must carry the KEM ciphertext");

    let mut bob = SessionState::initialize_as_responder(
        &envelope,
        &bob_keys.node_id(),
        &bob_prekeys,
        &alice_keys.node_id(),
        NOW,
        &mut rng,
    )
    .unwrap();

    assert_eq!(bob.decrypt_message(&envelope, NOW, &mut rng).unwrap(), first);

    Conversation { alice_keys, bob_keys, alice, bob, rng }
}

/// Give Bob a remote key id so he can send (in production this comes from
/// a DHT fetch of Alice's bundle).
fn give_bob_a_key_id(conversation: &mut Conversation) {
    let alice_prekeys = PreKeys::generate(&mut conversation.rng);
    conversation.bob.set_remote_key_id(alice_prekeys.key_id());
}

#[test]
fn both_peers_compute_the_same_ratchet_id() {
    let conversation = establish(1, b"hello");
    assert_eq!(conversation.alice.ratchet_id(), conversation.bob.ratchet_id());
}

#[test]
fn full_conversation_roundtrips() {
    let mut conversation = establish(2, b"Hello Bob!");
    give_bob_a_key_id(&mut conversation);
    let Conversation { alice_keys, bob_keys, mut alice, mut bob, mut rng } = conversation;

    let reply = bob.encrypt_message(b"Hi Alice!", &bob_keys, None, &mut rng).unwrap();
    assert_eq!(alice.decrypt_message(&reply, NOW, &mut rng).unwrap(), b"Hi Alice!");

    let third = alice.encrypt_message(b"How are you?", &alice_keys, None, &mut rng).unwrap();
    assert_eq!(bob.decrypt_message(&third, NOW, &mut rng).unwrap(), b"How are you?");
}

#[test]
fn initiator_cannot_decrypt_before_first_reply() {
    let mut conversation = establish(3, b"msg0");

    // Forge an envelope that reuses the DH key Alice already ratcheted
    // against, so no DH ratchet triggers on her side; her receiving chain
    // is still uninitialized by design.
    let fields = EnvelopeFields {
        key_id: [0u8; 8],
        dh_public_key: *conversation.alice.root_chain().remote_dh_public_key(),
        message_number: 0,
        previous_chain_length: 0,
        kem_ciphertext: None,
        cipher_data: CipherData::encrypt(&[0u8; 32], b"early", &mut conversation.rng),
    };
    let envelope = Envelope::create(fields, &conversation.bob_keys).unwrap();

    let result = conversation.alice.decrypt_message(&envelope, NOW, &mut conversation.rng);
    assert!(matches!(result, Err(OverlayError::UninitializedReceivingChain)));
}

#[test]
fn responder_requires_kem_ciphertext() {
    let mut conversation = establish(4, b"msg0");
    give_bob_a_key_id(&mut conversation);
    let Conversation { alice_keys, bob_keys, mut alice, mut bob, mut rng } = conversation;

    // A later message (no KEM ciphertext) must not initialize a session.
    let reply = bob.encrypt_message(b"hi", &bob_keys, None, &mut rng).unwrap();
    alice.decrypt_message(&reply, NOW, &mut rng).unwrap();
    let late = alice.encrypt_message(b"later", &alice_keys, None, &mut rng).unwrap();

    let charlie_prekeys = PreKeys::generate(&mut rng);
    let result = SessionState::initialize_as_responder(
        &late,
        &bob_keys.node_id(),
        &charlie_prekeys,
        &alice_keys.node_id(),
        NOW,
        &mut rng,
    );
    assert!(matches!(result, Err(OverlayError::MissingKemCiphertext)));
}

#[test]
fn encrypt_without_remote_key_id_fails() {
    let mut conversation = establish(5, b"msg0");

    // Bob never learned Alice's bundle id.
    let result = conversation.bob.encrypt_message(
        b"too soon",
        &conversation.bob_keys,
        None,
        &mut conversation.rng,
    );
    assert!(matches!(result, Err(OverlayError::MissingRemoteKeyId)));
}

#[test]
fn out_of_order_messages_recover_via_skipped_keys() {
    let conversation = establish(6, b"msg0");
    let Conversation { alice_keys, mut alice, mut bob, mut rng, .. } = conversation;

    let envelope1 = alice.encrypt_message(b"msg1", &alice_keys, None, &mut rng).unwrap();
    let envelope2 = alice.encrypt_message(b"msg2", &alice_keys, None, &mut rng).unwrap();

    // Bob receives message 2 first, skipping message 1.
    assert_eq!(bob.decrypt_message(&envelope2, NOW, &mut rng).unwrap(), b"msg2");
    assert_eq!(bob.skipped_keys().len(), 1);

    // The late message decrypts from the cache, which is then emptied.
    assert_eq!(bob.decrypt_message(&envelope1, NOW, &mut rng).unwrap(), b"msg1");
    assert!(bob.skipped_keys().is_empty());
}

#[test]
fn skip_guard_rejects_runaway_message_numbers() {
    let conversation = establish(7, b"msg0");
    let Conversation { alice_keys, mut alice, mut bob, mut rng, .. } = conversation;

    // Advance Alice's sending chain far past the bound.
    for _ in 0..(MAX_MESSAGE_SKIP + 500) {
        alice.encrypt_message(b"x", &alice_keys, None, &mut rng).unwrap();
    }
    let runaway = alice.encrypt_message(b"runaway", &alice_keys, None, &mut rng).unwrap();

    let skipped_before = bob.skipped_keys().len();
    let position_before = bob.root_chain().receiving_chain().message_number();

    let result = bob.decrypt_message(&runaway, NOW, &mut rng);
    assert!(matches!(
        result,
        Err(OverlayError::MessageSkipTooLarge { skip, max: MAX_MESSAGE_SKIP }) if skip > MAX_MESSAGE_SKIP
    ));

    // Guard fires before any chain work: receiver state is unchanged.
    assert_eq!(bob.skipped_keys().len(), skipped_before);
    assert_eq!(bob.root_chain().receiving_chain().message_number(), position_before);
}

#[test]
fn dh_ratchet_follows_remote_key_change() {
    let mut conversation = establish(8, b"msg0");
    give_bob_a_key_id(&mut conversation);
    let Conversation { bob_keys, mut alice, mut bob, mut rng, .. } = conversation;

    let bob_dh_before_send = bob.root_chain().dh_public_key();
    let reply = bob.encrypt_message(b"msg1", &bob_keys, None, &mut rng).unwrap();

    // Sending alone must not move Bob's DH key.
    assert_eq!(bob.root_chain().dh_public_key(), bob_dh_before_send);

    let alice_remote_before = *alice.root_chain().remote_dh_public_key();
    alice.decrypt_message(&reply, NOW, &mut rng).unwrap();

    assert_eq!(*alice.root_chain().remote_dh_public_key(), bob_dh_before_send);
    assert_ne!(*alice.root_chain().remote_dh_public_key(), alice_remote_before);
}

#[test]
fn ml_kem_rekey_at_message_bound_carries_ciphertext() {
    let conversation = establish(9, b"msg0");
    let Conversation { alice_keys, mut alice, mut rng, .. } = conversation;

    for i in 1..100 {
        alice.encrypt_message(format!("msg{i}").as_bytes(), &alice_keys, None, &mut rng).unwrap();
    }
    assert!(alice.should_ratchet(100, u64::MAX, NOW));

    // A fresh bundle from Bob's rotation arrives for the scheduled rekey.
    let bob_new_prekeys = PreKeys::generate(&mut rng);
    let kem_ciphertext =
        alice.perform_ml_kem_ratchet(&bob_new_prekeys.public(), NOW + 1, &mut rng).unwrap();
    let envelope = alice.encrypt_message(b"msg100", &alice_keys, Some(kem_ciphertext), &mut rng).unwrap();

    assert_eq!(envelope.kem_ciphertext().map(|ct| ct.len()), Some(KEM_CIPHERTEXT_SIZE));
    assert_eq!(envelope.key_id(), &bob_new_prekeys.key_id());
    assert_eq!(envelope.message_number(), 0);
    assert_eq!(envelope.previous_chain_length(), 100);
    assert_eq!(alice.ratchet_at(), NOW + 1);
}

#[test]
fn should_ratchet_fires_on_time_bound() {
    let conversation = establish(10, b"msg0");

    assert!(!conversation.alice.should_ratchet(100, 3_600_000, NOW + 3_599_999));
    assert!(conversation.alice.should_ratchet(100, 3_600_000, NOW + 3_600_000));
}

#[test]
fn forward_secrecy_chain_key_advances_on_send() {
    let conversation = establish(11, b"msg0");
    let Conversation { alice_keys, mut alice, mut bob, mut rng, .. } = conversation;

    let secret_before = alice.root_chain().sending_chain().secret().unwrap().to_bytes();
    let envelope = alice.encrypt_message(b"msg1", &alice_keys, None, &mut rng).unwrap();
    let secret_after = alice.root_chain().sending_chain().secret().unwrap().to_bytes();

    assert_ne!(secret_before, secret_after, "sending chain must advance per message");

    // The receiver still decrypts: its chain derives the consumed position.
    assert_eq!(bob.decrypt_message(&envelope, NOW, &mut rng).unwrap(), b"msg1");
}

#[test]
fn state_survives_storage_roundtrip_mid_conversation() {
    let mut conversation = establish(12, b"msg0");
    give_bob_a_key_id(&mut conversation);
    let Conversation { alice_keys, bob_keys, mut alice, bob, mut rng } = conversation;

    // Persist and reload Bob between messages.
    let mut bob = SessionState::from_bytes(&bob.to_bytes().unwrap()).unwrap();

    let reply = bob.encrypt_message(b"after reload", &bob_keys, None, &mut rng).unwrap();
    assert_eq!(alice.decrypt_message(&reply, NOW, &mut rng).unwrap(), b"after reload");

    let mut alice = SessionState::from_bytes(&alice.to_bytes().unwrap()).unwrap();
    let envelope = alice.encrypt_message(b"both reloaded", &alice_keys, None, &mut rng).unwrap();
    assert_eq!(bob.decrypt_message(&envelope, NOW, &mut rng).unwrap(), b"both reloaded");
}

#[test]
fn prune_drops_only_stale_skipped_keys() {
    let conversation = establish(13, b"msg0");
    let Conversation { alice_keys, mut alice, mut bob, mut rng, .. } = conversation;

    let envelope1 = alice.encrypt_message(b"msg1", &alice_keys, None, &mut rng).unwrap();
    let envelope2 = alice.encrypt_message(b"msg2", &alice_keys, None, &mut rng).unwrap();
    let envelope3 = alice.encrypt_message(b"msg3", &alice_keys, None, &mut rng).unwrap();

    // Skip messages 1 and 2; their keys get cached at different times.
    drop(envelope1);
    bob.decrypt_message(&envelope3, NOW, &mut rng).unwrap();
    assert_eq!(bob.skipped_keys().len(), 2);

    let removed = bob.prune_skipped_keys(SKIPPED_KEY_MAX_AGE_MS, NOW + SKIPPED_KEY_MAX_AGE_MS + 1);
    assert_eq!(removed, 2);
    assert!(bob.skipped_keys().is_empty());

    // A pruned key is gone for good.
    assert!(bob.decrypt_message(&envelope2, NOW, &mut rng).is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Any permutation of a message burst decrypts correctly, and the
    /// skipped-key cache is empty once every message is consumed.
    #[test]
    fn any_permutation_decrypts(
        seed in any::<u64>(),
        order in Just((0usize..6).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let conversation = establish(seed, b"msg0");
        let Conversation { alice_keys, mut alice, mut bob, mut rng, .. } = conversation;

        let envelopes: Vec<_> = (1..=6)
            .map(|i| {
                (
                    format!("msg{i}"),
                    alice
                        .encrypt_message(format!("msg{i}").as_bytes(), &alice_keys, None, &mut rng)
                        .unwrap(),
                )
            })
            .collect();

        for &index in &order {
            let (expected, envelope) = &envelopes[index];
            let plaintext = bob.decrypt_message(envelope, NOW, &mut rng).unwrap();
            prop_assert_eq!(&plaintext, expected.as_bytes());
        }

        prop_assert!(bob.skipped_keys().is_empty());
    }
}
