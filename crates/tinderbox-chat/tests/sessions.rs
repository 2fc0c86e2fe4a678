//! Session establishment and persistence through the facade, with real
//! X3DH sessions between peers sharing one in-memory directory.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, directory, init_tracing, peer, Peer, PeerBuilder};
use tinderbox_chat::{ChatError, KeyDistributionService, Participant, SecureSession};
use tinderbox_crypto::{FileCredentialStore, Identity, MessageType, SealedCredentialStore};

/// Alice opens a session with Bob; Bob accepts it. Both are stored.
async fn connect(alice: &Peer, bob: &Peer) -> (SecureSession, SecureSession) {
    let outgoing = alice.chat.start_as_sender(&bob.chat.participant(), None).await.unwrap();
    alice.chat.store_session(&outgoing).await.unwrap();
    let first = outgoing.encrypt_string("hello bob").await.unwrap();

    let incoming = bob
        .chat
        .start_as_receiver(&alice.chat.participant(), &first, None)
        .await
        .unwrap();
    bob.chat.store_session(&incoming).await.unwrap();
    assert_eq!(incoming.decrypt_string(&first).await.unwrap(), "hello bob");
    (outgoing, incoming)
}

// ── Round trips ──────────────────────────────────────────────────────

#[tokio::test]
async fn hundred_turns_with_reload_between_each() {
    init_tracing();
    let directory = directory();
    let dir = tempfile::TempDir::new().unwrap();
    let sealed = SealedCredentialStore::new(FileCredentialStore::open(dir.path()).unwrap(), b"bob's storage secret").unwrap();
    let bob = PeerBuilder::new(&directory, "bob", config(5))
        .credentials(Arc::new(sealed))
        .build();
    let alice = peer(&directory, "alice", config(5));
    bob.chat.rotate_keys().await.unwrap();
    alice.chat.rotate_keys().await.unwrap();
    connect(&alice, &bob).await;

    for turn in 0..100 {
        let to_bob = alice.chat.existing_session("bob", None).unwrap().unwrap();
        let to_alice = bob.chat.existing_session("alice", None).unwrap().unwrap();
        let text = format!("turn {turn}: {}", "x".repeat(turn));

        if turn % 2 == 0 {
            let message = to_bob.encrypt_string(&text).await.unwrap();
            assert_eq!(to_alice.decrypt_string(&message).await.unwrap(), text);
        } else {
            let message = to_alice.encrypt_string(&text).await.unwrap();
            assert_eq!(to_bob.decrypt_string(&message).await.unwrap(), text);
        }
    }
}

#[tokio::test]
async fn session_survives_a_restart() {
    let directory = directory();
    let dir = tempfile::TempDir::new().unwrap();
    let bob = PeerBuilder::new(&directory, "bob", config(3))
        .credentials(Arc::new(FileCredentialStore::open(dir.path()).unwrap()))
        .build();
    let alice = peer(&directory, "alice", config(3));
    bob.chat.rotate_keys().await.unwrap();
    let (outgoing, _) = connect(&alice, &bob).await;

    bob.chat.flush_replenishment().await;
    let identity = Identity::from_secret_bytes(&bob.identity_secret);
    let credentials = bob.credentials.clone();
    drop(bob);
    let bob = PeerBuilder::new(&directory, "bob", config(3))
        .identity(identity)
        .credentials(credentials)
        .build();

    let message = outgoing.encrypt_string("still there?").await.unwrap();
    let restored = bob.chat.existing_session("alice", None).unwrap().unwrap();
    assert!(restored.is_persistent());
    assert_eq!(restored.decrypt_string(&message).await.unwrap(), "still there?");

    // The restarted instance still owns its prekeys.
    let log = bob.chat.rotate_keys().await.unwrap();
    assert_eq!(log.long_term_keys_added, 0);
}

#[tokio::test]
async fn initiator_sends_prekey_messages_until_first_reply() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(2));
    let bob = peer(&directory, "bob", config(2));
    bob.chat.rotate_keys().await.unwrap();
    let (outgoing, incoming) = connect(&alice, &bob).await;

    let second = outgoing.encrypt_string("again").await.unwrap();
    assert_eq!(second.message_type(), MessageType::PreKey);
    incoming.decrypt(&second).await.unwrap();

    let reply = incoming.encrypt_string("hi alice").await.unwrap();
    assert_eq!(outgoing.decrypt_string(&reply).await.unwrap(), "hi alice");
    let third = outgoing.encrypt_string("now regular").await.unwrap();
    assert_eq!(third.message_type(), MessageType::Regular);
    assert_eq!(incoming.decrypt_string(&third).await.unwrap(), "now regular");
}

// ── Uniqueness ───────────────────────────────────────────────────────

#[tokio::test]
async fn second_session_with_same_name_is_rejected_on_either_side() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(5));
    let bob = peer(&directory, "bob", config(5));
    alice.chat.rotate_keys().await.unwrap();
    bob.chat.rotate_keys().await.unwrap();
    let (outgoing, _) = connect(&alice, &bob).await;

    let result = alice.chat.start_as_sender(&bob.chat.participant(), None).await;
    assert!(matches!(result, Err(ChatError::SessionAlreadyExists { .. })));

    let again = outgoing.encrypt_string("replayed").await.unwrap();
    let result = bob.chat.start_as_receiver(&alice.chat.participant(), &again, None).await;
    assert!(matches!(result, Err(ChatError::SessionAlreadyExists { .. })));

    // Bob cannot open his own "default" session with Alice either.
    let result = bob.chat.start_as_sender(&alice.chat.participant(), None).await;
    assert!(matches!(result, Err(ChatError::SessionAlreadyExists { .. })));

    // A different name is a different session.
    let named = bob
        .chat
        .start_as_sender(&alice.chat.participant(), Some("work"))
        .await
        .unwrap();
    assert_eq!(named.name(), "work");
}

#[tokio::test]
async fn deleted_session_can_be_started_again() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    bob.chat.rotate_keys().await.unwrap();
    connect(&alice, &bob).await;

    alice.chat.delete_session("bob", None).unwrap();
    assert!(alice.chat.existing_session("bob", None).unwrap().is_none());
    assert!(matches!(
        alice.chat.delete_session("bob", None),
        Err(ChatError::SessionNotFound { .. })
    ));

    let session = alice.chat.start_as_sender(&bob.chat.participant(), None).await.unwrap();
    alice.chat.store_session(&session).await.unwrap();
    assert!(alice.chat.existing_session("bob", None).unwrap().is_some());
}

#[tokio::test]
async fn delete_all_sessions_with_one_peer() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    let carol = peer(&directory, "carol", config(3));
    bob.chat.rotate_keys().await.unwrap();
    carol.chat.rotate_keys().await.unwrap();

    for name in [None, Some("work")] {
        let session = alice.chat.start_as_sender(&bob.chat.participant(), name).await.unwrap();
        alice.chat.store_session(&session).await.unwrap();
    }
    let session = alice.chat.start_as_sender(&carol.chat.participant(), None).await.unwrap();
    alice.chat.store_session(&session).await.unwrap();

    alice.chat.delete_all_sessions_with("bob").unwrap();
    assert!(alice.chat.existing_session("bob", None).unwrap().is_none());
    assert!(alice.chat.existing_session("bob", Some("work")).unwrap().is_none());
    assert!(alice.chat.existing_session("carol", None).unwrap().is_some());
}

#[tokio::test]
async fn handle_kept_across_reset_does_not_resurrect_session() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    bob.chat.rotate_keys().await.unwrap();
    let (outgoing, _) = connect(&alice, &bob).await;

    alice.chat.reset().await.unwrap();
    let result = outgoing.encrypt_string("after reset").await;
    assert!(matches!(result, Err(ChatError::SessionNotFound { .. })));
    assert!(alice.chat.existing_session("bob", None).unwrap().is_none());

    // Storing the handle again is an explicit opt back in.
    alice.chat.store_session(&outgoing).await.unwrap();
    outgoing.encrypt_string("stored again").await.unwrap();
    assert!(alice.chat.existing_session("bob", None).unwrap().is_some());
}

// ── Multiple recipients ──────────────────────────────────────────────

#[tokio::test]
async fn multiple_recipients_in_one_batch() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    let carol = peer(&directory, "carol", config(3));
    bob.chat.rotate_keys().await.unwrap();
    carol.chat.rotate_keys().await.unwrap();

    let sessions = alice
        .chat
        .start_multiple_as_sender(&[bob.chat.participant(), carol.chat.participant()], None)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);

    for (session, recipient) in sessions.iter().zip([&bob, &carol]) {
        assert_eq!(session.participant_identity(), recipient.chat.identity());
        let message = session.encrypt_string("group hello").await.unwrap();
        let incoming = recipient
            .chat
            .start_as_receiver(&alice.chat.participant(), &message, None)
            .await
            .unwrap();
        assert_eq!(incoming.decrypt_string(&message).await.unwrap(), "group hello");
    }
}

#[tokio::test]
async fn batch_checks_existing_sessions_before_fetching() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    let carol = peer(&directory, "carol", config(3));
    bob.chat.rotate_keys().await.unwrap();
    carol.chat.rotate_keys().await.unwrap();

    let existing = alice.chat.start_as_sender(&carol.chat.participant(), None).await.unwrap();
    alice.chat.store_session(&existing).await.unwrap();

    let result = alice
        .chat
        .start_multiple_as_sender(&[bob.chat.participant(), carol.chat.participant()], None)
        .await;
    assert!(matches!(result, Err(ChatError::SessionAlreadyExists { .. })));
    assert_eq!(directory.one_time_key_count("bob"), 3);
}

#[tokio::test]
async fn batch_rejects_the_same_peer_twice() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    bob.chat.rotate_keys().await.unwrap();

    let result = alice
        .chat
        .start_multiple_as_sender(&[bob.chat.participant(), bob.chat.participant()], None)
        .await;
    assert!(matches!(result, Err(ChatError::DuplicateParticipant(_))));
    assert_eq!(directory.one_time_key_count("bob"), 3);
}

#[tokio::test]
async fn batch_fails_when_a_key_set_is_missing() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    bob.chat.rotate_keys().await.unwrap();
    let unknown = Participant::new("dave", Identity::generate().public_key_bytes());

    let result = alice
        .chat
        .start_multiple_as_sender(&[bob.chat.participant(), unknown], None)
        .await;
    assert!(matches!(
        result,
        Err(ChatError::PublicKeySetsMismatch { requested: 2, received: 1 })
    ));
}

// ── Prekey lifecycle around handshakes ───────────────────────────────

#[tokio::test]
async fn accepted_handshake_replenishes_one_time_keys() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let mut bob_config = config(3);
    bob_config.replenish_debounce_ms = 200;
    let bob = peer(&directory, "bob", bob_config);
    bob.chat.rotate_keys().await.unwrap();

    connect(&alice, &bob).await;
    assert_eq!(bob.one_time_keys().await.len(), 2);

    bob.chat.flush_replenishment().await;
    assert_eq!(bob.one_time_keys().await.len(), 3);
    assert_eq!(directory.one_time_key_count("bob"), 3);

    // Nothing left for rotation to do.
    let log = bob.chat.rotate_keys().await.unwrap();
    assert_eq!(log.one_time_keys_added, 0);
    assert_eq!(log.one_time_keys_marked_orphaned, 0);
}

#[tokio::test]
async fn late_handshakes_use_outdated_keys_until_deleted() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    let carol = peer(&directory, "carol", config(3));
    bob.chat.rotate_keys().await.unwrap();

    let from_alice = alice.chat.start_as_sender(&bob.chat.participant(), None).await.unwrap();
    let from_carol = carol.chat.start_as_sender(&bob.chat.participant(), None).await.unwrap();
    let alice_first = from_alice.encrypt_string("sent before rotation").await.unwrap();
    let carol_first = from_carol.encrypt_string("very late").await.unwrap();

    // Long-term key expires and is replaced; still answerable while outdated.
    bob.clock.advance(Duration::from_secs(100));
    let log = bob.chat.rotate_keys().await.unwrap();
    assert_eq!(log.long_term_keys_marked_outdated, 1);
    let incoming = bob
        .chat
        .start_as_receiver(&alice.chat.participant(), &alice_first, None)
        .await
        .unwrap();
    assert_eq!(incoming.decrypt_string(&alice_first).await.unwrap(), "sent before rotation");

    // Past the grace period the key is gone.
    bob.clock.advance(Duration::from_secs(50));
    let log = bob.chat.rotate_keys().await.unwrap();
    assert_eq!(log.long_term_keys_deleted, 1);
    let result = bob
        .chat
        .start_as_receiver(&carol.chat.participant(), &carol_first, None)
        .await;
    assert!(matches!(result, Err(ChatError::KeyNotFound(_))));
}

// ── Reset ────────────────────────────────────────────────────────────

#[tokio::test]
async fn reset_erases_everything_and_can_be_repeated() {
    let directory = directory();
    let alice = peer(&directory, "alice", config(3));
    let bob = peer(&directory, "bob", config(3));
    alice.chat.rotate_keys().await.unwrap();
    bob.chat.rotate_keys().await.unwrap();
    connect(&alice, &bob).await;

    bob.chat.reset().await.unwrap();

    assert!(!directory.has_entity("bob"));
    assert!(bob.one_time_keys().await.is_empty());
    assert!(bob.long_term_keys().is_empty());
    assert!(bob.chat.existing_session("alice", None).unwrap().is_none());

    bob.chat.reset().await.unwrap();

    // Starting over republishes from scratch.
    let log = bob.chat.rotate_keys().await.unwrap();
    assert_eq!(log.long_term_keys_added, 1);
    assert_eq!(log.one_time_keys_added, 3);
    let mallory = directory.client("mallory", Identity::generate().public_key_bytes());
    assert!(mallory.get_public_key_set("bob").await.is_ok());
}
