use std::sync::Arc;

use lb_core::Context;
use lb_crypto::{generate_salt, Crypto, CryptoError, KdfParams, XChaChaCrypto};
use lb_store::{
    Ciphertext, CollectionKv, EncryptedCollection, EncryptedKv, Engine, KvStore, Row, Store,
    StoreConfig, StoreError, ZstdCodec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn cheap() -> KdfParams {
    KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

async fn unlocked(secret: &[u8], salt: [u8; 16]) -> Arc<dyn Crypto> {
    let cfg = StoreConfig {
        kdf: cheap(),
        ..Default::default()
    };
    let crypto = cfg.crypto(salt);
    crypto.init(secret).await.unwrap();
    Arc::new(crypto)
}

async fn open_vault(engine: &Engine) -> Store {
    Store::open(&Context::background(), engine, "vault", ["secrets", "notes"], 1)
        .await
        .unwrap()
}

#[tokio::test]
async fn values_are_sealed_on_disk_and_reopen_with_same_secret() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = Context::background();
    let salt = generate_salt();

    {
        let engine = Engine::on_disk(dir.path()).unwrap();
        let store = open_vault(&engine).await;
        let kv = EncryptedKv::<String, _>::new(
            CollectionKv::<Ciphertext>::new(store.clone(), "secrets"),
            unlocked(b"hunter2", salt).await,
        );
        kv.set_item(&ctx, "api-token", "tok_live_abcdef".to_string())
            .await
            .unwrap();

        let raw: Row<Value> = store.get(&ctx, "secrets", "api-token").await.unwrap().unwrap();
        let stored = raw.value.as_str().unwrap();
        assert!(!stored.contains("tok_live_abcdef"));
        store.close();
    }

    let engine = Engine::on_disk(dir.path()).unwrap();
    let store = open_vault(&engine).await;
    let kv = EncryptedKv::<String, _>::new(
        CollectionKv::<Ciphertext>::new(store.clone(), "secrets"),
        unlocked(b"hunter2", salt).await,
    );
    assert_eq!(kv.list_keys(&ctx).await.unwrap(), vec!["api-token"]);
    assert_eq!(
        kv.get_item(&ctx, "api-token").await.unwrap().as_deref(),
        Some("tok_live_abcdef")
    );

    let wrong = EncryptedKv::<String, _>::new(
        CollectionKv::<Ciphertext>::new(store, "secrets"),
        unlocked(b"not-hunter2", salt).await,
    );
    let err = wrong.get_item(&ctx, "api-token").await.unwrap_err();
    assert!(matches!(err, StoreError::Decrypt(CryptoError::AeadDecrypt)));
}

#[tokio::test]
async fn uninitialised_crypto_fails_before_any_write() {
    let ctx = Context::background();
    let store = open_vault(&Engine::in_memory()).await;
    let crypto: Arc<dyn Crypto> = Arc::new(XChaChaCrypto::new(generate_salt(), cheap()));
    let kv = EncryptedKv::<String, _>::new(
        CollectionKv::<Ciphertext>::new(store.clone(), "secrets"),
        crypto,
    );

    let err = kv.set_item(&ctx, "k", "v".to_string()).await.unwrap_err();
    assert!(matches!(err, StoreError::Encrypt(CryptoError::NotInitialised)));
    assert_eq!(store.stats().begun, 0);
    assert!(store.list_keys(&ctx, "secrets").await.unwrap().is_empty());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: String,
    title: String,
    body: String,
    pinned: bool,
}

fn note(id: &str, title: &str, pinned: bool) -> Note {
    Note {
        id: id.into(),
        title: title.into(),
        body: format!("{title} body"),
        pinned,
    }
}

#[tokio::test]
async fn encrypted_collection_keys_stay_plaintext() {
    let ctx = Context::background();
    let store = open_vault(&Engine::in_memory()).await;
    let notes = EncryptedCollection::new(
        store.clone(),
        "notes",
        unlocked(b"pw", generate_salt()).await,
        |n: &Note| n.id.clone(),
    );

    let before = store.stats().committed;
    notes
        .insert_or_update(
            &ctx,
            &[
                note("n1", "groceries", false),
                note("n2", "passwords", true),
                note("n3", "travel", true),
            ],
        )
        .await
        .unwrap();
    assert_eq!(store.stats().committed, before + 1);

    assert_eq!(
        store.list_keys(&ctx, "notes").await.unwrap(),
        vec!["n1", "n2", "n3"]
    );
    let raw: Row<Value> = store.get(&ctx, "notes", "n2").await.unwrap().unwrap();
    assert!(!raw.value.to_string().contains("passwords"));

    assert_eq!(
        notes.get(&ctx, "n2").await.unwrap(),
        Some(note("n2", "passwords", true))
    );
    assert_eq!(notes.get(&ctx, "missing").await.unwrap(), None);

    let pinned = notes.query(&ctx, |n| n.pinned).await.unwrap();
    let titles: Vec<&str> = pinned.iter().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, vec!["passwords", "travel"]);

    notes.delete(&ctx, "n1").await.unwrap();
    assert_eq!(notes.list_keys(&ctx).await.unwrap(), vec!["n2", "n3"]);
}

#[tokio::test]
async fn large_values_round_trip_through_zstd() {
    let ctx = Context::background();
    let store = open_vault(&Engine::in_memory()).await;
    let notes = EncryptedCollection::new(
        store.clone(),
        "notes",
        unlocked(b"pw", generate_salt()).await,
        |n: &Note| n.id.clone(),
    )
    .with_codec(ZstdCodec::default());

    let mut big = note("big", "journal", false);
    big.body = "dear diary ".repeat(2_000);
    notes
        .insert_or_update(&ctx, &[big.clone()])
        .await
        .unwrap();

    let raw: Row<Ciphertext> = store.get(&ctx, "notes", "big").await.unwrap().unwrap();
    assert!(raw.value.as_bytes().len() < big.body.len() / 4);
    assert_eq!(notes.get(&ctx, "big").await.unwrap(), Some(big));
}

#[tokio::test]
async fn query_reports_every_row_that_fails_to_open() {
    let ctx = Context::background();
    let store = open_vault(&Engine::in_memory()).await;
    let notes = EncryptedCollection::new(
        store.clone(),
        "notes",
        unlocked(b"pw", generate_salt()).await,
        |n: &Note| n.id.clone(),
    );
    notes
        .insert_or_update(&ctx, &[note("n2", "fine", false)])
        .await
        .unwrap();
    store
        .insert_or_update(
            &ctx,
            "notes",
            &[
                Row::new("n1", Ciphertext(vec![1; 8])),
                Row::new("n3", Ciphertext(vec![3; 64])),
            ],
        )
        .await
        .unwrap();

    let err = notes.query(&ctx, |_| true).await.unwrap_err();
    let agg = match err {
        StoreError::Aggregate(agg) => agg,
        other => panic!("expected an aggregate error, got {other:?}"),
    };
    let failed: Vec<usize> = agg.errors().map(|(idx, _)| idx).collect();
    assert_eq!(failed, vec![0, 2]);
    assert!(agg
        .errors()
        .all(|(_, e)| e.to_string().starts_with("Decryption failed")));
}
