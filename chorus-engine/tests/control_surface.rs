//! End-to-end tests over a bootstrapped `Engine` and its HTTP control
//! surface, using the offline reference adapters so nothing here touches
//! the network or a real ML runtime.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chorus_engine::adapters::{self, AdapterRegistry, Availability};
use chorus_engine::config::EngineConfig;
use chorus_engine::engine::CancelOutcome;
use chorus_engine::models::StemName;
use chorus_engine::{build_router, AppState, Engine};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::sync::Arc;
use tower::util::ServiceExt;

/// A `Separator` that takes a while, so tests can observe the record's
/// on-disk extraction state while the Extract Runner is still mid-flight.
struct SlowSeparator;

#[async_trait]
impl adapters::Separator for SlowSeparator {
    async fn probe(&self) -> Availability {
        Availability::Available
    }

    async fn separate(
        &self,
        _audio_bytes: &[u8],
        _model_id: &str,
        requested_stems: &[StemName],
    ) -> chorus_common::Result<HashMap<StemName, Vec<u8>>> {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        Ok(requested_stems.iter().map(|s| (*s, vec![0u8; 200])).collect())
    }
}

async fn test_engine() -> (Arc<Engine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig {
        downloads_root: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let adapters = AdapterRegistry::offline(&config.chord_backend_order);
    let engine = Engine::bootstrap(config, adapters).await.expect("bootstrap");
    (engine, dir)
}

/// Polls `check` until it returns `Some`, or panics once `tokio::time::timeout`
/// runs out. Stage runners complete asynchronously on background tasks
/// spawned at bootstrap, so tests observe their effect this way rather than
/// assuming a fixed sleep is long enough.
async fn wait_for<T, F>(mut check: F) -> T
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = Option<T>> + Send>>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition did not become true before the test timeout")
}

#[tokio::test]
async fn fetch_then_auto_analyze_populates_record_and_grants_access() {
    let (engine, _dir) = test_engine().await;
    let source_id = "xDedupHappy1";

    let outcome = engine.request_fetch("u_alice", source_id).await.unwrap();
    assert!(matches!(outcome, chorus_engine::RequestOutcome::Accepted { .. }));

    let engine_for_wait = engine.clone();
    let record = wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.analysis.tempo_bpm?;
            Some(record)
        })
    })
    .await;

    assert!(record.audio_blob_ref.is_some());
    assert!(record.analysis.chords.is_some());

    let views = engine.list_for_user("u_alice", chorus_engine::models::Role::User).await.unwrap();
    assert!(views.iter().any(|v| v.record.source_id == source_id));
}

#[tokio::test]
async fn a_second_fetch_request_for_the_same_source_is_deduplicated() {
    let (engine, _dir) = test_engine().await;
    let source_id = "xDedupTwice1";

    engine.request_fetch("u_alice", source_id).await.unwrap();

    let engine_for_wait = engine.clone();
    wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.audio_blob_ref.clone()
        })
    })
    .await;

    let outcome = engine.request_fetch("u_bob", source_id).await.unwrap();
    match outcome {
        chorus_engine::RequestOutcome::AlreadyDone { record } => {
            assert_eq!(record.source_id, source_id);
        }
        other => panic!("expected AlreadyDone once fetch has already completed, got {other:?}"),
    }

    let bob_views = engine.list_for_user("u_bob", chorus_engine::models::Role::User).await.unwrap();
    assert!(bob_views.iter().any(|v| v.record.source_id == source_id));
}

#[tokio::test]
async fn cancel_of_an_unknown_job_reports_not_found() {
    let (engine, _dir) = test_engine().await;
    let outcome = engine.cancel("u_alice", uuid::Uuid::new_v4()).await.unwrap();
    assert_eq!(outcome, CancelOutcome::NotFound);
}

#[tokio::test]
async fn delete_record_removes_the_record_and_revokes_access() {
    let (engine, _dir) = test_engine().await;
    let source_id = "xDeleteMe001";

    engine.request_fetch("u_alice", source_id).await.unwrap();
    let engine_for_wait = engine.clone();
    wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.audio_blob_ref.clone()
        })
    })
    .await;

    engine.delete_record(source_id).await.unwrap();

    assert!(engine.store.get_record(source_id).await.unwrap().is_none());
    let views = engine.list_for_user("u_alice", chorus_engine::models::Role::User).await.unwrap();
    assert!(!views.iter().any(|v| v.record.source_id == source_id));
}

#[tokio::test]
async fn health_endpoint_reports_ok_over_http() {
    let (engine, _dir) = test_engine().await;
    let app = build_router(AppState::new(engine));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn listing_sources_without_identity_headers_is_rejected() {
    let (engine, _dir) = test_engine().await;
    let app = build_router(AppState::new(engine));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/users/u_alice/sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// §8 scenario 1: two users requesting the same extraction concurrently
/// must share a single Extract Runner and both end up with a grant plus
/// the same stem set.
#[tokio::test]
async fn concurrent_extract_requests_for_the_same_source_share_one_job() {
    let (engine, _dir) = test_engine().await;
    let source_id = "xA1B2cExtract";

    engine.request_fetch("u_alice", source_id).await.unwrap();
    let engine_for_wait = engine.clone();
    wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.audio_blob_ref.clone()
        })
    })
    .await;

    let stems = vec![
        chorus_engine::models::StemName::Vocals,
        chorus_engine::models::StemName::Drums,
        chorus_engine::models::StemName::Bass,
        chorus_engine::models::StemName::Other,
    ];

    let outcome_alice = engine
        .request_extract("u_alice", source_id, "four_stem_v1", stems.clone())
        .await
        .unwrap();
    let outcome_bob = engine
        .request_extract("u_bob", source_id, "four_stem_v1", stems)
        .await
        .unwrap();

    // Both requests are accepted — whichever loses the dedup race becomes a
    // subscriber rather than running a second Extract Runner.
    assert!(matches!(outcome_alice, chorus_engine::RequestOutcome::Accepted { .. }));
    assert!(matches!(
        outcome_bob,
        chorus_engine::RequestOutcome::Accepted { .. } | chorus_engine::RequestOutcome::AlreadyDone { .. }
    ));

    let engine_for_wait = engine.clone();
    let record = wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            (record.extraction.state == Some(chorus_engine::models::ExtractionState::Done)).then_some(record)
        })
    })
    .await;

    let stem_refs = record.extraction.stem_refs.expect("stems committed");
    assert_eq!(stem_refs.len(), 4);

    assert!(engine.access.has_access("u_alice", source_id).await.unwrap());
    assert!(engine.access.has_access("u_bob", source_id).await.unwrap());
}

/// §8 scenario 4 (reachability half): the Extract Runner must persist an
/// on-disk `claimed`/`running` flag before the long separation call, so a
/// crash mid-extract leaves something for the Recovery Manager to heal.
/// `recovery/mod.rs`'s own tests cover the healing half; this covers the
/// production write path actually setting the flag in the first place.
#[tokio::test]
async fn extraction_state_is_claimed_or_running_before_it_commits_done() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig {
        downloads_root: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let mut adapters = AdapterRegistry::offline(&config.chord_backend_order);
    adapters.separator = Arc::new(SlowSeparator);
    let engine = Engine::bootstrap(config, adapters).await.expect("bootstrap");

    let source_id = "xClaimedFlag1";
    engine.request_fetch("u_alice", source_id).await.unwrap();
    let engine_for_wait = engine.clone();
    wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.audio_blob_ref.clone()
        })
    })
    .await;

    engine
        .request_extract(
            "u_alice",
            source_id,
            "four_stem_v1",
            vec![StemName::Vocals, StemName::Drums, StemName::Bass, StemName::Other],
        )
        .await
        .unwrap();

    let engine_for_wait = engine.clone();
    let mid_flight_state = wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.extraction.state
        })
    })
    .await;
    assert!(matches!(
        mid_flight_state,
        Some(chorus_engine::models::ExtractionState::Claimed) | Some(chorus_engine::models::ExtractionState::Running)
    ));

    let engine_for_wait = engine.clone();
    wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            (record.extraction.state == Some(chorus_engine::models::ExtractionState::Done)).then_some(())
        })
    })
    .await;
}

/// §8 scenario 5: the offline `NullSeparator` emits pure silence, so every
/// stem must clear the default -40dB threshold and be tagged silent, yet
/// still commit.
#[tokio::test]
async fn fully_silent_stems_are_tagged_but_still_committed() {
    let (engine, _dir) = test_engine().await;
    let source_id = "xSilentStem1";

    engine.request_fetch("u_alice", source_id).await.unwrap();
    let engine_for_wait = engine.clone();
    wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.audio_blob_ref.clone()
        })
    })
    .await;

    engine
        .request_extract(
            "u_alice",
            source_id,
            "four_stem_v1",
            vec![
                chorus_engine::models::StemName::Vocals,
                chorus_engine::models::StemName::Drums,
                chorus_engine::models::StemName::Bass,
                chorus_engine::models::StemName::Other,
            ],
        )
        .await
        .unwrap();

    let engine_for_wait = engine.clone();
    let record = wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            (record.extraction.state == Some(chorus_engine::models::ExtractionState::Done)).then_some(record)
        })
    })
    .await;

    assert_eq!(record.extraction.silent_stems.len(), 4);
    assert_eq!(record.extraction.stem_refs.unwrap().len(), 4);

    // Post-extract runs automatically once extraction commits and must
    // always leave a non-`none` lyrics_source once ASR has run, even on
    // fully instrumental (silent-vocals) input.
    let engine_for_wait = engine.clone();
    let final_record = wait_for(move || {
        let engine = engine_for_wait.clone();
        Box::pin(async move {
            let record = engine.store.get_record(source_id).await.unwrap()?;
            record.analysis.lyrics_source.map(|_| record)
        })
    })
    .await;
    assert_eq!(
        final_record.analysis.lyrics_source,
        Some(chorus_engine::models::LyricsSource::Asr)
    );
    assert!(final_record.analysis.lyrics.unwrap().lines.is_empty());
}

#[tokio::test]
async fn listing_another_users_sources_is_forbidden() {
    let (engine, _dir) = test_engine().await;
    let app = build_router(AppState::new(engine));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/users/u_bob/sources")
                .header("x-user-id", "u_alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
