//! End-to-end gate tests: challenge -> voucher -> verify -> consume, plus the
//! failure paths (replay, wrong scope, verifier outage, verifier hang).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;

use streamverse_core::gate::{GateConfig, GateDecision, PaymentGate, Rejection};
use streamverse_core::payment::{PaymentProof, PaymentRequirements, ResourceId};
use streamverse_core::replay::{MemoryReplayStore, ReplayStore, SqliteReplayStore};
use streamverse_core::settlement::{SettlementVerifier, Verification, VerifierError};
use streamverse_core::voucher::{self, VoucherVerifier};

const PRICE: u64 = 1000;
const ASSET: &str = "5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef";

fn config() -> GateConfig {
    GateConfig {
        pay_to: "0x6b66000000000000000000000000000000000001".into(),
        ..GateConfig::default()
    }
}

fn voucher_gate(replay: Arc<dyn ReplayStore>) -> PaymentGate {
    let cfg = config();
    let verifier = VoucherVerifier::new(cfg.replay_window);
    PaymentGate::new(cfg, Arc::new(verifier), replay)
}

fn nonce() -> [u8; 32] {
    let mut n = [0u8; 32];
    OsRng.fill_bytes(&mut n);
    n
}

/// Pay for `resource` the way a client would: read the challenge, sign.
async fn pay(gate: &PaymentGate, key: &SigningKey, resource: &ResourceId) -> String {
    let challenge = match gate.evaluate(resource, PRICE, None).await {
        GateDecision::PaymentRequired(body) => body,
        other => panic!("expected a challenge, got {other:?}"),
    };
    voucher::issue(key, &challenge.accepts[0], nonce())
        .to_header()
        .unwrap()
}

#[tokio::test]
async fn test_no_proof_never_yields_bytes() {
    let gate = voucher_gate(Arc::new(MemoryReplayStore::new()));
    for index in 0..13 {
        let decision = gate.evaluate(&ResourceId::new(ASSET, index), PRICE, None).await;
        assert!(matches!(decision, GateDecision::PaymentRequired(_)));
    }
}

#[tokio::test]
async fn test_proof_is_single_use() {
    let _ = tracing_subscriber::fmt::try_init();
    let gate = voucher_gate(Arc::new(MemoryReplayStore::new()));
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 4);

    let header = pay(&gate, &key, &resource).await;

    match gate.evaluate(&resource, PRICE, Some(&header)).await {
        GateDecision::Accepted(receipt) => {
            assert!(receipt.success);
            assert_eq!(receipt.network, "polygon-amoy");
        }
        other => panic!("first use must be accepted, got {other:?}"),
    }

    match gate.evaluate(&resource, PRICE, Some(&header)).await {
        GateDecision::Rejected {
            rejection: Rejection::Replay,
            challenge,
        } => assert_eq!(challenge.error.as_deref(), Some("payment proof already used")),
        other => panic!("second use must be a replay, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reencoded_voucher_is_still_spent() {
    let gate = voucher_gate(Arc::new(MemoryReplayStore::new()));
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 5);

    let header = pay(&gate, &key, &resource).await;
    assert!(matches!(
        gate.evaluate(&resource, PRICE, Some(&header)).await,
        GateDecision::Accepted(_)
    ));
    let spent = PaymentProof::from_header(&header).unwrap();

    // Same signed terms, different JSON: numeric amount.
    let mut numeric = spent.clone();
    numeric.payload["amount"] = serde_json::json!(PRICE);
    let decision = gate
        .evaluate(&resource, PRICE, Some(&numeric.to_header().unwrap()))
        .await;
    assert!(
        matches!(decision, GateDecision::Rejected { rejection: Rejection::Replay, .. }),
        "{decision:?}"
    );

    // Extra fields and re-cased hex do not decode at all.
    let mut padded = spent.clone();
    padded.payload["memo"] = serde_json::json!(1);
    let mut shouting = spent.clone();
    let sig = spent.payload["signature"].as_str().unwrap().to_uppercase();
    shouting.payload["signature"] = serde_json::json!(sig);
    for variant in [padded, shouting] {
        let decision = gate
            .evaluate(&resource, PRICE, Some(&variant.to_header().unwrap()))
            .await;
        assert!(
            matches!(decision, GateDecision::Rejected { rejection: Rejection::Invalid(ref r), .. } if r.contains("malformed voucher")),
            "{decision:?}"
        );
    }
}

#[tokio::test]
async fn test_proof_scoped_to_one_chunk() {
    let gate = voucher_gate(Arc::new(MemoryReplayStore::new()));
    let key = SigningKey::generate(&mut OsRng);
    let a = ResourceId::new(ASSET, 0);
    let b = ResourceId::new(ASSET, 1);

    let header_for_a = pay(&gate, &key, &a).await;

    let decision = gate.evaluate(&b, PRICE, Some(&header_for_a)).await;
    assert!(
        matches!(decision, GateDecision::Rejected { rejection: Rejection::Invalid(ref r), .. } if r.contains("scoped")),
        "{decision:?}"
    );

    // The failed attempt on B must not burn the proof for A.
    assert!(matches!(
        gate.evaluate(&a, PRICE, Some(&header_for_a)).await,
        GateDecision::Accepted(_)
    ));
}

#[tokio::test]
async fn test_price_increase_rejects_old_proof() {
    let gate = voucher_gate(Arc::new(MemoryReplayStore::new()));
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 2);
    let header = pay(&gate, &key, &resource).await;

    let decision = gate.evaluate(&resource, PRICE * 2, Some(&header)).await;
    assert!(matches!(
        decision,
        GateDecision::Rejected { rejection: Rejection::Invalid(ref r), .. } if r.contains("insufficient")
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_deliver_once() {
    let gate = Arc::new(voucher_gate(Arc::new(MemoryReplayStore::new())));
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 7);
    let header = pay(&gate, &key, &resource).await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let gate = gate.clone();
            let header = header.clone();
            let resource = resource.clone();
            tokio::spawn(async move { gate.evaluate(&resource, PRICE, Some(&header)).await })
        })
        .collect();

    let mut accepted = 0;
    let mut replays = 0;
    for t in tasks {
        match t.await.unwrap() {
            GateDecision::Accepted(_) => accepted += 1,
            GateDecision::Rejected {
                rejection: Rejection::Replay,
                ..
            } => replays += 1,
            other => panic!("unexpected decision {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(replays, 15);
}

#[tokio::test]
async fn test_replay_detected_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replay.db");
    let node_a = voucher_gate(Arc::new(SqliteReplayStore::open(&path).unwrap()));
    let node_b = voucher_gate(Arc::new(SqliteReplayStore::open(&path).unwrap()));
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 9);

    let header = pay(&node_a, &key, &resource).await;
    assert!(matches!(
        node_a.evaluate(&resource, PRICE, Some(&header)).await,
        GateDecision::Accepted(_)
    ));
    assert!(matches!(
        node_b.evaluate(&resource, PRICE, Some(&header)).await,
        GateDecision::Rejected {
            rejection: Rejection::Replay,
            ..
        }
    ));
}

// ── Verifier failure modes ─────────────────────────────────────────────

/// Fails the first `failures` calls (by hanging or by reporting an outage),
/// then defers to the voucher verifier.
#[derive(Debug)]
struct FlakyVerifier {
    failures: usize,
    hang: bool,
    calls: AtomicUsize,
    inner: VoucherVerifier,
}

#[async_trait]
impl SettlementVerifier for FlakyVerifier {
    async fn verify(
        &self,
        proof: &PaymentProof,
        req: &PaymentRequirements,
    ) -> Result<Verification, VerifierError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            return Err(VerifierError::Unavailable("connection refused".into()));
        }
        self.inner.verify(proof, req).await
    }
}

fn flaky_gate(hang: bool) -> PaymentGate {
    let cfg = config();
    let verifier = FlakyVerifier {
        failures: 1,
        hang,
        calls: AtomicUsize::new(0),
        inner: VoucherVerifier::new(cfg.replay_window),
    };
    PaymentGate::new(cfg, Arc::new(verifier), Arc::new(MemoryReplayStore::new()))
}

#[tokio::test]
async fn test_verifier_outage_fails_closed_and_is_retryable() {
    let gate = flaky_gate(false);
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 5);
    let header = pay(&gate, &key, &resource).await;

    assert!(matches!(
        gate.evaluate(&resource, PRICE, Some(&header)).await,
        GateDecision::Rejected {
            rejection: Rejection::VerifierUnavailable(_),
            ..
        }
    ));
    // The outage released the claim, so the same proof goes through now.
    assert!(matches!(
        gate.evaluate(&resource, PRICE, Some(&header)).await,
        GateDecision::Accepted(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hung_verifier_times_out() {
    let gate = flaky_gate(true);
    let key = SigningKey::generate(&mut OsRng);
    let resource = ResourceId::new(ASSET, 6);
    let header = pay(&gate, &key, &resource).await;

    let started = tokio::time::Instant::now();
    let decision = gate.evaluate(&resource, PRICE, Some(&header)).await;
    assert!(started.elapsed() < Duration::from_secs(3600));
    match decision {
        GateDecision::Rejected {
            rejection: Rejection::VerifierUnavailable(reason),
            ..
        } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected timeout, got {other:?}"),
    }
}
