// tests/learning_equivalence.rs
//
// The batch learning lookup must return exactly what the single-item path returns
// for every member, whatever mix of texts, brands and history is in the store.

use std::sync::Arc;

use inbound_spam_classifier::learning::{Learning, LearningParams, LearningQuery};
use inbound_spam_classifier::model::LearningSource;
use inbound_spam_classifier::resilience::{ResilienceConfig, StoreGuard};
use inbound_spam_classifier::store::MemoryStore;
use proptest::prelude::*;

const VOCAB: &[&str] = &[
    "stop", "free", "cash", "order", "refund", "hello", "winner", "call", "me", "now", "stopp",
    "prize", "claim", "your",
];
const BRANDS: &[&str] = &["Acme", " acme ", "Globex"];

fn learning(store: Arc<MemoryStore>) -> Learning {
    let guard = Arc::new(StoreGuard::new(&ResilienceConfig::default()));
    Learning::new(store, guard, LearningParams::default())
}

fn phrase() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(VOCAB.to_vec()), 1..4).prop_map(|w| w.join(" "))
}

fn brand() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::sample::select(BRANDS.to_vec()).prop_map(str::to_string))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn batch_equals_single(
        history in prop::collection::vec((phrase(), brand(), any::<bool>()), 0..12),
        queries in prop::collection::vec((phrase(), brand()), 1..8),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let learn = learning(Arc::new(MemoryStore::new()));
            for (text, brand, is_spam) in &history {
                learn
                    .learn_from_spam_decision(text, *is_spam, brand.as_deref(), LearningSource::Agent)
                    .await
                    .unwrap();
            }

            let items: Vec<LearningQuery> = queries
                .iter()
                .enumerate()
                .map(|(i, (text, brand))| LearningQuery { id: i as i64, text: text.clone(), brand: brand.clone() })
                .collect();
            let batch = learn.get_batch_improved_spam_scores(&items).await.unwrap();
            assert_eq!(batch.len(), items.len());

            for q in &items {
                let single = learn.get_improved_spam_score(&q.text, q.brand.as_deref()).await.unwrap();
                assert_eq!(batch.get(&q.id), Some(&single), "query {:?}", q);
            }
        });
    }
}

#[tokio::test]
async fn repeated_verdicts_strengthen_confidence() {
    let learn = learning(Arc::new(MemoryStore::new()));
    let before = learn.get_improved_spam_score("claim your prize", None).await.unwrap();
    assert_eq!(before.record_count, 0);

    learn
        .learn_from_spam_decision("Claim your PRIZE!", true, None, LearningSource::Agent)
        .await
        .unwrap();
    let one = learn.get_improved_spam_score("claim your prize", None).await.unwrap();

    learn
        .learn_from_spam_decision("claim your prize", true, None, LearningSource::Agent)
        .await
        .unwrap();
    let two = learn.get_improved_spam_score("claim your prize", None).await.unwrap();

    assert_eq!(one.record_count, 1);
    assert_eq!(two.record_count, 2);
    assert!(two.historical_confidence > one.historical_confidence);
    assert!(two.score > one.score);
}

#[tokio::test]
async fn empty_text_is_rejected_without_writing() {
    let store = Arc::new(MemoryStore::new());
    let learn = learning(store.clone());
    let err = learn
        .learn_from_spam_decision("  !!! ", true, None, LearningSource::Manual)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("empty"));
    assert_eq!(store.learning_len(), 0);
}
