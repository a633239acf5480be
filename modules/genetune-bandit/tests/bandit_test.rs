//! Integration tests for the Thompson bandit, its store and reward feed.

use std::collections::HashMap;
use std::sync::Arc;

use genetune_bandit::{
    spawn_reward_feed, BanditStore, RewardEvent, ThompsonBandit,
};
use genetune_common::{BanditConfig, Genome, GenomeParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn genome(id: &str, temperature: f64) -> Genome {
    let mut g = Genome::new(
        GenomeParams {
            temperature,
            top_p: 0.95,
            model_key: "balanced".into(),
            prompt_variant_id: "concise".into(),
            use_chain_of_thought: false,
            max_tokens: 512,
        },
        0,
    );
    g.id = id.to_string();
    g
}

fn seeded_bandit(seed: u64) -> ThompsonBandit {
    ThompsonBandit::new(&BanditConfig {
        seed: Some(seed),
        ..BanditConfig::default()
    })
    .unwrap()
}

// ---------------------------------------------------------------------------
// Posterior bookkeeping
// ---------------------------------------------------------------------------

#[test]
fn one_reward_from_uniform_prior_gives_two_thirds() {
    let bandit = seeded_bandit(1);
    bandit.install(vec![genome("g-1", 0.4)]);
    bandit.update("g-1", 1.0).unwrap();

    let stats = bandit.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].pulls, 1);
    assert_eq!(stats[0].alpha, 2.0);
    assert_eq!(stats[0].beta, 1.0);
    assert!((stats[0].mean_reward - 2.0 / 3.0).abs() < 1e-12);
}

#[test]
fn empty_bandit_falls_back_to_default_genome() {
    let bandit = ThompsonBandit::new(&BanditConfig {
        default_genome_id: "prod-baseline".into(),
        ..BanditConfig::default()
    })
    .unwrap();
    for _ in 0..10 {
        assert_eq!(bandit.choose(), "prod-baseline");
    }
}

#[test]
fn choose_concentrates_on_the_better_arm() {
    let bandit = seeded_bandit(2024);
    bandit.install(vec![genome("good", 0.3), genome("bad", 0.9)]);
    let truth: HashMap<&str, f64> = [("good", 0.9), ("bad", 0.1)].into_iter().collect();
    let mut env = StdRng::seed_from_u64(7);

    let mut late_good = 0;
    for round in 0..2_000 {
        let chosen = bandit.choose();
        let p = truth[chosen.as_str()];
        let reward = if env.random_bool(p) { 1.0 } else { 0.0 };
        bandit.update(&chosen, reward).unwrap();
        if round >= 1_500 && chosen == "good" {
            late_good += 1;
        }
    }

    let good = bandit.arm_stats("good").unwrap();
    let bad = bandit.arm_stats("bad").unwrap();
    assert!(good.pulls > bad.pulls * 5, "good={} bad={}", good.pulls, bad.pulls);
    assert!((good.mean_reward - 0.9).abs() < 0.05);
    assert!(late_good >= 450, "good chosen {late_good}/500 times late in the run");
}

#[test]
fn better_arm_wins_across_independent_trials() {
    let truth: HashMap<&str, f64> = [("good", 0.9), ("bad", 0.1)].into_iter().collect();
    let trials = 20u64;
    let draws = 100;

    let mut good_draws = 0;
    for trial in 0..trials {
        let bandit = seeded_bandit(1_000 + trial);
        bandit.install(vec![genome("good", 0.3), genome("bad", 0.9)]);
        let mut env = StdRng::seed_from_u64(trial);
        for _ in 0..1_000 {
            let chosen = bandit.choose();
            let reward = if env.random_bool(truth[chosen.as_str()]) { 1.0 } else { 0.0 };
            bandit.update(&chosen, reward).unwrap();
        }
        good_draws += (0..draws).filter(|_| bandit.choose() == "good").count();
    }

    let share = good_draws as f64 / (trials as usize * draws) as f64;
    assert!(share > 0.9, "good arm chosen {share:.3} of the time");
}

#[test]
fn concurrent_updates_are_not_lost() {
    let bandit = Arc::new(seeded_bandit(3));
    bandit.install(vec![genome("a", 0.1), genome("b", 0.2)]);

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let bandit = Arc::clone(&bandit);
            scope.spawn(move || {
                let id = if worker % 2 == 0 { "a" } else { "b" };
                for _ in 0..500 {
                    bandit.update(id, 1.0).unwrap();
                    bandit.choose();
                }
            });
        }
    });

    for stats in bandit.stats() {
        assert_eq!(stats.pulls, 2_000);
        assert_eq!(stats.alpha, 2_001.0);
        assert_eq!(stats.beta, 1.0);
    }
}

#[test]
fn choose_only_returns_deployed_ids_during_installs() {
    let bandit = Arc::new(seeded_bandit(4));
    bandit.install(vec![genome("seed", 0.5)]);

    std::thread::scope(|scope| {
        let installer = Arc::clone(&bandit);
        scope.spawn(move || {
            for i in 0..50 {
                installer.install(vec![genome(&format!("new-{i:02}"), 0.5)]);
            }
        });
        let chooser = Arc::clone(&bandit);
        scope.spawn(move || {
            for _ in 0..500 {
                let id = chooser.choose();
                assert!(chooser.contains(&id), "chose undeployed arm {id}");
            }
        });
    });

    assert_eq!(bandit.len(), 51);
}

#[test]
fn warm_start_prior_uses_offline_fitness() {
    let bandit = ThompsonBandit::new(&BanditConfig {
        warm_start_strength: 4.0,
        seed: Some(9),
        ..BanditConfig::default()
    })
    .unwrap();
    let mut candidate = genome("warm", 0.6);
    candidate.set_fitness(genetune_common::FitnessScore {
        total: 0.75,
        correctness: 0.75,
        latency_ms: 0.0,
        tokens_used: 0.0,
        repair_rate: 0.0,
        cost: 0.0,
        failure_rate: 0.0,
        examples: 8,
        sample_epoch: 0,
        evaluated_at: chrono::Utc::now(),
    });
    bandit.install(vec![candidate]);

    let stats = bandit.arm_stats("warm").unwrap();
    assert_eq!(stats.alpha, 4.0);
    assert_eq!(stats.beta, 2.0);
    assert_eq!(stats.pulls, 0);
}

#[test]
fn prune_removes_only_tried_losers() {
    let bandit = seeded_bandit(5);
    bandit.install(vec![genome("loser", 0.1), genome("fresh", 0.2), genome("winner", 0.3)]);
    for _ in 0..20 {
        bandit.update("loser", 0.0).unwrap();
        bandit.update("winner", 1.0).unwrap();
    }

    let removed = bandit.prune(10, 0.2);
    assert_eq!(removed, vec!["loser".to_string()]);
    assert!(bandit.contains("fresh"));
    assert!(bandit.contains("winner"));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn snapshot_survives_a_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = BanditStore::new(dir.path().join("state").join("bandit.json"));
    assert!(store.load().unwrap().is_none());

    let bandit = seeded_bandit(6);
    bandit.install(vec![genome("x", 0.3), genome("y", 0.7)]);
    bandit.update("x", 0.35).unwrap();
    bandit.update("y", 1.0).unwrap();
    let snapshot = bandit.snapshot();
    store.save(&snapshot).unwrap();

    let reloaded = store.load().unwrap().unwrap();
    assert_eq!(reloaded, snapshot);

    let restored = store.open(&BanditConfig::default()).unwrap();
    assert_eq!(restored.stats(), bandit.stats());
    assert_eq!(restored.genome("y"), bandit.genome("y"));
}

#[test]
fn corrupt_store_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bandit.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = BanditStore::new(&path).load().unwrap_err();
    assert!(matches!(err, genetune_bandit::BanditError::Corrupt { .. }));
}

// ---------------------------------------------------------------------------
// Reward feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reward_feed_applies_and_counts_events() {
    let bandit = Arc::new(seeded_bandit(8));
    bandit.install(vec![genome("live", 0.5)]);
    let (tx, rx) = mpsc::channel(16);
    let feed = spawn_reward_feed(Arc::clone(&bandit), rx);

    for reward in [1.0, 0.0, 0.5] {
        tx.send(RewardEvent {
            genome_id: "live".into(),
            reward,
        })
        .await
        .unwrap();
    }
    tx.send(RewardEvent {
        genome_id: "ghost".into(),
        reward: 1.0,
    })
    .await
    .unwrap();
    tx.send(RewardEvent {
        genome_id: "live".into(),
        reward: -3.0,
    })
    .await
    .unwrap();
    drop(tx);

    let stats = feed.await.unwrap();
    assert_eq!(stats.applied, 3);
    assert_eq!(stats.unknown_arm, 1);
    assert_eq!(stats.invalid_reward, 1);
    let arm = bandit.arm_stats("live").unwrap();
    assert_eq!(arm.pulls, 3);
    assert_eq!(arm.alpha, 2.5);
    assert_eq!(arm.beta, 2.5);
}
