//! Stress tests designed to break the coordinator.
//!
//! These tests exercise races between concurrent dispatches, async
//! completions, disposal and the pending counter.

#[cfg(test)]
mod stress_tests {
    use crate::command::{Command, CommandType};
    use crate::config::CoordinatorConfig;
    use crate::coordinator::Coordinator;
    use crate::operation::operation;
    use crate::registry::RuleRegistry;
    use crate::result::RuleResult;
    use crate::rule::Rule;
    use crate::state::StateModel;
    use crate::store::Store;
    use crate::testing::{wait_for, within, MetaRecorder, SnapshotRecorder};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, PartialEq)]
    enum Cmd {
        Bump,
        Spawn { jitter_ms: u64 },
        Landed,
        Flaky { fail: bool },
        Hang,
    }

    impl Command for Cmd {
        fn command_type(&self) -> CommandType {
            match self {
                Cmd::Bump => CommandType::new("stress/BUMP"),
                Cmd::Spawn { .. } => CommandType::new("stress/SPAWN"),
                Cmd::Landed => CommandType::new("stress/LANDED"),
                Cmd::Flaky { .. } => CommandType::new("stress/FLAKY"),
                Cmd::Hang => CommandType::new("stress/HANG"),
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counters {
        bumps: usize,
        landed: usize,
    }

    struct Model;

    impl StateModel for Model {
        type Durable = Counters;
        type Catalog = ();
        type Runtime = ();
        type Command = Cmd;
    }

    fn stress_coordinator() -> Coordinator<Model> {
        let registry = Arc::new(RuleRegistry::<Model>::new());

        registry.register(Rule::<Model>::on("stress/BUMP").apply(|_, _| {
            Ok(RuleResult::<Model>::none().durable(|c| Counters {
                bumps: c.bumps + 1,
                ..c.clone()
            }))
        }));
        registry.register(Rule::<Model>::on("stress/SPAWN").apply(|_, cmd| {
            let Cmd::Spawn { jitter_ms } = cmd else {
                return Ok(RuleResult::<Model>::none());
            };
            let jitter_ms = *jitter_ms;
            Ok(RuleResult::<Model>::none().spawn(operation("jittery", move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
                Ok(Cmd::Landed)
            })))
        }));
        registry.register(Rule::<Model>::on("stress/LANDED").apply(|_, _| {
            Ok(RuleResult::<Model>::none().durable(|c| Counters {
                landed: c.landed + 1,
                ..c.clone()
            }))
        }));
        registry.register(Rule::<Model>::on("stress/FLAKY").apply(|_, cmd| {
            let Cmd::Flaky { fail } = cmd else {
                return Ok(RuleResult::<Model>::none());
            };
            let fail = *fail;
            Ok(RuleResult::<Model>::none().spawn(operation("flaky", move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..3))).await;
                if fail {
                    anyhow::bail!("flaky failure");
                }
                Ok(Cmd::Landed)
            })))
        }));
        registry.register(Rule::<Model>::on("stress/HANG").apply(|_, _| {
            Ok(RuleResult::<Model>::none().spawn(operation("hang", |_ctx| async {
                // Ignores cancellation on purpose.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Cmd::Landed)
            })))
        }));

        Coordinator::new(
            registry,
            Store::new(Counters::default(), (), ()),
            CoordinatorConfig::default(),
        )
    }

    fn watch_for_early_emission(coordinator: &Coordinator<Model>) -> Arc<AtomicBool> {
        let violated = Arc::new(AtomicBool::new(false));
        let pending = coordinator.pending_tracker();
        let flag = violated.clone();
        let _ = coordinator.subscribe(move |_| {
            if pending.count() > 0 {
                flag.store(true, Ordering::SeqCst);
            }
        });
        violated
    }

    // ==========================================================================
    // Tests
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_many_operations_random_completion_order() {
        let coordinator = stress_coordinator();
        let violated = watch_for_early_emission(&coordinator);
        let snapshots = SnapshotRecorder::attach(&coordinator);

        const N: usize = 200;
        for _ in 0..N {
            coordinator
                .dispatch(Cmd::Spawn {
                    jitter_ms: fastrand::u64(0..10),
                })
                .await
                .unwrap();
        }

        within(Duration::from_secs(10), "all operations", coordinator.wait_until_settled()).await;

        assert!(!violated.load(Ordering::SeqCst), "emitted while work was pending");
        assert_eq!(coordinator.state().durable().landed, N);
        assert_eq!(coordinator.pending_operations(), 0);
        assert!(!snapshots.is_empty());
        assert_eq!(snapshots.last().unwrap().durable().landed, N);
        coordinator.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_concurrent_dispatchers() {
        let coordinator = stress_coordinator();
        let violated = watch_for_early_emission(&coordinator);

        const TASKS: usize = 8;
        const PER_TASK: usize = 50;

        let mut handles = Vec::new();
        for _ in 0..TASKS {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..PER_TASK {
                    let cmd = if i % 2 == 0 {
                        Cmd::Bump
                    } else {
                        Cmd::Spawn {
                            jitter_ms: fastrand::u64(0..5),
                        }
                    };
                    coordinator.dispatch(cmd).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        within(Duration::from_secs(10), "concurrent work", coordinator.wait_until_settled()).await;

        let state = coordinator.state();
        assert_eq!(state.durable().bumps, TASKS * PER_TASK / 2);
        assert_eq!(state.durable().landed, TASKS * PER_TASK / 2);
        assert!(!violated.load(Ordering::SeqCst), "emitted while work was pending");
        coordinator.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_mixed_failures_keep_counter_consistent() {
        let coordinator = stress_coordinator();
        let meta = MetaRecorder::attach(&coordinator);

        let mut expected = 0;
        for _ in 0..100 {
            let fail = fastrand::bool();
            if !fail {
                expected += 1;
            }
            coordinator.dispatch(Cmd::Flaky { fail }).await.unwrap();
        }

        within(Duration::from_secs(10), "flaky operations", coordinator.wait_until_settled()).await;

        assert_eq!(coordinator.pending_operations(), 0);
        assert_eq!(coordinator.state().durable().landed, expected);
        assert_eq!(meta.last(), Some(false));
        // One increment and one decrement per operation.
        assert_eq!(meta.values().len(), 200);
        coordinator.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_dispose_with_hanging_operations() {
        let coordinator = stress_coordinator();

        for _ in 0..25 {
            coordinator.dispatch(Cmd::Hang).await.unwrap();
        }
        assert_eq!(coordinator.pending_operations(), 25);

        coordinator.dispose();

        wait_for(Duration::from_secs(2), || coordinator.pending_operations() == 0)
            .await
            .expect("aborted operations release the counter exactly once");
        assert!(!coordinator.is_loading());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_dispose_races_with_completions() {
        for _ in 0..20 {
            let coordinator = stress_coordinator();
            let emitted_after_dispose = Arc::new(AtomicUsize::new(0));

            for _ in 0..20 {
                coordinator
                    .dispatch(Cmd::Spawn {
                        jitter_ms: fastrand::u64(0..4),
                    })
                    .await
                    .unwrap();
            }

            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..4))).await;
            coordinator.dispose();

            // Listeners were cleared; a late one must never fire.
            let counter = emitted_after_dispose.clone();
            let _ = coordinator.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            wait_for(Duration::from_secs(2), || coordinator.pending_operations() == 0)
                .await
                .expect("counter drains after dispose");
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(emitted_after_dispose.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stress_waiters_and_dispatchers_interleave() {
        let coordinator = stress_coordinator();

        let producer = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    coordinator
                        .dispatch(Cmd::Spawn {
                            jitter_ms: fastrand::u64(0..3),
                        })
                        .await
                        .unwrap();
                    if fastrand::u8(0..4) == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        // Waiting concurrently with new work must neither hang nor panic.
        for _ in 0..5 {
            within(
                Duration::from_secs(10),
                "interleaved wait",
                coordinator.wait_until_settled(),
            )
            .await;
        }
        producer.await.unwrap();
        within(Duration::from_secs(10), "final wait", coordinator.wait_until_settled()).await;

        assert_eq!(coordinator.state().durable().landed, 100);
        coordinator.dispose();
    }
}
