//! Property tests: placement resolution yields a constraint-satisfying
//! total order, token buckets never admit beyond capacity in a burst, and
//! retry jitter stays within its band

use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::Arc;
use switchyard::bus::{Behavior, BehaviorChain, Next, Placement, PipelineContext, PipelineStage};
use switchyard::config::RateLimitConfig;
use switchyard::domain_types::{BackoffMultiplier, MaxAttempts, RetryDelayMs};
use switchyard::error::BusError;
use switchyard::gateway::{RateDecision, TokenBucketLimiter};
use switchyard::retry::{RetryPolicy, RetryStrategy};

struct NamedBehavior {
    id: String,
    placement: Placement,
}

#[async_trait]
impl Behavior for NamedBehavior {
    fn id(&self) -> &str {
        &self.id
    }

    fn placement(&self) -> Placement {
        self.placement.clone()
    }

    async fn invoke(&self, ctx: &mut PipelineContext, next: Next<'_>) -> Result<(), BusError> {
        next.run(ctx).await
    }
}

#[derive(Debug, Clone)]
enum PlacementSpec {
    First,
    Last,
    Default,
    Ordered(i32),
    AtStage(usize, i32),
    Before(usize),
    After(usize),
}

fn spec_strategy() -> impl Strategy<Value = PlacementSpec> {
    prop_oneof![
        Just(PlacementSpec::First),
        Just(PlacementSpec::Last),
        Just(PlacementSpec::Default),
        (-20i32..20).prop_map(PlacementSpec::Ordered),
        (0usize..8, -20i32..20).prop_map(|(s, o)| PlacementSpec::AtStage(s, o)),
        any::<usize>().prop_map(PlacementSpec::Before),
        any::<usize>().prop_map(PlacementSpec::After),
    ]
}

fn stage_of(index: usize) -> PipelineStage {
    match index {
        0 => PipelineStage::Authentication,
        1 => PipelineStage::Validation,
        2 => PipelineStage::PreProcessing,
        3 => PipelineStage::Processing,
        4 => PipelineStage::PostProcessing,
        5 => PipelineStage::Transformation,
        6 => PipelineStage::Telemetry,
        _ => PipelineStage::ErrorHandling,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn resolved_order_satisfies_all_constraints(
        specs in prop::collection::vec(spec_strategy(), 2..8)
    ) {
        let count = specs.len();
        let ids: Vec<String> = (0..count).map(|i| format!("b{i}")).collect();

        let mut behaviors: Vec<Arc<dyn Behavior>> = Vec::new();
        let mut placements = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            let placement = match spec {
                PlacementSpec::First => Placement::First,
                PlacementSpec::Last => Placement::Last,
                PlacementSpec::Default => Placement::Default,
                PlacementSpec::Ordered(order) => Placement::Ordered(*order),
                PlacementSpec::AtStage(stage, order) => {
                    Placement::AtStage(stage_of(*stage), *order)
                }
                PlacementSpec::Before(target) => {
                    let target = target % count;
                    if target == index {
                        Placement::Default
                    } else {
                        Placement::Before(ids[target].clone())
                    }
                }
                PlacementSpec::After(target) => {
                    let target = target % count;
                    if target == index {
                        Placement::Default
                    } else {
                        Placement::After(ids[target].clone())
                    }
                }
            };
            placements.push((ids[index].clone(), placement.clone()));
            behaviors.push(Arc::new(NamedBehavior {
                id: ids[index].clone(),
                placement,
            }));
        }

        match BehaviorChain::resolve(behaviors) {
            Ok(chain) => {
                let order = chain.ids();
                prop_assert_eq!(order.len(), ids.len());
                let position = |id: &str| order.iter().position(|o| o == id).unwrap();

                for (id, placement) in &placements {
                    match placement {
                        Placement::Before(target) => {
                            prop_assert!(position(id) < position(target),
                                "{} must precede {}", id, target);
                        }
                        Placement::After(target) => {
                            prop_assert!(position(id) > position(target),
                                "{} must follow {}", id, target);
                        }
                        Placement::First => {
                            for (other, other_placement) in &placements {
                                if other != id && *other_placement != Placement::First {
                                    prop_assert!(position(id) < position(other));
                                }
                            }
                        }
                        Placement::Last => {
                            for (other, other_placement) in &placements {
                                if other != id && *other_placement != Placement::Last {
                                    prop_assert!(position(id) > position(other));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Err(_) => {
                // Cycles and pin conflicts are legitimate rejections; the
                // property only constrains successful resolutions.
            }
        }
    }

    #[test]
    fn token_bucket_burst_never_exceeds_capacity(capacity in 1u32..50, requests in 1usize..200) {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            capacity: f64::from(capacity),
            refill_per_sec: 0.001,
        });
        let allowed = (0..requests)
            .filter(|_| limiter.check("client") == RateDecision::Allowed)
            .count();
        prop_assert!(allowed <= capacity as usize + 1,
            "allowed {} with capacity {}", allowed, capacity);
    }

    #[test]
    fn jittered_retry_delay_stays_in_band(attempt in 1u32..9, base_ms in 10u64..5000) {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            max_attempts: MaxAttempts::try_new(10).unwrap(),
            initial_delay: RetryDelayMs::try_new(base_ms).unwrap(),
            max_delay: RetryDelayMs::try_new(300_000).unwrap(),
            multiplier: BackoffMultiplier::default(),
            jitter: true,
            non_retryable: Vec::new(),
        };
        let delay = policy.delay_before_next(attempt).as_secs_f64();
        let base = base_ms as f64 / 1000.0;
        prop_assert!(delay >= base * 0.749, "delay {} below band for base {}", delay, base);
        prop_assert!(delay <= base * 1.251, "delay {} above band for base {}", delay, base);
    }

    #[test]
    fn linear_backoff_is_monotonic(base_ms in 1u64..1000) {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Linear,
            max_attempts: MaxAttempts::try_new(10).unwrap(),
            initial_delay: RetryDelayMs::try_new(base_ms).unwrap(),
            max_delay: RetryDelayMs::try_new(300_000).unwrap(),
            multiplier: BackoffMultiplier::default(),
            jitter: false,
            non_retryable: Vec::new(),
        };
        let mut previous = policy.delay_before_next(1);
        for attempt in 2..8 {
            let next = policy.delay_before_next(attempt);
            prop_assert!(next >= previous);
            previous = next;
        }
    }
}
