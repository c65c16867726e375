//! Batch executor and OOM-adaptive retry properties
//!
//! Runs the executor against an instrumented model that records every range
//! it receives.

mod common;

use common::{indices, ranges, ConcurrencyGauge, RecordingModel, ScriptedMemory};
use pixel_inference::{
    execute_batched, AcceleratorHandle, BatchExecutor, BatchRange, ExecutionError, SafeBatchSize,
};
use std::sync::Arc;
use std::time::Duration;

fn scripted_device() -> (Arc<ScriptedMemory>, AcceleratorHandle) {
    let memory = Arc::new(ScriptedMemory::gpu(1 << 30));
    let handle = AcceleratorHandle::new(memory.clone());
    (memory, handle)
}

#[tokio::test]
async fn test_outputs_follow_input_order_for_any_safe_size() {
    for n in [0, 1, 7] {
        for safe in [1, 3, 100] {
            let (_memory, handle) = scripted_device();
            let model = RecordingModel::new("clip");
            let items = indices(n);

            let outputs = execute_batched(&handle, &model, &items, &SafeBatchSize::new("clip", safe))
                .await
                .unwrap();

            let order: Vec<usize> = outputs.iter().map(|&(input, _)| input).collect();
            assert_eq!(order, items, "n={n} safe={safe}");
        }
    }
}

#[tokio::test]
async fn test_processed_ranges_tile_the_submission() {
    let (memory, handle) = scripted_device();
    let model = RecordingModel::new("clip");

    execute_batched(&handle, &model, &indices(7), &SafeBatchSize::new("clip", 3))
        .await
        .unwrap();

    let calls = model.calls();
    assert_eq!(calls, ranges(&[(0, 3), (3, 6), (6, 7)]));

    let mut next = 0;
    for range in &calls {
        assert_eq!(range.start, next, "gap or overlap at {range}");
        next = range.end;
    }
    assert_eq!(next, 7);

    // One clear after each released range
    assert_eq!(memory.clears(), 3);
}

#[tokio::test]
async fn test_empty_submission_never_calls_the_model() {
    let (memory, handle) = scripted_device();
    let model = RecordingModel::new("clip");

    let outputs = execute_batched(&handle, &model, &[], &SafeBatchSize::new("clip", 4))
        .await
        .unwrap();

    assert!(outputs.is_empty());
    assert!(model.calls().is_empty());
    assert_eq!(memory.clears(), 0);
}

#[tokio::test]
async fn test_bisection_sequence_is_deterministic() {
    let (_memory, handle) = scripted_device();
    let model = RecordingModel::new("clip").oom_above(3);
    let executor = BatchExecutor::new(handle);

    let outputs = executor
        .execute_batched(&model, &indices(10), &SafeBatchSize::new("clip", 10))
        .await
        .unwrap();

    let order: Vec<usize> = outputs.iter().map(|&(input, _)| input).collect();
    assert_eq!(order, indices(10));

    // Left halves take the extra item on odd lengths: [0,5) -> [0,3) + [3,5)
    assert_eq!(
        model.calls(),
        ranges(&[(0, 10), (0, 5), (0, 3), (3, 5), (5, 10), (5, 8), (8, 10)])
    );

    let stats = executor.stats();
    assert_eq!(stats.accelerator_calls, 7);
    assert_eq!(stats.bisections, 3);
    assert_eq!(stats.oom_events, 3);
    assert_eq!(stats.batches, 1);
}

#[tokio::test]
async fn test_bisection_clears_cache_before_each_retry() {
    let (memory, handle) = scripted_device();
    let model = RecordingModel::new("clip").oom_above(3);

    execute_batched(&handle, &model, &indices(10), &SafeBatchSize::new("clip", 10))
        .await
        .unwrap();

    // Three bisections plus the clear after the range is released
    assert_eq!(memory.clears(), 4);
}

#[tokio::test]
async fn test_persistent_oom_ends_unrecoverable_at_single_item() {
    let (_memory, handle) = scripted_device();
    let model = RecordingModel::new("clip").oom_above(0);

    let err = execute_batched(&handle, &model, &indices(4), &SafeBatchSize::new("clip", 4))
        .await
        .unwrap_err();

    match err {
        ExecutionError::Unrecoverable { range, .. } => {
            assert_eq!(range, Some(BatchRange::new(0, 1)));
        }
        other => panic!("expected unrecoverable, got {other:?}"),
    }
    assert_eq!(model.calls(), ranges(&[(0, 4), (0, 2), (0, 1)]));
}

#[tokio::test]
async fn test_non_oom_failure_is_not_bisected() {
    let (_memory, handle) = scripted_device();
    let model = RecordingModel::new("clip")
        .failing_with(|_| Some(ExecutionError::unrecoverable("malformed image")));
    let executor = BatchExecutor::new(handle);

    let err = executor
        .execute_batched(&model, &indices(5), &SafeBatchSize::new("clip", 5))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecutionError::Unrecoverable {
            cause: "malformed image".to_string(),
            range: Some(BatchRange::new(0, 5)),
        }
    );
    assert_eq!(model.calls(), ranges(&[(0, 5)]));
    assert_eq!(executor.stats().bisections, 0);
}

#[tokio::test]
async fn test_transient_failure_surfaces_unchanged() {
    let (_memory, handle) = scripted_device();
    let model = RecordingModel::new("clip")
        .failing_with(|range| (range.start >= 4).then(|| ExecutionError::transient("device lost")));

    let err = execute_batched(&handle, &model, &indices(10), &SafeBatchSize::new("clip", 4))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecutionError::Transient {
            cause: "device lost".to_string(),
            range: Some(BatchRange::new(4, 8)),
        }
    );
    // The failing range aborts the submission; [8,10) is never attempted
    assert_eq!(model.calls(), ranges(&[(0, 4), (4, 8)]));
}

#[tokio::test]
async fn test_model_reported_range_maps_to_submission_indices() {
    let (_memory, handle) = scripted_device();
    // The model flags the second item of its slice
    let model = RecordingModel::new("clip").failing_with(|range| {
        (range.start >= 4).then(|| ExecutionError::Unrecoverable {
            cause: "corrupt image".to_string(),
            range: Some(BatchRange::new(1, 2)),
        })
    });

    let err = execute_batched(&handle, &model, &indices(10), &SafeBatchSize::new("clip", 4))
        .await
        .unwrap_err();

    assert_eq!(err.range(), Some(BatchRange::new(5, 6)));
}

#[tokio::test]
async fn test_length_mismatch_is_unrecoverable() {
    struct ShortModel;

    #[async_trait::async_trait]
    impl pixel_inference::BatchModel for ShortModel {
        type Input = usize;
        type Output = usize;

        fn model_id(&self) -> &str {
            "short"
        }

        fn synthetic_input(&self) -> usize {
            0
        }

        async fn infer(&self, batch: &[usize]) -> Result<Vec<usize>, ExecutionError> {
            Ok(batch.iter().skip(1).copied().collect())
        }
    }

    let (_memory, handle) = scripted_device();
    let err = execute_batched(&handle, &ShortModel, &indices(3), &SafeBatchSize::new("short", 3))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecutionError::Unrecoverable { range: Some(r), .. } if r == BatchRange::new(0, 3)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_never_share_the_device() {
    let (_memory, handle) = scripted_device();
    let gauge = Arc::new(ConcurrencyGauge::default());

    // Two models, two executors, one device lock
    let first = Arc::new(
        RecordingModel::new("clip")
            .with_delay(Duration::from_millis(5))
            .with_gauge(gauge.clone()),
    );
    let second = Arc::new(
        RecordingModel::new("blip")
            .with_delay(Duration::from_millis(5))
            .with_gauge(gauge.clone()),
    );
    let first_executor = BatchExecutor::new(handle.clone());
    let second_executor = BatchExecutor::new(handle);

    let a = {
        let model = first.clone();
        tokio::spawn(async move {
            first_executor
                .execute_batched(&model, &indices(12), &SafeBatchSize::new("clip", 3))
                .await
        })
    };
    let b = {
        let model = second.clone();
        tokio::spawn(async move {
            second_executor
                .execute_batched(&model, &indices(12), &SafeBatchSize::new("blip", 2))
                .await
        })
    };

    let (a, b) = tokio::join!(a, b);
    assert_eq!(a.unwrap().unwrap().len(), 12);
    assert_eq!(b.unwrap().unwrap().len(), 12);
    assert_eq!(gauge.max(), 1);
    assert_eq!(first.calls().len() + second.calls().len(), 4 + 6);
}

#[tokio::test]
async fn test_oom_on_second_range_only() {
    let (_memory, handle) = scripted_device();
    let model = RecordingModel::new("clip")
        .failing_with(|range| (range == BatchRange::new(10, 20)).then_some(ExecutionError::OutOfMemory));

    let outputs = execute_batched(&handle, &model, &indices(25), &SafeBatchSize::new("clip", 10))
        .await
        .unwrap();

    assert_eq!(outputs.len(), 25);
    let calls = model.calls();
    assert_eq!(
        calls,
        ranges(&[(0, 10), (10, 20), (10, 15), (15, 20), (20, 25)])
    );

    let (input, call) = outputs[12];
    assert_eq!(input, 12);
    assert_eq!(calls[call], BatchRange::new(10, 15));
}
