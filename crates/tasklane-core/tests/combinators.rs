use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tasklane_core::execution::{Executor, ImmediateExecutor};
use tasklane_core::models::{Failure, Outcome};
use tasklane_core::promise::{Promise, join_all, join2, join3, on_cancel};

fn delayed<T: Clone + Send + 'static>(millis: u64, value: T) -> Promise<T> {
    Promise::spawn(async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(value)
    })
}

async fn settle<T: Clone + Send + 'static>(promise: &Promise<T>) -> Outcome<T> {
    tokio::time::timeout(Duration::from_secs(5), promise.wait())
        .await
        .expect("promise settled in time")
}

#[tokio::test]
async fn join2_fulfills_with_both_values() {
    let joined = join2(&delayed(20, 1_u32), &delayed(5, "two"));
    assert_eq!(settle(&joined).await.unwrap(), (1, "two"));
}

#[tokio::test]
async fn join3_fulfills_with_all_values() {
    let joined = join3(
        &delayed(15, 'a'),
        &Promise::resolved(2_u8),
        &delayed(5, String::from("c")),
    );
    assert_eq!(settle(&joined).await.unwrap(), ('a', 2, "c".to_string()));
}

#[tokio::test]
async fn join2_rejects_when_either_input_rejects() {
    let slow = delayed(50, 1_u32);
    let joined = join2(&slow, &Promise::<u32>::rejected(Failure::msg("second failed")));

    let failure = settle(&joined).await.unwrap_err();
    assert_eq!(failure.to_string(), "second failed");
    assert!(!slow.is_cancelled());
    assert_eq!(settle(&slow).await.unwrap(), 1);
}

#[tokio::test]
async fn join_all_keeps_input_order() {
    let joined = join_all(vec![delayed(30, 1_u32), delayed(1, 2), delayed(15, 3)]);
    assert_eq!(settle(&joined).await.unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn join_all_of_nothing_is_empty() {
    let joined = join_all(Vec::<Promise<u32>>::new());
    assert_eq!(settle(&joined).await.unwrap(), Vec::<u32>::new());
}

#[test]
fn cancelling_a_join_forwards_to_every_input() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let executor: Arc<dyn Executor> = Arc::new(ImmediateExecutor);
    let input = || {
        let cancels = cancels.clone();
        Promise::<u32>::cancelable_on(executor.clone(), move |_resolver| {
            Ok(Some(on_cancel(move || {
                cancels.fetch_add(1, Ordering::SeqCst);
            })))
        })
    };

    join_all(vec![input(), input(), input()]).cancel();
    assert_eq!(cancels.load(Ordering::SeqCst), 3);

    join3(&input(), &input(), &input()).cancel();
    assert_eq!(cancels.load(Ordering::SeqCst), 6);
}
