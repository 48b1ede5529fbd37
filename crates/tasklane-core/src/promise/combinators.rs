//! Joining independent promises.
//!
//! A joined promise fulfills once every input has fulfilled and rejects with
//! the first rejection it observes. When inputs reject concurrently, which
//! error counts as "first" is decided by whichever settlement reaches the
//! joined promise first; either choice is a valid outcome. Inputs are never
//! canceled because a sibling rejected; canceling the joined promise forwards
//! the request to every input.

use std::sync::{Arc, Mutex, PoisonError};

use crate::promise::Promise;

pub fn join2<A, B>(a: &Promise<A>, b: &Promise<B>) -> Promise<(A, B)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    let (joined, resolver) = Promise::pending_on(a.executor.clone());
    joined.inner.link(a.cancel_node());
    joined.inner.link(b.cancel_node());

    let slots: Arc<PairSlots<A, B>> = Arc::new(Mutex::new((None, None)));

    a.inner.subscribe(Box::new({
        let slots = slots.clone();
        let resolver = resolver.clone();
        move |outcome| match outcome {
            Ok(value) => {
                if let Some(values) = store_pair(&slots, |pair| pair.0 = Some(value)) {
                    resolver.fulfill(values);
                }
            }
            Err(failure) => {
                resolver.reject(failure);
            }
        }
    }));

    b.inner.subscribe(Box::new(move |outcome| match outcome {
        Ok(value) => {
            if let Some(values) = store_pair(&slots, |pair| pair.1 = Some(value)) {
                resolver.fulfill(values);
            }
        }
        Err(failure) => {
            resolver.reject(failure);
        }
    }));

    joined
}

pub fn join3<A, B, C>(a: &Promise<A>, b: &Promise<B>, c: &Promise<C>) -> Promise<(A, B, C)>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
{
    let (joined, resolver) = Promise::pending_on(a.executor.clone());
    joined.inner.link(c.cancel_node());

    let pair = join2(a, b);
    joined.inner.link(pair.cancel_node());
    let all = join2(&pair, c);

    all.inner.subscribe(Box::new(move |outcome| {
        resolver.settle(outcome.map(|((a, b), c)| (a, b, c)));
    }));

    joined
}

type PairSlots<A, B> = Mutex<(Option<A>, Option<B>)>;

fn store_pair<A: Clone, B: Clone>(
    slots: &PairSlots<A, B>,
    update: impl FnOnce(&mut (Option<A>, Option<B>)),
) -> Option<(A, B)> {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    update(&mut slots);
    let (Some(a), Some(b)) = &*slots else {
        return None;
    };
    Some((a.clone(), b.clone()))
}

/// Joins any number of promises of one type; values keep input order.
pub fn join_all<T>(promises: Vec<Promise<T>>) -> Promise<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let Some(first) = promises.first() else {
        return Promise::resolved(Vec::new());
    };

    let (joined, resolver) = Promise::pending_on(first.executor.clone());
    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; promises.len()]));

    for (index, promise) in promises.iter().enumerate() {
        joined.inner.link(promise.cancel_node());

        let slots = slots.clone();
        let resolver = resolver.clone();
        promise.inner.subscribe(Box::new(move |outcome| match outcome {
            Ok(value) => {
                let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                slots[index] = Some(value);
                if slots.iter().all(Option::is_some) {
                    let values: Vec<T> = slots.iter_mut().filter_map(Option::take).collect();
                    drop(slots);
                    resolver.fulfill(values);
                }
            }
            Err(failure) => {
                resolver.reject(failure);
            }
        }));
    }

    joined
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{join_all, join2, join3};
    use crate::execution::{Executor, ImmediateExecutor};
    use crate::models::{Failure, PromiseStatus};
    use crate::promise::Promise;

    fn immediate() -> Arc<dyn Executor> {
        Arc::new(ImmediateExecutor)
    }

    #[test]
    fn join2_waits_for_both_inputs() {
        let (a, resolve_a) = Promise::<u8>::pending_on(immediate());
        let (b, resolve_b) = Promise::<&'static str>::pending_on(immediate());
        let joined = join2(&a, &b);

        resolve_b.fulfill("two");
        assert_eq!(joined.status(), PromiseStatus::Pending);

        resolve_a.fulfill(1);
        assert_eq!(joined.outcome().unwrap().unwrap(), (1, "two"));
    }

    #[test]
    fn join3_flattens_into_a_triple() {
        let a = Promise::resolved(1_u8).on(immediate());
        let b = Promise::resolved('b');
        let c = Promise::resolved(String::from("c"));
        let joined = join3(&a, &b, &c);
        assert_eq!(
            joined.outcome().unwrap().unwrap(),
            (1, 'b', String::from("c"))
        );
    }

    #[test]
    fn first_rejection_wins_and_siblings_stay_pending() {
        let (a, _resolve_a) = Promise::<u8>::pending_on(immediate());
        let failure = Failure::msg("b failed");
        let b = Promise::<u8>::rejected(failure.clone());
        let joined = join_all(vec![a.clone(), b]);

        let rejected = joined.outcome().unwrap().unwrap_err();
        assert!(rejected.ptr_eq(&failure));
        assert_eq!(a.status(), PromiseStatus::Pending);
        assert!(!a.is_cancelled());
    }

    #[test]
    fn join_all_of_nothing_fulfills_empty() {
        let joined = join_all(Vec::<Promise<u8>>::new());
        assert_eq!(joined.outcome().unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn cancelling_the_join_reaches_every_input() {
        let (a, _resolve_a) = Promise::<u8>::pending_on(immediate());
        let (b, _resolve_b) = Promise::<u8>::pending_on(immediate());
        let joined = join2(&a, &b);

        joined.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
