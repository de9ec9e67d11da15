#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use futures::future;

    use crate::links::LinkMap;
    use crate::prelude::*;

    fn run<F: std::future::Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, f)
    }

    /// Lets spawned local work (retires, effect tasks) settle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    type Log = Rc<RefCell<Vec<String>>>;

    fn log() -> Log {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn assert_log(log: &Log, expected: &[&str]) {
        let got: Vec<String> = log.borrow().clone();
        let want: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        assert_eq!(got, want);
    }

    /// Resource that records its release in `log`.
    fn tracked(log: &Log, name: &str) -> Resource {
        let log = Rc::clone(log);
        let name = name.to_string();
        Resource::from_fn(move || log.borrow_mut().push(name))
    }

    /// Observer logging `value:N` on arrival and `released:N` on release.
    fn watcher<T: std::fmt::Debug + Clone + 'static>(log: &Log) -> impl Fn(T) -> Resource {
        let log = Rc::clone(log);
        move |v: T| {
            log.borrow_mut().push(format!("value:{v:?}"));
            let released = format!("released:{v:?}");
            let log = Rc::clone(&log);
            Resource::from_fn(move || log.borrow_mut().push(released))
        }
    }

    // resource

    #[test]
    fn release_runs_once() {
        run(async {
            let count = Rc::new(RefCell::new(0));
            let r = Resource::from_fn({
                let count = Rc::clone(&count);
                move || *count.borrow_mut() += 1
            });
            r.release().await.unwrap();
            r.release().await.unwrap();
            r.release().await.unwrap();
            assert_eq!(*count.borrow(), 1);
            assert!(r.is_released());
        });
    }

    #[test]
    fn sequential_releases_in_order() {
        run(async {
            let l = log();
            let r = Resource::sequential([tracked(&l, "a"), tracked(&l, "b"), tracked(&l, "c")]);
            r.release().await.unwrap();
            assert_log(&l, &["a", "b", "c"]);
        });
    }

    #[test]
    fn sequential_stops_at_first_failure() {
        run(async {
            let l = log();
            let failing = Resource::new(|| future::ready(Err(Error::release("boom"))));
            let last = tracked(&l, "late");
            let r = Resource::sequential([tracked(&l, "first"), failing, last.clone()]);
            let err = r.release().await.unwrap_err();
            assert!(matches!(err, Error::Release(_)));
            assert_log(&l, &["first"]);
            assert!(!last.is_released());
        });
    }

    #[test]
    fn parallel_collects_every_failure() {
        run(async {
            let l = log();
            let r = Resource::parallel([
                Resource::new(|| future::ready(Err(Error::release("one")))),
                tracked(&l, "ok"),
                Resource::new(|| future::ready(Err(Error::release("two")))),
            ]);
            let err = r.release().await.unwrap_err();
            match err {
                Error::Aggregate(errors) => assert_eq!(errors.len(), 2),
                other => panic!("expected aggregate, got {other}"),
            }
            assert_log(&l, &["ok"]);
        });
    }

    #[test]
    fn parallel_single_failure_surfaces_as_itself() {
        run(async {
            let r = Resource::parallel([
                Resource::noop(),
                Resource::new(|| future::ready(Err(Error::release("only")))),
            ]);
            assert!(matches!(r.release().await.unwrap_err(), Error::Release(_)));
        });
    }

    #[test]
    fn collector_releases_newest_first() {
        run(async {
            let l = log();
            let c = Collector::new();
            c.add(tracked(&l, "a"));
            c.add(tracked(&l, "b"));
            c.add(tracked(&l, "c"));
            c.resource().release().await.unwrap();
            assert_log(&l, &["c", "b", "a"]);
        });
    }

    #[test]
    fn collector_releases_stragglers_immediately() {
        run(async {
            let l = log();
            let c = Collector::new();
            c.resource().release().await.unwrap();
            c.add(tracked(&l, "late"));
            settle().await;
            assert_log(&l, &["late"]);
        });
    }

    // realm

    #[test]
    fn pure_publishes_once_and_owns_the_value() {
        run(async {
            let l = log();
            let obs = Realm::pure(7).instantiate(watcher(&l));
            assert_log(&l, &["value:7"]);
            obs.release().await.unwrap();
            assert_log(&l, &["value:7", "released:7"]);
        });
    }

    #[test]
    fn never_stays_silent() {
        run(async {
            let l = log();
            let obs = Realm::<i32>::never().instantiate(watcher(&l));
            obs.release().await.unwrap();
            assert_log(&l, &[]);
        });
    }

    #[test]
    fn map_and_filter_compose() {
        run(async {
            let l = log();
            let realm = iterable([1, 2, 3, 4]).map(|v| v * 10).filter(|v| *v > 15);
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:20", "value:30", "value:40"]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn merge_publishes_both_sides() {
        run(async {
            let l = log();
            let realm = Realm::pure(1).merge(&Realm::pure(2));
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:1", "value:2"]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn flat_map_inner_owned_by_outer() {
        run(async {
            let l = log();
            let inner_released = Rc::new(RefCell::new(false));
            let inner = Realm::new({
                let inner_released = Rc::clone(&inner_released);
                move |observer: Observer<i32>| {
                    observer(11);
                    let inner_released = Rc::clone(&inner_released);
                    Resource::from_fn(move || *inner_released.borrow_mut() = true)
                }
            });
            let realm = iterable([1]).flat_map(move |_| inner.clone());
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:11"]);
            obs.release().await.unwrap();
            assert!(*inner_released.borrow());
            assert_log(&l, &["value:11", "released:11"]);
        });
    }

    #[test]
    fn release_stops_publications() {
        run(async {
            let slot: Rc<RefCell<Option<Observer<i32>>>> = Rc::new(RefCell::new(None));
            let realm = Realm::new({
                let slot = Rc::clone(&slot);
                move |observer| {
                    *slot.borrow_mut() = Some(observer);
                    Resource::noop()
                }
            });
            let seen = Rc::new(RefCell::new(0));
            let obs = realm.instantiate({
                let seen = Rc::clone(&seen);
                move |_v| {
                    *seen.borrow_mut() += 1;
                    Resource::noop()
                }
            });
            let publish = slot.borrow().clone().unwrap();
            publish(1);
            assert_eq!(*seen.borrow(), 1);
            obs.release().await.unwrap();
            publish(2);
            assert_eq!(*seen.borrow(), 1);
        });
    }

    #[test]
    fn lazy_defers_construction() {
        run(async {
            let built = Rc::new(RefCell::new(0));
            let realm = Realm::lazy({
                let built = Rc::clone(&built);
                move || {
                    *built.borrow_mut() += 1;
                    Realm::pure(5)
                }
            });
            assert_eq!(*built.borrow(), 0);
            let l = log();
            let obs = realm.instantiate(watcher(&l));
            assert_eq!(*built.borrow(), 1);
            assert_log(&l, &["value:5"]);
            obs.release().await.unwrap();
        });
    }

    // links

    #[test]
    fn link_map_unlinks_from_both_sides() {
        let mut links = LinkMap::new();
        assert!(links.link(1, 10, Resource::noop()).is_none());
        assert!(links.link(1, 11, Resource::noop()).is_none());
        assert!(links.link(2, 10, Resource::noop()).is_none());
        assert_eq!(links.len(), 3);

        let by_value = links.unlink_value(1);
        assert_eq!(by_value.len(), 2);
        assert_eq!(links.len(), 1);

        let by_observer = links.unlink_observer(10);
        assert_eq!(by_observer.len(), 1);
        assert_eq!(links.len(), 0);
    }

    #[test]
    fn link_map_replacement_returns_the_old_resource() {
        let mut links = LinkMap::new();
        let old = Resource::noop();
        links.link(1, 10, old.clone());
        let evicted = links.link(1, 10, Resource::noop());
        assert!(evicted.is_some());
        assert_eq!(links.len(), 1);
    }

    // store

    #[test]
    fn store_observes_its_source_once() {
        run(async {
            let count = Rc::new(RefCell::new(0));
            let source = Realm::new({
                let count = Rc::clone(&count);
                move |observer: Observer<i32>| {
                    *count.borrow_mut() += 1;
                    let a = observer(1);
                    let b = observer(2);
                    Resource::sequential([b, a])
                }
            });
            let store = Store::new(&source);
            assert_eq!(*count.borrow(), 1);

            let l1 = log();
            let l2 = log();
            let o1 = store.instantiate(watcher(&l1));
            let o2 = store.instantiate(watcher(&l2));
            assert_eq!(*count.borrow(), 1);
            assert_log(&l1, &["value:1", "value:2"]);
            assert_log(&l2, &["value:1", "value:2"]);
            assert_eq!(store.peek(), vec![1, 2]);

            o1.release().await.unwrap();
            assert_log(&l1, &["value:1", "value:2", "released:1", "released:2"]);
            // The other observer and the live set are untouched.
            assert_log(&l2, &["value:1", "value:2"]);
            assert_eq!(store.peek(), vec![1, 2]);

            store.release().await.unwrap();
            assert!(store.peek().is_empty());
            o2.release().await.unwrap();
        });
    }

    #[test]
    fn store_follows_cell_replacements() {
        run(async {
            let cell = Cell::new(0);
            let store = Store::new(&cell.realm());
            let l = log();
            let _obs = store.instantiate(watcher(&l));
            assert_eq!(store.peek(), vec![0]);

            cell.set(5);
            settle().await;
            assert_eq!(store.peek(), vec![5]);
            assert_log(&l, &["value:0", "value:5", "released:0"]);
        });
    }

    #[test]
    fn store_release_is_idempotent() {
        run(async {
            let store = Store::new(&Realm::pure(1));
            store.release().await.unwrap();
            store.release().await.unwrap();
            assert!(store.peek().is_empty());
        });
    }

    // cell

    #[test]
    fn cell_deduplicates_by_value() {
        run(async {
            let cell = Cell::new(1);
            let l = log();
            let _obs = cell.realm().instantiate(watcher(&l));
            cell.set(2);
            cell.set(2);
            cell.set(3);
            settle().await;
            assert_eq!(cell.peek(), 3);
            let values: Vec<String> = l
                .borrow()
                .iter()
                .filter(|e| e.starts_with("value:"))
                .cloned()
                .collect();
            assert_eq!(values, vec!["value:1", "value:2", "value:3"]);
        });
    }

    #[test]
    fn cell_new_value_arrives_before_old_release_starts() {
        run(async {
            let cell = Cell::new(0);
            let l = log();
            let _obs = cell.realm().instantiate(watcher(&l));
            cell.set(5);
            assert_log(&l, &["value:0", "value:5"]);
            settle().await;
            assert_log(&l, &["value:0", "value:5", "released:0"]);
        });
    }

    #[test]
    fn cell_modify_and_peek() {
        run(async {
            let cell = Cell::new(10);
            cell.modify(|v| v + 5);
            assert_eq!(cell.peek(), 15);
        });
    }

    #[test]
    fn cell_release_drains_instances_and_disables_set() {
        run(async {
            let cell = Cell::new(0);
            let l = log();
            let _obs = cell.realm().instantiate(watcher(&l));
            cell.release().await.unwrap();
            assert_log(&l, &["value:0", "released:0"]);
            cell.set(9);
            settle().await;
            assert_log(&l, &["value:0", "released:0"]);
            assert_eq!(cell.peek(), 0);
        });
    }

    #[test]
    fn cell_instance_release_settles_pending_retires() {
        run(async {
            let cell = Cell::new(0);
            let l = log();
            let obs = cell.realm().instantiate(watcher(&l));
            cell.set(1);
            cell.set(2);
            // Retires for 0 and 1 are still queued; the instance release
            // must wait for them before the live value goes.
            obs.release().await.unwrap();
            let got = l.borrow().clone();
            assert!(got.contains(&"released:0".to_string()));
            assert!(got.contains(&"released:1".to_string()));
            assert_eq!(got.last().unwrap(), "released:2");
        });
    }

    // effect

    #[test]
    fn effect_sync_value_publishes_inline() {
        run(async {
            let l = log();
            let realm = effect(|_scope| future::ready(Ok(42)));
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:42"]);
            obs.release().await.unwrap();
            assert_log(&l, &["value:42", "released:42"]);
        });
    }

    #[test]
    fn effect_releases_value_before_maker_resources() {
        run(async {
            let l = log();
            let realm = effect({
                let l = Rc::clone(&l);
                move |scope: EffectScope| {
                    scope.add_resource(tracked(&l, "computation"));
                    future::ready(Ok(1))
                }
            });
            let obs = realm.instantiate(watcher(&l));
            obs.release().await.unwrap();
            assert_log(&l, &["value:1", "released:1", "computation"]);
        });
    }

    #[test]
    fn effect_failure_reaches_the_hook_and_skips_publication() {
        run(async {
            let seen = Rc::new(RefCell::new(Vec::new()));
            set_effect_error_hook({
                let seen = Rc::clone(&seen);
                move |err| seen.borrow_mut().push(err.to_string())
            });
            let l = log();
            let realm: Realm<i32> = effect(|_scope| future::ready(Err(Error::effect("boom"))));
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &[]);
            assert_eq!(seen.borrow().len(), 1);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn effect_async_value_arrives_later() {
        run(async {
            let l = log();
            let realm = effect(|_scope| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(9)
            });
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &[]);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_log(&l, &["value:9"]);
            obs.release().await.unwrap();
            assert_log(&l, &["value:9", "released:9"]);
        });
    }

    #[test]
    fn timeout_fires_once_and_cancels_on_release() {
        run(async {
            let l = log();
            let fired = timeout(20).instantiate(watcher(&l));
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_log(&l, &["value:()"]);
            fired.release().await.unwrap();

            let cancelled = timeout(50).instantiate(watcher(&l));
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancelled.release().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_log(&l, &["value:()", "released:()"]);
        });
    }

    // blueprint

    #[test]
    fn blueprint_body_without_uses_publishes_its_result() {
        run(async {
            let l = log();
            let realm = to_realm(|| 5);
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:5"]);
            obs.release().await.unwrap();
            assert_log(&l, &["value:5", "released:5"]);
        });
    }

    #[test]
    fn blueprint_replays_deterministically() {
        run(async {
            let realm = to_realm(|| {
                let a = use_realm(&Realm::pure(2));
                let b = use_realm(&Realm::pure(3));
                a + b
            });
            for _ in 0..2 {
                let l = log();
                let obs = realm.instantiate(watcher(&l));
                assert_log(&l, &["value:5"]);
                obs.release().await.unwrap();
            }
        });
    }

    #[test]
    fn blueprint_forks_per_iterable_item() {
        run(async {
            let l = log();
            let realm = to_realm(|| use_iterable([1, 2, 3]) * 10);
            let obs = realm.instantiate(watcher(&l));
            // Later synchronous publications fork eagerly inside the
            // subscribe; the first continues after it returns.
            assert_log(&l, &["value:20", "value:30", "value:10"]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn blueprint_resumes_on_cell_updates() {
        run(async {
            let cell = Cell::new(1);
            let l = log();
            let realm = to_realm({
                let cell = cell.clone();
                move || use_realm(&cell.realm()) * 2
            });
            let _obs = realm.instantiate(watcher(&l));
            cell.set(3);
            settle().await;
            assert_log(&l, &["value:2", "value:6", "released:2"]);
        });
    }

    #[test]
    fn blueprint_guard_holds_the_body_until_true() {
        run(async {
            let cell = Cell::new(0);
            let l = log();
            let realm = to_realm({
                let cell = cell.clone();
                move || {
                    let v = use_realm(&cell.realm());
                    use_guard(move || v > 0);
                    v
                }
            });
            let _obs = realm.instantiate(watcher(&l));
            assert_log(&l, &[]);
            cell.set(4);
            settle().await;
            assert_log(&l, &["value:4"]);
        });
    }

    #[test]
    fn blueprint_never_suspends_forever() {
        run(async {
            let l = log();
            let realm = to_realm(|| use_never::<i32>());
            let obs = realm.instantiate(watcher(&l));
            settle().await;
            assert_log(&l, &[]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn blueprint_use_effect_runs_once_per_reach() {
        run(async {
            let cell = Cell::new(0);
            let l = log();
            let realm = to_realm({
                let cell = cell.clone();
                let l = Rc::clone(&l);
                move || {
                    let v = use_realm(&cell.realm());
                    let l = Rc::clone(&l);
                    use_effect(move |_scope| {
                        l.borrow_mut().push(format!("ran:{v}"));
                        future::ready(Ok(()))
                    });
                    v
                }
            });
            let _obs = realm.instantiate(|_| Resource::noop());
            cell.set(1);
            settle().await;
            // One run per distinct value, none per replay.
            assert_log(&l, &["ran:0", "ran:1"]);
        });
    }

    #[test]
    fn blueprint_nests() {
        run(async {
            let l = log();
            let inner = to_realm(|| 21);
            let realm = to_realm(move || use_realm(&inner) * 2);
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:42"]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn use_store_shares_one_observation() {
        run(async {
            let cell = Cell::new(0);
            let realm = to_realm({
                let cell = cell.clone();
                move || use_store(&cell.realm()).peek()
            });
            let seen: Rc<RefCell<Vec<Vec<i32>>>> = Rc::new(RefCell::new(Vec::new()));
            let obs = realm.instantiate({
                let seen = Rc::clone(&seen);
                move |v: Vec<i32>| {
                    seen.borrow_mut().push(v);
                    Resource::noop()
                }
            });
            assert_eq!(seen.borrow().clone(), vec![vec![0]]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "outside a blueprint body")]
    fn use_outside_a_body_is_fatal() {
        use_realm(&Realm::pure(1));
    }

    // context

    #[test]
    fn context_provides_and_consumes() {
        run(async {
            let key = create_context::<i32>();
            let l = log();
            let realm = to_realm(move || {
                key.provide(10);
                key.consume()
            });
            let obs = realm.instantiate(watcher(&l));
            assert_log(&l, &["value:10"]);
            obs.release().await.unwrap();
        });
    }

    #[test]
    fn context_inner_provide_shadows_outer() {
        run(async {
            let key = create_context::<i32>();
            let realm = to_realm(move || {
                key.provide(1);
                let a = key.consume();
                key.provide(2);
                let b = key.consume();
                (a, b)
            });
            let seen = Rc::new(RefCell::new(None));
            let obs = realm.instantiate({
                let seen = Rc::clone(&seen);
                move |v| {
                    *seen.borrow_mut() = Some(v);
                    Resource::noop()
                }
            });
            assert_eq!(*seen.borrow(), Some((1, 2)));
            obs.release().await.unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "consumed but never provided")]
    fn context_missing_value_is_fatal() {
        run(async {
            let key = create_context::<i32>();
            let realm = to_realm(move || key.consume());
            let _obs = realm.instantiate(|_| Resource::noop());
        });
    }

    // portal

    #[test]
    fn portal_places_and_withdraws_one_value() {
        run(async {
            let (store, setter) = portal::<i32>();
            let l = log();
            let _obs = store.instantiate(watcher(&l));

            let placement = setter.set(5).instantiate(|_| Resource::noop());
            assert_eq!(store.peek(), vec![5]);
            assert_log(&l, &["value:5"]);

            placement.release().await.unwrap();
            assert!(store.peek().is_empty());
            assert_log(&l, &["value:5", "released:5"]);
        });
    }

    #[test]
    fn portal_values_coexist() {
        run(async {
            let (store, setter) = portal::<i32>();
            let a = setter.set(1).instantiate(|_| Resource::noop());
            let _b = setter.set(2).instantiate(|_| Resource::noop());
            assert_eq!(store.peek(), vec![1, 2]);
            a.release().await.unwrap();
            assert_eq!(store.peek(), vec![2]);
        });
    }

    // hooks

    #[test]
    fn empty_iterable_is_a_noop() {
        run(async {
            let l = log();
            let obs = iterable(Vec::<i32>::new()).instantiate(watcher(&l));
            assert_log(&l, &[]);
            obs.release().await.unwrap();
            assert_log(&l, &[]);
        });
    }

    #[test]
    fn iterable_releases_in_reverse_insertion_order() {
        run(async {
            let l = log();
            let obs = iterable([1, 2, 3]).instantiate(watcher(&l));
            obs.release().await.unwrap();
            assert_log(
                &l,
                &[
                    "value:1",
                    "value:2",
                    "value:3",
                    "released:3",
                    "released:2",
                    "released:1",
                ],
            );
        });
    }

    #[test]
    fn guard_publishes_only_when_the_predicate_holds() {
        run(async {
            let l = log();
            let open = guard(|| true).instantiate(watcher(&l));
            assert_log(&l, &["value:()"]);
            open.release().await.unwrap();

            let closed = guard(|| false).instantiate(watcher(&l));
            closed.release().await.unwrap();
            assert_log(&l, &["value:()", "released:()"]);
        });
    }
}
