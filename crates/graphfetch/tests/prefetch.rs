//! Scheduler behavior observed through the in-memory unit of work.

use asupersync::runtime::RuntimeBuilder;
use graphfetch::{
    Cx, Error, FieldDescriptor, FieldId, Key, ModelBuilder, ModelRegistry, Outcome,
    PrefetchConfig, PrefetchScheduler, StateAnchor, TypeId, UnitOfWork, Value,
    default_descriptors,
};
use graphfetch_core::UsageErrorKind;
use graphfetch_query::FetchSpec;
use graphfetch_session::{MemorySession, MemoryStore};
use std::sync::{Arc, Mutex};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

struct Shop {
    model: Arc<ModelRegistry>,
    customer: TypeId,
    order: TypeId,
    product: TypeId,
    book: TypeId,
    novel: TypeId,
    manual: TypeId,
    review: TypeId,
    author: TypeId,
    authorship: TypeId,
    titled: TypeId,
    orders: FieldId,
    order_product: FieldId,
    review_book: FieldId,
    author_books: FieldId,
    titled_title: FieldId,
}

fn shop() -> Shop {
    let mut m = ModelBuilder::new();
    let customer = m.declare("Customer");
    let order = m.declare("Order");
    let product = m.declare("Product");
    let book = m.declare("Book");
    let novel = m.declare("Novel");
    let manual = m.declare("Manual");
    let review = m.declare("Review");
    let author = m.declare("Author");
    let authorship = m.declare("Authorship");
    let titled = m.declare("Titled");

    m.interface(titled).column("title").finish().unwrap();
    m.entity(product).implements(titled).key("id").column("title").finish().unwrap();
    m.entity(order)
        .key("id")
        .column("total")
        .reference("customer", customer)
        .reference("product", product)
        .finish()
        .unwrap();
    let paired = m.field_id(order, "customer").unwrap();
    m.entity(customer)
        .key("id")
        .column("name")
        .one_to_many("orders", order, paired)
        .finish()
        .unwrap();
    m.entity(book)
        .abstract_type()
        .implements(titled)
        .key("id")
        .column("title")
        .finish()
        .unwrap();
    m.entity(novel).base(book).column("genre").finish().unwrap();
    m.entity(manual).base(book).finish().unwrap();
    m.entity(review).key("id").reference("book", book).finish().unwrap();
    m.entity(authorship)
        .key("id")
        .reference("author", author)
        .reference("book", book)
        .finish()
        .unwrap();
    let master = m.field_id(authorship, "author").unwrap();
    let slave = m.field_id(authorship, "book").unwrap();
    m.entity(author)
        .key("id")
        .column("name")
        .many_to_many("books", book, authorship, master, slave)
        .finish()
        .unwrap();

    let orders = m.field_id(customer, "orders").unwrap();
    let order_product = m.field_id(order, "product").unwrap();
    let review_book = m.field_id(review, "book").unwrap();
    let author_books = m.field_id(author, "books").unwrap();
    let titled_title = m.field_id(titled, "title").unwrap();
    Shop {
        model: Arc::new(m.build().unwrap()),
        customer,
        order,
        product,
        book,
        novel,
        manual,
        review,
        author,
        authorship,
        titled,
        orders,
        order_product,
        review_book,
        author_books,
        titled_title,
    }
}

/// `customers` customers with `orders_each` orders each, over three products,
/// plus novel 10, manual 20, and author 1 who wrote both.
fn seeded(shop: &Shop, customers: i64, orders_each: i64) -> MemorySession {
    let mut store = MemoryStore::new(Arc::clone(&shop.model));
    for id in 1..=3 {
        store
            .insert(shop.product, &[("id", Value::BigInt(id)), ("title", format!("p{id}").into())])
            .unwrap();
    }
    for c in 1..=customers {
        store
            .insert(shop.customer, &[("id", Value::BigInt(c)), ("name", format!("c{c}").into())])
            .unwrap();
        for i in 0..orders_each {
            store
                .insert(
                    shop.order,
                    &[
                        ("id", Value::BigInt(c * 100 + i)),
                        ("total", Value::BigInt(i * 10)),
                        ("customer", Value::BigInt(c)),
                        ("product", Value::BigInt(i % 3 + 1)),
                    ],
                )
                .unwrap();
        }
    }
    store
        .insert(
            shop.novel,
            &[("id", Value::BigInt(10)), ("title", "Lathe".into()), ("genre", "sf".into())],
        )
        .unwrap();
    store
        .insert(shop.manual, &[("id", Value::BigInt(20)), ("title", "Lathe care".into())])
        .unwrap();
    store
        .insert(shop.review, &[("id", Value::BigInt(1)), ("book", Value::BigInt(10))])
        .unwrap();
    store
        .insert(shop.author, &[("id", Value::BigInt(1)), ("name", "Le Guin".into())])
        .unwrap();
    for (id, book) in [(100, 10), (101, 20)] {
        store
            .insert(
                shop.authorship,
                &[
                    ("id", Value::BigInt(id)),
                    ("author", Value::BigInt(1)),
                    ("book", Value::BigInt(book)),
                ],
            )
            .unwrap();
    }
    MemorySession::new(store)
}

fn key(shop: &Shop, type_id: TypeId, id: i64) -> Key {
    Key::new(&shop.model, type_id, vec![Value::BigInt(id)]).unwrap()
}

#[test]
fn repeated_requests_share_one_node() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 2, 0));
    let one = key(&shop, shop.customer, 1);
    let defaults = default_descriptors(&shop.model, shop.customer);

    scheduler.request_fetch(&one, shop.customer, &defaults).unwrap();
    scheduler.request_fetch(&one, shop.customer, &defaults).unwrap();
    assert_eq!(scheduler.pending_nodes(), 1);

    scheduler.execute_rounds(false).unwrap();
    assert_eq!(scheduler.session().stats().queries, 1);
    assert_eq!(scheduler.pending_nodes(), 0);
    assert!(scheduler.session().lookup(&one).unwrap().tuple().is_some());
}

#[test]
fn keys_are_chunked_per_query() {
    for (count, queries) in [(40, 1), (41, 2), (81, 3)] {
        let shop = shop();
        let mut scheduler = PrefetchScheduler::new(seeded(&shop, count, 0));
        let defaults = default_descriptors(&shop.model, shop.customer);
        for id in 1..=count {
            scheduler
                .request_fetch(&key(&shop, shop.customer, id), shop.customer, &defaults)
                .unwrap();
        }
        scheduler.execute_rounds(false).unwrap();

        let stats = scheduler.session().stats();
        assert_eq!(stats.queries, queries, "{count} keys");
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.rows, count as u64);
    }
}

#[test]
fn unknown_foreign_keys_are_followed_in_round_two() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 1));
    let order = key(&shop, shop.order, 100);

    scheduler
        .request_fetch(&order, shop.order, &[FieldDescriptor::reference(shop.order_product)])
        .unwrap();
    scheduler.execute_rounds(false).unwrap();

    let session = scheduler.session();
    let round_one: Vec<_> = session.executed_in(1).collect();
    let round_two: Vec<_> = session.executed_in(2).collect();
    assert_eq!(round_one.len(), 1);
    assert_eq!(round_one[0].target_type(), shop.order);
    assert_eq!(round_two.len(), 1);
    assert_eq!(round_two[0].target_type(), shop.product);
    assert!(session.lookup(&key(&shop, shop.product, 1)).is_some());
    assert_eq!(scheduler.task_execution_count(), 2);
}

#[test]
fn known_foreign_keys_are_followed_in_round_one() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 1));
    let order = key(&shop, shop.order, 100);
    scheduler
        .request_fetch(&order, shop.order, &default_descriptors(&shop.model, shop.order))
        .unwrap();
    scheduler.execute_rounds(false).unwrap();

    scheduler
        .request_fetch(&order, shop.order, &[FieldDescriptor::reference(shop.order_product)])
        .unwrap();
    scheduler.execute_rounds(false).unwrap();

    let session = scheduler.session();
    assert_eq!(session.stats().batches, 2);
    let second: Vec<_> = session.executed_in(2).collect();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].target_type(), shop.product);
}

#[test]
fn absent_entities_are_marked_removed_once() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 0));
    let ghost = key(&shop, shop.customer, 999);
    let defaults = default_descriptors(&shop.model, shop.customer);

    scheduler.request_fetch(&ghost, shop.customer, &defaults).unwrap();
    scheduler.execute_rounds(false).unwrap();
    assert!(scheduler.session().lookup(&ghost).unwrap().is_removed());
    assert_eq!(scheduler.session().stats().queries, 1);

    let anchor = scheduler.request_fetch(&ghost, shop.customer, &defaults).unwrap();
    assert!(anchor.is_some());
    assert_eq!(scheduler.pending_nodes(), 0);
    scheduler.execute_rounds(false).unwrap();
    assert_eq!(scheduler.session().stats().queries, 1);
}

#[test]
fn a_narrower_declared_type_does_not_remove_other_subtypes() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 0, 0));
    let novel_fields = default_descriptors(&shop.model, shop.novel);
    let novel = key(&shop, shop.book, 10);
    let manual = key(&shop, shop.book, 20);

    scheduler.request_fetch(&novel, shop.novel, &novel_fields).unwrap();
    scheduler.request_fetch(&manual, shop.novel, &novel_fields).unwrap();
    scheduler.execute_rounds(false).unwrap();

    let state = scheduler.session().lookup(&novel).unwrap();
    assert_eq!(state.key().type_id(), shop.novel);
    assert!(state.tuple().unwrap().is_loaded(3));
    // Not a novel, but it exists: nothing is recorded for it.
    assert!(scheduler.session().lookup(&manual).is_none());

    scheduler
        .request_fetch(&manual, shop.book, &default_descriptors(&shop.model, shop.book))
        .unwrap();
    scheduler.execute_rounds(false).unwrap();
    let state = scheduler.session().lookup(&manual).unwrap();
    assert!(!state.is_removed());
    assert_eq!(state.key().type_id(), shop.manual);
    assert_eq!(state.tuple().unwrap().get(2), Some(&Value::from("Lathe care")));
}

#[test]
fn mixed_cycles_remove_only_the_absent_keys() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 3, 0));
    let defaults = default_descriptors(&shop.model, shop.customer);
    let keys: Vec<Key> = (1..=5).map(|id| key(&shop, shop.customer, id)).collect();

    for k in &keys {
        scheduler.request_fetch(k, shop.customer, &defaults).unwrap();
    }
    scheduler.execute_rounds(false).unwrap();

    let session = scheduler.session();
    let states: Vec<_> = keys.iter().map(|k| session.lookup(k).unwrap()).collect();
    let removed = states.iter().filter(|s| s.is_removed()).count();
    let loaded = states.iter().filter(|s| s.tuple().is_some()).count();
    assert_eq!(removed, 2);
    assert_eq!(loaded, 3);
    assert!(states[3].is_removed() && states[4].is_removed());
    assert_eq!(session.stats().queries, 1);

    // The same request again resolves from the column cache and loads nothing.
    let before = scheduler.column_cache_stats();
    for k in &keys {
        scheduler.request_fetch(k, shop.customer, &defaults).unwrap();
    }
    scheduler.execute_rounds(false).unwrap();
    let after = scheduler.column_cache_stats();
    assert_eq!(after.misses, before.misses);
    assert!(after.hits > before.hits);
    assert_eq!(scheduler.session().stats().queries, 1);
}

#[test]
fn columns_already_loaded_are_not_fetched_again() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 1));
    let order = key(&shop, shop.order, 100);
    let total = shop.model.type_info(shop.order).unwrap().field_by_name("total").unwrap().id;

    scheduler.request_fetch(&order, shop.order, &[FieldDescriptor::new(total)]).unwrap();
    scheduler.execute_rounds(false).unwrap();
    scheduler
        .request_fetch(&order, shop.order, &default_descriptors(&shop.model, shop.order))
        .unwrap();
    scheduler.execute_rounds(false).unwrap();

    let columns: Vec<Vec<usize>> = scheduler
        .session()
        .executed()
        .iter()
        .filter(|q| q.target_type() == shop.order)
        .map(|q| match &*q.plan {
            FetchSpec::Columns(spec) => spec.columns.to_vec(),
            FetchSpec::Collection(_) => panic!("unexpected collection query"),
        })
        .collect();
    assert_eq!(columns.len(), 2);
    assert!(columns[0].contains(&2));
    // total (2) is in the buffer already; only the foreign keys are loaded
    assert!(!columns[1].contains(&2));
    assert!(columns[1].contains(&3) && columns[1].contains(&4));
    let state = scheduler.session().lookup(&order).unwrap();
    assert_eq!(state.tuple().unwrap().loaded_count(), 5);
}

#[test]
fn exact_type_is_resolved_from_loaded_rows() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 0, 0));
    let review = key(&shop, shop.review, 1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let descriptor = FieldDescriptor::reference(shop.review_book)
        .with_key_extractor(move |k| sink.lock().unwrap().push(k.clone()));

    scheduler.request_fetch(&review, shop.review, &[descriptor]).unwrap();
    scheduler.execute_rounds(false).unwrap();

    let book = key(&shop, shop.book, 10);
    assert!(!book.is_exact_type());
    let state = scheduler.session().lookup(&book).unwrap();
    assert_eq!(state.key().type_id(), shop.novel);
    assert!(state.key().is_exact_type());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].type_id(), shop.novel);
    assert_eq!(scheduler.task_execution_count(), 2);
}

#[test]
fn unknown_fields_are_rejected_before_any_work() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 0));
    let customer = key(&shop, shop.customer, 1);

    let err = scheduler
        .request_fetch(&customer, shop.customer, &[FieldDescriptor::new(shop.order_product)])
        .unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::UnknownField));
    assert_eq!(scheduler.pending_nodes(), 0);

    let err = scheduler
        .request_fetch(&customer, shop.product, &[])
        .unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::IncompatibleType));
}

#[test]
fn interface_fields_resolve_on_each_implementor() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 0, 0));
    let title = FieldDescriptor::new(shop.titled_title);
    let book = key(&shop, shop.book, 10);
    let product = key(&shop, shop.product, 2);

    scheduler.request_fetch(&book, shop.titled, &[title.clone()]).unwrap();
    scheduler.request_fetch(&product, shop.titled, &[title.clone()]).unwrap();
    scheduler.execute_rounds(false).unwrap();

    let session = scheduler.session();
    let state = session.lookup(&book).unwrap();
    assert_eq!(state.key().type_id(), shop.novel);
    let tuple = state.tuple().unwrap();
    assert_eq!(tuple.get(2), Some(&Value::from("Lathe")));
    assert!(!tuple.is_loaded(3));
    let state = session.lookup(&product).unwrap();
    assert_eq!(state.tuple().unwrap().get(2), Some(&Value::from("p2")));

    let err = scheduler
        .request_fetch(&key(&shop, shop.customer, 1), shop.titled, &[title])
        .unwrap_err();
    assert_eq!(err.usage_kind(), Some(UsageErrorKind::IncompatibleType));
}

#[test]
fn many_to_many_collections_cache_links_and_members() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 0, 0));
    let author = key(&shop, shop.author, 1);

    scheduler
        .request_fetch(&author, shop.author, &[FieldDescriptor::collection(shop.author_books, None)])
        .unwrap();
    scheduler.execute_rounds(false).unwrap();

    let session = scheduler.session();
    let collections = session.executed().iter().filter(|q| q.is_collection()).count();
    assert_eq!(collections, 1);
    let state = session.lookup(&author).unwrap();
    let books = state.collection(shop.author_books).unwrap();
    assert!(books.fully_loaded);
    assert_eq!(books.members.len(), 2);
    assert!(books.members.iter().all(Key::is_exact_type));
    assert!(books.members.contains(&key(&shop, shop.novel, 10)));
    assert!(books.members.contains(&key(&shop, shop.manual, 20)));
    for member in &books.members {
        assert!(session.lookup(member).unwrap().tuple().is_some());
    }
    for id in [100, 101] {
        let link = session.lookup(&key(&shop, shop.authorship, id)).unwrap();
        assert!(link.tuple().is_some());
    }
}

#[test]
fn loaded_collections_are_skipped_until_refreshed() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 3));
    let customer = key(&shop, shop.customer, 1);
    let orders = FieldDescriptor::collection(shop.orders, None);

    scheduler.request_fetch(&customer, shop.customer, &[orders.clone()]).unwrap();
    scheduler.execute_rounds(false).unwrap();
    let state = scheduler.session().lookup(&customer).unwrap();
    let collection = state.collection(shop.orders).unwrap();
    assert!(collection.fully_loaded);
    assert_eq!(collection.members.len(), 3);
    let queries = scheduler.session().stats().queries;

    scheduler.request_fetch(&customer, shop.customer, &[orders.clone()]).unwrap();
    scheduler.execute_rounds(false).unwrap();
    assert_eq!(scheduler.session().stats().queries, queries);

    scheduler
        .request_fetch(&customer, shop.customer, &[orders.with_refresh_token(1)])
        .unwrap();
    scheduler.execute_rounds(false).unwrap();
    assert_eq!(scheduler.session().stats().queries, queries + 1);
    let state = scheduler.session().lookup(&customer).unwrap();
    assert_eq!(state.collection(shop.orders).unwrap().refresh_token, 1);
}

#[test]
fn limited_collections_are_not_fully_loaded() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 3));
    let customer = key(&shop, shop.customer, 1);
    let limited = FieldDescriptor::collection(shop.orders, Some(2));

    scheduler.request_fetch(&customer, shop.customer, &[limited.clone()]).unwrap();
    scheduler.execute_rounds(false).unwrap();
    let state = scheduler.session().lookup(&customer).unwrap();
    let collection = state.collection(shop.orders).unwrap();
    assert_eq!(collection.members.len(), 2);
    assert!(!collection.fully_loaded);

    let queries = scheduler.session().stats().queries;
    scheduler.request_fetch(&customer, shop.customer, &[limited]).unwrap();
    scheduler.execute_rounds(false).unwrap();
    assert_eq!(scheduler.session().stats().queries, queries + 1);
}

#[test]
fn requests_for_one_collection_merge_to_the_widest() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 3));
    let customer = key(&shop, shop.customer, 1);

    scheduler
        .request_fetch(&customer, shop.customer, &[FieldDescriptor::collection(shop.orders, Some(1))])
        .unwrap();
    scheduler
        .request_fetch(&customer, shop.customer, &[FieldDescriptor::collection(shop.orders, None)])
        .unwrap();
    scheduler.execute_rounds(false).unwrap();

    let session = scheduler.session();
    let collections = session.executed().iter().filter(|q| q.is_collection()).count();
    assert_eq!(collections, 1);
    let state = session.lookup(&customer).unwrap();
    let collection = state.collection(shop.orders).unwrap();
    assert_eq!(collection.members.len(), 3);
    assert!(collection.fully_loaded);
}

#[test]
fn cycle_anchors_join_and_release_together() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 2, 0));
    let defaults = default_descriptors(&shop.model, shop.customer);

    scheduler.request_fetch(&key(&shop, shop.customer, 1), shop.customer, &defaults).unwrap();
    let first = scheduler.execute_rounds(false).unwrap().unwrap();
    scheduler.request_fetch(&key(&shop, shop.customer, 2), shop.customer, &defaults).unwrap();
    let second = scheduler.execute_rounds(false).unwrap().unwrap();
    assert_eq!(scheduler.live_anchors(), 2);

    first.join(second).unwrap();
    assert_eq!(first.payload_count(), 2);
    assert_eq!(scheduler.live_anchors(), 2);

    drop(first);
    assert_eq!(scheduler.live_anchors(), 0);
}

#[test]
fn unused_anchors_do_not_accumulate() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 3, 1));
    let defaults = default_descriptors(&shop.model, shop.customer);

    for _ in 0..3 {
        for id in 1..=3 {
            scheduler.request_fetch(&key(&shop, shop.customer, id), shop.customer, &defaults).unwrap();
        }
        scheduler.execute_rounds(false).unwrap();
        assert_eq!(scheduler.live_anchors(), 0);
    }

    let held = scheduler.anchor_state(&key(&shop, shop.customer, 1)).unwrap();
    assert_eq!(held.payloads()[0].key(), &key(&shop, shop.customer, 1));
    assert_eq!(scheduler.live_anchors(), 1);
    drop(held);
    assert_eq!(scheduler.live_anchors(), 0);
}

#[test]
fn large_pending_graphs_execute_on_their_own() {
    let shop = shop();
    let config = PrefetchConfig::default().with_max_pending_nodes(2);
    let mut scheduler = PrefetchScheduler::with_config(seeded(&shop, 3, 0), config).unwrap();
    let defaults = default_descriptors(&shop.model, shop.customer);

    let mut anchors: Vec<Option<StateAnchor>> = Vec::new();
    for id in 1..=3 {
        anchors.push(
            scheduler
                .request_fetch(&key(&shop, shop.customer, id), shop.customer, &defaults)
                .unwrap(),
        );
    }
    assert!(anchors[..2].iter().all(Option::is_none));
    assert!(anchors[2].is_some());
    assert_eq!(scheduler.pending_nodes(), 0);
    assert_eq!(scheduler.task_execution_count(), 1);
    assert_eq!(scheduler.live_anchors(), 1);
}

#[test]
fn failed_cycles_leave_nothing_behind() {
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 0));
    let customer = key(&shop, shop.customer, 1);
    let defaults = default_descriptors(&shop.model, shop.customer);

    scheduler.request_fetch(&customer, shop.customer, &defaults).unwrap();
    scheduler.session_mut().fail_next_batch("connection reset");
    let err = scheduler.execute_rounds(false).unwrap_err();
    assert!(matches!(err, Error::Query(_)));
    assert_eq!(scheduler.pending_nodes(), 0);
    assert_eq!(scheduler.session().queued_len(), 0);
    assert!(scheduler.session().lookup(&customer).is_none());

    scheduler.request_fetch(&customer, shop.customer, &defaults).unwrap();
    scheduler.execute_rounds(false).unwrap();
    assert!(scheduler.session().lookup(&customer).unwrap().tuple().is_some());
}

#[test]
fn suspendable_execution_matches_direct() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let shop = shop();

    let run = |scheduler: &mut PrefetchScheduler<MemorySession>| {
        for id in 1..=2 {
            scheduler
                .request_fetch(
                    &key(&shop, shop.order, id * 100),
                    shop.order,
                    &[FieldDescriptor::reference(shop.order_product)],
                )
                .unwrap();
        }
    };

    let mut direct = PrefetchScheduler::new(seeded(&shop, 2, 1));
    run(&mut direct);
    direct.execute_rounds(false).unwrap();

    let mut suspendable = PrefetchScheduler::new(seeded(&shop, 2, 1));
    run(&mut suspendable);
    rt.block_on(async {
        unwrap_outcome(suspendable.execute_rounds_async(&cx, false).await);
    });

    assert_eq!(direct.session().stats(), suspendable.session().stats());
    assert_eq!(direct.task_execution_count(), suspendable.task_execution_count());
    let product = key(&shop, shop.product, 1);
    assert_eq!(
        direct.session().lookup(&product).unwrap().tuple(),
        suspendable.session().lookup(&product).unwrap().tuple()
    );
}

#[test]
fn suspendable_failures_pass_through() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let shop = shop();
    let mut scheduler = PrefetchScheduler::new(seeded(&shop, 1, 0));
    let customer = key(&shop, shop.customer, 1);
    let defaults = default_descriptors(&shop.model, shop.customer);

    rt.block_on(async {
        unwrap_outcome(
            scheduler
                .request_fetch_async(&cx, &customer, shop.customer, &defaults)
                .await,
        );
        scheduler.session_mut().fail_next_batch("timeout");
        let outcome = scheduler.execute_rounds_async(&cx, false).await;
        assert!(matches!(outcome, Outcome::Err(Error::Query(_))));
    });
    assert_eq!(scheduler.pending_nodes(), 0);
    assert_eq!(scheduler.session().queued_len(), 0);
}

#[test]
fn skip_side_effects_is_forwarded() {
    let shop = shop();
    let mut session = seeded(&shop, 1, 0);
    session.stage_insert(shop.customer, &[("id", Value::BigInt(7))]);
    let mut scheduler = PrefetchScheduler::new(session);
    let defaults = default_descriptors(&shop.model, shop.customer);

    scheduler.request_fetch(&key(&shop, shop.customer, 7), shop.customer, &defaults).unwrap();
    scheduler.execute_rounds(true).unwrap();
    assert!(scheduler.session().lookup(&key(&shop, shop.customer, 7)).unwrap().is_removed());
    assert_eq!(scheduler.session().stats().writes_applied, 0);
}
