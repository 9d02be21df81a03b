//! End-to-end checks of the in-memory unit of work against the query crate.

use graphfetch_core::{Key, ModelBuilder, ModelRegistry, TypeId, Value};
use graphfetch_query::{
    CollectionFetchSpec, ColumnFetchSpec, FetchSpec, QueuedQuery, decode_association_row,
    decode_entity,
};
use graphfetch_session::{MemorySession, MemoryStore, UnitOfWork};
use std::sync::Arc;

struct Library {
    model: Arc<ModelRegistry>,
    book: TypeId,
    novel: TypeId,
    author: TypeId,
}

fn library() -> Library {
    let mut m = ModelBuilder::new();
    let book = m.declare("Book");
    let novel = m.declare("Novel");
    let manual = m.declare("Manual");
    let author = m.declare("Author");
    let authorship = m.declare("Authorship");
    m.entity(book).abstract_type().key("id").column("title").finish().unwrap();
    m.entity(novel).base(book).column("genre").finish().unwrap();
    m.entity(manual).base(book).finish().unwrap();
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
    Library {
        model: Arc::new(m.build().unwrap()),
        book,
        novel,
        author,
    }
}

fn seeded(lib: &Library) -> (MemorySession, Key) {
    let mut store = MemoryStore::new(Arc::clone(&lib.model));
    let authorship = lib.model.type_by_name("Authorship").unwrap().id;
    let manual = lib.model.type_by_name("Manual").unwrap().id;
    let owner = store
        .insert(lib.author, &[("id", Value::BigInt(1)), ("name", "Le Guin".into())])
        .unwrap();
    store
        .insert(lib.novel, &[("id", Value::BigInt(10)), ("title", "Lathe".into()), ("genre", "sf".into())])
        .unwrap();
    store
        .insert(manual, &[("id", Value::BigInt(11)), ("title", "Steering".into())])
        .unwrap();
    for (id, book) in [(100, 10), (101, 11), (102, 99)] {
        store
            .insert(
                authorship,
                &[
                    ("id", Value::BigInt(id)),
                    ("author", Value::BigInt(1)),
                    ("book", Value::BigInt(book)),
                ],
            )
            .unwrap();
    }
    (MemorySession::new(store), owner)
}

#[test]
fn many_to_many_rows_decode_into_both_sides() {
    let lib = library();
    let (mut session, owner) = seeded(&lib);
    let field = lib
        .model
        .type_info(lib.author)
        .unwrap()
        .field_by_name("books")
        .unwrap();
    let spec = CollectionFetchSpec::new(&lib.model, lib.author, field, None, false).unwrap();
    let plan = Arc::new(FetchSpec::Collection(spec.clone()));
    let handle = session.register_query(QueuedQuery::collection(plan, owner));
    assert!(session.execute_queued(false).unwrap());

    let rows = session.take_results(handle).unwrap();
    // The link to book 99 has no target row.
    assert_eq!(rows.len(), 2);
    let decoded: Vec<_> = rows
        .iter()
        .map(|row| decode_association_row(&lib.model, &spec, row).unwrap())
        .collect();
    assert!(decoded.iter().all(|r| r.auxiliary.is_some()));
    assert_eq!(decoded[0].target.0.type_id(), lib.novel);
    assert_eq!(decoded[1].target.0.values(), &[Value::BigInt(11)]);
}

#[test]
fn column_rows_decode_to_exact_keys_and_cache() {
    let lib = library();
    let (mut session, _) = seeded(&lib);
    let keys: Vec<Key> = [10, 11, 12]
        .into_iter()
        .map(|id| Key::new(&lib.model, lib.book, vec![Value::BigInt(id)]).unwrap())
        .collect();
    let spec = ColumnFetchSpec::new(&lib.model, lib.book, [2]).unwrap();
    let plan = Arc::new(FetchSpec::Columns(spec.clone()));
    let handle = session.register_query(QueuedQuery::columns(plan, keys));
    session.execute_queued(false).unwrap();

    for row in session.take_results(handle).unwrap() {
        let (key, tuple) = decode_entity(&lib.model, lib.book, &spec.columns, &row).unwrap();
        assert!(key.is_exact_type());
        session.update_state(key, Some(tuple));
    }
    assert_eq!(session.cache().loaded_count(), 2);
    assert_eq!(session.stats().queries, 1);
}
