use tdb::{Database, Error, TableType, Value};
use test_log::test;

#[test]
fn strong_link_cascades_on_owner_removal() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    let (a_key, b_key) = {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;

        let a = txn.add_table("a")?;
        let b = txn.add_table("b")?;
        let link = a.add_link_column("owns", b.key(), true)?;

        let owner = a.create_object()?;
        let owned = b.create_object()?;
        owner.set(link, Value::Link(owned.key()))?;

        assert_eq!(1, owned.backlink_count()?);

        let keys = (owner.key(), owned.key());
        txn.commit()?;
        keys
    };

    {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;
        txn.table("a")?.remove_object(a_key)?;
        txn.commit()?;
    }

    // after reopen, the owned row is gone and nothing dangles
    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    assert_eq!(0, read.table("a")?.size()?);
    assert_eq!(0, read.table("b")?.size()?);
    assert!(read.table("b")?.try_object(b_key)?.is_none());
    read.verify()?;

    Ok(())
}

#[test]
fn removing_a_strongly_held_row_is_refused() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let a = txn.add_table("a")?;
    let b = txn.add_table("b")?;
    let link = a.add_link_column("owns", b.key(), true)?;

    let owner = a.create_object()?;
    let owned = b.create_object()?;
    owner.set(link, Value::Link(owned.key()))?;

    assert!(matches!(
        b.remove_object(owned.key()),
        Err(Error::ConstraintViolation(_))
    ));

    // releasing the link first makes it removable; the strong link
    // reassignment itself cascades
    owner.set(link, Value::Null)?;
    assert_eq!(0, b.size()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn weak_links_are_nullified_on_target_removal() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let people = txn.add_table("people")?;
    let pets = txn.add_table("pets")?;
    let friend = people.add_link_column("pet", pets.key(), false)?;

    let alice = people.create_object()?;
    let bob = people.create_object()?;
    let rex = pets.create_object()?;

    alice.set(friend, Value::Link(rex.key()))?;
    bob.set(friend, Value::Link(rex.key()))?;
    assert_eq!(2, rex.backlink_count()?);
    assert_eq!(
        vec![alice.key(), bob.key()],
        rex.backlinks(people.key(), friend)?,
    );

    pets.remove_object(rex.key())?;

    assert_eq!(Value::Null, alice.get(friend)?);
    assert_eq!(Value::Null, bob.get(friend)?);
    assert_eq!(2, people.size()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn backlinks_follow_reassignment() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let a = txn.add_table("a")?;
    let b = txn.add_table("b")?;
    let link = a.add_link_column("to", b.key(), false)?;

    let origin = a.create_object()?;
    let first = b.create_object()?;
    let second = b.create_object()?;

    origin.set(link, Value::Link(first.key()))?;
    assert_eq!(1, first.backlink_count()?);
    assert_eq!(0, second.backlink_count()?);

    origin.set(link, Value::Link(second.key()))?;
    assert_eq!(0, first.backlink_count()?);
    assert_eq!(1, second.backlink_count()?);

    origin.set(link, Value::Null)?;
    assert_eq!(0, second.backlink_count()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn embedded_tables_have_one_owner() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let outer = txn.add_table("outer")?;
    let inner = txn.add_table_of_type("inner", TableType::Embedded)?;

    // embedded rows cannot be created directly
    assert!(inner.create_object().is_err());

    // weak links into an embedded table are refused
    assert!(matches!(
        outer.add_link_column("bad", inner.key(), false),
        Err(Error::CrossTableLinkTarget)
    ));

    let own = outer.add_link_column("own", inner.key(), true)?;

    // a second owning column is one owner too many
    assert!(matches!(
        outer.add_link_column("own2", inner.key(), true),
        Err(Error::CrossTableLinkTarget)
    ));

    let parent = outer.create_object()?;
    let child = parent.create_linked_object(own)?;
    assert_eq!(1, inner.size()?);
    assert_eq!(Value::Link(child.key()), parent.get(own)?);

    // stealing the child from another row is refused
    let thief = outer.create_object()?;
    assert!(matches!(
        thief.set(own, Value::Link(child.key())),
        Err(Error::CrossTableLinkTarget)
    ));

    // removing the owner removes the child
    parent.remove()?;
    assert_eq!(0, inner.size()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn self_links() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let t = txn.add_table("nodes")?;
    let next = t.add_link_column("next", t.key(), false)?;

    let a = t.create_object()?;
    let b = t.create_object()?;
    a.set(next, Value::Link(b.key()))?;
    b.set(next, Value::Link(a.key()))?;

    assert_eq!(1, a.backlink_count()?);
    assert_eq!(1, b.backlink_count()?);

    t.remove_object(a.key())?;
    assert_eq!(Value::Null, b.get(next)?);
    assert_eq!(0, b.backlink_count()?);

    txn.commit()?;
    Ok(())
}
