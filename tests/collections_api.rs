use tdb::{CollectionKind, ColumnType, Database, Value};
use test_log::test;

#[test]
fn lists_roundtrip_across_commit() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    let key = {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;
        let tags =
            table.add_collection_column("tags", ColumnType::String, CollectionKind::List, false)?;

        let obj = table.create_object()?;
        let list = obj.list(tags)?;
        assert!(list.is_empty()?);

        list.push("alpha")?;
        list.push("gamma")?;
        list.insert(1, "beta")?;
        list.push("delta")?;
        list.remove(3)?;
        list.set(0, "ALPHA")?;

        let key = obj.key();
        txn.commit()?;
        key
    };

    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    let table = read.table("t")?;
    let tags = table.col_key("tags")?;

    let list = table.object(key)?.list(tags)?;
    assert_eq!(3, list.len()?);
    assert_eq!(
        vec![
            Value::String("ALPHA".into()),
            Value::String("beta".into()),
            Value::String("gamma".into()),
        ],
        list.to_vec()?,
    );

    read.verify()?;
    Ok(())
}

#[test]
fn sets_deduplicate() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let nums = table.add_collection_column("nums", ColumnType::Int, CollectionKind::Set, false)?;

    let obj = table.create_object()?;
    let set = obj.set_collection(nums)?;

    assert!(set.insert(3)?);
    assert!(set.insert(5)?);
    assert!(!set.insert(3)?);
    assert_eq!(2, set.len()?);

    assert!(set.contains(5)?);
    assert!(set.remove(5)?);
    assert!(!set.remove(5)?);
    assert!(!set.contains(5)?);
    assert_eq!(1, set.len()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn dictionaries_upsert_and_remove() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let attrs = table.add_collection_column(
        "attrs",
        ColumnType::Int,
        CollectionKind::Dictionary,
        false,
    )?;

    let obj = table.create_object()?;
    let dict = obj.dictionary(attrs)?;

    assert!(dict.insert("height", 180)?);
    assert!(dict.insert("width", 90)?);
    assert!(!dict.insert("height", 185)?);

    assert_eq!(Some(Value::Int(185)), dict.get("height")?);
    assert_eq!(Some(Value::Int(90)), dict.get("width")?);
    assert_eq!(None, dict.get("depth")?);
    assert_eq!(2, dict.len()?);

    assert!(dict.remove("width")?);
    assert!(!dict.remove("width")?);
    assert_eq!(vec!["height".to_owned()], dict.keys()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn collections_are_per_row() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let nums = table.add_collection_column("nums", ColumnType::Int, CollectionKind::List, false)?;

    let first = table.create_object()?;
    let second = table.create_object()?;

    first.list(nums)?.push(1)?;
    first.list(nums)?.push(2)?;
    second.list(nums)?.push(10)?;

    assert_eq!(2, first.list(nums)?.len()?);
    assert_eq!(1, second.list(nums)?.len()?);

    // removing a row releases its collection, others are untouched
    table.remove_object(first.key())?;
    assert_eq!(1, second.list(nums)?.len()?);

    txn.commit()?;
    Ok(())
}

#[test]
fn clearing_a_list() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let nums = table.add_collection_column("nums", ColumnType::Int, CollectionKind::List, false)?;

    let obj = table.create_object()?;
    for i in 0..50 {
        obj.list(nums)?.push(i)?;
    }
    assert_eq!(50, obj.list(nums)?.len()?);

    obj.list(nums)?.clear()?;
    assert!(obj.list(nums)?.is_empty()?);

    txn.commit()?;
    Ok(())
}
