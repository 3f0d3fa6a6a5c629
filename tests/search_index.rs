use tdb::{ColumnType, Database, Value};
use test_log::test;

#[test]
fn indexed_lookups_match_scans() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;
        let table = txn.add_table("words")?;
        let w = table.add_column("w", ColumnType::String, false)?;

        for word in ["apple", "apply", "banana", "apple", "applesauce"] {
            table.create_object()?.set(w, word)?;
        }

        // index added after the fact back-fills existing rows
        let w = table.add_search_index(w)?;

        assert_eq!(2, table.find_string(w, "apple")?.len());
        assert_eq!(4, table.find_prefix(w, "appl")?.len());
        assert!(table.find_string(w, "missing")?.is_empty());

        txn.commit()?;
    }

    // the index is persistent
    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    let table = read.table("words")?;
    let w = table.col_key("w")?;
    assert!(w.is_indexed());

    assert_eq!(2, table.find_string(w, "apple")?.len());
    assert_eq!(4, table.find_prefix(w, "appl")?.len());
    assert_eq!(1, table.find_string(w, "banana")?.len());

    read.verify()?;
    Ok(())
}

#[test]
fn index_follows_updates_and_removals() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let w = table.add_column("w", ColumnType::String, false)?;
    let w = table.add_search_index(w)?;

    let a = table.create_object()?;
    a.set(w, "old")?;
    let b = table.create_object()?;
    b.set(w, "old")?;

    assert_eq!(vec![a.key(), b.key()], table.find_string(w, "old")?);

    a.set(w, "new")?;
    assert_eq!(vec![b.key()], table.find_string(w, "old")?);
    assert_eq!(vec![a.key()], table.find_string(w, "new")?);

    table.remove_object(b.key())?;
    assert!(table.find_string(w, "old")?.is_empty());

    txn.commit()?;
    Ok(())
}

#[test]
fn unindexed_scans_still_work() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let txn = db.begin_write()?;
    let table = txn.add_table("t")?;
    let w = table.add_column("w", ColumnType::String, true)?;
    let n = table.add_column("n", ColumnType::Int, false)?;

    for (word, num) in [("x", 1i64), ("y", 2), ("x", 3)] {
        let obj = table.create_object()?;
        obj.set(w, word)?;
        obj.set(n, num)?;
    }

    assert_eq!(2, table.find_string(w, "x")?.len());
    assert_eq!(2, table.find_prefix(w, "x")?.len());

    let hit = table.find_first(n, &Value::Int(2))?;
    assert!(hit.is_some());
    assert_eq!(None, table.find_first(n, &Value::Int(99))?);

    txn.commit()?;
    Ok(())
}
