use tdb::{ColumnType, Database, Error, Value};
use test_log::test;

#[test]
fn insert_commit_reopen_roundtrip() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;

        let table = txn.add_table("t")?;
        let n = table.add_column("n", ColumnType::Int, false)?;

        for v in [1i64, 2, 3] {
            let obj = table.create_object()?;
            obj.set(n, v)?;
        }

        txn.commit()?;
    }

    // a brand-new process would do exactly this
    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    let table = read.table("t")?;
    let n = table.col_key("n")?;

    assert_eq!(3, table.size()?);

    let mut seen = Vec::new();
    table.for_each(|obj| {
        seen.push(obj.get(n)?);
        Ok(true)
    })?;
    assert_eq!(
        vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        seen,
    );

    Ok(())
}

#[test]
fn empty_database_reads_as_empty() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let read = db.begin_read()?;
    assert!(read.table_names()?.is_empty());
    assert!(matches!(read.table("nope"), Err(Error::KeyNotFound)));

    Ok(())
}

#[test]
fn read_only_refuses_writes() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    {
        let db = Database::open(&path)?;
        let txn = db.begin_write()?;
        txn.add_table("t")?;
        txn.commit()?;
    }

    let db = tdb::Config::new(&path).read_only(true).open()?;
    assert!(matches!(
        db.begin_write(),
        Err(Error::WrongTransactState)
    ));

    let read = db.begin_read()?;
    assert_eq!(vec!["t".to_owned()], read.table_names()?);

    Ok(())
}

#[test]
fn in_memory_database_leaves_no_file() -> tdb::Result<()> {
    let db = tdb::Config::new("ignored.tdb").in_memory().open()?;

    let txn = db.begin_write()?;
    let table = txn.add_table("scratch")?;
    let c = table.add_column("x", ColumnType::Int, false)?;
    let obj = table.create_object()?;
    obj.set(c, 7)?;
    txn.commit()?;

    let read = db.begin_read()?;
    assert_eq!(1, read.table("scratch")?.size()?);

    assert!(!std::path::Path::new("ignored.tdb").exists());
    Ok(())
}
