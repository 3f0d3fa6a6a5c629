use std::time::Duration;
use tdb::{ColumnType, Database, Value};
use test_log::test;

#[test]
fn second_handle_observes_commit_after_advance() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    let writer_db = Database::open(&path)?;
    let reader_db = Database::open(&path)?;

    {
        let txn = writer_db.begin_write()?;
        let table = txn.add_table("t")?;
        table.add_column("n", ColumnType::Int, false)?;
        txn.commit()?;
    }

    let mut read = reader_db.begin_read()?;
    assert_eq!(0, read.table("t")?.size()?);
    let seen_version = read.version();

    {
        let txn = writer_db.begin_write()?;
        let table = txn.table("t")?;
        let n = table.col_key("n")?;
        table.create_object()?.set(n, 9)?;
        txn.commit()?;
    }

    // the commit is signalled within a bounded delay
    assert!(reader_db.wait_for_change_timeout(seen_version, Duration::from_secs(5)));

    read.advance()?;
    let table = read.table("t")?;
    assert_eq!(1, table.size()?);

    let n = table.col_key("n")?;
    let mut values = Vec::new();
    table.for_each(|obj| {
        values.push(obj.get(n)?);
        Ok(true)
    })?;
    assert_eq!(vec![Value::Int(9)], values);

    Ok(())
}

#[test]
fn writers_exclude_each_other() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    let db_a = Database::open(&path)?;
    let db_b = Database::open(&path)?;

    let txn = db_a.begin_write()?;
    assert!(matches!(db_b.try_begin_write(), Err(tdb::Error::Locked)));
    txn.commit()?;

    // the slot is free again
    let txn = db_b.try_begin_write()?;
    txn.rollback();

    Ok(())
}

#[test]
fn concurrent_readers_across_threads() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    {
        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;
        let n = table.add_column("n", ColumnType::Int, false)?;
        for i in 0..1_000i64 {
            table.create_object()?.set(n, i)?;
        }
        txn.commit()?;
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || -> tdb::Result<u64> {
            let read = db.begin_read()?;
            let table = read.table("t")?;

            let n = table.col_key("n")?;
            let mut sum = 0i64;
            table.for_each(|obj| {
                if let Value::Int(v) = obj.get(n)? {
                    sum += v;
                }
                Ok(true)
            })?;
            assert_eq!(499_500, sum);

            Ok(table.size()?)
        }));
    }

    for handle in handles {
        let size = handle.join().expect("reader thread panicked")?;
        assert_eq!(1_000, size);
    }

    Ok(())
}

#[test]
fn writer_thread_and_reader_threads_interleave() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    {
        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;
        table.add_column("n", ColumnType::Int, false)?;
        txn.commit()?;
    }

    let writer = {
        let db = db.clone();
        std::thread::spawn(move || -> tdb::Result<()> {
            for _ in 0..20 {
                let txn = db.begin_write()?;
                let table = txn.table("t")?;
                let n = table.col_key("n")?;
                table.create_object()?.set(n, 1)?;
                txn.commit()?;
            }
            Ok(())
        })
    };

    let reader = {
        let db = db.clone();
        std::thread::spawn(move || -> tdb::Result<()> {
            let mut last = 0;
            for _ in 0..50 {
                let read = db.begin_read()?;
                let size = read.table("t")?.size()?;

                // sizes are monotonic across snapshots
                assert!(size >= last);
                last = size;
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
    };

    writer.join().expect("writer thread panicked")?;
    reader.join().expect("reader thread panicked")?;

    let read = db.begin_read()?;
    assert_eq!(20, read.table("t")?.size()?);
    Ok(())
}
