use tdb::{ColumnType, Database, Value};
use test_log::test;

fn bulk_insert(total: i64, commits: i64) -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");
    let per_commit = total / commits;

    {
        let db = Database::open(&path)?;

        {
            let txn = db.begin_write()?;
            let table = txn.add_table("t")?;
            table.add_column("n", ColumnType::Int, false)?;
            txn.commit()?;
        }

        for chunk in 0..commits {
            let txn = db.begin_write()?;
            let table = txn.table("t")?;
            let n = table.col_key("n")?;

            for i in 0..per_commit {
                let obj = table.create_object()?;
                obj.set(n, chunk * per_commit + i)?;
            }

            txn.commit()?;
        }
    }

    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    let table = read.table("t")?;
    assert_eq!(total as u64, table.size()?);

    // spot-check a few rows through the key-order iterator
    let n = table.col_key("n")?;
    let mut expected = 0i64;
    table.for_each(|obj| {
        assert_eq!(Value::Int(expected), obj.get(n)?);
        expected += 1;
        Ok(expected < 1000)
    })?;

    read.verify()?;
    Ok(())
}

#[test]
fn fifty_thousand_rows_in_ten_commits() -> tdb::Result<()> {
    bulk_insert(50_000, 10)
}

#[test]
#[ignore = "large: a million rows in ten commits"]
fn million_rows_in_ten_commits() -> tdb::Result<()> {
    bulk_insert(1_000_000, 10)
}

#[test]
fn unsafe_durability_bulk_load() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db.tdb");

    {
        let db = tdb::Config::new(&path)
            .durability(tdb::Durability::Unsafe)
            .open()?;

        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;
        let n = table.add_column("n", ColumnType::Int, false)?;
        for i in 0..10_000i64 {
            table.create_object()?.set(n, i)?;
        }
        txn.commit()?;
    }

    // the commit is complete even though no barriers ran
    let db = Database::open(&path)?;
    let read = db.begin_read()?;
    assert_eq!(10_000, read.table("t")?.size()?);
    read.verify()?;

    Ok(())
}

#[test]
fn keys_stay_stable_across_removals() -> tdb::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path().join("db.tdb"))?;

    let keys = {
        let txn = db.begin_write()?;
        let table = txn.add_table("t")?;
        let n = table.add_column("n", ColumnType::Int, false)?;

        let mut keys = Vec::new();
        for i in 0..2_000i64 {
            let obj = table.create_object()?;
            obj.set(n, i)?;
            keys.push(obj.key());
        }
        txn.commit()?;
        keys
    };

    // remove every other row, forcing cluster merges
    {
        let txn = db.begin_write()?;
        let table = txn.table("t")?;
        for key in keys.iter().step_by(2) {
            table.remove_object(*key)?;
        }
        txn.commit()?;
    }

    let read = db.begin_read()?;
    let table = read.table("t")?;
    let n = table.col_key("n")?;
    assert_eq!(1_000, table.size()?);

    for (i, key) in keys.iter().enumerate() {
        match table.try_object(*key)? {
            Some(obj) => {
                assert_eq!(1, i % 2);
                assert_eq!(Value::Int(i as i64), obj.get(n)?);
            }
            None => assert_eq!(0, i % 2),
        }
    }

    read.verify()?;
    Ok(())
}
